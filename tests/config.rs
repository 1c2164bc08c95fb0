use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use livingpark_utils::config::{Config, ConfigLoader};
use livingpark_utils::domain::{CacheLayout, MatchPolicy};
use livingpark_utils::error::LivingParkError;

#[test]
fn parse_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("livingpark.json");
    std::fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "cache_root": "/data/study",
            "base_dir": "",
            "layout": "plain",
            "match_policy": "exact",
            "ppmi": { "base_url": "https://mirror.example.org/ppmi/", "timeout_secs": 30 }
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.cache_root, Utf8PathBuf::from("/data/study"));
    assert_eq!(resolved.base_dir, "");
    assert_eq!(resolved.layout, CacheLayout::Plain);
    assert_eq!(resolved.match_policy, MatchPolicy::Exact);
    assert_eq!(resolved.ppmi.timeout, Duration::from_secs(30));
    assert_eq!(
        resolved.study_files_dir,
        Utf8PathBuf::from("inputs/study_files")
    );
}

#[test]
fn unknown_policy_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("livingpark.json");
    std::fs::write(&path, r#"{ "match_policy": "fuzzy" }"#).unwrap();

    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, LivingParkError::ConfigParse(_));
}

#[test]
fn missing_explicit_file_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, LivingParkError::ConfigRead(_));
}

#[test]
fn defaults_without_config() {
    let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
    assert_eq!(resolved.cache_root, Utf8PathBuf::from(".cache"));
    assert_eq!(resolved.layout, CacheLayout::Ppmi);
    assert_eq!(resolved.match_policy, MatchPolicy::Normalized);
}
