use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{CacheLayout, MatchPolicy};
use crate::error::LivingParkError;

pub const CONFIG_FILE_NAME: &str = "livingpark.json";
pub const DEFAULT_CACHE_ROOT: &str = ".cache";
pub const DEFAULT_BASE_DIR: &str = "inputs";
pub const DEFAULT_STUDY_FILES_DIR: &str = "inputs/study_files";
pub const DEFAULT_PPMI_BASE_URL: &str = "https://ida.loni.usc.edu/ppmi";
pub const DEFAULT_PPMI_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub cache_root: Option<String>,
    #[serde(default)]
    pub base_dir: Option<String>,
    #[serde(default)]
    pub study_files_dir: Option<String>,
    #[serde(default)]
    pub layout: Option<CacheLayout>,
    #[serde(default)]
    pub match_policy: Option<MatchPolicy>,
    #[serde(default)]
    pub ppmi: Option<PpmiSection>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PpmiSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PpmiSettings {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub cache_root: Utf8PathBuf,
    pub base_dir: String,
    pub study_files_dir: Utf8PathBuf,
    pub layout: CacheLayout,
    pub match_policy: MatchPolicy,
    pub ppmi: PpmiSettings,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            cache_root: Utf8PathBuf::from(DEFAULT_CACHE_ROOT),
            base_dir: DEFAULT_BASE_DIR.to_string(),
            study_files_dir: Utf8PathBuf::from(DEFAULT_STUDY_FILES_DIR),
            layout: CacheLayout::default(),
            match_policy: MatchPolicy::default(),
            ppmi: PpmiSettings {
                base_url: DEFAULT_PPMI_BASE_URL.to_string(),
                api_token: None,
                timeout: Duration::from_secs(DEFAULT_PPMI_TIMEOUT_SECS),
            },
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load an explicit config file, or the first of `./livingpark.json` and the
    /// user config directory that exists. Without any file the defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, LivingParkError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let config = match config_path {
            Some(config_path) => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| LivingParkError::ConfigRead(config_path.clone()))?;
                serde_json::from_str(&content)
                    .map_err(|err| LivingParkError::ConfigParse(err.to_string()))?
            }
            None => Config::default(),
        };

        Ok(Self::with_env_overrides(Self::resolve_config(config)?))
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, LivingParkError> {
        let defaults = ResolvedConfig::default();
        let ppmi = config.ppmi.unwrap_or_default();
        let base_url = ppmi
            .base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.ppmi.base_url);
        if base_url.is_empty() {
            return Err(LivingParkError::ConfigParse(
                "ppmi.base_url must not be empty".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            cache_root: config
                .cache_root
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.cache_root),
            base_dir: config.base_dir.unwrap_or(defaults.base_dir),
            study_files_dir: config
                .study_files_dir
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.study_files_dir),
            layout: config.layout.unwrap_or(defaults.layout),
            match_policy: config.match_policy.unwrap_or(defaults.match_policy),
            ppmi: PpmiSettings {
                base_url,
                api_token: None,
                timeout: ppmi
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.ppmi.timeout),
            },
        })
    }

    fn with_env_overrides(mut resolved: ResolvedConfig) -> ResolvedConfig {
        if let Ok(url) = std::env::var("PPMI_BASE_URL") {
            let url = url.trim().trim_end_matches('/');
            if !url.is_empty() {
                resolved.ppmi.base_url = url.to_string();
            }
        }
        if let Ok(token) = std::env::var("PPMI_API_TOKEN") {
            if !token.trim().is_empty() {
                resolved.ppmi.api_token = Some(token.trim().to_string());
            }
        }
        resolved
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("org", "LivingPark", "livingpark")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.cache_root, Utf8PathBuf::from(".cache"));
        assert_eq!(resolved.base_dir, "inputs");
        assert_eq!(resolved.layout, CacheLayout::Ppmi);
        assert_eq!(resolved.match_policy, MatchPolicy::Normalized);
        assert_eq!(resolved.ppmi.timeout, Duration::from_secs(600));
    }

    #[test]
    fn trailing_slash_is_trimmed_from_base_url() {
        let config = Config {
            ppmi: Some(PpmiSection {
                base_url: Some("https://mirror.example.org/ppmi/".to_string()),
                timeout_secs: Some(30),
            }),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.ppmi.base_url, "https://mirror.example.org/ppmi");
        assert_eq!(resolved.ppmi.timeout, Duration::from_secs(30));
    }
}
