use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use livingpark_utils::domain::StudyFileIdentifier;
use livingpark_utils::error::LivingParkError;
use livingpark_utils::store::{Metadata, Store};

fn store_in(temp: &tempfile::TempDir) -> (Store, Utf8PathBuf) {
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new_with_paths(
        root.clone(),
        root.join(".cache"),
        root.join("inputs/study_files"),
    );
    (store, root)
}

#[test]
fn layout_paths() {
    let temp = tempfile::tempdir().unwrap();
    let (store, root) = store_in(&temp);
    let id = StudyFileIdentifier::new("3001", "BL", "MPRAGE").unwrap();

    assert_eq!(store.inputs_dir(), root.join(".cache/inputs"));
    assert!(
        store
            .pre_processing_anat_dir(&id)
            .ends_with("outputs/pre_processing/sub-3001/ses-BL/anat")
    );
    assert!(
        store
            .metadata_path("MDS-UPDRS_Part_III.csv")
            .ends_with("study_files/.metadata/MDS-UPDRS_Part_III.csv.json")
    );
}

#[cfg(unix)]
#[test]
fn setup_links_inputs_and_outputs() {
    let temp = tempfile::tempdir().unwrap();
    let (store, root) = store_in(&temp);

    let result = store.setup_notebook_cache(true).unwrap();
    assert_eq!(result.linked.len(), 2);
    let inputs = root.join("inputs");
    assert!(fs::symlink_metadata(&inputs).unwrap().file_type().is_symlink());

    // Running setup again replaces the links.
    store.setup_notebook_cache(true).unwrap();
    assert!(root.join("outputs").as_std_path().is_dir());
}

#[test]
fn setup_refuses_to_replace_a_directory() {
    let temp = tempfile::tempdir().unwrap();
    let (store, root) = store_in(&temp);
    fs::create_dir_all(root.join("outputs")).unwrap();

    assert!(store.setup_notebook_cache(true).is_err());
    assert!(store.setup_notebook_cache(false).is_ok());
}

#[test]
fn setup_reports_an_unreadable_working_directory() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let work_dir = root.join("notebook.ipynb");
    fs::write(&work_dir, b"{}").unwrap();
    let store = Store::new_with_paths(work_dir, root.join(".cache"), root.join("study_files"));

    let err = store.setup_notebook_cache(true).unwrap_err();
    assert_matches!(err, LivingParkError::Filesystem(_));
    assert!(root.join(".cache/inputs").as_std_path().is_dir());
}

#[cfg(unix)]
#[test]
fn link_in_outputs_points_back_to_inputs() {
    let temp = tempfile::tempdir().unwrap();
    let (store, _root) = store_in(&temp);
    let id = StudyFileIdentifier::new("3001", "BL", "MPRAGE").unwrap();
    let input = store.inputs_dir().join("sub-3001/ses-BL/anat/PPMI_3001_MPRAGE.nii.gz");
    fs::create_dir_all(input.parent().unwrap()).unwrap();
    fs::write(&input, b"nifti").unwrap();

    let link = store.link_in_outputs(&input, &id).unwrap();
    assert_eq!(fs::read(&link).unwrap(), b"nifti");
    assert!(fs::read_link(&link).unwrap().is_relative());

    // Linking twice is allowed.
    store.link_in_outputs(&input, &id).unwrap();
}

#[test]
fn metadata_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let (store, _root) = store_in(&temp);
    let path = store.metadata_path("PD_Diagnosis_History.csv");
    assert!(Store::read_metadata(&path).unwrap().is_none());

    let meta = Metadata {
        source: "ppmi".to_string(),
        file: "PD_Diagnosis_History.csv".to_string(),
        downloaded_at: "2024-01-01T00:00:00+00:00".to_string(),
        tool: "livingpark/0.1.0".to_string(),
        resolved_path: store.study_file_path("PD_Diagnosis_History.csv").to_string(),
    };
    Store::write_metadata(&path, &meta).unwrap();
    let read = Store::read_metadata(&path).unwrap().unwrap();
    assert_eq!(read.file, meta.file);
    assert_eq!(read.source, "ppmi");
}
