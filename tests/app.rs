use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use zip::write::SimpleFileOptions;

use livingpark_utils::app::{App, T1Options};
use livingpark_utils::cache::NiftiCache;
use livingpark_utils::cohort::CohortEntry;
use livingpark_utils::convert::NiftiConverter;
use livingpark_utils::domain::{CacheLayout, MatchPolicy, StudyFileIdentifier, SubjectId};
use livingpark_utils::error::LivingParkError;
use livingpark_utils::output::JsonOutput;
use livingpark_utils::ppmi::{DownloadInfo, PpmiClient};
use livingpark_utils::store::Store;

#[derive(Default)]
struct MockPpmi {
    /// requested name -> (served name, content)
    study_files: HashMap<String, (String, String)>,
    /// subject -> archive entries
    images: HashMap<String, Vec<(String, Vec<u8>)>>,
    timeout_subjects: Vec<String>,
    imaging_calls: Mutex<Vec<(Vec<String>, Duration)>>,
}

impl MockPpmi {
    fn serve_study_file(mut self, name: &str, served: &str, content: &str) -> Self {
        self.study_files
            .insert(name.to_string(), (served.to_string(), content.to_string()));
        self
    }

    fn serve_image(mut self, subject: &str, entry: &str, content: &[u8]) -> Self {
        self.images
            .entry(subject.to_string())
            .or_default()
            .push((entry.to_string(), content.to_vec()));
        self
    }

    fn imaging_calls(&self) -> Vec<(Vec<String>, Duration)> {
        self.imaging_calls.lock().unwrap().clone()
    }
}

impl PpmiClient for &MockPpmi {
    fn download_study_file(
        &self,
        name: &str,
        destination_dir: &Path,
        _timeout: Duration,
    ) -> Result<PathBuf, LivingParkError> {
        let Some((served, content)) = self.study_files.get(name) else {
            return Err(LivingParkError::PpmiStatus {
                status: 404,
                message: "not found".to_string(),
            });
        };
        let path = destination_dir.join(served);
        fs::write(&path, content).unwrap();
        Ok(path)
    }

    fn download_imaging(
        &self,
        subjects: &[SubjectId],
        destination: &Path,
        timeout: Duration,
    ) -> Result<DownloadInfo, LivingParkError> {
        let subjects = subjects
            .iter()
            .map(|subject| subject.to_string())
            .collect::<Vec<_>>();
        self.imaging_calls
            .lock()
            .unwrap()
            .push((subjects.clone(), timeout));

        if subjects
            .iter()
            .any(|subject| self.timeout_subjects.contains(subject))
        {
            return Err(LivingParkError::PpmiTimeout("mock".to_string()));
        }
        let entries = subjects
            .iter()
            .filter_map(|subject| self.images.get(subject))
            .flatten()
            .collect::<Vec<_>>();
        if entries.is_empty() {
            return Err(LivingParkError::PpmiStatus {
                status: 404,
                message: "no images".to_string(),
            });
        }

        let file = fs::File::create(destination).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer
                .start_file(name.as_str(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        Ok(DownloadInfo { is_zip: true })
    }
}

#[derive(Default)]
struct MockConverter {
    calls: Mutex<Vec<usize>>,
}

impl NiftiConverter for &MockConverter {
    fn convert(
        &self,
        dicom_files: &[PathBuf],
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, LivingParkError> {
        self.calls.lock().unwrap().push(dicom_files.len());
        fs::create_dir_all(output_dir).unwrap();
        let output = output_dir.join("converted_SAG_3D_MPRAGE.nii.gz");
        fs::write(&output, b"converted").unwrap();
        Ok(vec![output])
    }

    fn tool_version(&self) -> Option<String> {
        Some("mock".to_string())
    }
}

struct Workspace {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        Self { _temp: temp, root }
    }

    fn app<'a>(
        &self,
        ppmi: &'a MockPpmi,
        converter: &'a MockConverter,
    ) -> App<&'a MockPpmi, &'a MockConverter> {
        let cache_root = self.root.join(".cache");
        let store = Store::new_with_paths(
            self.root.clone(),
            cache_root.clone(),
            self.root.join("inputs/study_files"),
        );
        let cache = NiftiCache::new(cache_root, "inputs", CacheLayout::Ppmi, MatchPolicy::Normalized);
        App::new(store, cache, ppmi, converter)
    }
}

fn options(batch_size: usize) -> T1Options {
    T1Options {
        symlink: false,
        force: false,
        timeout: Duration::from_secs(10),
        batch_size,
    }
}

fn image_sidecar(patno: &str, visit: &str, series: &str, image: &str, description: &str) -> String {
    format!(
        r#"<idaxs><project><subject>
        <subjectIdentifier>{patno}</subjectIdentifier>
        <study>
          <visit><visitIdentifier>{visit}</visitIdentifier></visit>
          <series><seriesIdentifier>{series}</seriesIdentifier></series>
          <imagingProtocol>
            <imageUID>{image}</imageUID>
            <description>{description}</description>
          </imagingProtocol>
        </study>
    </subject></project></idaxs>"#
    )
}

impl MockPpmi {
    /// Serve an `MPRAGE GRAPPA` NIfTI image together with its XML sidecar.
    fn serve_nifti(self, patno: &str, visit: &str, series: &str, image: &str, content: &[u8]) -> Self {
        let xml = image_sidecar(patno, visit, series, image, "MPRAGE GRAPPA");
        self.serve_image(
            patno,
            &format!("PPMI_{patno}_MPRAGE_GRAPPA_S{series}_I{image}.xml"),
            xml.as_bytes(),
        )
        .serve_image(
            patno,
            &format!(
                "PPMI/{patno}/MPRAGE_GRAPPA/2011-01-01/S{series}/PPMI_{patno}_MR_MPRAGE_GRAPPA_br_raw_S{series}_I{image}.nii.gz"
            ),
            content,
        )
    }
}

#[test]
fn downloads_and_maps_images_into_the_cache() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default().serve_nifti("3001", "Baseline", "1", "2", b"image");
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let cohort = vec![
        CohortEntry::new("3001", "BL", "MPRAGE GRAPPA"),
        CohortEntry::new("3002", "BL", "MPRAGE GRAPPA"),
    ];

    let result = app.get_t1_nifti_files(&cohort, options(2), &JsonOutput).unwrap();

    let expected = workspace
        .root
        .join(".cache/inputs/sub-3001/ses-BL/anat/PPMI_3001_MPRAGE_GRAPPA.nii.gz");
    assert_eq!(result.success.len(), 1);
    assert_eq!(result.success[0].file_name.as_deref(), Some(expected.as_str()));
    assert_eq!(fs::read(&expected).unwrap(), b"image");
    assert_eq!(result.missing.len(), 1);
    assert_eq!(result.missing[0].patno, "3002");

    // One batch of two subjects, with the timeout scaled by its size.
    let calls = ppmi.imaging_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, vec!["3001".to_string(), "3002".to_string()]);
    assert_eq!(calls[0].1, Duration::from_secs(20));
}

#[test]
fn cached_images_are_not_downloaded_again() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default();
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let cached = workspace
        .root
        .join(".cache/inputs/sub-3001/ses-BL/anat/PPMI_3001_MPRAGE_GRAPPA.nii.gz");
    fs::create_dir_all(cached.parent().unwrap()).unwrap();
    fs::write(&cached, b"image").unwrap();

    let cohort = vec![CohortEntry::new("3001", "BL", "MPRAGE GRAPPA")];
    assert!(app.missing_t1_nifti_files(&cohort, false).unwrap().is_empty());
    assert_eq!(app.missing_t1_nifti_files(&cohort, true).unwrap().len(), 1);

    let result = app.get_t1_nifti_files(&cohort, options(10), &JsonOutput).unwrap();
    assert_eq!(result.success.len(), 1);
    assert!(ppmi.imaging_calls().is_empty());
}

#[test]
fn failed_batch_does_not_stop_the_next_one() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default().serve_nifti("3001", "Baseline", "1", "2", b"image");
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let cohort = vec![
        CohortEntry::new("3002", "BL", "MPRAGE GRAPPA"),
        CohortEntry::new("3001", "BL", "MPRAGE GRAPPA"),
    ];

    let result = app.get_t1_nifti_files(&cohort, options(1), &JsonOutput).unwrap();
    assert_eq!(ppmi.imaging_calls().len(), 2);
    assert_eq!(result.success.len(), 1);
    assert_eq!(result.success[0].patno, "3001");
}

#[test]
fn timeout_stops_further_batches() {
    let workspace = Workspace::new();
    let mut ppmi = MockPpmi::default().serve_nifti("3002", "Baseline", "1", "2", b"image");
    ppmi.timeout_subjects.push("3001".to_string());
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let cohort = vec![
        CohortEntry::new("3001", "BL", "MPRAGE GRAPPA"),
        CohortEntry::new("3002", "BL", "MPRAGE GRAPPA"),
    ];

    let result = app.get_t1_nifti_files(&cohort, options(1), &JsonOutput).unwrap();
    assert_eq!(ppmi.imaging_calls().len(), 1);
    assert!(result.success.is_empty());
    assert_eq!(result.missing.len(), 2);
}

#[test]
fn dicom_series_is_converted() {
    let xml = r#"<idaxs><project><subject>
        <subjectIdentifier>3001</subjectIdentifier>
        <study>
          <visit><visitIdentifier>Baseline</visitIdentifier></visit>
          <series><seriesIdentifier>11</seriesIdentifier></series>
          <imagingProtocol>
            <imageUID>22</imageUID>
            <description>SAG 3D MPRAGE</description>
            <protocolTerm><protocol term="Matrix Z">2</protocol></protocolTerm>
          </imagingProtocol>
        </study>
    </subject></project></idaxs>"#;
    let series = "PPMI/3001/SAG_3D_MPRAGE/2011-01-01/S11";
    let ppmi = MockPpmi::default()
        .serve_image("3001", "PPMI_3001_SAG_3D_MPRAGE_S11_I22.xml", xml.as_bytes())
        .serve_image(
            "3001",
            &format!("{series}/PPMI_3001_MR_SAG_3D_MPRAGE__br_raw_2011_1_S11_I22.dcm"),
            b"slice",
        )
        .serve_image(
            "3001",
            &format!("{series}/PPMI_3001_MR_SAG_3D_MPRAGE__br_raw_2011_2_S11_I22.dcm"),
            b"slice",
        );
    let converter = MockConverter::default();
    let workspace = Workspace::new();
    let app = workspace.app(&ppmi, &converter);

    let cohort = vec![CohortEntry::new("3001", "BL", "SAG 3D MPRAGE")];
    let result = app.get_t1_nifti_files(&cohort, options(10), &JsonOutput).unwrap();

    assert_eq!(*converter.calls.lock().unwrap(), vec![2]);
    let expected = workspace
        .root
        .join(".cache/inputs/sub-3001/ses-BL/anat/PPMI_3001_SAG_3D_MPRAGE.nii.gz");
    assert_eq!(result.success[0].file_name.as_deref(), Some(expected.as_str()));
    assert_eq!(fs::read(&expected).unwrap(), b"converted");
}

#[test]
fn images_are_mapped_to_their_own_visit() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default()
        .serve_nifti("3001", "Baseline", "1", "2", b"baseline")
        .serve_nifti("3001", "Month 12", "3", "4", b"month12");
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let cohort = vec![
        CohortEntry::new("3001", "BL", "MPRAGE GRAPPA"),
        CohortEntry::new("3001", "V04", "MPRAGE GRAPPA"),
    ];

    let result = app.get_t1_nifti_files(&cohort, options(10), &JsonOutput).unwrap();

    assert_eq!(result.success.len(), 2);
    assert!(result.missing.is_empty());
    let anat = workspace.root.join(".cache/inputs/sub-3001");
    assert_eq!(
        fs::read(anat.join("ses-BL/anat/PPMI_3001_MPRAGE_GRAPPA.nii.gz")).unwrap(),
        b"baseline"
    );
    assert_eq!(
        fs::read(anat.join("ses-V04/anat/PPMI_3001_MPRAGE_GRAPPA.nii.gz")).unwrap(),
        b"month12"
    );
}

#[test]
fn image_of_another_visit_is_not_cached() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default().serve_nifti("3001", "Month 12", "3", "4", b"month12");
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let cohort = vec![
        CohortEntry::new("3001", "BL", "MPRAGE GRAPPA"),
        CohortEntry::new("3001", "V04", "MPRAGE GRAPPA"),
    ];

    let result = app.get_t1_nifti_files(&cohort, options(10), &JsonOutput).unwrap();

    assert_eq!(result.success.len(), 1);
    assert_eq!(result.success[0].event_id, "V04");
    assert_eq!(result.missing.len(), 1);
    assert_eq!(result.missing[0].event_id, "BL");
    assert!(
        !workspace
            .root
            .join(".cache/inputs/sub-3001/ses-BL/anat/PPMI_3001_MPRAGE_GRAPPA.nii.gz")
            .exists()
    );
}

#[cfg(unix)]
#[test]
fn symlink_option_links_images_in_outputs() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default().serve_nifti("3001", "Baseline", "1", "2", b"image");
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let cohort = vec![CohortEntry::new("3001", "BL", "MPRAGE GRAPPA")];

    let mut opts = options(10);
    opts.symlink = true;
    app.get_t1_nifti_files(&cohort, opts, &JsonOutput).unwrap();

    let link = workspace.root.join(
        ".cache/outputs/pre_processing/sub-3001/ses-BL/anat/PPMI_3001_MPRAGE_GRAPPA.nii.gz",
    );
    assert_eq!(fs::read(&link).unwrap(), b"image");
}

#[test]
fn invalid_cohort_entry_fails_before_download() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default();
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let cohort = vec![CohortEntry::new("3001", "", "MPRAGE")];

    let err = app
        .get_t1_nifti_files(&cohort, options(10), &JsonOutput)
        .unwrap_err();
    assert_matches!(err, LivingParkError::InvalidVisitId(_));
    assert!(ppmi.imaging_calls().is_empty());
}

#[test]
fn study_files_are_installed_under_their_canonical_name() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default().serve_study_file(
        "PD_Diagnosis_History.csv",
        "PD_Diagnosis_History_03Jan2024.csv",
        "PATNO,EVENT_ID,PDDXDT\n",
    );
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);

    let files = vec![
        "PD_Diagnosis_History.csv".to_string(),
        "Unknown.csv".to_string(),
    ];
    let result = app
        .install_study_files(&files, false, Duration::from_secs(5), &JsonOutput)
        .unwrap();
    assert_eq!(result.downloaded, vec!["PD_Diagnosis_History.csv".to_string()]);
    assert_eq!(result.available, vec!["PD_Diagnosis_History.csv".to_string()]);
    assert_eq!(result.missing, vec!["Unknown.csv".to_string()]);

    let store = app.store();
    assert!(store.study_file_path("PD_Diagnosis_History.csv").as_std_path().is_file());
    let meta = Store::read_metadata(&store.metadata_path("PD_Diagnosis_History.csv"))
        .unwrap()
        .unwrap();
    assert_eq!(meta.source, "ppmi");

    // Present files are not fetched again.
    let again = app
        .install_study_files(&files[..1], false, Duration::from_secs(5), &JsonOutput)
        .unwrap();
    assert!(again.downloaded.is_empty());
}

#[test]
fn disease_duration_downloads_study_files() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default()
        .serve_study_file(
            "PD_Diagnosis_History.csv",
            "PD_Diagnosis_History.csv",
            "PATNO,EVENT_ID,PDDXDT\n3001,SC,01/2010\n",
        )
        .serve_study_file(
            "MDS-UPDRS_Part_III.csv",
            "MDS-UPDRS_Part_III_03Jan2024.csv",
            "PATNO,EVENT_ID,INFODT\n3001,BL,01/2011\n3001,V04,01/2012\n",
        );
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    let output = workspace.root.join("durations.csv");

    let result = app
        .disease_duration(false, Duration::from_secs(5), Some(output.as_std_path()), &JsonOutput)
        .unwrap();
    assert_eq!(
        result.rows.iter().map(|row| row.months).collect::<Vec<_>>(),
        vec![Some(12), Some(24)]
    );
    assert!(output.as_std_path().is_file());
}

#[test]
fn disease_duration_without_study_files() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default();
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);

    let err = app
        .disease_duration(false, Duration::from_secs(5), None, &JsonOutput)
        .unwrap_err();
    assert_matches!(err, LivingParkError::MissingStudyFiles(files) if files.len() == 2);
}

#[test]
fn lookup_reports_expected_path() {
    let workspace = Workspace::new();
    let ppmi = MockPpmi::default();
    let converter = MockConverter::default();
    let app = workspace.app(&ppmi, &converter);
    app.init(false).unwrap();

    let id = StudyFileIdentifier::new("3001", "BL", "MPRAGE").unwrap();
    let result = app.lookup(&id).unwrap();
    assert_eq!(result.path, None);
    assert!(
        result
            .expected_path
            .ends_with("inputs/sub-3001/ses-BL/anat/PPMI_3001_MPRAGE.nii.gz")
    );
}
