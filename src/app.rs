use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::NiftiCache;
use crate::clinical::{self, DIAGNOSIS_HISTORY_FILE, DiseaseDuration, UPDRS_PART_III_FILE};
use crate::cohort::{CohortEntry, unique_subjects};
use crate::convert::NiftiConverter;
use crate::domain::{StudyFileIdentifier, SubjectId};
use crate::error::LivingParkError;
use crate::fs_util;
use crate::mri::{self, MRI_INFO_FILE, MRI_INFO_SOURCE_FILE, MriFilterSummary};
use crate::ppmi::{self, PpmiClient};
use crate::store::{Metadata, SetupResult, Store};

#[derive(Debug, Clone)]
pub struct T1Options {
    pub symlink: bool,
    pub force: bool,
    /// Per-subject download timeout; a batch gets `timeout * batch length`.
    pub timeout: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct T1Result {
    pub success: Vec<CohortEntry>,
    pub missing: Vec<CohortEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyFilesResult {
    pub available: Vec<String>,
    pub downloaded: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupResult {
    pub identifier: String,
    pub expected_path: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiseaseDurationResult {
    pub output: Option<String>,
    pub rows: Vec<DiseaseDuration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MriMetadataResult {
    pub output: String,
    #[serde(flatten)]
    pub summary: MriFilterSummary,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Clone)]
pub struct App<P: PpmiClient, C: NiftiConverter> {
    store: Store,
    cache: NiftiCache,
    ppmi: P,
    converter: C,
}

impl<P: PpmiClient, C: NiftiConverter> App<P, C> {
    pub fn new(store: Store, cache: NiftiCache, ppmi: P, converter: C) -> Self {
        Self {
            store,
            cache,
            ppmi,
            converter,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cache(&self) -> &NiftiCache {
        &self.cache
    }

    pub fn init(&self, link: bool) -> Result<SetupResult, LivingParkError> {
        self.store.ensure_study_files_dir()?;
        self.store.setup_notebook_cache(link)
    }

    pub fn lookup(&self, id: &StudyFileIdentifier) -> Result<LookupResult, LivingParkError> {
        let path = self.cache.find_nifti_file_in_cache(id)?;
        Ok(LookupResult {
            identifier: id.to_string(),
            expected_path: self.cache.expected_nifti_path(id).to_string(),
            path: path.map(|path| path.to_string()),
        })
    }

    /// Download the study files that are not already present. A failed
    /// download is logged and reported in `missing`.
    pub fn install_study_files(
        &self,
        files: &[String],
        force: bool,
        timeout: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<StudyFilesResult, LivingParkError> {
        let needed = self.store.missing_study_files(files, force);
        let mut downloaded = Vec::new();

        if !needed.is_empty() {
            self.store.ensure_study_files_dir()?;
            sink.event(ProgressEvent {
                message: format!("phase=Download; {} study file(s)", needed.len()),
                elapsed: None,
            });
        }

        for name in &needed {
            let start = Instant::now();
            match self.download_study_file(name, timeout) {
                Ok(installed) => {
                    sink.event(ProgressEvent {
                        message: format!("ppmi.response file={installed}"),
                        elapsed: Some(start.elapsed()),
                    });
                    downloaded.push(installed);
                }
                Err(err) => {
                    warn!(file = %name, error = %err, "study file download failed");
                }
            }
        }

        let missing = self.store.missing_study_files(files, false);
        let available = files
            .iter()
            .filter(|name| !missing.contains(*name))
            .cloned()
            .collect();
        Ok(StudyFilesResult {
            available,
            downloaded,
            missing,
        })
    }

    fn download_study_file(&self, name: &str, timeout: Duration) -> Result<String, LivingParkError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("livingpark-study")
            .tempdir_in(self.store.study_files_dir().as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        let downloaded = self.ppmi.download_study_file(name, temp_dir.path(), timeout)?;
        let received = downloaded
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| LivingParkError::Filesystem("non-utf8 study file name".to_string()))?;
        let installed = ppmi::strip_download_date_suffix(received);

        let destination = self.store.study_file_path(&installed);
        Store::move_file(&downloaded, &destination)?;
        let meta = build_metadata("ppmi", &installed, destination.as_str());
        Store::write_metadata(&self.store.metadata_path(&installed), &meta)?;
        info!(file = %installed, path = %destination, "installed study file");
        Ok(installed)
    }

    /// Cohort entries whose image is not in the cache yet.
    pub fn missing_t1_nifti_files(
        &self,
        cohort: &[CohortEntry],
        force: bool,
    ) -> Result<Vec<CohortEntry>, LivingParkError> {
        if force {
            return Ok(cohort.to_vec());
        }
        let mut missing = Vec::new();
        for entry in cohort {
            if self.cache.find_nifti_file_in_cache(&entry.identifier()?)?.is_none() {
                missing.push(entry.clone());
            }
        }
        Ok(missing)
    }

    /// Download the T1 images of a cohort into the cache, in batches of
    /// subjects, and fill in each entry's `File name`.
    pub fn get_t1_nifti_files(
        &self,
        cohort: &[CohortEntry],
        options: T1Options,
        sink: &dyn ProgressSink,
    ) -> Result<T1Result, LivingParkError> {
        // Validate every identifier before touching the network.
        for entry in cohort {
            entry.identifier()?;
        }
        self.store.ensure_cache_root()?;

        let pending = self.missing_t1_nifti_files(cohort, options.force)?;
        let subjects = unique_subjects(&pending)?;

        let total = subjects.len().div_ceil(options.batch_size.max(1));
        for (index, batch) in ppmi::batched(&subjects, options.batch_size).enumerate() {
            sink.event(ProgressEvent {
                message: format!("phase=Download; batch {}/{total} ({} subjects)", index + 1, batch.len()),
                elapsed: None,
            });
            let timeout = options.timeout * batch.len() as u32;
            match self.download_batch(batch, &pending, timeout, sink) {
                Ok(()) => {}
                Err(LivingParkError::PpmiTimeout(message)) => {
                    warn!(batch = index + 1, %message, "download timed out, stopping");
                    break;
                }
                Err(err) => {
                    warn!(batch = index + 1, error = %err, "batch download failed");
                }
            }
        }

        let mut success = Vec::new();
        let mut missing = Vec::new();
        for entry in cohort {
            let id = entry.identifier()?;
            let mut entry = entry.clone();
            match self.cache.find_nifti_file_in_cache(&id)? {
                Some(path) => {
                    if options.symlink {
                        self.store.link_in_outputs(&path, &id)?;
                    }
                    entry.file_name = Some(path.to_string());
                    success.push(entry);
                }
                None => {
                    entry.file_name = None;
                    missing.push(entry);
                }
            }
        }

        if !missing.is_empty() {
            warn!(count = missing.len(), "images are still missing from the cache");
        }
        Ok(T1Result { success, missing })
    }

    fn download_batch(
        &self,
        batch: &[SubjectId],
        pending: &[CohortEntry],
        timeout: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<(), LivingParkError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("livingpark-images")
            .tempdir_in(self.store.cache_root().as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        let archive = temp_dir.path().join("images.zip");

        let start = Instant::now();
        let download = self.ppmi.download_imaging(batch, &archive, timeout);
        sink.event(ProgressEvent {
            message: "ppmi.response".to_string(),
            elapsed: Some(start.elapsed()),
        });

        // A timed out transfer may still have produced a usable archive.
        let timed_out = match download {
            Ok(info) if !info.is_zip => {
                return Err(LivingParkError::Filesystem(
                    "expected imaging download to be a zip archive".to_string(),
                ));
            }
            Ok(_) => None,
            Err(LivingParkError::PpmiTimeout(message)) => Some(message),
            Err(err) => return Err(err),
        };
        if let Some(message) = &timed_out {
            if fs_util::validate_zip(&archive).is_err() {
                return Err(LivingParkError::PpmiTimeout(message.clone()));
            }
        } else {
            fs_util::validate_zip(&archive)?;
        }

        let extracted = temp_dir.path().join("extracted");
        fs_util::extract_zip(&archive, &extracted)?;
        sink.event(ProgressEvent {
            message: "phase=Store; mapping images into the cache".to_string(),
            elapsed: None,
        });
        let subjects = batch.iter().collect::<HashSet<_>>();
        for entry in pending {
            let id = entry.identifier()?;
            if !subjects.contains(&id.subject) {
                continue;
            }
            match self.map_downloaded_image(&extracted, &id) {
                Ok(path) => info!(identifier = %id, path = %path, "cached image"),
                Err(err) => warn!(identifier = %id, error = %err, "could not map downloaded image"),
            }
        }

        match timed_out {
            Some(message) => Err(LivingParkError::PpmiTimeout(message)),
            None => Ok(()),
        }
    }

    /// Move the image of `id` from an extracted collection to its cache path,
    /// converting the DICOM series when the collection has no NIfTI file.
    fn map_downloaded_image(
        &self,
        extracted: &Path,
        id: &StudyFileIdentifier,
    ) -> Result<Utf8PathBuf, LivingParkError> {
        let source = match self.find_downloaded_nifti(extracted, id)? {
            Some(path) => path,
            None => {
                let dicom = ppmi::find_dicom(extracted, id)?;
                debug!(
                    identifier = %id,
                    files = dicom.len(),
                    tool = ?self.converter.tool_version(),
                    "converting DICOM series"
                );
                let out_dir = extracted.join(format!("nifti-{}-{}", id.subject, id.visit));
                let mut produced = self.converter.convert(&dicom, &out_dir)?;
                produced.sort_by_key(|path| !is_gzipped(path));
                produced.into_iter().next().ok_or_else(|| {
                    LivingParkError::FileConversion(format!("no NIfTI file produced for {id}"))
                })?
            }
        };

        let destination = self.destination_for(id, &source);
        Store::move_file(&source, &destination)?;
        Ok(destination)
    }

    /// The NIfTI image of `id` in an extracted collection, resolved through the
    /// XML sidecar so that images of other visits of the same subject are never
    /// picked up.
    fn find_downloaded_nifti(
        &self,
        extracted: &Path,
        id: &StudyFileIdentifier,
    ) -> Result<Option<PathBuf>, LivingParkError> {
        let prefix = format!("PPMI_{}_", id.subject);
        let candidates = fs_util::walk_files(extracted)?
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let stem = nifti_stem(name)?;
                name.starts_with(&prefix).then(|| (stem.to_string(), path.clone()))
            })
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut matches = Vec::new();
        for meta in ppmi::find_image_metadata(extracted, id)? {
            let (Some(series), Some(image)) = (meta.series_id, meta.image_id) else {
                continue;
            };
            let suffix = format!("_S{series}_I{image}");
            matches.extend(
                candidates
                    .iter()
                    .filter(|(stem, _)| stem.ends_with(&suffix))
                    .map(|(_, path)| path.clone()),
            );
        }
        matches.sort();
        matches.dedup();
        match matches.len() {
            0 => {
                debug!(identifier = %id, "no downloaded NIfTI image belongs to this visit");
                Ok(None)
            }
            1 => Ok(matches.pop()),
            _ => Err(LivingParkError::FileMatching(format!(
                "several downloaded images match {id}: {matches:?}"
            ))),
        }
    }

    /// The layout's expected path, with the compression suffix of `source`.
    fn destination_for(&self, id: &StudyFileIdentifier, source: &Path) -> Utf8PathBuf {
        let expected = self.cache.expected_nifti_path(id);
        match (is_gzipped(source), expected.extension() == Some("gz")) {
            (true, false) => Utf8PathBuf::from(format!("{expected}.gz")),
            (false, true) => expected.with_extension(""),
            _ => expected,
        }
    }

    /// Disease duration for every MDS-UPDRS Part III exam, written to `output`
    /// when given.
    pub fn disease_duration(
        &self,
        force: bool,
        timeout: Duration,
        output: Option<&Path>,
        sink: &dyn ProgressSink,
    ) -> Result<DiseaseDurationResult, LivingParkError> {
        let files = [DIAGNOSIS_HISTORY_FILE.to_string(), UPDRS_PART_III_FILE.to_string()];
        let installed = self.install_study_files(&files, force, timeout, sink)?;
        if !installed.missing.is_empty() {
            return Err(LivingParkError::MissingStudyFiles(installed.missing));
        }

        sink.event(ProgressEvent {
            message: "phase=Compute; disease duration".to_string(),
            elapsed: None,
        });
        let diagnoses = clinical::read_diagnosis_history(
            self.store.study_file_path(DIAGNOSIS_HISTORY_FILE).as_std_path(),
        )?;
        let exams = clinical::read_updrs_part_iii(
            self.store.study_file_path(UPDRS_PART_III_FILE).as_std_path(),
        )?;
        let rows = clinical::disease_duration(&diagnoses, &exams)?;
        if let Some(output) = output {
            clinical::write_disease_durations(output, &rows)?;
        }
        Ok(DiseaseDurationResult {
            output: output.map(|path| path.display().to_string()),
            rows,
        })
    }

    /// Write the sagittal T1 subset of the imaging metadata table.
    pub fn mri_metadata(
        &self,
        input: Option<&Path>,
        output: Option<&Path>,
        timeout: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<MriMetadataResult, LivingParkError> {
        let input = match input {
            Some(path) => path.to_path_buf(),
            None => {
                let files = [MRI_INFO_SOURCE_FILE.to_string()];
                let installed = self.install_study_files(&files, false, timeout, sink)?;
                if !installed.missing.is_empty() {
                    return Err(LivingParkError::MissingStudyFiles(installed.missing));
                }
                self.store
                    .study_file_path(MRI_INFO_SOURCE_FILE)
                    .into_std_path_buf()
            }
        };
        let output = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.store.study_file_path(MRI_INFO_FILE).into_std_path_buf());

        let summary = mri::filter_t1_sagittal(&input, &output)?;
        Ok(MriMetadataResult {
            output: output.display().to_string(),
            summary,
        })
    }
}

/// File name without its `.nii` or `.nii.gz` extension, if it is a NIfTI file.
fn nifti_stem(name: &str) -> Option<&str> {
    let lower = name.to_ascii_lowercase();
    [".nii.gz", ".nii"]
        .into_iter()
        .find(|ext| lower.ends_with(ext))
        .map(|ext| &name[..name.len() - ext.len()])
}

fn is_gzipped(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

fn build_metadata(source: &str, file: &str, path: &str) -> Metadata {
    Metadata {
        source: source.to_string(),
        file: file.to_string(),
        downloaded_at: iso_timestamp(),
        tool: format!("livingpark/{}", env!("CARGO_PKG_VERSION")),
        resolved_path: path.to_string(),
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
