//! Lookup of downloaded NIfTI images in the notebook cache.
//!
//! The directory tree is the index: the location of a cached image is a pure
//! function of its [`StudyFileIdentifier`] and the cache root, so a lookup is a
//! directory scan plus a name match. Nothing here writes to disk.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::domain::{
    CacheLayout, MatchPolicy, StudyFileIdentifier, SubjectId, TissueClass, VisitId,
    clean_protocol_description,
};
use crate::error::LivingParkError;
use crate::fs_util;

const LOG_TARGET: &str = "livingpark::cache";

#[derive(Debug, Clone)]
pub struct NiftiCache {
    root: Utf8PathBuf,
    base_dir: String,
    layout: CacheLayout,
    policy: MatchPolicy,
}

impl NiftiCache {
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        base_dir: impl Into<String>,
        layout: CacheLayout,
        policy: MatchPolicy,
    ) -> Self {
        Self {
            root: root.into(),
            base_dir: base_dir.into(),
            layout,
            policy,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(
            config.cache_root.clone(),
            config.base_dir.clone(),
            config.layout,
            config.match_policy,
        )
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Distinguishes a misconfigured cache from an empty one.
    pub fn check_root(&self) -> Result<(), LivingParkError> {
        let metadata = match fs::metadata(self.root.as_std_path()) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(LivingParkError::CacheRootMissing(self.root.to_string()));
            }
            Err(err) => {
                return Err(LivingParkError::CacheRootInaccessible {
                    path: self.root.to_string(),
                    reason: err.to_string(),
                });
            }
        };
        if !metadata.is_dir() {
            return Err(LivingParkError::CacheRootInaccessible {
                path: self.root.to_string(),
                reason: "not a directory".to_string(),
            });
        }
        fs::read_dir(self.root.as_std_path()).map_err(|err| {
            LivingParkError::CacheRootInaccessible {
                path: self.root.to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(())
    }

    fn search_root(&self) -> Utf8PathBuf {
        if self.base_dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.base_dir)
        }
    }

    /// Directory holding the images of one subject visit.
    pub fn identifier_dir(&self, id: &StudyFileIdentifier) -> Utf8PathBuf {
        self.visit_dir(&self.search_root(), &id.subject, &id.visit)
    }

    fn visit_dir(&self, base: &Utf8Path, subject: &SubjectId, visit: &VisitId) -> Utf8PathBuf {
        match self.layout {
            CacheLayout::Ppmi => base
                .join(format!("sub-{subject}"))
                .join(format!("ses-{visit}"))
                .join("anat"),
            CacheLayout::Plain => base.join(subject.as_str()).join(visit.as_str()),
        }
    }

    fn expected_stem(&self, id: &StudyFileIdentifier) -> String {
        match self.layout {
            CacheLayout::Ppmi => format!("PPMI_{}_{}", id.subject, id.description.cleaned()),
            CacheLayout::Plain => id.description.cleaned(),
        }
    }

    pub fn expected_file_name(&self, id: &StudyFileIdentifier) -> String {
        match self.layout {
            CacheLayout::Ppmi => format!("{}.nii.gz", self.expected_stem(id)),
            CacheLayout::Plain => format!("{}.nii", self.expected_stem(id)),
        }
    }

    /// Where a downloader must place the image so that later lookups find it.
    pub fn expected_nifti_path(&self, id: &StudyFileIdentifier) -> Utf8PathBuf {
        self.identifier_dir(id).join(self.expected_file_name(id))
    }

    /// Resolve an identifier to its cached image.
    ///
    /// Returns `Ok(None)` on a cache miss. A missing or unreadable cache root is
    /// an error, as is more than one file matching the identifier.
    pub fn find_nifti_file_in_cache(
        &self,
        id: &StudyFileIdentifier,
    ) -> Result<Option<Utf8PathBuf>, LivingParkError> {
        self.check_root()?;

        let dir = self.identifier_dir(id);
        if !dir.as_std_path().is_dir() {
            debug!(target: LOG_TARGET, identifier = %id, path = %dir, "cache miss: no visit directory");
            return Ok(None);
        }

        let candidates = nifti_files(&dir)?;
        let matched = self.select(id, &candidates);
        match matched.as_slice() {
            [] => {
                debug!(
                    target: LOG_TARGET,
                    identifier = %id,
                    policy = ?self.policy,
                    scanned = candidates.len(),
                    "cache miss"
                );
                Ok(None)
            }
            [single] => {
                debug!(target: LOG_TARGET, identifier = %id, path = %single, "cache hit");
                Ok(Some((*single).clone()))
            }
            many => Err(LivingParkError::AmbiguousCacheEntry {
                pattern: dir.join(self.expected_file_name(id)).to_string(),
                candidates: many.iter().map(|path| path.to_string()).collect(),
            }),
        }
    }

    fn select<'a>(
        &self,
        id: &StudyFileIdentifier,
        candidates: &'a [Utf8PathBuf],
    ) -> Vec<&'a Utf8PathBuf> {
        let expected = self.expected_stem(id);
        match self.policy {
            MatchPolicy::Exact => candidates
                .iter()
                .filter(|path| file_stem(path) == Some(expected.as_str()))
                .collect(),
            MatchPolicy::Normalized => {
                let expected = normalize(&expected);
                candidates
                    .iter()
                    .filter(|path| {
                        file_stem(path).map(normalize).as_deref() == Some(expected.as_str())
                    })
                    .collect()
            }
            MatchPolicy::Lenient => {
                let needle = normalize(id.description.as_str());
                let eligible = candidates
                    .iter()
                    .filter(|path| self.has_layout_prefix(path))
                    .collect::<Vec<_>>();
                let strict = eligible
                    .iter()
                    .copied()
                    .filter(|path| {
                        file_stem(path)
                            .map(|stem| normalize(stem).contains(&needle))
                            .unwrap_or(false)
                    })
                    .collect::<Vec<_>>();
                if strict.is_empty() { eligible } else { strict }
            }
        }
    }

    fn has_layout_prefix(&self, path: &Utf8Path) -> bool {
        match self.layout {
            CacheLayout::Ppmi => path
                .file_name()
                .map(|name| name.starts_with("PPMI_"))
                .unwrap_or(false),
            CacheLayout::Plain => true,
        }
    }

    /// Find an SPM tissue class image derived from a cached image, e.g.
    /// `outputs/pre_processing/sub-3001/ses-BL/anat/smwc1PPMI_3001_MPRAGE.nii`.
    pub fn find_tissue_image_in_cache(
        &self,
        tissue_class: TissueClass,
        subject: &SubjectId,
        visit: &VisitId,
        image_prefix: &str,
        pre_processing_dir: &str,
    ) -> Result<Option<Utf8PathBuf>, LivingParkError> {
        self.check_root()?;

        let base = self.root.join("outputs").join(pre_processing_dir);
        let dir = self.visit_dir(&base, subject, visit);
        let prefix = format!("{image_prefix}c{}PPMI", tissue_class.get());
        if !dir.as_std_path().is_dir() {
            return Ok(None);
        }

        let mut matched = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(format!("read {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            let is_match = path
                .file_name()
                .map(|name| name.starts_with(&prefix) && name.ends_with(".nii"))
                .unwrap_or(false);
            if is_match && path.as_std_path().is_file() {
                matched.push(path);
            }
        }
        matched.sort();

        match matched.len() {
            0 => Ok(None),
            1 => Ok(matched.pop()),
            _ => Err(LivingParkError::AmbiguousCacheEntry {
                pattern: dir.join(format!("{prefix}*.nii")).to_string(),
                candidates: matched.iter().map(|path| path.to_string()).collect(),
            }),
        }
    }
}

/// File name without its `.nii` / `.nii.gz` extension, `None` for other files.
pub fn file_stem(path: &Utf8Path) -> Option<&str> {
    let name = path.file_name()?;
    let lower = name.to_ascii_lowercase();
    [".nii.gz", ".nii"]
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| &name[..name.len() - ext.len()])
}

fn normalize(value: &str) -> String {
    clean_protocol_description(value).to_ascii_lowercase()
}

fn nifti_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, LivingParkError> {
    let mut files = fs_util::walk_files(dir.as_std_path())?
        .into_iter()
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .filter(|path| file_stem(path).is_some())
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_strips_both_extensions() {
        assert_eq!(file_stem(Utf8Path::new("a/PPMI_1_T1.nii.gz")), Some("PPMI_1_T1"));
        assert_eq!(file_stem(Utf8Path::new("a/MPRAGE.NII")), Some("MPRAGE"));
        assert_eq!(file_stem(Utf8Path::new("a/notes.txt")), None);
    }

    #[test]
    fn ppmi_layout_paths() {
        let cache = NiftiCache::new(".cache", "inputs", CacheLayout::Ppmi, MatchPolicy::Exact);
        let id = StudyFileIdentifier::new("3001", "BL", "MPRAGE GRAPPA").unwrap();
        assert_eq!(
            cache.expected_nifti_path(&id),
            Utf8PathBuf::from(".cache/inputs/sub-3001/ses-BL/anat/PPMI_3001_MPRAGE_GRAPPA.nii.gz")
        );
    }

    #[test]
    fn plain_layout_without_base_dir() {
        let cache = NiftiCache::new("/data/study", "", CacheLayout::Plain, MatchPolicy::Exact);
        let id = StudyFileIdentifier::new("3001", "BL", "MPRAGE").unwrap();
        assert_eq!(
            cache.expected_nifti_path(&id),
            Utf8PathBuf::from("/data/study/3001/BL/MPRAGE.nii")
        );
    }
}
