use std::fs;
use std::path::{Component, Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::ResolvedConfig;
use crate::domain::StudyFileIdentifier;
use crate::error::LivingParkError;

/// Notebook workspace: the cache tree, the study files directory and the
/// `inputs`/`outputs` entry points next to the notebook.
#[derive(Debug, Clone)]
pub struct Store {
    work_dir: Utf8PathBuf,
    cache_root: Utf8PathBuf,
    study_files_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupResult {
    pub cache_root: String,
    pub linked: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub source: String,
    pub file: String,
    pub downloaded_at: String,
    pub tool: String,
    pub resolved_path: String,
}

impl Store {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new_with_paths(
            Utf8PathBuf::from("."),
            config.cache_root.clone(),
            config.study_files_dir.clone(),
        )
    }

    pub fn new_with_paths(
        work_dir: Utf8PathBuf,
        cache_root: Utf8PathBuf,
        study_files_dir: Utf8PathBuf,
    ) -> Self {
        Self {
            work_dir,
            cache_root,
            study_files_dir,
        }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn study_files_dir(&self) -> &Utf8Path {
        &self.study_files_dir
    }

    pub fn inputs_dir(&self) -> Utf8PathBuf {
        self.cache_root.join("inputs")
    }

    pub fn outputs_dir(&self) -> Utf8PathBuf {
        self.cache_root.join("outputs")
    }

    pub fn pre_processing_anat_dir(&self, id: &StudyFileIdentifier) -> Utf8PathBuf {
        self.outputs_dir()
            .join("pre_processing")
            .join(format!("sub-{}", id.subject))
            .join(format!("ses-{}", id.visit))
            .join("anat")
    }

    pub fn study_file_path(&self, name: &str) -> Utf8PathBuf {
        self.study_files_dir.join(name)
    }

    pub fn metadata_path(&self, name: &str) -> Utf8PathBuf {
        self.study_files_dir
            .join(".metadata")
            .join(format!("{name}.json"))
    }

    pub fn ensure_cache_root(&self) -> Result<(), LivingParkError> {
        fs::create_dir_all(self.cache_root.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))
    }

    pub fn ensure_study_files_dir(&self) -> Result<(), LivingParkError> {
        fs::create_dir_all(self.study_files_dir.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))
    }

    /// Create the cache tree and, with `link`, point `inputs` and `outputs` in
    /// the working directory at it. An existing real directory is never replaced.
    pub fn setup_notebook_cache(&self, link: bool) -> Result<SetupResult, LivingParkError> {
        let mut linked = Vec::new();
        for dir in [self.inputs_dir(), self.outputs_dir()] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        }

        if link {
            for name in ["inputs", "outputs"] {
                let entry = self.work_dir.join(name);
                match fs::symlink_metadata(entry.as_std_path()) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        fs::remove_file(entry.as_std_path())
                            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
                    }
                    Ok(_) => {
                        return Err(LivingParkError::Filesystem(format!(
                            "{entry} exists and is not a symlink"
                        )));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(LivingParkError::Filesystem(err.to_string())),
                }
                let target = absolute(self.cache_root.join(name).as_std_path())?;
                make_link(&target, entry.as_std_path())?;
                linked.push(entry.to_string());
            }
        }

        Ok(SetupResult {
            cache_root: self.cache_root.to_string(),
            linked,
        })
    }

    pub fn missing_study_files(&self, files: &[String], force: bool) -> Vec<String> {
        if force {
            return files.to_vec();
        }
        files
            .iter()
            .filter(|name| !self.study_file_path(name).as_std_path().exists())
            .cloned()
            .collect()
    }

    /// Link a cached input image under `outputs/pre_processing`, where tools
    /// such as SPM write their results next to their inputs.
    pub fn link_in_outputs(
        &self,
        input: &Utf8Path,
        id: &StudyFileIdentifier,
    ) -> Result<Utf8PathBuf, LivingParkError> {
        let file_name = input
            .file_name()
            .ok_or_else(|| LivingParkError::Filesystem(format!("invalid input path {input}")))?;
        let out_dir = self.pre_processing_anat_dir(id);
        fs::create_dir_all(out_dir.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        let output = out_dir.join(file_name);

        if let Ok(meta) = fs::symlink_metadata(output.as_std_path()) {
            if meta.file_type().is_symlink() || meta.is_file() {
                fs::remove_file(output.as_std_path())
                    .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
            }
        }

        let target = relative_to(
            &absolute(input.as_std_path())?,
            &absolute(out_dir.as_std_path())?,
        );
        make_link(&target, output.as_std_path())?;
        Ok(output)
    }

    pub fn write_metadata(path: &Utf8Path, metadata: &Metadata) -> Result<(), LivingParkError> {
        let content = serde_json::to_vec_pretty(metadata)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn read_metadata(path: &Utf8Path) -> Result<Option<Metadata>, LivingParkError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), LivingParkError> {
        let parent = path
            .parent()
            .ok_or_else(|| LivingParkError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("livingpark-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Move a file into the cache, copying when a rename crosses filesystems.
    pub fn move_file(source: &Path, dest: &Utf8Path) -> Result<(), LivingParkError> {
        let parent = dest
            .parent()
            .ok_or_else(|| LivingParkError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        if fs::rename(source, dest.as_std_path()).is_ok() {
            return Ok(());
        }
        let temp = tempfile::Builder::new()
            .prefix("livingpark-move")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        fs::copy(source, temp.path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        fs::remove_file(source).map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn absolute(path: &Path) -> Result<PathBuf, LivingParkError> {
    std::path::absolute(path).map_err(|err| LivingParkError::Filesystem(err.to_string()))
}

/// Path of `target` as seen from directory `base`; both must be absolute.
fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target = normal_components(target);
    let base = normal_components(base);
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for part in &target[common..] {
        relative.push(part);
    }
    relative
}

fn normal_components(path: &Path) -> Vec<Component<'_>> {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> Result<(), LivingParkError> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|err| LivingParkError::Filesystem(format!("symlink {}: {err}", link.display())))
}

// Symlinks need elevated rights on Windows; plain copies keep the layout usable.
#[cfg(not(unix))]
fn make_link(target: &Path, link: &Path) -> Result<(), LivingParkError> {
    let source = match link.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target.to_path_buf(),
    };
    if source.is_dir() {
        return fs::create_dir_all(link).map_err(|err| LivingParkError::Filesystem(err.to_string()));
    }
    fs::copy(&source, link)
        .map(|_| ())
        .map_err(|err| LivingParkError::Filesystem(err.to_string()))
}
