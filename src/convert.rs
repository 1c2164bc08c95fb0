use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::cache::file_stem;
use crate::error::LivingParkError;
use crate::fs_util;

pub trait NiftiConverter: Send + Sync {
    /// Convert one DICOM series into NIfTI files written to `output_dir`,
    /// returning the files it produced.
    fn convert(
        &self,
        dicom_files: &[PathBuf],
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, LivingParkError>;

    fn tool_version(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct Dcm2niixConverter {
    binary: Option<PathBuf>,
}

impl Dcm2niixConverter {
    pub fn new() -> Self {
        Self {
            binary: find_in_path("dcm2niix"),
        }
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary: Some(binary),
        }
    }

    fn require_binary(&self) -> Result<&PathBuf, LivingParkError> {
        self.binary
            .as_ref()
            .ok_or_else(|| LivingParkError::MissingTool("dcm2niix".to_string()))
    }

    fn run_cmd(&self, program: &Path, args: &[String]) -> Result<(), LivingParkError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| LivingParkError::FileConversion(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", program.display())
        } else {
            stderr
        };
        Err(LivingParkError::FileConversion(message))
    }
}

impl Default for Dcm2niixConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl NiftiConverter for Dcm2niixConverter {
    fn convert(
        &self,
        dicom_files: &[PathBuf],
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, LivingParkError> {
        let binary = self.require_binary()?;
        if dicom_files.is_empty() {
            return Err(LivingParkError::FileConversion(
                "no DICOM files to convert".to_string(),
            ));
        }
        fs::create_dir_all(output_dir)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;

        // dcm2niix reads whole directories, so the series is staged on its own.
        let staging = tempfile::Builder::new()
            .prefix("livingpark-dicom")
            .tempdir()
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        for (index, file) in dicom_files.iter().enumerate() {
            let name = file
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| format!("{index}.dcm").into());
            fs::copy(file, staging.path().join(name))
                .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        }

        let before = nifti_files(output_dir)?.into_iter().collect::<HashSet<_>>();
        let args = vec![
            "-z".to_string(),
            "y".to_string(),
            "-f".to_string(),
            "%f_%s".to_string(),
            "-o".to_string(),
            output_dir.to_string_lossy().to_string(),
            staging.path().to_string_lossy().to_string(),
        ];
        self.run_cmd(binary, &args)?;

        let produced = nifti_files(output_dir)?
            .into_iter()
            .filter(|path| !before.contains(path))
            .collect::<Vec<_>>();
        if produced.is_empty() {
            return Err(LivingParkError::FileConversion(format!(
                "dcm2niix produced no NIfTI file in {}",
                output_dir.display()
            )));
        }
        Ok(produced)
    }

    fn tool_version(&self) -> Option<String> {
        let binary = self.binary.as_ref()?;
        let output = Command::new(binary).arg("--version").output().ok()?;
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    }
}

fn nifti_files(dir: &Path) -> Result<Vec<PathBuf>, LivingParkError> {
    let mut files = fs_util::walk_files(dir)?
        .into_iter()
        .filter(|path| {
            camino::Utf8Path::from_path(path)
                .and_then(file_stem)
                .is_some()
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
