use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::LivingParkError;

/// Unpack a PPMI imaging archive, refusing entries that escape `target_dir`.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, LivingParkError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        LivingParkError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| LivingParkError::Filesystem(err.to_string()))?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(LivingParkError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        extracted.push(entry_path);
    }
    Ok(extracted)
}

pub fn validate_zip(zip_path: &Path) -> Result<(), LivingParkError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        LivingParkError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| LivingParkError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// All regular files below `root`, depth first.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, LivingParkError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| {
            LivingParkError::Filesystem(format!("read {}: {err}", path.display()))
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                items.push(path);
            }
        }
    }
    Ok(items)
}

/// Files below `root` whose name ends with `suffix` (ASCII case-insensitive).
pub fn find_files_with_suffix(root: &Path, suffix: &str) -> Result<Vec<PathBuf>, LivingParkError> {
    let suffix = suffix.to_ascii_lowercase();
    let mut files = walk_files(root)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.to_ascii_lowercase().ends_with(&suffix))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}
