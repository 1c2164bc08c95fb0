use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LivingParkError {
    #[error("invalid subject id: {0:?}")]
    InvalidSubjectId(String),

    #[error("invalid visit id: {0:?}")]
    InvalidVisitId(String),

    #[error("invalid protocol description: {0:?}")]
    InvalidDescription(String),

    #[error("invalid MoCA score: {0} (expected 0..=30)")]
    InvalidMocaScore(u32),

    #[error("unrecognized tissue class: {0} (expected 1..=6)")]
    InvalidTissueClass(u8),

    #[error("invalid date: {0:?}")]
    InvalidDate(String),

    #[error("cache root does not exist: {0}")]
    #[diagnostic(help("create the directory or point `cache_root` in livingpark.json at the study cache"))]
    CacheRootMissing(String),

    #[error("cache root is not accessible: {path}: {reason}")]
    CacheRootInaccessible { path: String, reason: String },

    #[error("more than one NIfTI file matched {pattern}: {candidates:?}")]
    AmbiguousCacheEntry {
        pattern: String,
        candidates: Vec<String>,
    },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("{file} is missing required column {column:?}")]
    MissingColumn { file: String, column: String },

    #[error("study files are not available: {0:?}")]
    #[diagnostic(help("download them from the PPMI website into the study files directory"))]
    MissingStudyFiles(Vec<String>),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("PPMI request failed: {0}")]
    PpmiHttp(String),

    #[error("PPMI returned status {status}: {message}")]
    PpmiStatus { status: u16, message: String },

    #[error("PPMI download timed out: {0}")]
    PpmiTimeout(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("file conversion failed: {0}")]
    FileConversion(String),

    #[error("{0}")]
    FileMatching(String),

    #[error("failed to read image metadata: {0}")]
    Metadata(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl From<csv::Error> for LivingParkError {
    fn from(err: csv::Error) -> Self {
        LivingParkError::Csv(err.to_string())
    }
}
