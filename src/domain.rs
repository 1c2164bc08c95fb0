use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::LivingParkError;

/// PPMI imaging visit names keyed by the EVENT_ID used in the study files.
const VISIT_NAMES: &[(&str, &str)] = &[
    ("SC", "Screening"),
    ("BL", "Baseline"),
    ("V01", "Month 3"),
    ("V02", "Month 6"),
    ("V03", "Month 9"),
    ("V04", "Month 12"),
    ("V05", "Month 18"),
    ("V06", "Month 24"),
    ("V07", "Month 30"),
    ("V08", "Month 36"),
    ("V09", "Month 42"),
    ("V10", "Month 48"),
    ("V11", "Month 54"),
    ("V12", "Month 60"),
    ("V13", "Month 72"),
    ("V14", "Month 84"),
    ("V15", "Month 96"),
    ("V16", "Month 108"),
    ("V17", "Month 120"),
    ("V18", "Month 132"),
    ("V19", "Month 144"),
    ("V20", "Month 156"),
    ("ST", "Symptomatic Therapy"),
    ("U01", "Unscheduled Visit 01"),
    ("U02", "Unscheduled Visit 02"),
    ("PW", "Premature Withdrawal"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DownloaderKind {
    Ppmi,
}

impl fmt::Display for DownloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloaderKind::Ppmi => write!(f, "ppmi"),
        }
    }
}

/// How cached files are nested below the cache root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayout {
    /// `sub-<subject>/ses-<visit>/anat/PPMI_<subject>_<description>.nii.gz`
    #[default]
    Ppmi,
    /// `<subject>/<visit>/<description>.nii`
    Plain,
}

/// How a free-text protocol description is compared with file names on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// File stem must equal the expected stem byte for byte.
    Exact,
    /// Stems are compared after cleaning and ASCII case folding.
    #[default]
    Normalized,
    /// Cleaned description as a case-insensitive substring, falling back to the
    /// only NIfTI file of the visit directory.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectId {
    type Err = LivingParkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !is_path_token(trimmed) {
            return Err(LivingParkError::InvalidSubjectId(value.to_string()));
        }
        // PATNO columns are sometimes read back as floats ("3001.0").
        let normalized = trimmed
            .strip_suffix(".0")
            .filter(|rest| !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_digit()))
            .unwrap_or(trimmed);
        Ok(Self(normalized.to_string()))
    }
}

impl From<u32> for SubjectId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisitId(String);

impl VisitId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the visit in the PPMI imaging database, e.g. `BL` -> `Baseline`.
    pub fn visit_name(&self) -> Option<&'static str> {
        VISIT_NAMES
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, name)| *name)
    }

    pub fn from_visit_name(name: &str) -> Option<Self> {
        let name = name.trim();
        VISIT_NAMES
            .iter()
            .find(|(_, candidate)| candidate.eq_ignore_ascii_case(name))
            .map(|(code, _)| Self((*code).to_string()))
    }
}

impl fmt::Display for VisitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VisitId {
    type Err = LivingParkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !is_path_token(&normalized) {
            return Err(LivingParkError::InvalidVisitId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolDescription(String);

impl ProtocolDescription {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Description as it appears in PPMI file names.
    pub fn cleaned(&self) -> String {
        clean_protocol_description(&self.0)
    }
}

impl fmt::Display for ProtocolDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProtocolDescription {
    type Err = LivingParkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(LivingParkError::InvalidDescription(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Replace whitespace, parentheses and slashes with underscores, as PPMI does
/// when naming downloaded files. `"MPRAGE GRAPPA"` becomes `"MPRAGE_GRAPPA"`.
pub fn clean_protocol_description(description: &str) -> String {
    description
        .chars()
        .map(|ch| {
            if ch.is_whitespace() || matches!(ch, '(' | ')' | '/') {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudyFileIdentifier {
    pub subject: SubjectId,
    pub visit: VisitId,
    pub description: ProtocolDescription,
}

impl StudyFileIdentifier {
    pub fn new(subject: &str, visit: &str, description: &str) -> Result<Self, LivingParkError> {
        Ok(Self {
            subject: subject.parse()?,
            visit: visit.parse()?,
            description: description.parse()?,
        })
    }
}

impl fmt::Display for StudyFileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subject, self.visit, self.description)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TissueClass(u8);

impl TissueClass {
    pub fn new(value: u8) -> Result<Self, LivingParkError> {
        if (1..=6).contains(&value) {
            Ok(Self(value))
        } else {
            Err(LivingParkError::InvalidTissueClass(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

fn is_path_token(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value
            .chars()
            .any(|ch| ch == '/' || ch == '\\' || ch.is_whitespace() || ch.is_control())
}
