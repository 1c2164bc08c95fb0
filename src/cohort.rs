use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{StudyFileIdentifier, SubjectId};
use crate::error::LivingParkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortEntry {
    #[serde(rename = "PATNO")]
    pub patno: String,
    #[serde(rename = "EVENT_ID")]
    pub event_id: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "File name", default)]
    pub file_name: Option<String>,
}

impl CohortEntry {
    pub fn new(patno: &str, event_id: &str, description: &str) -> Self {
        Self {
            patno: patno.to_string(),
            event_id: event_id.to_string(),
            description: description.to_string(),
            file_name: None,
        }
    }

    pub fn identifier(&self) -> Result<StudyFileIdentifier, LivingParkError> {
        StudyFileIdentifier::new(&self.patno, &self.event_id, &self.description)
    }
}

/// Read a cohort produced by a cohort-definition notebook. Extra columns are
/// ignored; `File name` is optional.
pub fn read_cohort(path: &Path) -> Result<Vec<CohortEntry>, LivingParkError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|header| header.trim() == name);
    let required = |name: &str| {
        column(name).ok_or_else(|| LivingParkError::MissingColumn {
            file: path.display().to_string(),
            column: name.to_string(),
        })
    };

    let patno = required("PATNO")?;
    let event_id = required("EVENT_ID")?;
    let description = required("Description")?;
    let file_name = column("File name");

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |index: usize| record.get(index).unwrap_or("").trim().to_string();
        entries.push(CohortEntry {
            patno: field(patno),
            event_id: field(event_id),
            description: field(description),
            file_name: file_name.map(field).filter(|value| !value.is_empty()),
        });
    }
    Ok(entries)
}

pub fn write_cohort(path: &Path, entries: &[CohortEntry]) -> Result<(), LivingParkError> {
    let mut writer = csv::Writer::from_path(path)?;
    for entry in entries {
        writer.serialize(entry)?;
    }
    writer
        .flush()
        .map_err(|err| LivingParkError::Filesystem(err.to_string()))
}

/// Stable identifier of a cohort, derived from its sorted subject ids.
///
/// Used in file names consumed by SPM, so the result is plain lowercase hex
/// and never contains a `-`.
pub fn cohort_id(entries: &[CohortEntry]) -> String {
    let mut patnos = entries
        .iter()
        .map(|entry| entry.patno.as_str())
        .collect::<Vec<_>>();
    patnos.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    });
    let hash = blake3::hash(patnos.join(",").as_bytes());
    hash.to_hex()[..16].to_string()
}

/// Distinct subject ids in order of first appearance.
pub fn unique_subjects(entries: &[CohortEntry]) -> Result<Vec<SubjectId>, LivingParkError> {
    let mut seen = std::collections::HashSet::new();
    let mut subjects = Vec::new();
    for entry in entries {
        let subject = entry.patno.parse::<SubjectId>()?;
        if seen.insert(subject.clone()) {
            subjects.push(subject);
        }
    }
    Ok(subjects)
}
