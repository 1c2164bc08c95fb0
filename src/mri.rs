//! Selection of sagittal 3D T1-weighted acquisitions from the PPMI imaging
//! metadata table (`3D_mri_info.csv`).

use std::path::Path;

use csv::StringRecord;
use serde::Serialize;
use tracing::warn;

use crate::domain::VisitId;
use crate::error::LivingParkError;

pub const MRI_INFO_SOURCE_FILE: &str = "3D_mri_info.csv";
pub const MRI_INFO_FILE: &str = "MRI_info.csv";

const VISIT_CODE_COLUMN: &str = "Visit code";

/// Descriptions of non-sagittal or calibration sequences.
const EXCLUDED_DESCRIPTIONS: &[&str] = &[
    "COR",
    "Coronal",
    "Cal Head 24",
    "Transverse",
    "tra_T1_MPRAGE",
    "TRA",
];

const EXCLUDED_FRAGMENTS: &[&str] = &["AX", "Ax", "axial", "Phantom", "T2"];

#[derive(Debug, Clone, Serialize)]
pub struct MriFilterSummary {
    pub total: usize,
    pub kept: usize,
    pub unknown_visits: Vec<String>,
}

/// A T1 acquisition is flagged by its protocol weighting or by `t1`/`T1` in the
/// description, since the weighting field is unreliable.
pub fn is_t1(imaging_protocol: &str, description: &str) -> bool {
    imaging_protocol.contains("Weighting=T1")
        || description.contains("t1")
        || description.contains("T1")
}

pub fn is_sagittal(description: &str) -> bool {
    !EXCLUDED_DESCRIPTIONS.contains(&description)
        && !EXCLUDED_FRAGMENTS
            .iter()
            .any(|fragment| description.contains(fragment))
}

/// Filter `input` to sagittal T1 scans and write them to `output` with an
/// extra `Visit code` column.
pub fn filter_t1_sagittal(input: &Path, output: &Path) -> Result<MriFilterSummary, LivingParkError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(input)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim() == name)
            .ok_or_else(|| LivingParkError::MissingColumn {
                file: input.display().to_string(),
                column: name.to_string(),
            })
    };
    let protocol = column("Imaging Protocol")?;
    let description = column("Description")?;
    let visit = column("Visit")?;

    let mut writer = csv::Writer::from_path(output)?;
    let mut out_headers = headers.clone();
    out_headers.push_field(VISIT_CODE_COLUMN);
    writer.write_record(&out_headers)?;

    let mut summary = MriFilterSummary {
        total: 0,
        kept: 0,
        unknown_visits: Vec::new(),
    };
    for record in reader.records() {
        let record = record?;
        summary.total += 1;
        let desc = record.get(description).unwrap_or("").trim();
        if !is_t1(record.get(protocol).unwrap_or(""), desc) || !is_sagittal(desc) {
            continue;
        }
        let visit_name = record.get(visit).unwrap_or("").trim();
        let Some(code) = VisitId::from_visit_name(visit_name) else {
            warn!(visit = visit_name, "dropping scan with unknown visit name");
            if !summary.unknown_visits.iter().any(|seen| seen == visit_name) {
                summary.unknown_visits.push(visit_name.to_string());
            }
            continue;
        };
        let mut row: StringRecord = record.clone();
        row.push_field(code.as_str());
        writer.write_record(&row)?;
        summary.kept += 1;
    }
    writer
        .flush()
        .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
    Ok(summary)
}
