//! Clinical metrics for Parkinson's disease cohorts.

use std::collections::HashMap;
use std::path::Path;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::LivingParkError;

pub const DIAGNOSIS_HISTORY_FILE: &str = "PD_Diagnosis_History.csv";
pub const UPDRS_PART_III_FILE: &str = "MDS-UPDRS_Part_III.csv";

/// MMSE equivalents of MoCA scores 1..=30, Table 2 of van Steenoven et al. (2014),
/// <https://www.ncbi.nlm.nih.gov/pmc/articles/PMC4371590>.
const MOCA_TO_MMSE: [u8; 30] = [
    6, 9, 11, 12, 13, 14, 15, 15, 16, 17, 18, 18, 19, 20, 21, 22, 22, 23, 24, 25, 26, 26, 27, 28,
    28, 29, 29, 30, 30, 30,
];

/// Convert a MoCA score to its MMSE equivalent. A score of 0 is outside the
/// conversion table and is returned unchanged.
pub fn moca_to_mmse(moca_score: u32) -> Result<u8, LivingParkError> {
    match moca_score {
        0 => Ok(0),
        1..=30 => Ok(MOCA_TO_MMSE[moca_score as usize - 1]),
        _ => Err(LivingParkError::InvalidMocaScore(moca_score)),
    }
}

/// Parse the date formats found in PPMI study files (`MM/YYYY` for most
/// visit dates). Dates without a day fall on the first of the month.
pub fn parse_ppmi_date(value: &str) -> Result<NaiveDate, LivingParkError> {
    let value = value.trim();
    let invalid = || LivingParkError::InvalidDate(value.to_string());

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%m/%d/%Y") {
        return Ok(date);
    }

    let (first, second) = value
        .split_once('/')
        .or_else(|| value.split_once('-'))
        .ok_or_else(invalid)?;
    let (year, month) = if value.contains('/') {
        (second, first)
    } else {
        (first, second)
    };
    if year.len() != 4 {
        return Err(invalid());
    }
    let year = year.parse::<i32>().map_err(|_| invalid())?;
    let month = month.parse::<u32>().map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)
}

/// Whole months between two dates, regardless of order. A trailing partial
/// month is not counted; adding months clips to the end of shorter months, so
/// Jan 31 to Feb 29 is one month.
pub fn month_difference(a: NaiveDate, b: NaiveDate) -> u32 {
    let (later, earlier) = if a >= b { (a, b) } else { (b, a) };
    let mut months = ((later.year() - earlier.year()) * 12 + later.month() as i32
        - earlier.month() as i32)
        .max(0) as u32;
    while months > 0
        && earlier
            .checked_add_months(Months::new(months))
            .is_none_or(|date| date > later)
    {
        months -= 1;
    }
    months
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisRecord {
    pub patno: String,
    pub event_id: String,
    pub diagnosis_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamRecord {
    pub patno: String,
    pub event_id: String,
    pub exam_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiseaseDuration {
    #[serde(rename = "PATNO")]
    pub patno: String,
    #[serde(rename = "EVENT_ID")]
    pub event_id: String,
    #[serde(rename = "PDXDUR")]
    pub months: Option<u32>,
}

/// Disease duration in months at each exam, measured from the diagnosis date
/// recorded at screening. Subjects without such a date get no duration.
pub fn disease_duration(
    diagnoses: &[DiagnosisRecord],
    exams: &[ExamRecord],
) -> Result<Vec<DiseaseDuration>, LivingParkError> {
    let mut diagnosis_dates = HashMap::new();
    for record in diagnoses {
        if record.event_id != "SC" {
            continue;
        }
        if let Some(date) = record.diagnosis_date.as_deref() {
            diagnosis_dates.insert(record.patno.as_str(), parse_ppmi_date(date)?);
        }
    }

    exams
        .iter()
        .map(|exam| -> Result<DiseaseDuration, LivingParkError> {
            let months = match (diagnosis_dates.get(exam.patno.as_str()), &exam.exam_date) {
                (Some(diagnosed), Some(examined)) => {
                    Some(month_difference(parse_ppmi_date(examined)?, *diagnosed))
                }
                _ => None,
            };
            Ok(DiseaseDuration {
                patno: exam.patno.clone(),
                event_id: exam.event_id.clone(),
                months,
            })
        })
        .collect()
}

pub fn read_diagnosis_history(path: &Path) -> Result<Vec<DiagnosisRecord>, LivingParkError> {
    let table = Table::read(path, &["PATNO", "EVENT_ID", "PDDXDT"])?;
    Ok(table
        .rows
        .into_iter()
        .map(|mut row| DiagnosisRecord {
            diagnosis_date: non_empty(row.pop()),
            event_id: row.pop().unwrap_or_default(),
            patno: row.pop().unwrap_or_default(),
        })
        .collect())
}

pub fn read_updrs_part_iii(path: &Path) -> Result<Vec<ExamRecord>, LivingParkError> {
    let table = Table::read(path, &["PATNO", "EVENT_ID", "INFODT"])?;
    Ok(table
        .rows
        .into_iter()
        .map(|mut row| ExamRecord {
            exam_date: non_empty(row.pop()),
            event_id: row.pop().unwrap_or_default(),
            patno: row.pop().unwrap_or_default(),
        })
        .collect())
}

pub fn write_disease_durations(
    path: &Path,
    durations: &[DiseaseDuration],
) -> Result<(), LivingParkError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in durations {
        writer.serialize(row)?;
    }
    writer
        .flush()
        .map_err(|err| LivingParkError::Filesystem(err.to_string()))
}

/// Projection of a CSV file onto a fixed set of named columns.
pub(crate) struct Table {
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn read(path: &Path, columns: &[&str]) -> Result<Self, LivingParkError> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.clone();
        let indices = columns
            .iter()
            .map(|column| {
                headers
                    .iter()
                    .position(|header| header.trim() == *column)
                    .ok_or_else(|| LivingParkError::MissingColumn {
                        file: path.display().to_string(),
                        column: column.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                indices
                    .iter()
                    .map(|&index| record.get(index).unwrap_or("").trim().to_string())
                    .collect(),
            );
        }
        Ok(Self { rows })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("nan"))
}
