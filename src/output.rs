use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{
    DiseaseDurationResult, LookupResult, MriMetadataResult, ProgressEvent, ProgressSink,
    StudyFilesResult, T1Result,
};
use crate::store::SetupResult;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

/// Prints results as pretty JSON on stdout; progress is dropped.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Plain-text summaries on stdout; progress goes to the log.
pub struct HumanOutput;

impl HumanOutput {
    pub fn print_t1(result: &T1Result) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(
            stdout,
            "Downloaded {}/{} images",
            result.success.len(),
            result.success.len() + result.missing.len()
        )?;
        for entry in &result.missing {
            writeln!(
                stdout,
                "missing: PATNO={} EVENT_ID={} Description={}",
                entry.patno, entry.event_id, entry.description
            )?;
        }
        Ok(())
    }

    pub fn print_lookup(result: &LookupResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        match &result.path {
            Some(path) => writeln!(stdout, "{path}"),
            None => writeln!(
                stdout,
                "not cached: {} (expected at {})",
                result.identifier, result.expected_path
            ),
        }
    }

    pub fn print_study_files(result: &StudyFilesResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        if result.missing.is_empty() {
            writeln!(stdout, "All study files are available")?;
        } else {
            writeln!(stdout, "Missing study files: {}", result.missing.join(", "))?;
        }
        for name in &result.downloaded {
            writeln!(stdout, "downloaded: {name}")?;
        }
        Ok(())
    }

    pub fn print_disease_duration(result: &DiseaseDurationResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        let known = result.rows.iter().filter(|row| row.months.is_some()).count();
        writeln!(
            stdout,
            "{} exams, {known} with a disease duration",
            result.rows.len()
        )?;
        if let Some(output) = &result.output {
            writeln!(stdout, "written to {output}")?;
        }
        Ok(())
    }

    pub fn print_mri_metadata(result: &MriMetadataResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(
            stdout,
            "kept {}/{} scans, written to {}",
            result.summary.kept, result.summary.total, result.output
        )?;
        if !result.summary.unknown_visits.is_empty() {
            writeln!(
                stdout,
                "unknown visits: {}",
                result.summary.unknown_visits.join(", ")
            )?;
        }
        Ok(())
    }

    pub fn print_setup(result: &SetupResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "cache: {}", result.cache_root)?;
        for link in &result.linked {
            writeln!(stdout, "linked: {link}")?;
        }
        Ok(())
    }
}

impl ProgressSink for HumanOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
