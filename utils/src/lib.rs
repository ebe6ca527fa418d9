use std::{fs::OpenOptions, io, path::Path};

use bytesize::ByteSize;
use csv::WriterBuilder;
use thousands::Separable;
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("row has {actual} columns, the report has {expected}")]
    Width { expected: usize, actual: usize },
}

/// Rows of string cells under fixed headers, written out as CSV.
#[derive(Clone, Debug, Default)]
pub struct CsvReport {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvReport {
    pub fn from_headers<S: IntoIterator<Item = T>, T: Into<String>>(headers: S) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push<S: IntoIterator<Item = T>, T: ToString>(&mut self, row: S) -> Result<(), ReportError> {
        let row: Vec<String> = row.into_iter().map(|cell| cell.to_string()).collect();
        if row.len() != self.headers.len() {
            return Err(ReportError::Width {
                expected: self.headers.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn write_to<W: io::Write>(&self, writer: W, with_headers: bool) -> anyhow::Result<()> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(writer);
        if with_headers {
            writer.write_record(&self.headers)?;
        }
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Appends the rows to `path`, writing the headers only when the file is new.
    pub fn flush(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file_exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        self.write_to(file, !file_exists)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string()
}

pub fn format_count(count: u64) -> String {
    count.separate_with_commas()
}

/// Physical memory used by the process, if the platform reports it.
pub fn memory_usage() -> Option<u64> {
    memory_stats::memory_stats().map(|stats| stats.physical_mem as u64)
}

pub fn log_memory(label: &str) {
    if let Some(used) = memory_usage() {
        info!("{label}: {} of physical memory in use", format_bytes(used));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_must_match_headers() {
        let mut report = CsvReport::from_headers(["layer", "jobs"]);
        report.push(["conv", "8"]).unwrap();
        assert!(matches!(
            report.push(["conv"]),
            Err(ReportError::Width {
                expected: 2,
                actual: 1
            })
        ));
        let mut out = Vec::new();
        report.write_to(&mut out, true).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "layer,jobs\nconv,8\n");
    }

    #[test]
    fn flushing_twice_appends_without_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.csv");
        let mut report = CsvReport::from_headers(["a"]);
        report.push([1]).unwrap();
        report.flush(&path).unwrap();
        report.flush(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\n1\n1\n");
    }

    #[test]
    fn counts_are_grouped() {
        assert_eq!(format_count(1234567), "1,234,567");
        assert!(format_bytes(512).starts_with("512"));
    }
}
