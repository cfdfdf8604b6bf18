//! CSV Output

use crate::record::CalibrationResult;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result file failures
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to open results file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write results file: {0}")]
    Write(#[from] io::Error),
}

/// Render results as CSV lines without a header
pub fn generate_csv_report(results: &[CalibrationResult]) -> String {
    results.iter().map(CalibrationResult::to_csv_line).collect()
}

/// Append-only calibration results file.
///
/// Every open appends a fresh header, so one file can hold several sessions.
pub struct CsvWriter {
    path: PathBuf,
    file: File,
}

impl CsvWriter {
    /// Open `path` for appending and write the header
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ReportError::Open {
                path: path.clone(),
                source,
            })?;
        file.write_all(CalibrationResult::csv_header().as_bytes())?;
        file.flush()?;
        Ok(Self { path, file })
    }

    /// File being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one batch and flush it. Returns the text written.
    pub fn write_batch(&mut self, results: &[CalibrationResult]) -> Result<String, ReportError> {
        let text = generate_csv_report(results);
        self.file.write_all(text.as_bytes())?;
        self.file.flush()?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(p: u32, run: u32, emu: u32) -> CalibrationResult {
        CalibrationResult::new(p, run, emu, Duration::from_millis(10), Duration::from_millis(5))
    }

    #[test]
    fn test_batches_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration-results.txt");

        let mut writer = CsvWriter::open(&path).unwrap();
        let text = writer.write_batch(&[result(1, 0, 0)]).unwrap();
        assert_eq!(text, "1,0,0,10,5\n");
        writer.write_batch(&[result(2, 0, 0), result(2, 0, 1)]).unwrap();
        drop(writer);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "P-Level,Run,Emu,SysInit,Workload\n1,0,0,10,5\n2,0,0,10,5\n2,0,1,10,5\n"
        );

        let mut again = CsvWriter::open(&path).unwrap();
        again.write_batch(&[]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("P-Level").count(), 2);
    }

    #[test]
    fn test_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = CsvWriter::open(dir.path().join("missing/results.csv")).err().unwrap();
        assert!(matches!(err, ReportError::Open { .. }));
    }
}
