#![warn(missing_docs)]
//! emufi Report - Calibration Results
//!
//! Per-run calibration timings and their CSV rendering:
//! - `CalibrationResult`, one record per emulator and repetition
//! - `CsvWriter`, the append-only results file flushed after every batch

mod csv;
mod record;

pub use csv::{CsvWriter, ReportError, generate_csv_report};
pub use record::CalibrationResult;
