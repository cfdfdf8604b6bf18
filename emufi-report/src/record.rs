//! Calibration result records

use std::fmt;
use std::time::Duration;

/// Timings of one successful calibration run on one emulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationResult {
    /// Number of emulators running in parallel
    pub p_level: u32,
    /// Repetition index within the parallelism level
    pub run: u32,
    /// Emulator id
    pub emu: u32,
    /// Emulator start until the workload started, in milliseconds
    pub sysinit_ms: u64,
    /// Workload start until it finished or failed, in milliseconds
    pub workload_ms: u64,
}

impl CalibrationResult {
    /// Build a record from measured durations
    pub fn new(p_level: u32, run: u32, emu: u32, sysinit: Duration, workload: Duration) -> Self {
        Self {
            p_level,
            run,
            emu,
            sysinit_ms: sysinit.as_millis() as u64,
            workload_ms: workload.as_millis() as u64,
        }
    }

    /// CSV header line, newline included
    pub fn csv_header() -> &'static str {
        "P-Level,Run,Emu,SysInit,Workload\n"
    }

    /// CSV line, newline included
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{}\n",
            self.p_level, self.run, self.emu, self.sysinit_ms, self.workload_ms
        )
    }
}

impl fmt::Display for CalibrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "P: {}, R: {}, Emu: {}, SysInit: {} ms, Workload: {} ms",
            self.p_level, self.run, self.emu, self.sysinit_ms, self.workload_ms
        )
    }
}
