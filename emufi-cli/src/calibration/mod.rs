//! Calibration Coordinator
//!
//! Measures how long boot and workload take when `P` emulators run side by
//! side, for every configured `P`. The numbers feed the detection timings.
//!
//! ## Modules
//!
//! - [`spec`] - Session description (`"<module> <levels> <repetitions>"`)
//! - [`instance`] - One timed run on one emulator
//! - [`coordinator`] - Parallel batches, timeout, retries and CSV output

mod coordinator;
mod instance;
mod spec;

use emufi_core::{BridgeError, EmulatorError};
use emufi_ipc::CollectorError;
use emufi_report::ReportError;
use std::time::Duration;
use thiserror::Error;

pub use coordinator::CalibrationCoordinator;
pub use instance::{CalibrationInstance, EmulatorInstance, RunTimings};
pub use spec::{CalibSpec, SpecError, parse_levels};

/// Calibration failures
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("Emulator failure: {0}")]
    Emulator(#[from] EmulatorError),

    #[error("Device command failed: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Emulator {0} died prematurely")]
    EmulatorDied(u32),

    #[error("Calibration run on emulator {0} was cancelled")]
    Cancelled(u32),

    #[error("Collector communication failed: {0}")]
    Collector(#[from] CollectorError),

    #[error("Failed to write calibration results: {0}")]
    Report(#[from] ReportError),

    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Need {needed} emulator instances, have {available}")]
    NotEnoughInstances { needed: u32, available: usize },

    #[error("Failed to wait for {count} calibration runs: timed out after {after:?}")]
    Timeout { count: u32, after: Duration },

    #[error("{failed} of {count} calibration runs failed")]
    BatchFailed { failed: u32, count: u32 },

    #[error("Run with {level} emulators failed {failures} times in a row")]
    RetriesExhausted { level: u32, failures: u32 },
}
