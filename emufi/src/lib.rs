#![warn(missing_docs)]
//! # emufi
//!
//! Host-side orchestrator for fault-injection experiments on emulated
//! Android devices.
//!
//! emufi boots an emulator, loads a fault-injected kernel module, waits for
//! the on-device workload and classifies how the experiment ended purely from
//! the outside: console output, device log streams and flag files.
//! - **Emulator lifecycle**: accounting-wrapped launch, console capture, kill
//!   cycles with confirmed shutdown
//! - **Device bridge**: adb commands whose processes are tracked and can be
//!   cancelled in bulk, plus waits that give up when the emulator dies
//! - **Result detection**: independent probes racing to deliver exactly one
//!   verdict per run
//! - **Calibration**: parallel batches with a timeout, retries and CSV output
//!
//! ## Quick Start
//!
//! ```ignore
//! use emufi::prelude::*;
//! use std::sync::Arc;
//!
//! let config = EmufiConfig::discover().unwrap_or_default();
//! let emulator = Arc::new(EmulatorFactory::new(Arc::new(config.settings())).create()?);
//! let collector = Arc::new(TcpCollector::connect("localhost:4444", Duration::from_secs(60))?);
//! let target = EmulatedTarget::new(
//!     emulator,
//!     collector,
//!     config.detection_timings()?,
//!     config.device.clone(),
//!     config.detection.failure_delay_periods,
//! );
//! let verdict = target.execute(Duration::from_secs(3600))?;
//! target.stop()?;
//! ```

// Re-export runtime types
pub use emufi_core::{
    BridgeError, CancelSignal, CancelSource, CircularBuffer, DeviceBridge, DeviceLayout,
    Emulator, EmulatorConfig, EmulatorError, EmulatorFactory, ExperimentSettings, HostTools,
    ImageSet, OutputCapturer, Phase, Race, race,
};

// Re-export detection types
pub use emufi_detect::{DetectionTimings, MutationLog, ProbeKind, ProbeTarget, ResultDetector};

// Re-export protocol types
pub use emufi_ipc::{
    Collector, CollectorError, CollectorMessage, ExperimentResult, MemoryCollector, TcpCollector,
};

// Re-export report types
pub use emufi_report::{CalibrationResult, CsvWriter};

// Re-export orchestration and CLI
pub use emufi_cli::{
    CalibSpec, CalibrationCoordinator, CalibrationError, CalibrationInstance, Cli, Commands,
    EmufiConfig, EmulatedTarget, EmulatorInstance, ExperimentError, RunTimings, run,
    run_with_cli,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CalibSpec, CalibrationCoordinator, Collector, DetectionTimings, EmufiConfig,
        EmulatedTarget, Emulator, EmulatorFactory, ExperimentResult, ResultDetector,
        TcpCollector,
    };
    pub use std::time::Duration;
}
