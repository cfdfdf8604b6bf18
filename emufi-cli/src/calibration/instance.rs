//! One calibration run on one emulator

use super::CalibrationError;
use emufi_core::{CancelSignal, Emulator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Durations measured by one successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTimings {
    /// Emulator start until the workload started
    pub sysinit: Duration,
    /// Workload start until it finished or failed
    pub workload: Duration,
}

/// Something a calibration batch can run on
pub trait CalibrationInstance: Send + Sync {
    /// Emulator id
    fn id(&self) -> u32;

    /// Boot, load `module`, time the workload and tear down again. The
    /// teardown happens on every path, including errors.
    fn run_once(&self, module: &str, cancel: &CancelSignal) -> Result<RunTimings, CalibrationError>;

    /// Make a running [`run_once`](Self::run_once) return soon. May be
    /// called repeatedly while the run winds down.
    fn abort(&self);

    /// Block until the instance confirmed its shutdown
    fn await_shutdown(&self);
}

/// Calibration instance backed by a real emulator
pub struct EmulatorInstance {
    emulator: Arc<Emulator>,
    module_dir: String,
    flag_file: String,
}

impl EmulatorInstance {
    /// Instance loading modules from `module_dir` and clearing `flag_file`
    pub fn new(emulator: Arc<Emulator>, module_dir: String, flag_file: String) -> Self {
        Self {
            emulator,
            module_dir,
            flag_file,
        }
    }

    fn measure(&self, module: &str, cancel: &CancelSignal) -> Result<RunTimings, CalibrationError> {
        let emu = self.emulator.log_id();
        let bridge = self.emulator.bridge();
        let checkpoint = || {
            if cancel.is_cancelled() {
                Err(CalibrationError::Cancelled(self.id()))
            } else {
                Ok(())
            }
        };

        checkpoint()?;
        let sysinit_start = Instant::now();
        self.emulator.start()?;

        info!(emu = %emu, "Waiting for emulator boot-up");
        let ready = bridge.wait_for_device_checked(|peer: &CancelSignal| {
            self.emulator.await_termination_or(peer, cancel)
        })?;
        checkpoint()?;
        if !ready {
            return Err(CalibrationError::EmulatorDied(self.id()));
        }
        bridge.remove_file(&self.flag_file, true)?;

        checkpoint()?;
        info!(emu = %emu, "Loading kernel module {module}");
        bridge.load_module(&format!("{}/{}", self.module_dir, module))?;

        checkpoint()?;
        info!(emu = %emu, "Waiting for workload start");
        bridge.wait_for_logcat_event_until("main", "workload_started", &["Workload:D"], cancel)?;
        let sysinit = sysinit_start.elapsed();

        let workload_start = Instant::now();
        info!(emu = %emu, "Waiting for workload end");
        bridge.wait_for_logcat_event_until(
            "main",
            "workload_finished|workload_failed",
            &["Workload:D"],
            cancel,
        )?;

        Ok(RunTimings {
            sysinit,
            workload: workload_start.elapsed(),
        })
    }

    fn shutdown(&self) -> Result<(), CalibrationError> {
        let emu = self.emulator.log_id();
        debug!(emu = %emu, "Shutting down emulator");
        self.emulator.bridge().cancel_created_processes();
        self.emulator.kill()?;
        debug!(emu = %emu, "Emulator shutdown complete");
        Ok(())
    }
}

impl CalibrationInstance for EmulatorInstance {
    fn id(&self) -> u32 {
        self.emulator.id()
    }

    fn run_once(&self, module: &str, cancel: &CancelSignal) -> Result<RunTimings, CalibrationError> {
        info!(emu = %self.emulator.log_id(), "Doing single calibration run");
        let measured = self.measure(module, cancel);
        if let Err(e) = &measured {
            error!(emu = %self.emulator.log_id(), "Calibration run failed: {e}");
        }
        let shutdown = self.shutdown();
        let timings = measured?;
        shutdown?;
        Ok(timings)
    }

    fn abort(&self) {
        self.emulator.bridge().cancel_created_processes();
    }

    fn await_shutdown(&self) {
        self.emulator.await_shutdown();
    }
}
