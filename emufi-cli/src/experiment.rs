//! Single-instance experiment orchestration
//!
//! An [`EmulatedTarget`] drives one emulator through a fault-injection run:
//! boot, error detectors, the fault-injected module, then the workload. The
//! verdict itself comes from the [`ResultDetector`]; when orchestration fails
//! the detector is told to report an experiment failure after a grace period,
//! so a crash that caused the failure still gets the chance to be classified.
//!
//! [`EmulatedTarget::execute`] runs the orchestration on its own thread. The
//! first verdict (or the verdict timeout) aborts whatever step it is blocked
//! in, so a device that hangs during boot still ends in a teardown.

use crate::config::DeviceConfig;
use emufi_core::{BridgeError, CancelSignal, CancelSource, Emulator, EmulatorError};
use emufi_detect::{DetectError, DetectionTimings, ResultDetector};
use emufi_ipc::{Collector, CollectorError, ExperimentResult};
use regex::Regex;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Block device queue whose scheduler an iosched module replaces
pub const IOSCHED_SPEC_FILE: &str = "/sys/block/mmcblk0/queue/scheduler";

static IOSCHED_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<schedName>\w+)-iosched(?:\.i_\w+_\d+)+\.ko$")
        .unwrap_or_else(|e| unreachable!("iosched pattern is a valid regex: {e}"))
});

/// Scheduler name if `module` is a fault-injected I/O scheduler
pub fn iosched_name(module: &str) -> Option<&str> {
    IOSCHED_MODULE
        .captures(module)
        .and_then(|caps| caps.name("schedName"))
        .map(|m| m.as_str())
}

/// Orchestration failures; each one becomes a delayed experiment failure
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Failed to start emulator: {0}")]
    Emulator(#[from] EmulatorError),

    #[error("Device command failed: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Communication failure with collector: {0}")]
    Collector(#[from] CollectorError),

    #[error("Detection engine failed: {0}")]
    Detect(#[from] DetectError),

    #[error("Emulator died prematurely")]
    EmulatorDied,

    #[error("Collector sent an empty configuration")]
    EmptyConfiguration,

    #[error("Experiment run aborted")]
    Aborted,
}

/// One emulator under test, its detector and its collector connection
pub struct EmulatedTarget {
    emulator: Arc<Emulator>,
    collector: Arc<dyn Collector>,
    detector: ResultDetector,
    device: DeviceConfig,
    failure_delay_periods: u32,
    run_lock: Mutex<()>,
}

impl EmulatedTarget {
    /// Target reporting to `collector`
    pub fn new(
        emulator: Arc<Emulator>,
        collector: Arc<dyn Collector>,
        timings: DetectionTimings,
        device: DeviceConfig,
        failure_delay_periods: u32,
    ) -> Self {
        let detector = ResultDetector::new(emulator.clone(), collector.clone(), timings);
        Self {
            emulator,
            collector,
            detector,
            device,
            failure_delay_periods,
            run_lock: Mutex::new(()),
        }
    }

    /// Emulator under test
    pub fn emulator(&self) -> &Emulator {
        &self.emulator
    }

    /// Verdict engine of this target
    pub fn detector(&self) -> &ResultDetector {
        &self.detector
    }

    /// Run one experiment up to the point where the workload is running.
    /// The verdict is reported asynchronously by the detector.
    pub fn run_experiment(&self) {
        self.run_experiment_until(&CancelSignal::never());
    }

    /// [`run_experiment`](Self::run_experiment), giving up at the next step
    /// once `abort` fires. An aborted run schedules no failure verdict.
    pub fn run_experiment_until(&self, abort: &CancelSignal) {
        self.detector.rearm();
        self.run_armed(abort);
    }

    /// Run one experiment, wait up to `verdict_timeout` for its verdict and
    /// reset the target. Orchestration still in progress when the verdict
    /// arrives (or the timeout passes) is aborted and its device commands
    /// are killed before the reset.
    pub fn execute(&self, verdict_timeout: Duration) -> Result<Option<ExperimentResult>, EmulatorError> {
        let emu = self.emulator.log_id();
        let abort = CancelSource::new();
        self.detector.rearm();

        let verdict = thread::scope(|scope| {
            let signal = abort.signal();
            let worker = scope.spawn(move || self.run_armed(&signal));

            let verdict = self.detector.wait_for_verdict(verdict_timeout);
            if verdict.is_none() {
                warn!(emu = %emu, "No verdict within {verdict_timeout:?}, aborting run");
            }
            abort.cancel();
            while !worker.is_finished() {
                self.emulator.bridge().cancel_created_processes();
                thread::sleep(self.emulator.poll_interval());
            }
            if worker.join().is_err() {
                error!(emu = %emu, "Experiment orchestration panicked");
            }
            verdict
        });

        self.reset()?;
        Ok(verdict)
    }

    fn run_armed(&self, abort: &CancelSignal) {
        let _run = self.run_lock.lock().unwrap_or_else(|e| e.into_inner());
        let emu = self.emulator.log_id();
        info!(emu = %emu, "Starting experiment run");

        match self.orchestrate(abort) {
            Ok(()) => {}
            Err(e) if abort.is_cancelled() => {
                info!(emu = %emu, "Experiment run aborted: {e}");
            }
            Err(e) => {
                error!(emu = %emu, "Experiment logic failed: {e}");
                if let Err(e) = self.detector.signal_delayed_failure(self.failure_delay_periods) {
                    error!(emu = %emu, "Failed to schedule experiment failure: {e}");
                }
            }
        }
    }

    fn orchestrate(&self, abort: &CancelSignal) -> Result<(), ExperimentError> {
        let emu = self.emulator.log_id();
        let bridge = self.emulator.bridge();
        let checkpoint = || {
            if abort.is_cancelled() {
                Err(ExperimentError::Aborted)
            } else {
                Ok(())
            }
        };
        // Returns when the emulator dies or the run is aborted
        let peer = |cancel: &CancelSignal| self.emulator.await_termination_or(cancel, abort);

        self.detector.start_sysinit_detector()?;
        checkpoint()?;
        self.emulator.start()?;

        info!(emu = %emu, "Waiting for emulator boot-up");
        let ready = bridge.wait_for_device_checked(peer)?;
        checkpoint()?;
        if !ready {
            return Err(ExperimentError::EmulatorDied);
        }
        info!(emu = %emu, "Removing workload flag file");
        bridge.remove_file(&self.device.workload_flag_file, true)?;

        // Loading the module alone can already panic the kernel
        checkpoint()?;
        info!(emu = %emu, "Starting error detection");
        self.start_error_detectors()?;
        self.detector.start_system_detectors()?;

        let module = self.instrumented_module()?;
        checkpoint()?;
        info!(emu = %emu, "Loading kernel module {module}");
        bridge.load_module(&format!("{}/{}", self.device.module_dir, module))?;

        if let Some(scheduler) = iosched_name(&module) {
            bridge.exec_shell(&format!("echo {scheduler} > {IOSCHED_SPEC_FILE}"))?;
            debug!(emu = %emu, "I/O scheduler experiment: {IOSCHED_SPEC_FILE} set to {scheduler}");
        }

        checkpoint()?;
        info!(emu = %emu, "Waiting for workload start");
        bridge.wait_for_logcat_event_checked(peer, "main", "workload_started", &["Workload:D"])?;
        checkpoint()?;
        self.detector.stop_sysinit_detector();
        self.detector.start_application_detectors()?;

        info!(emu = %emu, "Experiment logic finished, waiting for results");
        Ok(())
    }

    fn start_error_detectors(&self) -> Result<(), BridgeError> {
        let bridge = self.emulator.bridge();
        let emu = self.emulator.log_id();
        debug!(emu = %emu, "Loading heavy error detector");
        bridge.load_module(&self.device.cande_heavy_path())?;
        debug!(emu = %emu, "Starting light error detector");
        bridge.spawn_shell(&self.device.cande_light_command, Some(&self.device.bin_dir))
    }

    fn instrumented_module(&self) -> Result<String, ExperimentError> {
        let config = self.collector.configuration()?;
        config
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or(ExperimentError::EmptyConfiguration)
    }

    /// Tear down after a run: stop probes, kill the emulator and forward its
    /// accounting statistics.
    pub fn reset(&self) -> Result<(), EmulatorError> {
        let emu = self.emulator.log_id();
        info!(emu = %emu, "Resetting target");
        self.teardown()?;

        let stats = self.emulator.accounting_stats().unwrap_or_default();
        if let Err(e) = self.collector.send_log(&stats.join("\n")) {
            error!(emu = %emu, "Failed to log accounting stats: {e}");
        }
        Ok(())
    }

    /// Final shutdown: disconnect from the collector and kill the emulator
    pub fn stop(&self) -> Result<(), EmulatorError> {
        info!(emu = %self.emulator.log_id(), "Stopping target");
        self.collector.disconnect();
        self.teardown()
    }

    fn teardown(&self) -> Result<(), EmulatorError> {
        self.detector.stop_all();
        self.emulator.bridge().cancel_created_processes();
        self.emulator.kill()
    }

    /// Block until the detector delivers a verdict
    pub fn wait_for_verdict(&self, timeout: Duration) -> Option<ExperimentResult> {
        self.detector.wait_for_verdict(timeout)
    }
}
