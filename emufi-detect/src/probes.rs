//! Probe checks
//!
//! Each check inspects a [`ProbeTarget`] once and returns the verdict it
//! supports, if any. Bridge failures never produce a verdict: an unanswered
//! query is inconclusive and the probe simply tries again next period.

use crate::target::ProbeTarget;
use emufi_core::BridgeError;
use emufi_ipc::ExperimentResult;
use std::time::Duration;
use tracing::{debug, error, info};

/// Console text of a kernel panic
pub const KERNEL_PANIC: &str = "Kernel panic";
/// Panic reason used by the in-kernel hang detector
pub const HANG_DETECTED: &str = "Hang detected";
/// Fatal emulator error
pub const QEMU_FATAL: &str = "qemu: fatal:";
/// Kernel oops
pub const KERNEL_OOPS: &str = "Internal error: Oops:";
/// Printed by the activity manager when the workload is not installed
pub const MISSING_WORKLOAD: &str =
    "Error: Activity class {de.grinder.android_fi/de.grinder.android_fi.Workload} does not exist.";
/// Flag-file content after a successful workload run
pub const WORKLOAD_FINISHED: &str = "workload_finished";
/// Flag-file content after a failed workload run
pub const WORKLOAD_FAILED: &str = "workload_failed";

fn inconclusive<T>(target: &dyn ProbeTarget, what: &str, result: Result<T, BridgeError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(emu = %target.log_id(), "{what} got no answer: {e}");
            None
        }
    }
}

/// First console line starting at the first kernel panic message
pub fn panic_line(console: &str) -> Option<&str> {
    let start = console.find(KERNEL_PANIC)?;
    let rest = &console[start..];
    Some(rest.split('\n').next().unwrap_or(rest))
}

/// Kernel panic, emulator death, fatal emulator error or kernel oops
pub fn check_system_crash(target: &dyn ProbeTarget) -> Option<ExperimentResult> {
    if target.console_contains(KERNEL_PANIC) {
        let console = target.console_output();
        return match panic_line(&console) {
            Some(line) if line.contains(HANG_DETECTED) => Some(ExperimentResult::SystemHangDetected),
            _ => {
                debug!(emu = %target.log_id(), "System crash detected: kernel panic message");
                Some(ExperimentResult::SystemCrashDetected)
            }
        };
    }
    if !target.is_emulator_running() || target.console_contains(QEMU_FATAL) {
        debug!(emu = %target.log_id(), "System crash detected: emulator gone or emulator error");
        return Some(ExperimentResult::SystemCrashDetected);
    }
    if target.console_contains(KERNEL_OOPS) {
        return Some(ExperimentResult::SystemOopsDetected);
    }
    None
}

/// The emulator runs but the device does not answer
pub fn check_system_hang(target: &dyn ProbeTarget, timeout: Duration) -> Option<ExperimentResult> {
    if !target.is_emulator_running() {
        return None;
    }
    let responds = inconclusive(target, "Responsiveness check", target.responds_within(timeout))?;
    (!responds).then_some(ExperimentResult::SystemHangAssumed)
}

fn flag_is(target: &dyn ProbeTarget, flag_file: &str, expected: &str) -> Option<bool> {
    let flag = inconclusive(target, "Flag read", target.read_flag(flag_file))?;
    Some(flag.as_deref().map(str::trim) == Some(expected))
}

/// The workload reported success
pub fn check_app_finished(target: &dyn ProbeTarget, flag_file: &str) -> Option<ExperimentResult> {
    flag_is(target, flag_file, WORKLOAD_FINISHED)?.then_some(ExperimentResult::Finished)
}

/// The workload is missing or reported failure
pub fn check_app_failure(target: &dyn ProbeTarget, flag_file: &str) -> Option<ExperimentResult> {
    if target.console_contains(MISSING_WORKLOAD) {
        return Some(ExperimentResult::ApplicationFaultDetected);
    }
    flag_is(target, flag_file, WORKLOAD_FAILED)?.then_some(ExperimentResult::ApplicationFaultDetected)
}

/// The system is alive and answering, yet the workload never finished
pub fn check_app_hang(target: &dyn ProbeTarget, timeout: Duration) -> Option<ExperimentResult> {
    if !target.is_emulator_running() {
        return None;
    }
    let responds = inconclusive(target, "Responsiveness check", target.responds_within(timeout))?;
    responds.then_some(ExperimentResult::ApplicationHangAssumed)
}

/// Boot never reached the workload. Always yields a verdict after logging
/// what is still alive.
pub fn assume_sysinit_hang(target: &dyn ProbeTarget) -> Option<ExperimentResult> {
    let emu = target.log_id();
    info!(emu = %emu, "Sysinit hang assumer fires, assuming hang during system initialization");
    if !target.is_accounting_running() {
        error!(emu = %emu, "Accounting is not running");
    }
    if !target.is_emulator_running() {
        error!(emu = %emu, "Emulator process is not running");
    }
    match target.device_state() {
        Ok(state) if state == "device" => {}
        Ok(state) => error!(emu = %emu, "Bridge reports device state '{state}'"),
        Err(e) => error!(emu = %emu, "Failed to query device state: {e}"),
    }
    Some(ExperimentResult::SysinitHangAssumed)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use emufi_core::CircularBuffer;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted probe target
    pub struct FakeTarget {
        pub emulator_running: AtomicBool,
        pub accounting_running: AtomicBool,
        pub responds: Mutex<Result<bool, ()>>,
        pub flag: Mutex<Option<String>>,
        pub console: CircularBuffer,
    }

    impl FakeTarget {
        pub fn new() -> Self {
            Self {
                emulator_running: AtomicBool::new(true),
                accounting_running: AtomicBool::new(true),
                responds: Mutex::new(Ok(true)),
                flag: Mutex::new(None),
                console: CircularBuffer::with_capacity(4096),
            }
        }

        pub fn set_flag(&self, flag: &str) {
            *self.flag.lock().unwrap() = Some(flag.to_string());
        }

        pub fn set_responds(&self, responds: Result<bool, ()>) {
            *self.responds.lock().unwrap() = responds;
        }
    }

    impl ProbeTarget for FakeTarget {
        fn log_id(&self) -> &str {
            "0/5554"
        }

        fn is_emulator_running(&self) -> bool {
            self.emulator_running.load(Ordering::SeqCst)
        }

        fn is_accounting_running(&self) -> bool {
            self.accounting_running.load(Ordering::SeqCst)
        }

        fn device_state(&self) -> Result<String, BridgeError> {
            Ok("device".to_string())
        }

        fn responds_within(&self, _timeout: Duration) -> Result<bool, BridgeError> {
            (*self.responds.lock().unwrap()).map_err(|()| BridgeError::Transport {
                command: "true".to_string(),
            })
        }

        fn read_flag(&self, _device_path: &str) -> Result<Option<String>, BridgeError> {
            Ok(self.flag.lock().unwrap().clone())
        }

        fn console_contains(&self, pattern: &str) -> bool {
            self.console.contains(pattern)
        }

        fn console_output(&self) -> String {
            self.console.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeTarget;
    use super::*;
    use std::sync::atomic::Ordering;

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn test_panic_line() {
        let console = "boot\nKernel panic - not syncing: Hang detected\nmore\n";
        assert_eq!(
            panic_line(console),
            Some("Kernel panic - not syncing: Hang detected")
        );
        assert_eq!(panic_line("Kernel panic at end"), Some("Kernel panic at end"));
        assert_eq!(panic_line("clean\n"), None);
    }

    #[test]
    fn test_crash_classification() {
        let target = FakeTarget::new();
        assert_eq!(check_system_crash(&target), None);

        target.console.put("Internal error: Oops: 17 [#1]\n");
        assert_eq!(check_system_crash(&target), Some(ExperimentResult::SystemOopsDetected));

        target.console.put("Kernel panic - not syncing: Fatal exception\n");
        assert_eq!(check_system_crash(&target), Some(ExperimentResult::SystemCrashDetected));

        let hang = FakeTarget::new();
        hang.console.put("Kernel panic - not syncing: Hang detected on cpu0\n");
        assert_eq!(check_system_crash(&hang), Some(ExperimentResult::SystemHangDetected));
    }

    #[test]
    fn test_dead_emulator_is_crash() {
        let target = FakeTarget::new();
        target.emulator_running.store(false, Ordering::SeqCst);
        assert_eq!(check_system_crash(&target), Some(ExperimentResult::SystemCrashDetected));

        let fatal = FakeTarget::new();
        fatal.console.put("qemu: fatal: trying to execute code outside RAM\n");
        assert_eq!(check_system_crash(&fatal), Some(ExperimentResult::SystemCrashDetected));
    }

    #[test]
    fn test_hang_assumers() {
        let target = FakeTarget::new();
        assert_eq!(check_system_hang(&target, TIMEOUT), None);
        assert_eq!(
            check_app_hang(&target, TIMEOUT),
            Some(ExperimentResult::ApplicationHangAssumed)
        );

        target.set_responds(Ok(false));
        assert_eq!(
            check_system_hang(&target, TIMEOUT),
            Some(ExperimentResult::SystemHangAssumed)
        );
        assert_eq!(check_app_hang(&target, TIMEOUT), None);

        target.set_responds(Err(()));
        assert_eq!(check_system_hang(&target, TIMEOUT), None);
        assert_eq!(check_app_hang(&target, TIMEOUT), None);

        target.set_responds(Ok(false));
        target.emulator_running.store(false, Ordering::SeqCst);
        assert_eq!(check_system_hang(&target, TIMEOUT), None);
    }

    #[test]
    fn test_workload_flags() {
        let target = FakeTarget::new();
        assert_eq!(check_app_finished(&target, "/flag"), None);
        assert_eq!(check_app_failure(&target, "/flag"), None);

        target.set_flag("workload_failed");
        assert_eq!(
            check_app_failure(&target, "/flag"),
            Some(ExperimentResult::ApplicationFaultDetected)
        );
        assert_eq!(check_app_finished(&target, "/flag"), None);

        target.set_flag("workload_finished\r");
        assert_eq!(check_app_finished(&target, "/flag"), Some(ExperimentResult::Finished));
    }

    #[test]
    fn test_missing_workload() {
        let target = FakeTarget::new();
        target.console.put(MISSING_WORKLOAD);
        assert_eq!(
            check_app_failure(&target, "/flag"),
            Some(ExperimentResult::ApplicationFaultDetected)
        );
    }

    #[test]
    fn test_sysinit_always_fires() {
        let target = FakeTarget::new();
        target.accounting_running.store(false, Ordering::SeqCst);
        assert_eq!(
            assume_sysinit_hang(&target),
            Some(ExperimentResult::SysinitHangAssumed)
        );
    }
}
