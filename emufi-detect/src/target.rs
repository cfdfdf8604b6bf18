//! Observation surface of the system under test

use emufi_core::{BridgeError, Emulator};
use std::time::Duration;

/// Everything a probe may look at. Implemented by [`Emulator`]; tests supply
/// scripted targets.
pub trait ProbeTarget: Send + Sync {
    /// Log prefix of the observed instance
    fn log_id(&self) -> &str;

    /// Whether the emulator process is alive
    fn is_emulator_running(&self) -> bool;

    /// Whether the accounting wrapper is alive
    fn is_accounting_running(&self) -> bool;

    /// Device state reported by the bridge
    fn device_state(&self) -> Result<String, BridgeError>;

    /// Whether the device answers a trivial command within `timeout`
    fn responds_within(&self, timeout: Duration) -> Result<bool, BridgeError>;

    /// First line of a device file, `None` if it does not exist
    fn read_flag(&self, device_path: &str) -> Result<Option<String>, BridgeError>;

    /// Cyclic search over the retained console window
    fn console_contains(&self, pattern: &str) -> bool;

    /// Retained console window, oldest first
    fn console_output(&self) -> String;
}

impl ProbeTarget for Emulator {
    fn log_id(&self) -> &str {
        Emulator::log_id(self)
    }

    fn is_emulator_running(&self) -> bool {
        Emulator::is_emulator_running(self)
    }

    fn is_accounting_running(&self) -> bool {
        Emulator::is_accounting_running(self)
    }

    fn device_state(&self) -> Result<String, BridgeError> {
        self.bridge().get_state()
    }

    fn responds_within(&self, timeout: Duration) -> Result<bool, BridgeError> {
        self.bridge().test_response(timeout)
    }

    fn read_flag(&self, device_path: &str) -> Result<Option<String>, BridgeError> {
        self.bridge().read_first_line(device_path)
    }

    fn console_contains(&self, pattern: &str) -> bool {
        self.console().contains(pattern)
    }

    fn console_output(&self) -> String {
        self.console().output()
    }
}
