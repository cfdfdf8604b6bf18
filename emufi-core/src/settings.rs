//! Experiment settings shared by every emulator instance.

use crate::ring::DEFAULT_CAPACITY;
use std::path::PathBuf;
use std::time::Duration;

/// Host tools invoked by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTools {
    /// `adb` binary
    pub adb: PathBuf,
    /// Shell wrapper that runs one command on a device and forwards its exit code
    pub adb_shell: PathBuf,
    /// Android emulator binary
    pub emulator: PathBuf,
    /// Task-accounting wrapper that launches the emulator
    pub getdelays: PathBuf,
}

impl Default for HostTools {
    fn default() -> Self {
        Self {
            adb: PathBuf::from("adb"),
            adb_shell: PathBuf::from("adbshell"),
            emulator: PathBuf::from("emulator"),
            getdelays: PathBuf::from("getdelays"),
        }
    }
}

/// Shared disk images. Per-instance copies live next to these files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    pub kernel: PathBuf,
    pub system_vanilla: PathBuf,
    pub userdata: PathBuf,
    pub userdata_vanilla: PathBuf,
    pub sdcard: PathBuf,
    pub sdcard_vanilla: PathBuf,
}

impl Default for ImageSet {
    fn default() -> Self {
        Self {
            kernel: PathBuf::from("images/kernel-qemu"),
            system_vanilla: PathBuf::from("images/system.img"),
            userdata: PathBuf::from("images/userdata-qemu.img"),
            userdata_vanilla: PathBuf::from("images/userdata.img"),
            sdcard: PathBuf::from("images/sdcard.img"),
            sdcard_vanilla: PathBuf::from("images/sdcard-vanilla.img"),
        }
    }
}

/// Paths and names on the emulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    /// AVD base name; instances use `<avd_name>-<id>`
    pub avd_name: String,
    /// Directory holding kernel modules
    pub module_dir: String,
    /// Directory holding on-device helper binaries
    pub bin_dir: String,
    /// File the workload writes its final state into
    pub workload_flag_file: String,
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self {
            avd_name: "grinder".to_string(),
            module_dir: "/data/local/modules".to_string(),
            bin_dir: "/data/local/bin".to_string(),
            workload_flag_file: "/data/local/tmp/workload_flag".to_string(),
        }
    }
}

/// Everything needed to allocate and drive emulator instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentSettings {
    pub tools: HostTools,
    pub images: ImageSet,
    pub device: DeviceLayout,
    /// Console buffer capacity in bytes
    pub console_capacity: usize,
    /// Poll interval for process waits and log streams
    pub poll_interval: Duration,
    /// Period of the boot-marker scanner
    pub scan_interval: Duration,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            tools: HostTools::default(),
            images: ImageSet::default(),
            device: DeviceLayout::default(),
            console_capacity: DEFAULT_CAPACITY,
            poll_interval: Duration::from_millis(100),
            scan_interval: Duration::from_millis(250),
        }
    }
}
