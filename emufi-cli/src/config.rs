//! Configuration loading from emufi.toml
//!
//! emufi configuration can be specified in an `emufi.toml` file. The file is
//! discovered by walking up from the current directory; every key has a
//! default, so a partial file (or none at all) is fine.

use emufi_core::{DeviceLayout, ExperimentSettings, HostTools, ImageSet};
use emufi_detect::DetectionTimings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// emufi configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmufiConfig {
    /// Host tool locations
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Disk images
    #[serde(default)]
    pub images: ImagesConfig,
    /// Paths and names on the device
    #[serde(default)]
    pub device: DeviceConfig,
    /// Results collector endpoint
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Result detection timings
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Calibration session settings
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Emulator allocation settings
    #[serde(default)]
    pub emulator: EmulatorSection,
}

/// Host tool locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// `adb` binary
    #[serde(default = "default_adb")]
    pub adb: PathBuf,
    /// Device shell wrapper forwarding the remote exit code
    #[serde(default = "default_adb_shell")]
    pub adb_shell: PathBuf,
    /// Emulator binary
    #[serde(default = "default_emulator")]
    pub emulator: PathBuf,
    /// Task-accounting wrapper
    #[serde(default = "default_getdelays")]
    pub getdelays: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            adb: default_adb(),
            adb_shell: default_adb_shell(),
            emulator: default_emulator(),
            getdelays: default_getdelays(),
        }
    }
}

fn default_adb() -> PathBuf {
    HostTools::default().adb
}
fn default_adb_shell() -> PathBuf {
    HostTools::default().adb_shell
}
fn default_emulator() -> PathBuf {
    HostTools::default().emulator
}
fn default_getdelays() -> PathBuf {
    HostTools::default().getdelays
}

/// Shared disk images
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_kernel")]
    pub kernel: PathBuf,
    #[serde(default = "default_system_vanilla")]
    pub system_vanilla: PathBuf,
    #[serde(default = "default_userdata")]
    pub userdata: PathBuf,
    #[serde(default = "default_userdata_vanilla")]
    pub userdata_vanilla: PathBuf,
    #[serde(default = "default_sdcard")]
    pub sdcard: PathBuf,
    #[serde(default = "default_sdcard_vanilla")]
    pub sdcard_vanilla: PathBuf,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        let images = ImageSet::default();
        Self {
            kernel: images.kernel,
            system_vanilla: images.system_vanilla,
            userdata: images.userdata,
            userdata_vanilla: images.userdata_vanilla,
            sdcard: images.sdcard,
            sdcard_vanilla: images.sdcard_vanilla,
        }
    }
}

fn default_kernel() -> PathBuf {
    ImageSet::default().kernel
}
fn default_system_vanilla() -> PathBuf {
    ImageSet::default().system_vanilla
}
fn default_userdata() -> PathBuf {
    ImageSet::default().userdata
}
fn default_userdata_vanilla() -> PathBuf {
    ImageSet::default().userdata_vanilla
}
fn default_sdcard() -> PathBuf {
    ImageSet::default().sdcard
}
fn default_sdcard_vanilla() -> PathBuf {
    ImageSet::default().sdcard_vanilla
}

/// Paths and names on the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// AVD base name
    #[serde(default = "default_avd_name")]
    pub avd_name: String,
    /// Directory holding kernel modules
    #[serde(default = "default_module_dir")]
    pub module_dir: String,
    /// Directory holding helper binaries
    #[serde(default = "default_bin_dir")]
    pub bin_dir: String,
    /// File the workload writes its final state into
    #[serde(default = "default_flag_file")]
    pub workload_flag_file: String,
    /// In-kernel error detector module name, without `.ko`
    #[serde(default = "default_cande_heavy")]
    pub cande_heavy_module: String,
    /// User-space error detector command, run from `bin_dir`
    #[serde(default = "default_cande_light")]
    pub cande_light_command: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let layout = DeviceLayout::default();
        Self {
            avd_name: layout.avd_name,
            module_dir: layout.module_dir,
            bin_dir: layout.bin_dir,
            workload_flag_file: layout.workload_flag_file,
            cande_heavy_module: default_cande_heavy(),
            cande_light_command: default_cande_light(),
        }
    }
}

impl DeviceConfig {
    /// Device path of the in-kernel error detector module
    pub fn cande_heavy_path(&self) -> String {
        format!("{}/{}.ko", self.module_dir, self.cande_heavy_module)
    }
}

fn default_avd_name() -> String {
    DeviceLayout::default().avd_name
}
fn default_module_dir() -> String {
    DeviceLayout::default().module_dir
}
fn default_bin_dir() -> String {
    DeviceLayout::default().bin_dir
}
fn default_flag_file() -> String {
    DeviceLayout::default().workload_flag_file
}
fn default_cande_heavy() -> String {
    "cande_heavy".to_string()
}
fn default_cande_light() -> String {
    "cande_light".to_string()
}

/// Results collector endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Collector host
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the first instance; instance `n` uses `port + n`
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a configuration request waits for its answer
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            reply_timeout: default_reply_timeout(),
        }
    }
}

impl CollectorConfig {
    /// Collector address for the instance with `id`
    pub fn addr_for(&self, id: u32) -> String {
        format!("{}:{}", self.host, u32::from(self.port) + id)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    4444
}
fn default_reply_timeout() -> String {
    "60s".to_string()
}

/// Result detection timings (duration strings)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Console and flag-file probe period
    #[serde(default = "default_period")]
    pub period: String,
    /// Boot watchdog delay
    #[serde(default = "default_sysinit_delay")]
    pub sysinit_hang_delay: String,
    /// Application hang assumer delay
    #[serde(default = "default_app_delay")]
    pub app_hang_delay: String,
    /// System hang assumer first check
    #[serde(default = "default_system_delay")]
    pub system_hang_delay: String,
    /// System hang assumer period
    #[serde(default = "default_system_period")]
    pub system_hang_period: String,
    /// Device responsiveness timeout
    #[serde(default = "default_bridge_timeout")]
    pub bridge_timeout: String,
    /// Periods to wait before reporting an orchestration failure
    #[serde(default = "default_failure_delay_periods")]
    pub failure_delay_periods: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            sysinit_hang_delay: default_sysinit_delay(),
            app_hang_delay: default_app_delay(),
            system_hang_delay: default_system_delay(),
            system_hang_period: default_system_period(),
            bridge_timeout: default_bridge_timeout(),
            failure_delay_periods: default_failure_delay_periods(),
        }
    }
}

fn default_period() -> String {
    "5s".to_string()
}
fn default_sysinit_delay() -> String {
    "4m".to_string()
}
fn default_app_delay() -> String {
    "5m".to_string()
}
fn default_system_delay() -> String {
    "2m".to_string()
}
fn default_system_period() -> String {
    "30s".to_string()
}
fn default_bridge_timeout() -> String {
    "10s".to_string()
}
fn default_failure_delay_periods() -> u32 {
    5
}

/// Calibration session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Ceiling for one batch of parallel runs
    #[serde(default = "default_run_timeout")]
    pub run_timeout: String,
    /// Failed batches in a row that abort a parallelism level
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// CSV file results are appended to
    #[serde(default = "default_results_file")]
    pub results_file: PathBuf,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            run_timeout: default_run_timeout(),
            max_failures: default_max_failures(),
            results_file: default_results_file(),
        }
    }
}

fn default_run_timeout() -> String {
    "30m".to_string()
}
fn default_max_failures() -> u32 {
    3
}
fn default_results_file() -> PathBuf {
    PathBuf::from("calibration-results.txt")
}

/// Emulator allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorSection {
    /// Console port of the first instance
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Console buffer capacity in bytes
    #[serde(default = "default_console_buffer")]
    pub console_buffer: usize,
}

impl Default for EmulatorSection {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            console_buffer: default_console_buffer(),
        }
    }
}

fn default_base_port() -> u16 {
    emufi_core::BASE_CONSOLE_PORT
}
fn default_console_buffer() -> usize {
    emufi_core::DEFAULT_CAPACITY
}

impl EmufiConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.emulator.console_buffer == 0 {
            anyhow::bail!("emulator.console_buffer must be at least 1 byte");
        }
        Ok(())
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join("emufi.toml");
            if config_path.exists() {
                return Self::load(&config_path).ok();
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Settings shared by every emulator instance
    pub fn settings(&self) -> ExperimentSettings {
        ExperimentSettings {
            tools: HostTools {
                adb: self.tools.adb.clone(),
                adb_shell: self.tools.adb_shell.clone(),
                emulator: self.tools.emulator.clone(),
                getdelays: self.tools.getdelays.clone(),
            },
            images: ImageSet {
                kernel: self.images.kernel.clone(),
                system_vanilla: self.images.system_vanilla.clone(),
                userdata: self.images.userdata.clone(),
                userdata_vanilla: self.images.userdata_vanilla.clone(),
                sdcard: self.images.sdcard.clone(),
                sdcard_vanilla: self.images.sdcard_vanilla.clone(),
            },
            device: DeviceLayout {
                avd_name: self.device.avd_name.clone(),
                module_dir: self.device.module_dir.clone(),
                bin_dir: self.device.bin_dir.clone(),
                workload_flag_file: self.device.workload_flag_file.clone(),
            },
            console_capacity: self.emulator.console_buffer,
            ..ExperimentSettings::default()
        }
    }

    /// Probe timings with the durations parsed
    pub fn detection_timings(&self) -> anyhow::Result<DetectionTimings> {
        let d = &self.detection;
        Ok(DetectionTimings {
            period: Self::parse_duration(&d.period)?,
            sysinit_hang_delay: Self::parse_duration(&d.sysinit_hang_delay)?,
            app_hang_delay: Self::parse_duration(&d.app_hang_delay)?,
            system_hang_delay: Self::parse_duration(&d.system_hang_delay)?,
            system_hang_period: Self::parse_duration(&d.system_hang_period)?,
            bridge_timeout: Self::parse_duration(&d.bridge_timeout)?,
            flag_file: self.device.workload_flag_file.clone(),
        })
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# emufi Configuration

[tools]
adb = "adb"
# Wrapper running one device command and forwarding its exit code
adb_shell = "adbshell"
emulator = "emulator"
# Task-accounting wrapper the emulator is launched under
getdelays = "getdelays"

[images]
kernel = "images/kernel-qemu"
system_vanilla = "images/system.img"
userdata = "images/userdata-qemu.img"
userdata_vanilla = "images/userdata.img"
sdcard = "images/sdcard.img"
sdcard_vanilla = "images/sdcard-vanilla.img"

[device]
avd_name = "grinder"
module_dir = "/data/local/modules"
bin_dir = "/data/local/bin"
workload_flag_file = "/data/local/tmp/workload_flag"
# Error detectors started before the fault-injected module is loaded
cande_heavy_module = "cande_heavy"
cande_light_command = "cande_light"

[collector]
host = "localhost"
# Instance n talks to port + n
port = 4444
reply_timeout = "60s"

[detection]
period = "5s"
sysinit_hang_delay = "4m"
app_hang_delay = "5m"
system_hang_delay = "2m"
system_hang_period = "30s"
bridge_timeout = "10s"
# Orchestration errors are reported after this many periods
failure_delay_periods = 5

[calibration]
run_timeout = "30m"
# Failed batches in a row that abort a parallelism level
max_failures = 3
results_file = "calibration-results.txt"

[emulator]
base_port = 5554
console_buffer = 10240
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m", "1h")
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Invalid duration: {}", s));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok(Duration::from_nanos((value * multiplier as f64) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmufiConfig::default();
        assert_eq!(config.device.avd_name, "grinder");
        assert_eq!(config.calibration.max_failures, 3);
        assert_eq!(config.emulator.base_port, 5554);
        assert_eq!(
            config.device.cande_heavy_path(),
            "/data/local/modules/cande_heavy.ko"
        );
    }

    #[test]
    fn test_parse_duration() {
        let d = EmufiConfig::parse_duration;
        assert_eq!(d("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(d("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(d("100us").unwrap(), Duration::from_micros(100));
        assert_eq!(d("1000ns").unwrap(), Duration::from_nanos(1000));
        assert_eq!(d("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(d("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(d("7").unwrap(), Duration::from_secs(7));
        assert!(d("").is_err());
        assert_eq!(d("1h").unwrap(), Duration::from_secs(3600));
        assert!(d("3d").is_err());
        assert!(d("-1s").is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [collector]
            host = "grinder.local"
            port = 5000

            [detection]
            period = "1s"
        "#;

        let config: EmufiConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.collector.addr_for(3), "grinder.local:5003");
        let timings = config.detection_timings().unwrap();
        assert_eq!(timings.period, Duration::from_secs(1));
        // Defaults should still apply
        assert_eq!(timings.app_hang_delay, Duration::from_secs(300));
        assert_eq!(timings.flag_file, "/data/local/tmp/workload_flag");
    }

    #[test]
    fn test_zero_console_buffer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emufi.toml");
        std::fs::write(&path, "[emulator]\nconsole_buffer = 0\n").unwrap();
        let err = EmufiConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("console_buffer"));

        std::fs::write(&path, "[emulator]\nconsole_buffer = 64\n").unwrap();
        assert_eq!(EmufiConfig::load(&path).unwrap().settings().console_capacity, 64);
    }

    #[test]
    fn test_default_toml_parses() {
        let config: EmufiConfig = toml::from_str(&EmufiConfig::default_toml()).unwrap();
        assert_eq!(config.detection.failure_delay_periods, 5);
        assert_eq!(config.settings(), ExperimentSettings::default());
        assert_eq!(
            config.detection_timings().unwrap(),
            DetectionTimings::default()
        );
    }
}
