//! Emulator Lifecycle Manager
//!
//! One [`Emulator`] drives one Android emulator process for its whole life:
//! the emulator is launched through the task-accounting wrapper, whose merged
//! output feeds the console buffer. A scanner thread reads the emulator pid
//! and the temporary system image path from that console while it boots.
//!
//! Lifecycle: `Idle -> Starting -> Running -> Killed`, and `Killed` may be
//! started again.

use crate::bridge::DeviceBridge;
use crate::cancel::{CancelSignal, CancelSource};
use crate::capture::{CaptureError, OutputCapturer};
use crate::process::{self, OutputMode, ProcessError, Signal, Spawned};
use crate::settings::ExperimentSettings;
use crossbeam_channel as chan;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Console line carrying the emulator pid
pub const CHILD_PID_MARKER: &str = "Child pid: ";
/// Console line carrying the temporary system image path
pub const IMAGE_MAP_MARKER: &str = "emulator: mapping 'system' NAND image to ";
/// Once this appears, boot markers that are still missing will never show up
pub const BOOT_GIVE_UP_MARKER: &str = "Kernel command line:";

/// Errors raised by emulator lifecycle operations
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("Emulator {0} is already running")]
    AlreadyRunning(String),

    #[error("Failed to reset image {path}: {source}")]
    ImageReset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle phase of an emulator instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Never started
    Idle,
    /// Launch in progress
    Starting,
    /// Accounting process spawned and console captured
    Running,
    /// Kill cycle completed
    Killed,
}

/// Static identity and command lines of one emulator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorConfig {
    id: u32,
    control_port: u16,
    avd_name: String,
    userdata: PathBuf,
    userdata_vanilla: PathBuf,
    sdcard: PathBuf,
    sdcard_vanilla: PathBuf,
    emulator_command: Vec<String>,
    accounting_command: Vec<String>,
}

/// `dir/emu-<id>-<file>` next to the shared image
fn instance_image(shared: &Path, id: u32) -> PathBuf {
    let name = shared
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    shared.with_file_name(format!("emu-{id}-{name}"))
}

impl EmulatorConfig {
    /// Derive the configuration of instance `id` listening on `control_port`
    /// (adb uses `control_port + 1`).
    pub fn new(id: u32, control_port: u16, settings: &ExperimentSettings) -> Self {
        let images = &settings.images;
        let avd_name = format!("{}-{}", settings.device.avd_name, id);
        let userdata = instance_image(&images.userdata, id);
        let sdcard = instance_image(&images.sdcard, id);
        let path = |p: &Path| p.to_string_lossy().into_owned();

        let emulator_command = vec![
            path(&settings.tools.emulator),
            "-avd".to_string(),
            avd_name.clone(),
            "-kernel".to_string(),
            path(&images.kernel),
            "-system".to_string(),
            path(&images.system_vanilla),
            "-sdcard".to_string(),
            path(&sdcard),
            "-data".to_string(),
            path(&userdata),
            "-initdata".to_string(),
            path(&images.userdata_vanilla),
            "-ports".to_string(),
            format!("{},{}", control_port, control_port + 1),
            "-show-kernel".to_string(),
            "-verbose".to_string(),
            "-no-snapshot-save".to_string(),
            "-no-boot-anim".to_string(),
            "-no-window".to_string(),
            "-no-audio".to_string(),
            "-no-cache".to_string(),
        ];

        let mut accounting_command = vec![path(&settings.tools.getdelays), "-qdibec".to_string()];
        accounting_command.extend(emulator_command.iter().cloned());

        Self {
            id,
            control_port,
            avd_name,
            userdata,
            userdata_vanilla: images.userdata_vanilla.clone(),
            sdcard,
            sdcard_vanilla: images.sdcard_vanilla.clone(),
            emulator_command,
            accounting_command,
        }
    }

    /// Instance id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Emulator console port
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// adb port
    pub fn adb_port(&self) -> u16 {
        self.control_port + 1
    }

    /// adb serial, `emulator-<control port>`
    pub fn adb_name(&self) -> String {
        format!("emulator-{}", self.control_port)
    }

    /// AVD name, `<avd>-<id>`
    pub fn avd_name(&self) -> &str {
        &self.avd_name
    }

    /// Log prefix, `<id>/<control port>`
    pub fn log_id(&self) -> String {
        format!("{}/{}", self.id, self.control_port)
    }

    /// Per-instance userdata image
    pub fn userdata_image(&self) -> &Path {
        &self.userdata
    }

    /// Per-instance sdcard image
    pub fn sdcard_image(&self) -> &Path {
        &self.sdcard
    }

    /// Emulator command line
    pub fn emulator_command(&self) -> &[String] {
        &self.emulator_command
    }

    /// Accounting wrapper command line (wrapper, flags, emulator command)
    pub fn accounting_command(&self) -> &[String] {
        &self.accounting_command
    }
}

/// Values discovered on the console while booting
#[derive(Debug, Default)]
struct BootInfo {
    pid: Option<u32>,
    image_map: Option<PathBuf>,
}

struct Scanner {
    stop: CancelSource,
    handle: JoinHandle<()>,
}

struct Lifecycle {
    phase: Phase,
    scanner: Option<Scanner>,
}

/// Completion flag for the current kill cycle
struct ShutdownLatch {
    complete: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownLatch {
    fn set(&self, complete: bool) {
        *self.complete.lock().unwrap_or_else(|e| e.into_inner()) = complete;
        if complete {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut complete = self.complete.lock().unwrap_or_else(|e| e.into_inner());
        while !*complete {
            complete = self.cond.wait(complete).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Signals shutdown completion when dropped
struct ShutdownGuard<'a>(&'a ShutdownLatch);

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

/// A managed emulator instance
pub struct Emulator {
    config: EmulatorConfig,
    log_id: String,
    bridge: DeviceBridge,
    console: Arc<OutputCapturer>,
    poll_interval: Duration,
    scan_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    accounting: Mutex<Option<Child>>,
    boot: Arc<Mutex<BootInfo>>,
    stats: Mutex<Option<Vec<String>>>,
    shutdown: ShutdownLatch,
}

impl Emulator {
    /// Bind a bridge and a console to `config`. Use
    /// [`EmulatorFactory`](crate::EmulatorFactory) to allocate ids and ports.
    pub fn new(config: EmulatorConfig, settings: &ExperimentSettings) -> Self {
        let log_id = config.log_id();
        let bridge = DeviceBridge::new(
            &settings.tools,
            config.adb_name(),
            log_id.clone(),
            settings.device.module_dir.clone(),
            settings.poll_interval,
        );
        let console = Arc::new(OutputCapturer::new(
            format!("emu-{}", config.id()),
            settings.console_capacity,
        ));

        Self {
            config,
            log_id,
            bridge,
            console,
            poll_interval: settings.poll_interval,
            scan_interval: settings.scan_interval,
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                scanner: None,
            }),
            accounting: Mutex::new(None),
            boot: Arc::new(Mutex::new(BootInfo::default())),
            stats: Mutex::new(None),
            shutdown: ShutdownLatch {
                complete: Mutex::new(true),
                cond: Condvar::new(),
            },
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accounting(&self) -> MutexGuard<'_, Option<Child>> {
        self.accounting.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn boot(&self) -> MutexGuard<'_, BootInfo> {
        self.boot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Static configuration
    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Instance id
    pub fn id(&self) -> u32 {
        self.config.id()
    }

    /// Log prefix of this instance
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// Bridge bound to this instance's device
    pub fn bridge(&self) -> &DeviceBridge {
        &self.bridge
    }

    /// Console capturer of the accounting process
    pub fn console(&self) -> &OutputCapturer {
        &self.console
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.lifecycle().phase
    }

    /// Emulator pid discovered on the console, if any
    pub fn emulator_pid(&self) -> Option<u32> {
        self.boot().pid
    }

    /// Whether the accounting process is alive
    pub fn is_accounting_running(&self) -> bool {
        self.accounting()
            .as_mut()
            .is_some_and(process::is_child_running)
    }

    /// Whether the emulator pid (if known) is alive
    pub fn is_emulator_running(&self) -> bool {
        self.emulator_pid().is_some_and(process::is_pid_alive)
    }

    /// Task-accounting lines collected by the last kill, if any
    pub fn accounting_stats(&self) -> Option<Vec<String>> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Reset images, launch the emulator under the accounting wrapper and
    /// start console capture and the boot-marker scanner.
    pub fn start(&self) -> Result<(), EmulatorError> {
        let mut lifecycle = self.lifecycle();
        if matches!(lifecycle.phase, Phase::Starting | Phase::Running)
            || self.is_accounting_running()
        {
            return Err(EmulatorError::AlreadyRunning(self.log_id.clone()));
        }

        info!(emu = %self.log_id, "Starting Android emulator");
        lifecycle.phase = Phase::Starting;
        self.shutdown.set(false);

        match self.launch() {
            Ok(scanner) => {
                lifecycle.scanner = Some(scanner);
                lifecycle.phase = Phase::Running;
                Ok(())
            }
            Err(e) => {
                error!(emu = %self.log_id, "Failed to start emulator: {e}");
                if let Some(mut child) = self.accounting().take() {
                    let _ = child.kill();
                    let _ = process::wait_uninterrupted(&mut child);
                }
                self.console.stop();
                lifecycle.phase = Phase::Idle;
                self.shutdown.set(true);
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<Scanner, EmulatorError> {
        self.reset_images()?;
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.boot() = BootInfo::default();
        self.console.buffer().clear();

        let Spawned { child, output } =
            process::spawn(self.config.accounting_command(), OutputMode::Merged)?;
        *self.accounting() = Some(child);

        if let Some(output) = output {
            self.console.start(output)?;
        }
        self.spawn_scanner()
    }

    fn reset_images(&self) -> Result<(), EmulatorError> {
        let pairs = [
            (&self.config.userdata_vanilla, &self.config.userdata),
            (&self.config.sdcard_vanilla, &self.config.sdcard),
        ];
        for (vanilla, target) in pairs {
            std::fs::copy(vanilla, target).map_err(|source| EmulatorError::ImageReset {
                path: target.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn spawn_scanner(&self) -> Result<Scanner, EmulatorError> {
        let stop = CancelSource::new();
        let cancel = stop.signal();
        let console = Arc::clone(&self.console);
        let boot = Arc::clone(&self.boot);
        let log_id = self.log_id.clone();
        let ticker = chan::tick(self.scan_interval);

        let handle = std::thread::Builder::new()
            .name(format!("boot-scan-{}", self.config.id()))
            .spawn(move || {
                loop {
                    chan::select! {
                        recv(cancel.receiver()) -> _ => break,
                        recv(ticker) -> _ => {}
                    }
                    let output = console.output();
                    let mut info = boot.lock().unwrap_or_else(|e| e.into_inner());
                    if scan_boot_markers(&output, &mut info, &log_id) {
                        break;
                    }
                }
            })?;

        Ok(Scanner { stop, handle })
    }

    /// Kill the emulator, wait for the accounting wrapper to exit, collect its
    /// statistics and clean up. Shutdown completion is signalled on every
    /// path, including errors.
    pub fn kill(&self) -> Result<(), EmulatorError> {
        let mut lifecycle = self.lifecycle();
        let _done = ShutdownGuard(&self.shutdown);

        let Some(mut child) = self.accounting().take() else {
            warn!(emu = %self.log_id, "Skipped emulator kill: no associated emulator process");
            return Ok(());
        };

        let pid = self.boot().pid;
        info!(emu = %self.log_id, "Killing Android emulator");
        match pid {
            Some(pid) => {
                if let Err(e) = process::signal(pid, Signal::Kill) {
                    warn!(emu = %self.log_id, "Could not signal emulator: {e}");
                    let _ = child.kill();
                }
            }
            None => {
                warn!(emu = %self.log_id, "Emulator pid unknown, killing accounting process");
                let _ = child.kill();
            }
        }

        let waited = process::wait_uninterrupted(&mut child);

        self.console.stop();
        let stats =
            pid.and_then(|pid| collect_accounting_stats(&self.console.output(), pid, &self.log_id));
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = stats;

        let image_map = {
            let mut boot = self.boot();
            boot.pid = None;
            boot.image_map.take()
        };
        if let Some(scanner) = lifecycle.scanner.take() {
            scanner.stop.cancel();
            let _ = scanner.handle.join();
        }
        if let Some(path) = image_map {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(emu = %self.log_id, "Could not delete image map {}: {e}", path.display());
            }
        }

        lifecycle.phase = Phase::Killed;
        waited?;
        debug!(emu = %self.log_id, "Emulator shut down");
        Ok(())
    }

    /// Block until the current kill cycle has completed. Returns at once if
    /// none is pending.
    pub fn await_shutdown(&self) {
        self.shutdown.wait();
    }

    /// Return once the accounting process is gone or `cancel` fires. Used as
    /// the peer of the bridge's racing waits.
    pub fn await_termination(&self, cancel: &CancelSignal) {
        self.await_termination_or(cancel, &CancelSignal::never());
    }

    /// [`await_termination`](Self::await_termination) that also returns once
    /// `abort` fires.
    pub fn await_termination_or(&self, cancel: &CancelSignal, abort: &CancelSignal) {
        while self.is_accounting_running() {
            if cancel.sleep_either(abort, self.poll_interval) {
                return;
            }
        }
    }

    /// Poll period of process waits
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        if self.accounting().is_some() {
            let _ = self.kill();
        }
    }
}

/// Rest of the line after `marker`, if the marker occurs in `output`.
pub fn marker_value<'a>(output: &'a str, marker: &str) -> Option<&'a str> {
    let start = output.find(marker)? + marker.len();
    let rest = &output[start..];
    Some(rest.split('\n').next().unwrap_or(rest).trim_end_matches('\r'))
}

/// Update `info` from the console. Returns `true` when scanning can stop.
fn scan_boot_markers(output: &str, info: &mut BootInfo, log_id: &str) -> bool {
    if info.pid.is_none() {
        if let Some(value) = marker_value(output, CHILD_PID_MARKER) {
            match value.trim().parse::<u32>() {
                Ok(pid) => {
                    debug!(emu = %log_id, "Emulator pid {pid}");
                    info.pid = Some(pid);
                }
                Err(_) => warn!(emu = %log_id, "Unparsable emulator pid `{value}`"),
            }
        }
    }
    if info.image_map.is_none() {
        if let Some(value) = marker_value(output, IMAGE_MAP_MARKER) {
            debug!(emu = %log_id, "System image mapped to {value}");
            info.image_map = Some(PathBuf::from(value.trim()));
        }
    }

    if info.pid.is_some() && info.image_map.is_some() {
        return true;
    }
    if output.contains(BOOT_GIVE_UP_MARKER) {
        if info.pid.is_none() {
            error!(emu = %log_id, "Kernel booted without an emulator pid on the console");
        }
        if info.image_map.is_none() {
            error!(emu = %log_id, "Kernel booted without a system image mapping on the console");
        }
        return true;
    }
    false
}

/// Extract task-accounting lines for `pid` from the wrapper's output: the
/// `(key: value;…)` lines following the `PID <pid>` sentinel.
pub fn collect_accounting_stats(output: &str, pid: u32, log_id: &str) -> Option<Vec<String>> {
    let sentinel = match Regex::new(&format!(r"PID\s+{pid}\n")) {
        Ok(re) => re,
        Err(e) => {
            error!(emu = %log_id, "Invalid accounting sentinel: {e}");
            return None;
        }
    };
    let Some(found) = sentinel.find(output) else {
        error!(emu = %log_id, "No accounting data for pid {pid}");
        return None;
    };

    let line_pattern = match Regex::new(r"^\((\w+: \d+;)+\)$") {
        Ok(re) => re,
        Err(e) => {
            error!(emu = %log_id, "Invalid accounting pattern: {e}");
            return None;
        }
    };

    let mut stats = Vec::new();
    for line in output[found.end()..].lines().filter(|l| !l.is_empty()) {
        if line_pattern.is_match(line) {
            stats.push(line.to_string());
        } else {
            warn!(emu = %log_id, "Invalid accounting line: {line}");
        }
    }

    if stats.is_empty() {
        error!(emu = %log_id, "Accounting data for pid {pid} contained no valid lines");
        return None;
    }
    Some(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{HostTools, ImageSet};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::TempDir;

    fn settings_in(dir: &TempDir, getdelays_body: &str) -> ExperimentSettings {
        let root = dir.path();
        for name in ["userdata.img", "sdcard.img"] {
            std::fs::write(root.join(name), b"vanilla").unwrap();
        }
        let getdelays = root.join("getdelays");
        std::fs::write(&getdelays, format!("#!/bin/sh\n{getdelays_body}\n")).unwrap();
        std::fs::set_permissions(&getdelays, std::fs::Permissions::from_mode(0o755)).unwrap();

        ExperimentSettings {
            tools: HostTools {
                getdelays,
                ..HostTools::default()
            },
            images: ImageSet {
                kernel: root.join("kernel-qemu"),
                system_vanilla: root.join("system.img"),
                userdata: root.join("userdata-qemu.img"),
                userdata_vanilla: root.join("userdata.img"),
                sdcard: root.join("sdcard-qemu.img"),
                sdcard_vanilla: root.join("sdcard.img"),
            },
            poll_interval: Duration::from_millis(20),
            scan_interval: Duration::from_millis(20),
            ..ExperimentSettings::default()
        }
    }

    fn wait_for_pid(emulator: &Emulator) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while emulator.emulator_pid().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_config_derivation() {
        let settings = ExperimentSettings::default();
        let config = EmulatorConfig::new(3, 5560, &settings);

        assert_eq!(config.adb_port(), 5561);
        assert_eq!(config.adb_name(), "emulator-5560");
        assert_eq!(config.avd_name(), "grinder-3");
        assert_eq!(config.log_id(), "3/5560");
        assert_eq!(
            config.userdata_image(),
            Path::new("images/emu-3-userdata-qemu.img")
        );

        let cmd = config.emulator_command();
        assert_eq!(cmd[0], "emulator");
        assert_eq!(cmd[1..3], ["-avd".to_string(), "grinder-3".to_string()]);
        assert!(cmd.windows(2).any(|w| w[0] == "-ports" && w[1] == "5560,5561"));
        assert_eq!(cmd.last().map(String::as_str), Some("-no-cache"));

        let acc = config.accounting_command();
        assert_eq!(acc[..2], ["getdelays".to_string(), "-qdibec".to_string()]);
        assert_eq!(&acc[2..], cmd);
    }

    #[test]
    fn test_marker_value() {
        let console = "emulator: init\nChild pid: 4242\nemulator: mapping 'system' NAND image to /tmp/android/emulator-Ab12\n";
        assert_eq!(marker_value(console, CHILD_PID_MARKER), Some("4242"));
        assert_eq!(
            marker_value(console, IMAGE_MAP_MARKER),
            Some("/tmp/android/emulator-Ab12")
        );
        assert_eq!(marker_value(console, BOOT_GIVE_UP_MARKER), None);
    }

    #[test]
    fn test_scan_gives_up_after_kernel_command_line() {
        let mut info = BootInfo::default();
        assert!(!scan_boot_markers("Child pid: 7\n", &mut info, "0/5554"));
        assert_eq!(info.pid, Some(7));
        assert!(scan_boot_markers(
            "Child pid: 7\nKernel command line: qemu=1\n",
            &mut info,
            "0/5554"
        ));
        assert!(info.image_map.is_none());
    }

    #[test]
    fn test_accounting_stats() {
        let output = "noise\nPID\t1234\n(cpu: 10;blkio: 2;)\nbogus line\n(swap: 0;)\n";
        assert_eq!(
            collect_accounting_stats(output, 1234, "0/5554"),
            Some(vec!["(cpu: 10;blkio: 2;)".to_string(), "(swap: 0;)".to_string()])
        );
        // Sentinel for another pid
        assert_eq!(collect_accounting_stats(output, 99, "0/5554"), None);
        // Sentinel without valid lines
        assert_eq!(collect_accounting_stats("PID 5\nnothing\n", 5, "0/5554"), None);
    }

    #[test]
    fn test_kill_without_process_is_noop() {
        let emulator = Emulator::new(
            EmulatorConfig::new(0, 5554, &ExperimentSettings::default()),
            &ExperimentSettings::default(),
        );
        emulator.kill().unwrap();
        emulator.kill().unwrap();
        emulator.await_shutdown();
        assert_eq!(emulator.phase(), Phase::Idle);
    }

    #[test]
    fn test_start_kill_cycle() {
        let dir = TempDir::new().unwrap();
        // Stand-in wrapper: runs a child "emulator", prints its pid and the
        // accounting block once that child is killed.
        let settings = settings_in(
            &dir,
            "sleep 30 &\nchild=$!\necho \"Child pid: $child\"\necho 'Kernel command line: test'\nwait $child\necho \"PID $child\"\necho '(cpu: 1;)'",
        );
        let emulator = Emulator::new(EmulatorConfig::new(1, 5556, &settings), &settings);

        emulator.start().unwrap();
        assert!(matches!(
            emulator.start(),
            Err(EmulatorError::AlreadyRunning(_))
        ));
        assert!(dir.path().join("emu-1-userdata-qemu.img").exists());

        wait_for_pid(&emulator);
        assert!(emulator.is_emulator_running());
        assert!(emulator.is_accounting_running());

        emulator.kill().unwrap();
        emulator.await_shutdown();
        assert_eq!(emulator.phase(), Phase::Killed);
        assert!(!emulator.is_accounting_running());
        assert_eq!(emulator.emulator_pid(), None);
        assert_eq!(emulator.accounting_stats(), Some(vec!["(cpu: 1;)".to_string()]));

        // Killed instances can be started again
        emulator.start().unwrap();
        wait_for_pid(&emulator);
        emulator.kill().unwrap();
        assert_eq!(emulator.phase(), Phase::Killed);
    }

    #[test]
    fn test_await_termination_returns_when_wrapper_exits() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir, "exit 0");
        let emulator = Emulator::new(EmulatorConfig::new(2, 5558, &settings), &settings);
        emulator.start().unwrap();

        let start = Instant::now();
        emulator.await_termination(&CancelSignal::never());
        assert!(start.elapsed() < Duration::from_secs(10));
        emulator.kill().unwrap();
    }

    #[test]
    fn test_start_fails_without_images() {
        let settings = ExperimentSettings {
            images: ImageSet {
                userdata_vanilla: PathBuf::from("/nonexistent/userdata.img"),
                ..ImageSet::default()
            },
            ..ExperimentSettings::default()
        };
        let emulator = Emulator::new(EmulatorConfig::new(0, 5554, &settings), &settings);
        assert!(matches!(
            emulator.start(),
            Err(EmulatorError::ImageReset { .. })
        ));
        assert_eq!(emulator.phase(), Phase::Idle);
        emulator.await_shutdown();
    }
}
