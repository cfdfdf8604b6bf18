//! Device Control Bridge
//!
//! Runs adb commands against one emulated device. Every command is a fresh
//! OS process registered in the bridge's tracked set for its lifetime, so
//! [`DeviceBridge::cancel_created_processes`] can abort whatever is in flight.

use crate::cancel::{CancelSignal, Race, race};
use crate::process::{self, LineEvent, LineReader, OutputMode, ProcessError, Spawned};
use crate::settings::HostTools;
use fxhash::FxHashMap;
use regex::Regex;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Exit code the shell wrapper reserves for adb transport failures
pub const ADB_SHELL_TRANSPORT_ERROR: i32 = 42;

/// Poll period of [`DeviceBridge::test_response`]
pub const RESPONSE_POLL: Duration = Duration::from_secs(1);

/// Errors raised by bridge commands
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("adb transport error while running `{command}`")]
    Transport { command: String },

    #[error("`{command}` was terminated by a signal")]
    Signaled { command: String },

    #[error("`{command}` exited with status {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("Log stream ended before a line matched `{pattern}`")]
    StreamEnded { pattern: String },

    #[error("Invalid log pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Emulator terminated while waiting")]
    PeerTerminated,

    #[error("Wait cancelled")]
    Cancelled,
}

type SharedChild = Arc<Mutex<Child>>;

fn lock_child(child: &SharedChild) -> std::sync::MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

/// Processes spawned by one bridge and not yet reaped
#[derive(Default)]
struct ProcessRegistry {
    next_id: AtomicU64,
    children: Mutex<FxHashMap<u64, SharedChild>>,
}

impl ProcessRegistry {
    fn register(&self, child: Child) -> (u64, SharedChild) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let child = Arc::new(Mutex::new(child));
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&child));
        (id, child)
    }

    fn unregister(&self, id: u64) {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn len(&self) -> usize {
        self.children.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Kill and reap every tracked process, leaving the set empty.
    fn cancel_all(&self) -> usize {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        let count = children.len();
        for (_, child) in children.drain() {
            let mut child = lock_child(&child);
            if process::is_child_running(&mut child) {
                let _ = child.kill();
            }
            let _ = process::wait_uninterrupted(&mut child);
        }
        count
    }
}

/// Scoped registration of one command. Dropping it kills the process if it
/// is still running and removes it from the tracked set.
struct TrackedProcess<'a> {
    registry: &'a ProcessRegistry,
    id: u64,
    child: SharedChild,
    command: String,
}

impl TrackedProcess<'_> {
    fn try_status(&self) -> Result<Option<ExitStatus>, io::Error> {
        lock_child(&self.child).try_wait()
    }

    /// Poll until the process exits or `cancel` fires.
    fn wait(&self, cancel: &CancelSignal, poll: Duration) -> Result<ExitStatus, BridgeError> {
        loop {
            if let Some(status) = self.try_status()? {
                return Ok(status);
            }
            if cancel.sleep(poll) {
                return Err(BridgeError::Cancelled);
            }
        }
    }

    /// Exit code, mapping signal deaths to an error.
    fn exit_code(&self, status: ExitStatus) -> Result<i32, BridgeError> {
        status.code().ok_or_else(|| BridgeError::Signaled {
            command: self.command.clone(),
        })
    }
}

impl Drop for TrackedProcess<'_> {
    fn drop(&mut self) {
        {
            let mut child = lock_child(&self.child);
            if process::is_child_running(&mut child) {
                let _ = child.kill();
                let _ = process::wait_uninterrupted(&mut child);
            }
        }
        self.registry.unregister(self.id);
    }
}

/// adb front end bound to one device
pub struct DeviceBridge {
    adb: PathBuf,
    adb_shell: PathBuf,
    device: String,
    log_id: String,
    module_dir: String,
    poll_interval: Duration,
    registry: ProcessRegistry,
}

impl DeviceBridge {
    /// Bridge for the device named `device` (e.g. `emulator-5554`).
    pub fn new(
        tools: &HostTools,
        device: impl Into<String>,
        log_id: impl Into<String>,
        module_dir: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            adb: tools.adb.clone(),
            adb_shell: tools.adb_shell.clone(),
            device: device.into(),
            log_id: log_id.into(),
            module_dir: module_dir.into(),
            poll_interval,
            registry: ProcessRegistry::default(),
        }
    }

    /// Device serial this bridge targets
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Number of commands currently tracked
    pub fn tracked_processes(&self) -> usize {
        self.registry.len()
    }

    fn adb_command<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut argv = vec![
            self.adb.to_string_lossy().into_owned(),
            "-s".to_string(),
            self.device.clone(),
        ];
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    fn shell_command(&self, cmd: &str) -> Vec<String> {
        vec![
            self.adb_shell.to_string_lossy().into_owned(),
            self.device.clone(),
            cmd.to_string(),
        ]
    }

    fn spawn_tracked(
        &self,
        argv: Vec<String>,
        mode: OutputMode,
    ) -> Result<(TrackedProcess<'_>, Option<File>), BridgeError> {
        let command = argv.join(" ");
        debug!(emu = %self.log_id, "Running `{command}`");
        let Spawned { child, output } = process::spawn(&argv, mode)?;
        let (id, child) = self.registry.register(child);
        let tracked = TrackedProcess {
            registry: &self.registry,
            id,
            child,
            command,
        };
        Ok((tracked, output))
    }

    fn run(&self, argv: Vec<String>, cancel: &CancelSignal) -> Result<i32, BridgeError> {
        let (tracked, _) = self.spawn_tracked(argv, OutputMode::Null)?;
        let status = tracked.wait(cancel, self.poll_interval)?;
        tracked.exit_code(status)
    }

    fn run_checked(&self, argv: Vec<String>) -> Result<(), BridgeError> {
        let command = argv.join(" ");
        match self.run(argv, &CancelSignal::never())? {
            0 => Ok(()),
            code => Err(BridgeError::CommandFailed { command, code }),
        }
    }

    /// Run an adb command and collect its stdout lines.
    fn run_output<S: AsRef<str>>(&self, args: &[S]) -> Result<(i32, Vec<String>), BridgeError> {
        let (tracked, output) = self.spawn_tracked(self.adb_command(args), OutputMode::Piped)?;
        let mut lines = Vec::new();
        if let Some(output) = output {
            let mut reader = LineReader::new(output);
            loop {
                match reader.next_line(self.poll_interval)? {
                    LineEvent::Line(line) => lines.push(line),
                    LineEvent::Idle => continue,
                    LineEvent::Closed => break,
                }
            }
        }
        let status = tracked.wait(&CancelSignal::never(), self.poll_interval)?;
        Ok((tracked.exit_code(status)?, lines))
    }

    /// Run `adb -s <device> <args…>` and return its exit code.
    pub fn exec_adb<S: AsRef<str>>(&self, args: &[S]) -> Result<i32, BridgeError> {
        self.run(self.adb_command(args), &CancelSignal::never())
    }

    /// Run `cmd` in a device shell and return its exit code. The wrapper's
    /// reserved transport code is reported as [`BridgeError::Transport`].
    pub fn exec_shell(&self, cmd: &str) -> Result<i32, BridgeError> {
        match self.run(self.shell_command(cmd), &CancelSignal::never())? {
            ADB_SHELL_TRANSPORT_ERROR => Err(BridgeError::Transport {
                command: cmd.to_string(),
            }),
            code => Ok(code),
        }
    }

    /// Like [`exec_shell`](Self::exec_shell) with `path_ext` prepended to `PATH`.
    pub fn exec_shell_with_path(&self, cmd: &str, path_ext: &str) -> Result<i32, BridgeError> {
        self.exec_shell(&format!("PATH={path_ext}:$PATH; {cmd}"))
    }

    /// Start `cmd` in a device shell without waiting. The process stays
    /// tracked until [`cancel_created_processes`](Self::cancel_created_processes).
    pub fn spawn_shell(&self, cmd: &str, path_ext: Option<&str>) -> Result<(), BridgeError> {
        let cmd = match path_ext {
            Some(ext) => format!("PATH={ext}:$PATH; {cmd}"),
            None => cmd.to_string(),
        };
        debug!(emu = %self.log_id, "Starting `{cmd}` in background");
        let Spawned { child, .. } = process::spawn(&self.shell_command(&cmd), OutputMode::Null)?;
        self.registry.register(child);
        Ok(())
    }

    /// Block until adb reports the device as connected.
    pub fn wait_for_device(&self) -> Result<(), BridgeError> {
        self.wait_for_device_until(&CancelSignal::never())
    }

    /// [`wait_for_device`](Self::wait_for_device), abandoned when `cancel` fires.
    pub fn wait_for_device_until(&self, cancel: &CancelSignal) -> Result<(), BridgeError> {
        let argv = self.adb_command(&["wait-for-device"]);
        let command = argv.join(" ");
        match self.run(argv, cancel)? {
            0 => Ok(()),
            code => Err(BridgeError::CommandFailed { command, code }),
        }
    }

    /// Race the device wait against `peer`, which returns once the emulator
    /// has died. `Ok(true)` if the device came up first, `Ok(false)` if the
    /// peer finished first.
    pub fn wait_for_device_checked<P>(&self, peer: P) -> Result<bool, BridgeError>
    where
        P: FnOnce(&CancelSignal) + Send,
    {
        match race(|cancel| self.wait_for_device_until(cancel), peer) {
            Race::First(outcome) => outcome.map(|()| true),
            Race::Second(()) => {
                warn!(emu = %self.log_id, "Emulator terminated before the device came up");
                Ok(false)
            }
        }
    }

    /// Stream `logcat` for `buffer` with the given filter specs and return at
    /// the first line matching `pattern`.
    pub fn wait_for_logcat_event(
        &self,
        buffer: &str,
        pattern: &str,
        filters: &[&str],
    ) -> Result<(), BridgeError> {
        self.wait_for_logcat_event_until(buffer, pattern, filters, &CancelSignal::never())
    }

    /// [`wait_for_logcat_event`](Self::wait_for_logcat_event), abandoned when
    /// `cancel` fires.
    pub fn wait_for_logcat_event_until(
        &self,
        buffer: &str,
        pattern: &str,
        filters: &[&str],
        cancel: &CancelSignal,
    ) -> Result<(), BridgeError> {
        let regex = Regex::new(pattern)?;
        let mut args = vec!["logcat", "-s", "-b", buffer];
        args.extend_from_slice(filters);

        let (_tracked, output) = self.spawn_tracked(self.adb_command(&args), OutputMode::Piped)?;
        let Some(output) = output else {
            return Err(BridgeError::StreamEnded {
                pattern: pattern.to_string(),
            });
        };

        let mut reader = LineReader::new(output);
        loop {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            match reader.next_line(self.poll_interval)? {
                LineEvent::Line(line) if regex.is_match(&line) => {
                    debug!(emu = %self.log_id, "Log event matched: {line}");
                    return Ok(());
                }
                LineEvent::Line(_) | LineEvent::Idle => continue,
                LineEvent::Closed => {
                    return Err(BridgeError::StreamEnded {
                        pattern: pattern.to_string(),
                    });
                }
            }
        }
    }

    /// Race a log wait against `peer`; the peer finishing first is
    /// [`BridgeError::PeerTerminated`].
    pub fn wait_for_logcat_event_checked<P>(
        &self,
        peer: P,
        buffer: &str,
        pattern: &str,
        filters: &[&str],
    ) -> Result<(), BridgeError>
    where
        P: FnOnce(&CancelSignal) + Send,
    {
        match race(
            |cancel| self.wait_for_logcat_event_until(buffer, pattern, filters, cancel),
            peer,
        ) {
            Race::First(outcome) => outcome,
            Race::Second(()) => Err(BridgeError::PeerTerminated),
        }
    }

    /// Kill and unregister every command started through this bridge.
    pub fn cancel_created_processes(&self) {
        let count = self.registry.cancel_all();
        if count > 0 {
            debug!(emu = %self.log_id, "Cancelled {count} bridge process(es)");
        }
    }

    /// Device state as reported by `adb get-state` (e.g. `device`, `unknown`).
    pub fn get_state(&self) -> Result<String, BridgeError> {
        let (_, lines) = self.run_output(&["get-state"])?;
        Ok(lines
            .into_iter()
            .next()
            .map(|line| line.trim().to_string())
            .unwrap_or_default())
    }

    /// Whether a trivial adb shell command completes within `timeout`.
    pub fn test_response(&self, timeout: Duration) -> Result<bool, BridgeError> {
        let (tracked, _) =
            self.spawn_tracked(self.adb_command(&["shell", "ls"]), OutputMode::Null)?;
        let deadline = Instant::now() + timeout;
        loop {
            if tracked.try_status()?.is_some() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(emu = %self.log_id, "No adb response within {timeout:?}");
                return Ok(false);
            }
            std::thread::sleep(remaining.min(RESPONSE_POLL));
        }
    }

    /// `insmod` a module already on the device.
    pub fn load_module(&self, device_path: &str) -> Result<(), BridgeError> {
        let cmd = format!("insmod {device_path}");
        match self.exec_shell(&cmd)? {
            0 => Ok(()),
            code => Err(BridgeError::CommandFailed { command: cmd, code }),
        }
    }

    /// Push a host module into the device module directory and load it.
    pub fn push_load_module(&self, local: &Path) -> Result<(), BridgeError> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote = format!("{}/{}", self.module_dir, name);
        let local_arg = local.to_string_lossy().into_owned();
        self.run_checked(self.adb_command(&["push", local_arg.as_str(), remote.as_str()]))?;
        self.load_module(&remote)
    }

    /// Remove a device file. With `ignore_missing` a missing file is not an error.
    pub fn remove_file(&self, device_path: &str, ignore_missing: bool) -> Result<(), BridgeError> {
        let cmd = if ignore_missing {
            format!("rm -f {device_path}")
        } else {
            format!("rm {device_path}")
        };
        match self.exec_shell(&cmd)? {
            0 => Ok(()),
            code => Err(BridgeError::CommandFailed { command: cmd, code }),
        }
    }

    /// Copy a device file to a uniquely named file in the host temp dir.
    pub fn pull_file(&self, device_path: &str) -> Result<PathBuf, BridgeError> {
        let name = Path::new(device_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pulled".to_string());
        let local = std::env::temp_dir().join(format!("{name}-{:016x}", rand::random::<u64>()));
        let local_arg = local.to_string_lossy().into_owned();
        self.run_checked(self.adb_command(&["pull", device_path, local_arg.as_str()]))?;
        Ok(local)
    }

    /// First line of a device file, or `None` if it could not be pulled.
    /// The local copy is removed afterwards.
    pub fn read_first_line(&self, device_path: &str) -> Result<Option<String>, BridgeError> {
        let local = match self.pull_file(device_path) {
            Ok(local) => local,
            Err(BridgeError::CommandFailed { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let first = File::open(&local).and_then(|file| {
            let mut line = String::new();
            BufReader::new(file).read_line(&mut line)?;
            Ok(line.trim_end_matches(['\r', '\n']).to_string())
        });
        if let Err(e) = std::fs::remove_file(&local) {
            warn!(emu = %self.log_id, "Failed to delete {}: {e}", local.display());
        }
        Ok(Some(first?))
    }

    /// `am start` an activity.
    pub fn start_app(&self, activity: &str) -> Result<(), BridgeError> {
        let cmd = format!("am start {activity}");
        match self.exec_shell(&cmd)? {
            0 => Ok(()),
            code => Err(BridgeError::CommandFailed { command: cmd, code }),
        }
    }

    /// Whether the service manager knows `service`.
    pub fn check_service(&self, service: &str) -> Result<bool, BridgeError> {
        let code = self.exec_shell(&format!("service check {service} | grep \"not found\""))?;
        Ok(code != 0)
    }

    /// Poll [`check_service`](Self::check_service) every `poll` until it
    /// succeeds or `cancel` fires.
    pub fn wait_for_service(
        &self,
        service: &str,
        poll: Duration,
        cancel: &CancelSignal,
    ) -> Result<(), BridgeError> {
        loop {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            if self.check_service(service)? {
                return Ok(());
            }
            if cancel.sleep(poll) {
                return Err(BridgeError::Cancelled);
            }
        }
    }
}

impl Drop for DeviceBridge {
    fn drop(&mut self) {
        self.registry.cancel_all();
    }
}
