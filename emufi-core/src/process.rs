//! OS Process Primitives
//!
//! Spawning, signalling and liveness queries for the host tools the
//! orchestrator drives (emulator, accounting wrapper, adb). Output of spawned
//! tools is read through [`LineReader`], which polls the pipe so readers can
//! observe cancellation between lines instead of blocking in `read`.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the process layer
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Signals the orchestrator sends to tools it does not own a handle for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGKILL
    Kill,
    /// SIGTERM
    Terminate,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Kill => libc::SIGKILL,
            Signal::Terminate => libc::SIGTERM,
        }
    }
}

/// Where a spawned tool's output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Discard stdout and stderr
    Null,
    /// Capture stdout, discard stderr
    Piped,
    /// Capture stdout and stderr through one pipe
    Merged,
}

/// A freshly spawned tool with its captured output, if any
#[derive(Debug)]
pub struct Spawned {
    /// Child handle
    pub child: Child,
    /// Read end of the output pipe (`None` for [`OutputMode::Null`])
    pub output: Option<File>,
}

/// Spawn `argv[0]` with the remaining arguments.
pub fn spawn(argv: &[String], mode: OutputMode) -> Result<Spawned, ProcessError> {
    let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null());

    let spawn_err = |source| ProcessError::Spawn {
        program: program.clone(),
        source,
    };

    match mode {
        OutputMode::Null => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
            let child = command.spawn().map_err(spawn_err)?;
            Ok(Spawned {
                child,
                output: None,
            })
        }
        OutputMode::Piped => {
            command.stdout(Stdio::piped()).stderr(Stdio::null());
            let mut child = command.spawn().map_err(spawn_err)?;
            let output = child
                .stdout
                .take()
                .map(|stdout| File::from(OwnedFd::from(stdout)));
            Ok(Spawned { child, output })
        }
        OutputMode::Merged => {
            let (read_fd, write_fd) = create_pipe()?;
            let err_fd = match dup_cloexec(write_fd) {
                Ok(fd) => fd,
                Err(e) => {
                    close_fd(read_fd);
                    close_fd(write_fd);
                    return Err(ProcessError::Io(e));
                }
            };

            // The Command owns both write ends from here on and closes them on drop.
            let (stdout, stderr) =
                unsafe { (File::from_raw_fd(write_fd), File::from_raw_fd(err_fd)) };
            command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));

            let spawned = command.spawn();
            drop(command);

            match spawned {
                Ok(child) => Ok(Spawned {
                    child,
                    output: Some(unsafe { File::from_raw_fd(read_fd) }),
                }),
                Err(e) => {
                    close_fd(read_fd);
                    Err(spawn_err(e))
                }
            }
        }
    }
}

/// Create a close-on-exec pipe pair, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn dup_cloexec(fd: RawFd) -> Result<RawFd, io::Error> {
    let ret = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Send `signal` to `pid`.
pub fn signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal.raw()) };
    if ret == -1 {
        Err(ProcessError::Signal {
            pid,
            source: io::Error::last_os_error(),
        })
    } else {
        Ok(())
    }
}

/// Whether a process with this pid exists (the signal-0 probe).
pub fn is_pid_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM: exists but belongs to someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether an owned child has not exited yet.
pub fn is_child_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Block until `child` exits, retrying when the wait is interrupted.
pub fn wait_uninterrupted(child: &mut Child) -> Result<ExitStatus, io::Error> {
    loop {
        match child.wait() {
            Ok(status) => return Ok(status),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Result of polling for data
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(io::Error),
}

/// Wait for data to be available on a file descriptor with timeout
fn wait_for_data(fd: RawFd, timeout: Duration) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        PollResult::Error(io::Error::last_os_error())
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

/// One step of a [`LineReader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A complete line, without its terminator
    Line(String),
    /// Nothing arrived within the poll timeout
    Idle,
    /// The writer side is gone and all lines were delivered
    Closed,
}

/// Line splitter over a pipe that never blocks longer than one poll timeout.
pub struct LineReader {
    source: File,
    pending: Vec<u8>,
    ready: VecDeque<String>,
    closed: bool,
}

impl LineReader {
    /// Wrap the read end of a pipe
    pub fn new(source: File) -> Self {
        Self {
            source,
            pending: Vec::new(),
            ready: VecDeque::new(),
            closed: false,
        }
    }

    /// Return the next line, or `Idle` if none completed within `timeout`.
    pub fn next_line(&mut self, timeout: Duration) -> Result<LineEvent, io::Error> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(LineEvent::Line(line));
            }
            if self.closed {
                if self.pending.is_empty() {
                    return Ok(LineEvent::Closed);
                }
                let tail = std::mem::take(&mut self.pending);
                return Ok(LineEvent::Line(decode_line(&tail)));
            }

            match wait_for_data(self.source.as_raw_fd(), timeout) {
                PollResult::DataAvailable | PollResult::PipeClosed => self.fill()?,
                PollResult::Timeout => return Ok(LineEvent::Idle),
                PollResult::Error(e) if e.kind() == io::ErrorKind::Interrupted => {
                    return Ok(LineEvent::Idle);
                }
                PollResult::Error(e) => return Err(e),
            }
        }
    }

    fn fill(&mut self) -> Result<(), io::Error> {
        let mut chunk = [0u8; 8192];
        let n = match self.source.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };
        if n == 0 {
            self.closed = true;
            return Ok(());
        }

        self.pending.extend_from_slice(&chunk[..n]);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.ready.push_back(decode_line(&line[..pos]));
        }
        Ok(())
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn collect_lines(mut reader: LineReader) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            match reader.next_line(Duration::from_millis(500)).unwrap() {
                LineEvent::Line(line) => lines.push(line),
                LineEvent::Idle => continue,
                LineEvent::Closed => return lines,
            }
        }
    }

    #[test]
    fn test_empty_command() {
        assert!(matches!(
            spawn(&[], OutputMode::Null),
            Err(ProcessError::EmptyCommand)
        ));
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = spawn(&argv(&["/nonexistent/emufi-tool"]), OutputMode::Null).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_piped_lines() {
        let mut spawned = spawn(
            &argv(&["/bin/sh", "-c", "printf 'one\\ntwo\\r\\nthree'"]),
            OutputMode::Piped,
        )
        .unwrap();
        let lines = collect_lines(LineReader::new(spawned.output.take().unwrap()));
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert!(spawned.child.wait().unwrap().success());
    }

    #[test]
    fn test_merged_output_captures_stderr() {
        let mut spawned = spawn(
            &argv(&["/bin/sh", "-c", "echo out; echo err 1>&2"]),
            OutputMode::Merged,
        )
        .unwrap();
        let mut lines = collect_lines(LineReader::new(spawned.output.take().unwrap()));
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
        spawned.child.wait().unwrap();
    }

    #[test]
    fn test_idle_while_writer_is_quiet() {
        let mut spawned = spawn(&argv(&["/bin/sh", "-c", "sleep 2"]), OutputMode::Piped).unwrap();
        let mut reader = LineReader::new(spawned.output.take().unwrap());
        assert_eq!(
            reader.next_line(Duration::from_millis(50)).unwrap(),
            LineEvent::Idle
        );
        spawned.child.kill().unwrap();
        spawned.child.wait().unwrap();
    }

    #[test]
    fn test_signal_and_liveness() {
        let mut spawned = spawn(&argv(&["/bin/sh", "-c", "sleep 30"]), OutputMode::Null).unwrap();
        let pid = spawned.child.id();
        assert!(is_pid_alive(pid));
        assert!(is_child_running(&mut spawned.child));

        signal(pid, Signal::Kill).unwrap();
        let status = wait_uninterrupted(&mut spawned.child).unwrap();
        assert!(!status.success());
        assert!(!is_child_running(&mut spawned.child));
    }
}
