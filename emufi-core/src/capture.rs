//! Console output capture
//!
//! Drains a child's output pipe on a background thread, line by line, into a
//! [`CircularBuffer`] and the debug log.

use crate::cancel::CancelSource;
use crate::process::{LineEvent, LineReader};
use crate::ring::CircularBuffer;
use std::fs::File;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Poll timeout of the reader thread between cancellation checks
pub const READ_POLL: Duration = Duration::from_millis(200);

/// Errors raised while starting a capture
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Already capturing output of {0}")]
    AlreadyCapturing(String),

    #[error("Failed to start capture thread: {0}")]
    Thread(#[from] std::io::Error),
}

struct CaptureThread {
    stop: CancelSource,
    handle: JoinHandle<()>,
}

/// Captures one output stream at a time into a shared circular buffer.
pub struct OutputCapturer {
    label: String,
    buffer: Arc<CircularBuffer>,
    active: Mutex<Option<CaptureThread>>,
}

impl OutputCapturer {
    /// New capturer with a buffer of `capacity` bytes. `label` names the
    /// stream in log records.
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        Self {
            label: label.into(),
            buffer: Arc::new(CircularBuffer::with_capacity(capacity)),
            active: Mutex::new(None),
        }
    }

    /// The buffer lines are captured into
    pub fn buffer(&self) -> &Arc<CircularBuffer> {
        &self.buffer
    }

    /// Start draining `source` on a background thread.
    pub fn start(&self, source: File) -> Result<(), CaptureError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.is_some() {
            return Err(CaptureError::AlreadyCapturing(self.label.clone()));
        }

        let stop = CancelSource::new();
        let cancel = stop.signal();
        let buffer = Arc::clone(&self.buffer);
        let label = self.label.clone();

        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.label))
            .spawn(move || {
                let mut reader = LineReader::new(source);
                loop {
                    match reader.next_line(READ_POLL) {
                        Ok(LineEvent::Line(line)) => {
                            debug!(target: "emufi::console", source = %label, "{line}");
                            buffer.put(&format!("{line}\n"));
                        }
                        // Everything already in the pipe was drained before going idle.
                        Ok(LineEvent::Idle) if cancel.is_cancelled() => break,
                        Ok(LineEvent::Idle) => continue,
                        Ok(LineEvent::Closed) => break,
                        Err(e) => {
                            warn!(source = %label, "Console read failed: {e}");
                            break;
                        }
                    }
                }
                debug!(source = %label, "Console capture finished");
            })?;

        *active = Some(CaptureThread { stop, handle });
        Ok(())
    }

    /// Stop capturing and join the reader thread. Output already written to
    /// the pipe is drained first. No-op if not capturing.
    pub fn stop(&self) {
        let thread = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            thread.stop.cancel();
            if thread.handle.join().is_err() {
                warn!(source = %self.label, "Console capture thread panicked");
            }
        }
    }

    /// Whether a reader thread is attached
    pub fn is_capturing(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Captured content, oldest first
    pub fn output(&self) -> String {
        self.buffer.snapshot()
    }

    /// Cyclic search over the captured window
    pub fn contains(&self, pattern: &str) -> bool {
        self.buffer.contains(pattern)
    }
}

impl Drop for OutputCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{OutputMode, spawn};
    use std::time::Instant;

    fn shell(script: &str) -> crate::process::Spawned {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
        spawn(&argv, OutputMode::Merged).unwrap()
    }

    #[test]
    fn test_capture_until_eof() {
        let capturer = OutputCapturer::new("test", 1024);
        let mut spawned = shell("echo 'Child pid: 42'; echo 'Kernel command line: x'");
        capturer.start(spawned.output.take().unwrap()).unwrap();
        spawned.child.wait().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while capturer.is_capturing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        capturer.stop();

        assert_eq!(capturer.output(), "Child pid: 42\nKernel command line: x\n");
        assert!(capturer.contains("pid: 42\nKernel"));
    }

    #[test]
    fn test_stop_while_writer_alive() {
        let capturer = OutputCapturer::new("test", 1024);
        let mut spawned = shell("echo booting; sleep 30");
        capturer.start(spawned.output.take().unwrap()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !capturer.contains("booting") && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let start = Instant::now();
        capturer.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!capturer.is_capturing());
        assert_eq!(capturer.output(), "booting\n");

        spawned.child.kill().unwrap();
        spawned.child.wait().unwrap();
    }

    #[test]
    fn test_double_start_rejected() {
        let capturer = OutputCapturer::new("test", 64);
        let mut first = shell("sleep 30");
        let mut second = shell("true");
        capturer.start(first.output.take().unwrap()).unwrap();
        assert!(matches!(
            capturer.start(second.output.take().unwrap()),
            Err(CaptureError::AlreadyCapturing(_))
        ));

        capturer.stop();
        first.child.kill().unwrap();
        first.child.wait().unwrap();
        second.child.wait().unwrap();
    }
}
