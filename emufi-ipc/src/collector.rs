//! Results collector endpoints
//!
//! [`Collector`] is what the orchestrator reports to: it fetches the
//! experiment configuration and receives log text and verdicts.
//! [`TcpCollector`] speaks the framed protocol to a remote collector;
//! [`MemoryCollector`] records everything in memory.

use crate::framing::{FrameError, FramedStream};
use crate::messages::CollectorMessage;
use crate::result::ExperimentResult;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Collector communication failures
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Collector I/O failed: {0}")]
    Frame(#[from] FrameError),

    #[error("Failed to connect to collector at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not connected to a collector")]
    Disconnected,

    #[error("Unexpected collector reply: expected {expected}, got {got}")]
    UnexpectedReply { expected: String, got: String },
}

/// Sink for experiment configuration requests, logs and verdicts
pub trait Collector: Send + Sync {
    /// Fetch the experiment configuration text
    fn configuration(&self) -> Result<String, CollectorError>;

    /// Forward free-form log text
    fn send_log(&self, message: &str) -> Result<(), CollectorError>;

    /// Report the terminal verdict of a run
    fn send_experiment_finished(
        &self,
        result: ExperimentResult,
        metadata: &str,
    ) -> Result<(), CollectorError>;

    /// Release the connection, if any
    fn disconnect(&self) {}
}

/// Collector reached over TCP
pub struct TcpCollector {
    addr: String,
    stream: Mutex<Option<FramedStream<TcpStream>>>,
}

impl TcpCollector {
    /// Connect to `addr` (e.g. `"localhost:4444"`). `reply_timeout` bounds
    /// how long a configuration request waits for its answer.
    pub fn connect(addr: impl Into<String>, reply_timeout: Duration) -> Result<Self, CollectorError> {
        let addr = addr.into();
        let connect_err = |source| CollectorError::Connect {
            addr: addr.clone(),
            source,
        };

        let stream = addr
            .to_socket_addrs()
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
                })
            })
            .and_then(TcpStream::connect)
            .map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        stream
            .set_read_timeout(Some(reply_timeout))
            .map_err(connect_err)?;
        let write_half = stream.try_clone().map_err(connect_err)?;

        debug!("Connected to collector at {addr}");
        Ok(Self {
            addr,
            stream: Mutex::new(Some(FramedStream::new(stream, write_half))),
        })
    }

    /// Remote address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn with_stream<T>(
        &self,
        f: impl FnOnce(&mut FramedStream<TcpStream>) -> Result<T, CollectorError>,
    ) -> Result<T, CollectorError> {
        let mut guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let stream = guard.as_mut().ok_or(CollectorError::Disconnected)?;
        f(stream)
    }
}

impl Collector for TcpCollector {
    fn configuration(&self) -> Result<String, CollectorError> {
        self.with_stream(|stream| {
            stream.send(&CollectorMessage::GetConfiguration)?;
            match stream.recv()? {
                CollectorMessage::Configuration { config } => Ok(config),
                other => Err(CollectorError::UnexpectedReply {
                    expected: "Configuration".to_string(),
                    got: other.kind().to_string(),
                }),
            }
        })
    }

    fn send_log(&self, message: &str) -> Result<(), CollectorError> {
        self.with_stream(|stream| {
            stream.send(&CollectorMessage::Log {
                message: message.to_string(),
            })?;
            Ok(())
        })
    }

    fn send_experiment_finished(
        &self,
        result: ExperimentResult,
        metadata: &str,
    ) -> Result<(), CollectorError> {
        self.with_stream(|stream| {
            stream.send(&CollectorMessage::finished(result, metadata))?;
            Ok(())
        })
    }

    /// Close the connection. Later calls fail with `Disconnected`.
    fn disconnect(&self) {
        let stream = self.stream.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(stream) = stream {
            let _ = stream.get_ref().shutdown(std::net::Shutdown::Both);
            debug!("Disconnected from collector at {}", self.addr);
        }
    }
}

/// In-process collector that records every message
#[derive(Debug, Default)]
pub struct MemoryCollector {
    config: String,
    messages: Mutex<Vec<CollectorMessage>>,
}

impl MemoryCollector {
    /// Collector answering configuration requests with `config`
    pub fn new(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Everything received so far, in order
    pub fn messages(&self) -> Vec<CollectorMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Verdicts received so far with their metadata
    pub fn verdicts(&self) -> Vec<(ExperimentResult, String)> {
        self.messages()
            .into_iter()
            .filter_map(|msg| match msg {
                CollectorMessage::ExperimentFinished { result, metadata } => {
                    ExperimentResult::from_id(result).ok().map(|r| (r, metadata))
                }
                _ => None,
            })
            .collect()
    }

    /// Log texts received so far
    pub fn logs(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|msg| match msg {
                CollectorMessage::Log { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn record(&self, message: CollectorMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

impl Collector for MemoryCollector {
    fn configuration(&self) -> Result<String, CollectorError> {
        Ok(self.config.clone())
    }

    fn send_log(&self, message: &str) -> Result<(), CollectorError> {
        self.record(CollectorMessage::Log {
            message: message.to_string(),
        });
        Ok(())
    }

    fn send_experiment_finished(
        &self,
        result: ExperimentResult,
        metadata: &str,
    ) -> Result<(), CollectorError> {
        self.record(CollectorMessage::finished(result, metadata));
        Ok(())
    }
}
