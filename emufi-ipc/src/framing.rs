//! Length-Prefixed Collector Frames
//!
//! Message boundaries over a byte stream to the results collector.
//!
//! Frame format:
//! ```text
//! +----------------+------------------------------+
//! | length (4 LE)  | rkyv-archived CollectorMessage |
//! +----------------+------------------------------+
//! ```

use crate::messages::CollectorMessage;
use rkyv::Deserialize;
use std::io::{self, BufReader, BufWriter, Read, Write};
use thiserror::Error;

/// Largest accepted frame. Collector traffic is small text, so anything
/// bigger is a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("End of stream")]
    EndOfStream,
}

/// Serialize one message into a complete frame (prefix included).
pub fn encode(message: &CollectorMessage) -> Result<Vec<u8>, FrameError> {
    let payload = rkyv::to_bytes::<_, 256>(message)
        .map_err(|e| FrameError::Serialization(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validate and deserialize one frame payload (prefix excluded).
pub fn decode(payload: &[u8]) -> Result<CollectorMessage, FrameError> {
    let mut aligned = rkyv::AlignedVec::with_capacity(payload.len());
    aligned.extend_from_slice(payload);

    let archived = rkyv::check_archived_root::<CollectorMessage>(&aligned)
        .map_err(|e| FrameError::Deserialization(e.to_string()))?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| FrameError::Deserialization("archive conversion failed".to_string()))
}

/// Framed, buffered connection to the collector.
pub struct FramedStream<S: Read + Write> {
    reader: BufReader<S>,
    writer: BufWriter<S>,
}

impl<S: Read + Write> FramedStream<S> {
    /// Frame a duplex stream given as separate read and write handles
    /// (e.g. two clones of one `TcpStream`).
    pub fn new(read_half: S, write_half: S) -> Self {
        Self {
            reader: BufReader::with_capacity(16 * 1024, read_half),
            writer: BufWriter::with_capacity(16 * 1024, write_half),
        }
    }

    /// Write and flush one message
    pub fn send(&mut self, message: &CollectorMessage) -> Result<(), FrameError> {
        let frame = encode(message)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read one message, blocking until a whole frame arrived
    pub fn recv(&mut self) -> Result<CollectorMessage, FrameError> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::EndOfStream);
            }
            Err(e) => return Err(FrameError::Io(e)),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if len == 0 {
            return Err(FrameError::InvalidFrame("zero-length frame".to_string()));
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        decode(&payload)
    }

    /// Read handle
    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }
}
