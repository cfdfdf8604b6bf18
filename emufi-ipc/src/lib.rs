#![warn(missing_docs)]
//! emufi IPC Protocol
//!
//! Wire protocol between the orchestrator and the results collector.
//! Messages are rkyv-archived and length-prefixed; verdicts travel as the
//! stable numeric ids of [`ExperimentResult`].

mod collector;
mod framing;
mod messages;
mod result;

pub use collector::{Collector, CollectorError, MemoryCollector, TcpCollector};
pub use framing::{FrameError, FramedStream, MAX_FRAME_SIZE, decode, encode};
pub use messages::CollectorMessage;
pub use result::{ExperimentResult, UnknownResult};
