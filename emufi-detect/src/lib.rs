#![warn(missing_docs)]
//! emufi Detect - Result Detection Engine
//!
//! Watches a running emulator and decides how an experiment ended:
//! - `ProbeTarget`, the console, process and device view the probes inspect
//! - pure probe checks for crashes, hangs and workload outcomes
//! - `ResultDetector`, which runs the probes and delivers exactly one verdict
//!   per arming to a results collector

mod engine;
mod mutation;
pub mod probes;
mod target;
mod timings;

pub use engine::{DetectError, ProbeKind, ResultDetector};
pub use mutation::MutationLog;
pub use target::ProbeTarget;
pub use timings::DetectionTimings;
