//! Collector Message Types
//!
//! Messages exchanged with the results collector, serialized with rkyv.

use crate::result::{ExperimentResult, UnknownResult};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// One message on a collector connection
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum CollectorMessage {
    /// Orchestrator asks for the experiment configuration
    GetConfiguration,
    /// Collector reply: free-form configuration text
    Configuration {
        /// Configuration text
        config: String,
    },
    /// Free-form log text from the orchestrator
    Log {
        /// Log text
        message: String,
    },
    /// Terminal verdict of one run
    ExperimentFinished {
        /// Wire id of an [`ExperimentResult`]
        result: i16,
        /// Comma-separated metadata (e.g. observed fault sites)
        metadata: String,
    },
}

impl CollectorMessage {
    /// Build a verdict message
    pub fn finished(result: ExperimentResult, metadata: impl Into<String>) -> Self {
        CollectorMessage::ExperimentFinished {
            result: result.id(),
            metadata: metadata.into(),
        }
    }

    /// Decode the verdict of an `ExperimentFinished` message
    pub fn verdict(&self) -> Option<Result<ExperimentResult, UnknownResult>> {
        match self {
            CollectorMessage::ExperimentFinished { result, .. } => {
                Some(ExperimentResult::from_id(*result))
            }
            _ => None,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            CollectorMessage::GetConfiguration => "GetConfiguration",
            CollectorMessage::Configuration { .. } => "Configuration",
            CollectorMessage::Log { .. } => "Log",
            CollectorMessage::ExperimentFinished { .. } => "ExperimentFinished",
        }
    }
}
