//! Engine error types

use crate::record::RejectionKind;
use flowline_consensus::{NodeId, RaftError};
use flowline_storage::StorageError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures of the partition machinery itself
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Consensus error: {0}")]
    Raft(#[from] RaftError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Undecodable entry at index {index}: {reason}")]
    Decode { index: u64, reason: String },

    #[error("Event could not be applied: {0}")]
    Apply(String),

    #[error("Command processing failed: {0}")]
    Processing(String),

    #[error("Snapshot could not be installed: {0}")]
    Snapshot(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<prometheus::Error> for EngineError {
    fn from(err: prometheus::Error) -> Self {
        EngineError::Metrics(err.to_string())
    }
}

/// Outcome of a command handler that did not complete normally
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    /// The command is invalid for the current state; written as a rejection
    #[error("{kind:?}: {reason}")]
    Rejected { kind: RejectionKind, reason: String },

    /// The handler failed in a way that does not poison the partition;
    /// its writes are rolled back and a processing-error rejection is written
    #[error("Unexpected error: {0}")]
    Unexpected(String),

    /// The partition can not continue
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl ProcessingError {
    pub fn rejected(kind: RejectionKind, reason: impl Into<String>) -> Self {
        ProcessingError::Rejected {
            kind,
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for ProcessingError {
    fn from(err: StorageError) -> Self {
        ProcessingError::Fatal(err.to_string())
    }
}

impl From<EngineError> for ProcessingError {
    fn from(err: EngineError) -> Self {
        ProcessingError::Fatal(err.to_string())
    }
}

/// Why a submitted command got no response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Not the leader of the partition (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Partition is overloaded, try again later")]
    Backpressure,

    #[error("No response within the request timeout")]
    Timeout,

    #[error("Partition is shutting down")]
    ShuttingDown,

    #[error("Command could not be written: {0}")]
    Internal(String),
}

impl From<RaftError> for SubmitError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader(leader) => SubmitError::NotLeader(leader),
            RaftError::Backpressure => SubmitError::Backpressure,
            RaftError::ShuttingDown => SubmitError::ShuttingDown,
            other => SubmitError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for SubmitError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Raft(err) => err.into(),
            other => SubmitError::Internal(other.to_string()),
        }
    }
}
