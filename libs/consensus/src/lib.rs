//! Raft consensus for Flowline partitions
//!
//! Each partition of the engine is owned by one replication group running
//! the Raft protocol implemented here. The crate provides the replicated log,
//! membership with joint-consensus reconfiguration, and an actor-style node
//! that drives elections, replication and snapshot transfer.
//!
//! # Features
//!
//! - Leader election with randomized timeouts
//! - Log replication with quorum commit over one or two member sets
//! - Joint-consensus membership changes (active, passive and inactive members)
//! - Log compaction and chunked snapshot transfer to lagging followers
//! - Bounded proposal queue with explicit backpressure
//!
//! # Example
//!
//! ```no_run
//! use flowline_consensus::{InMemoryNetwork, Member, NodeId, RaftConfig, RaftNode};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let network = InMemoryNetwork::new();
//! let node = RaftNode::builder(NodeId(1))
//!     .config(RaftConfig::default())
//!     .members(vec![Member::active(NodeId(1))])
//!     .transport(network.transport(NodeId(1)))
//!     .start()
//!     .await?;
//! network.register(node.clone());
//!
//! // Resolves once the entry is committed
//! let index = node.propose(b"SET key value".to_vec().into()).await?;
//! # let _ = index;
//! # Ok(())
//! # }
//! ```

mod config;
mod log;
mod membership;
mod meta;
mod node;
mod rpc;
mod state;
mod transport;
mod types;

pub use config::{millis, RaftConfig, RaftConfigBuilder};
pub use log::{FileLogStorage, LogStorage, MemoryLogStorage, RaftLog, RaftLogReader};
pub use membership::{
    ClusterMembership, Configuration, Member, MemberContext, MemberType, SnapshotTransfer,
};
pub use meta::{FileMetaStore, MemoryMetaStore, MetaStore, PersistedMeta};
pub use node::{RaftHealth, RaftNode, RaftNodeBuilder, RaftStatus};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
pub use state::{NodeState, PersistentState, RaftRole, VolatileState};
pub use transport::{InMemoryNetwork, RaftTransport};
pub use types::{Entry, EntryPayload, LogIndex, NodeId, Snapshot, SnapshotMetadata, Term};

/// Result type for Raft operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur during Raft operations
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Too many pending requests, try again later")]
    Backpressure,

    #[error("Log index out of range: {0}")]
    LogIndexOutOfRange(LogIndex),

    #[error("Log integrity violated: {0}")]
    LogIntegrity(String),

    #[error("Configuration change rejected: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// Integrity failures must halt the node instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::LogIntegrity(_))
    }
}

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(err: serde_json::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}
