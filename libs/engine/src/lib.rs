//! Partitioned stream processing on top of Raft
//!
//! Every partition owns a replicated log of records. Clients submit commands
//! to the partition leader, which processes each committed command, writes the
//! resulting events back to the log and only then commits the state change.
//! Followers rebuild the same state by replaying those events, so the state of
//! every replica is a function of the committed log.
//!
//! Commands that concern all partitions are distributed: the origin partition
//! sends them to every other partition and keeps re-sending until each one
//! acknowledges.
//!
//! # Example
//!
//! ```no_run
//! use flowline_consensus::{InMemoryNetwork, Member, NodeId};
//! use flowline_engine::{CommandRequest, EngineConfig, Partition};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let network = InMemoryNetwork::new();
//! let config = EngineConfig::builder().node_id(NodeId(1)).build()?;
//! let partition = Partition::builder(config.partition(1, vec![Member::active(NodeId(1))])?)
//!     .transport(network.transport(NodeId(1)))
//!     .start()
//!     .await?;
//! network.register(partition.node().clone());
//!
//! let response = partition
//!     .submit(CommandRequest::create_tenant("acme", "Acme Corp"))
//!     .await?;
//! assert!(!response.is_rejection());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod distribution;
pub mod error;
pub mod log_stream;
pub mod partition;
pub mod processing;
pub mod record;
pub mod snapshot_controller;
pub mod state;
mod stream_processor;

pub use config::{EngineConfig, EngineConfigBuilder, PartitionConfig};
pub use distribution::{
    AcknowledgeProcessor, CommandDistributionBehavior, InterPartitionSender, PartitionRouter,
    IDENTITY_QUEUE,
};
pub use error::{EngineError, ProcessingError, Result, SubmitError};
pub use log_stream::{LogStream, LogStreamReader, ReadBatch, ReadOutcome};
pub use partition::{CommandRequest, CommandResponse, Partition, PartitionBuilder, PartitionHealth};
pub use processing::{CommandProcessor, ProcessingContext, RecordProcessors, SideEffect};
pub use record::{
    CommandDistributionRecord, DistributionIntent, Intent, LoggedRecord, Position, Record,
    RecordBatch, RecordType, RecordValue, Rejection, RejectionKind, TenantIntent, TenantRecord,
    ValueType,
};
pub use snapshot_controller::{EngineSnapshot, PendingSnapshot, SnapshotController, TakenSnapshot};
pub use state::ProcessingState;
pub use stream_processor::{ProcessingMode, Replayer};
