//! Records written to a partition's log
//!
//! Every application entry of the replicated log carries one [`RecordBatch`].
//! Records get their position while being read: the n-th record of the
//! partition is at position n on every replica.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, Result};

/// Position of a record in the partition's record stream
pub type Position = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tenant,
    CommandDistribution,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Tenant => "tenant",
            ValueType::CommandDistribution => "command_distribution",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TenantIntent {
    Create,
    Created,
    Update,
    Updated,
    Delete,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionIntent {
    Started,
    Enqueued,
    Distributing,
    Acknowledge,
    Acknowledged,
    Finished,
}

/// What happened, or is asked to happen, to a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Tenant(TenantIntent),
    Distribution(DistributionIntent),
}

impl Intent {
    pub fn value_type(self) -> ValueType {
        match self {
            Intent::Tenant(_) => ValueType::Tenant,
            Intent::Distribution(_) => ValueType::CommandDistribution,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Tenant(intent) => write!(f, "TENANT {:?}", intent),
            Intent::Distribution(intent) => write!(f, "COMMAND_DISTRIBUTION {:?}", intent),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_key: u64,
    pub tenant_id: String,
    pub name: String,
}

/// A command shipped to other partitions and its progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDistributionRecord {
    /// Origin partition for `Started`, target partition for per-partition
    /// intents and for `Acknowledge`
    pub partition_id: u32,
    /// Commands on the same queue reach a partition in order
    pub queue: Option<String>,
    /// Key of the distributed command
    pub command_key: u64,
    pub value_type: ValueType,
    pub intent: Intent,
    pub command_value: Option<Box<RecordValue>>,
    /// Targets still to be reached; only set on `Started`
    pub partitions: Vec<u32>,
}

impl CommandDistributionRecord {
    /// The same distribution, narrowed to one target partition
    pub fn for_partition(&self, partition_id: u32) -> Self {
        Self {
            partition_id,
            queue: self.queue.clone(),
            command_key: self.command_key,
            value_type: self.value_type,
            intent: self.intent,
            command_value: None,
            partitions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordValue {
    Tenant(TenantRecord),
    CommandDistribution(CommandDistributionRecord),
}

impl RecordValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            RecordValue::Tenant(_) => ValueType::Tenant,
            RecordValue::CommandDistribution(_) => ValueType::CommandDistribution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    ProcessingError,
}

impl RejectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionKind::InvalidArgument => "INVALID_ARGUMENT",
            RejectionKind::NotFound => "NOT_FOUND",
            RejectionKind::AlreadyExists => "ALREADY_EXISTS",
            RejectionKind::InvalidState => "INVALID_STATE",
            RejectionKind::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

/// Identifies the client request a command was submitted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Node that accepted the request and waits for the response
    pub node_id: u64,
    pub request_id: u64,
}

/// Marks a command received from another partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionMetadata {
    pub origin_partition: u32,
    pub distribution_key: u64,
}

/// A single record as written to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub record_type: RecordType,
    pub intent: Intent,
    pub key: u64,
    pub value: RecordValue,
    pub rejection: Option<Rejection>,
    pub request: Option<RequestMetadata>,
    pub distribution: Option<DistributionMetadata>,
    /// Position of the command this record was produced for
    pub source_position: Option<Position>,
}

impl Record {
    pub fn command(intent: Intent, key: u64, value: RecordValue) -> Self {
        Self {
            record_type: RecordType::Command,
            intent,
            key,
            value,
            rejection: None,
            request: None,
            distribution: None,
            source_position: None,
        }
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }
}

/// Records written atomically in one log entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn single(record: Record) -> Self {
        Self {
            records: vec![record],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(index: u64, data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|err| EngineError::Decode {
            index,
            reason: err.to_string(),
        })
    }
}

/// A record read back from the log, with its position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRecord {
    pub position: Position,
    /// Term of the entry that carried the record
    pub term: u64,
    /// Log index of that entry
    pub index: u64,
    pub record: Record,
}

impl LoggedRecord {
    /// Request metadata, if the command was submitted through `node_id`
    pub fn request_on(&self, node_id: u64) -> Option<RequestMetadata> {
        self.record.request.filter(|r| r.node_id == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_tenant(id: &str) -> Record {
        Record::command(
            Intent::Tenant(TenantIntent::Create),
            0,
            RecordValue::Tenant(TenantRecord {
                tenant_key: 0,
                tenant_id: id.to_string(),
                name: "Tenant".to_string(),
            }),
        )
    }

    #[test]
    fn test_batch_encoding() {
        let mut distributed = create_tenant("b");
        distributed.distribution = Some(DistributionMetadata {
            origin_partition: 2,
            distribution_key: 42,
        });
        let batch = RecordBatch::new(vec![create_tenant("a"), distributed]);

        let bytes = batch.encode().unwrap();
        assert_eq!(RecordBatch::decode(1, &bytes).unwrap(), batch);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = RecordBatch::decode(7, &[0xff; 3]).unwrap_err();
        assert!(matches!(err, EngineError::Decode { index: 7, .. }));
    }

    #[test]
    fn test_value_type_follows_intent() {
        assert_eq!(
            Intent::Distribution(DistributionIntent::Acknowledge).value_type(),
            ValueType::CommandDistribution
        );
        assert_eq!(create_tenant("a").value_type(), ValueType::Tenant);
        assert_eq!(
            Intent::Tenant(TenantIntent::Created).to_string(),
            "TENANT Created"
        );
    }
}
