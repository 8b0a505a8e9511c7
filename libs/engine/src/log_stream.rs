//! Record view of a partition's replicated log

use crate::error::{EngineError, Result};
use crate::record::{LoggedRecord, Position, RecordBatch};
use flowline_consensus::{EntryPayload, LogIndex, RaftError, RaftLogReader, RaftNode};

/// Writes record batches through consensus
#[derive(Clone)]
pub struct LogStream {
    partition_id: u32,
    node: RaftNode,
}

impl LogStream {
    pub fn new(partition_id: u32, node: RaftNode) -> Self {
        Self { partition_id, node }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Append a batch; resolves with its log index once it is committed
    pub async fn write(&self, batch: &RecordBatch) -> Result<LogIndex> {
        let data = batch.encode()?;
        Ok(self.node.propose(data).await?)
    }

    /// Read committed batches starting at `from`, whose first record has
    /// position `base_position`
    pub fn reader(&self, from: LogIndex, base_position: Position) -> LogStreamReader {
        LogStreamReader {
            reader: self.node.log().reader(from),
            next_position: base_position,
        }
    }
}

/// Records of one application entry
#[derive(Debug, Clone)]
pub struct ReadBatch {
    pub index: LogIndex,
    pub term: u64,
    /// Position of the first record
    pub base_position: Position,
    pub records: Vec<LoggedRecord>,
}

impl ReadBatch {
    /// Position of the last record, or the one before the batch if empty
    pub fn last_position(&self) -> Position {
        self.base_position + self.records.len() as u64 - 1
    }
}

/// Result of [`LogStreamReader::read`]
#[derive(Debug)]
pub enum ReadOutcome {
    Batch(ReadBatch),
    /// Nothing committed beyond the reader
    CaughtUp,
    /// The entry at this index was compacted or replaced by a snapshot
    Compacted(LogIndex),
}

/// Yields committed records in position order
///
/// Positions are counted while reading, so a reader must start at an entry
/// whose base position is known (the log start or a snapshot).
pub struct LogStreamReader {
    reader: RaftLogReader,
    next_position: Position,
}

impl LogStreamReader {
    /// Next application entry at or below `commit_index`
    ///
    /// Noop and configuration entries are skipped.
    pub fn next_batch(&mut self, commit_index: LogIndex) -> Result<Option<ReadBatch>> {
        while let Some(entry) = self.reader.next_entry(commit_index)? {
            let EntryPayload::Application(data) = &entry.payload else {
                continue;
            };
            let batch = RecordBatch::decode(entry.index.0, data)?;
            let base_position = self.next_position;
            let records = batch
                .records
                .into_iter()
                .enumerate()
                .map(|(offset, record)| LoggedRecord {
                    position: base_position + offset as u64,
                    term: entry.term.0,
                    index: entry.index.0,
                    record,
                })
                .collect::<Vec<_>>();
            self.next_position += records.len() as u64;
            return Ok(Some(ReadBatch {
                index: entry.index,
                term: entry.term.0,
                base_position,
                records,
            }));
        }
        Ok(None)
    }

    /// Like [`Self::next_batch`], but reports entries removed from under the
    /// reader instead of failing
    pub fn read(&mut self, commit_index: LogIndex) -> Result<ReadOutcome> {
        match self.next_batch(commit_index) {
            Ok(Some(batch)) => Ok(ReadOutcome::Batch(batch)),
            Ok(None) => Ok(ReadOutcome::CaughtUp),
            Err(EngineError::Raft(RaftError::LogIndexOutOfRange(index))) => {
                Ok(ReadOutcome::Compacted(index))
            }
            Err(err) => Err(err),
        }
    }

    /// Continue at `index`, whose first record has `base_position`
    pub fn seek(&mut self, index: LogIndex, base_position: Position) {
        self.reader.seek(index);
        self.next_position = base_position;
    }

    /// Index of the next entry to read
    pub fn next_index(&self) -> LogIndex {
        self.reader.next_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Intent, Record, RecordValue, TenantIntent, TenantRecord};
    use flowline_consensus::{
        Configuration, Entry, Member, NodeId, RaftLog, Snapshot, SnapshotMetadata, Term,
    };

    fn batch_entry(index: u64) -> Entry {
        let record = Record::command(
            Intent::Tenant(TenantIntent::Create),
            0,
            RecordValue::Tenant(TenantRecord {
                tenant_key: 0,
                tenant_id: format!("tenant-{}", index),
                name: String::new(),
            }),
        );
        let data = RecordBatch::single(record).encode().unwrap();
        Entry::application(Term(1), LogIndex(index), data)
    }

    #[test]
    fn test_read_reports_entries_replaced_by_snapshot() {
        let log = RaftLog::new_memory();
        log.append((1..=6).map(batch_entry).collect()).unwrap();
        let mut reader = LogStreamReader {
            reader: log.reader(LogIndex(1)),
            next_position: 1,
        };

        let ReadOutcome::Batch(first) = reader.read(LogIndex(6)).unwrap() else {
            panic!("expected the first batch");
        };
        assert_eq!(first.index, LogIndex(1));

        // A snapshot from the leader replaces the whole log
        log.reset_to_snapshot(Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(10),
                last_included_term: Term(2),
                configuration: Configuration::bootstrap(vec![Member::active(NodeId(1))]),
            },
            data: Default::default(),
        })
        .unwrap();

        // Entries already fetched are still returned, then the gap shows
        let mut outcome = reader.read(LogIndex(10)).unwrap();
        while let ReadOutcome::Batch(_) = outcome {
            outcome = reader.read(LogIndex(10)).unwrap();
        }
        assert!(matches!(outcome, ReadOutcome::Compacted(index) if index <= LogIndex(10)));

        reader.seek(LogIndex(11), 42);
        assert!(matches!(reader.read(LogIndex(10)).unwrap(), ReadOutcome::CaughtUp));
    }
}
