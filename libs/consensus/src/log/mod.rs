//! The replicated log
//!
//! Entries are contiguous and immutable once appended, and a snapshot may
//! replace a prefix. A gap or a reordered append is reported as
//! [`RaftError::LogIntegrity`] and never silently repaired.

mod file;
mod memory;

pub use file::FileLogStorage;
pub use memory::MemoryLogStorage;

use crate::membership::Configuration;
use crate::types::{Entry, LogIndex, Snapshot, Term};
use crate::{RaftError, Result};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

/// Backend holding the entries of one log
///
/// Implementations must ensure durability (fsync on write) when they claim
/// to be persistent.
pub trait LogStorage: Send + Sync {
    /// Append entries to the log; they must continue the last index
    fn append(&mut self, entries: Vec<Entry>) -> Result<()>;

    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Entries in `[start, end)`
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>>;

    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>>;

    /// Drop the suffix starting at `index`
    fn delete_from(&mut self, index: LogIndex) -> Result<()>;

    /// Index of the first entry still held, or `last_index + 1` when empty
    fn first_index(&self) -> LogIndex;

    /// Index of the last entry, or of the snapshot if the log is empty
    fn last_index(&self) -> LogIndex;

    fn last_term(&self) -> Term;

    /// Term at `index`, including the snapshot's last entry
    fn get_term(&self, index: LogIndex) -> Result<Option<Term>>;

    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()>;

    fn get_snapshot(&self) -> Option<Snapshot>;

    /// Compact the log by removing entries up to and including `through_index`
    fn compact(&mut self, through_index: LogIndex) -> Result<()>;

    /// Drop every entry and continue right after the given snapshot
    fn reset(&mut self, snapshot: Snapshot) -> Result<()>;
}

/// Shared handle on a [`LogStorage`]
pub struct RaftLog {
    storage: Arc<RwLock<Box<dyn LogStorage>>>,
}

impl RaftLog {
    pub fn new(storage: Box<dyn LogStorage>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn new_memory() -> Self {
        Self::new(Box::new(MemoryLogStorage::new()))
    }

    /// Open (or create) a durable log in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Box::new(FileLogStorage::open(dir)?)))
    }

    pub fn append(&self, entries: Vec<Entry>) -> Result<()> {
        self.storage.write().append(entries)
    }

    /// Append entries that must directly follow `prev`
    pub fn append_after(&self, prev: LogIndex, entries: Vec<Entry>) -> Result<()> {
        let mut storage = self.storage.write();
        let last = storage.last_index();
        if last != prev {
            return Err(RaftError::LogIntegrity(format!(
                "expected to append after {} but log ends at {}",
                prev, last
            )));
        }
        storage.append(entries)
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.storage.read().get(index)
    }

    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_range(start, end)
    }

    pub fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_from(start)
    }

    pub fn delete_from(&self, index: LogIndex) -> Result<()> {
        self.storage.write().delete_from(index)
    }

    pub fn first_index(&self) -> LogIndex {
        self.storage.read().first_index()
    }

    pub fn last_index(&self) -> LogIndex {
        self.storage.read().last_index()
    }

    pub fn last_term(&self) -> Term {
        self.storage.read().last_term()
    }

    pub fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        self.storage.read().get_term(index)
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.storage.write().set_snapshot(snapshot)
    }

    pub fn get_snapshot(&self) -> Option<Snapshot> {
        self.storage.read().get_snapshot()
    }

    pub fn compact(&self, through_index: LogIndex) -> Result<()> {
        self.storage.write().compact(through_index)
    }

    pub fn reset_to_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.storage.write().reset(snapshot)
    }

    /// The most recent configuration entry strictly before `index`
    ///
    /// Falls back to the configuration recorded in the snapshot when no
    /// configuration entry survives in the log.
    pub fn last_configuration_before(&self, index: LogIndex) -> Result<Option<Configuration>> {
        let storage = self.storage.read();
        let first = storage.first_index();
        let mut current = index.prev().min(storage.last_index());
        while current >= first && current > LogIndex::ZERO {
            if let Some(entry) = storage.get(current)? {
                if let Some(config) = entry.configuration() {
                    return Ok(Some(config.clone()));
                }
            }
            current = current.prev();
        }
        Ok(storage
            .get_snapshot()
            .filter(|s| s.metadata.last_included_index < index)
            .map(|s| s.metadata.configuration))
    }

    /// Lazily stream entries starting at `from`
    pub fn reader(&self, from: LogIndex) -> RaftLogReader {
        RaftLogReader {
            log: self.clone(),
            next: from,
            chunk_size: RaftLogReader::DEFAULT_CHUNK,
            buffer: VecDeque::new(),
        }
    }
}

impl Clone for RaftLog {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

/// Sequential reader over the log
///
/// Entries are fetched in chunks so that the storage lock is never held
/// while the caller works on an entry.
pub struct RaftLogReader {
    log: RaftLog,
    next: LogIndex,
    chunk_size: u64,
    buffer: VecDeque<Entry>,
}

impl RaftLogReader {
    const DEFAULT_CHUNK: u64 = 64;

    /// Index of the next entry this reader will return
    pub fn next_index(&self) -> LogIndex {
        self.buffer.front().map(|e| e.index).unwrap_or(self.next)
    }

    pub fn seek(&mut self, index: LogIndex) {
        self.buffer.clear();
        self.next = index;
    }

    /// Return the next entry if its index is at most `limit`
    pub fn next_entry(&mut self, limit: LogIndex) -> Result<Option<Entry>> {
        if self.buffer.is_empty() {
            if self.next > limit {
                return Ok(None);
            }
            let end = (self.next + self.chunk_size).min(limit.next());
            let entries = self.log.get_range(self.next, end)?;
            if let Some(first) = entries.first() {
                if first.index != self.next {
                    return Err(RaftError::LogIntegrity(format!(
                        "reader expected {} but storage returned {}",
                        self.next, first.index
                    )));
                }
            }
            self.next = self.next + entries.len() as u64;
            self.buffer.extend(entries);
        }

        match self.buffer.front() {
            Some(entry) if entry.index <= limit => Ok(self.buffer.pop_front()),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Member;
    use crate::types::{EntryPayload, NodeId};

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<Entry> {
        range
            .map(|i| Entry::application(Term(1), LogIndex(i), format!("cmd{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn test_append_after_rejects_wrong_predecessor() {
        let log = RaftLog::new_memory();
        log.append(entries(1..=3)).unwrap();

        let err = log
            .append_after(LogIndex(2), entries(4..=4))
            .unwrap_err();
        assert!(err.is_fatal());

        log.append_after(LogIndex(3), entries(4..=4)).unwrap();
        assert_eq!(log.last_index(), LogIndex(4));
    }

    #[test]
    fn test_reader_streams_up_to_limit() {
        let log = RaftLog::new_memory();
        log.append(entries(1..=200)).unwrap();

        let mut reader = log.reader(LogIndex(1));
        let mut seen = 0;
        while let Some(entry) = reader.next_entry(LogIndex(150)).unwrap() {
            seen += 1;
            assert_eq!(entry.index, LogIndex(seen));
        }
        assert_eq!(seen, 150);
        assert_eq!(reader.next_index(), LogIndex(151));

        // Raising the limit resumes where the reader stopped
        let entry = reader.next_entry(LogIndex(200)).unwrap().unwrap();
        assert_eq!(entry.index, LogIndex(151));
    }

    #[test]
    fn test_last_configuration_before() {
        let log = RaftLog::new_memory();
        let config = Configuration::bootstrap(vec![Member::active(NodeId(1))]);
        log.append(entries(1..=2)).unwrap();
        log.append(vec![Entry::new(
            Term(1),
            LogIndex(3),
            EntryPayload::Configuration(config.clone()),
        )])
        .unwrap();
        log.append(entries(4..=5)).unwrap();

        assert_eq!(log.last_configuration_before(LogIndex(6)).unwrap(), Some(config));
        assert_eq!(log.last_configuration_before(LogIndex(3)).unwrap(), None);
    }
}
