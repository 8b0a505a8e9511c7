//! In-memory log storage

use super::LogStorage;
use crate::types::{Entry, LogIndex, Snapshot, Term};
use crate::{RaftError, Result};

/// Log kept in memory; lost on restart
///
/// Also used as the read cache of [`super::FileLogStorage`].
pub struct MemoryLogStorage {
    /// Index of `entries[0]`, or the next index to append when empty
    start: LogIndex,
    /// Term of the entry at `start - 1`
    compacted_term: Term,
    entries: Vec<Entry>,
    snapshot: Option<Snapshot>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self {
            start: LogIndex(1),
            compacted_term: Term(0),
            entries: vec![],
            snapshot: None,
        }
    }

    pub(crate) fn with_start(start: LogIndex, compacted_term: Term) -> Self {
        Self {
            start,
            compacted_term,
            ..Self::new()
        }
    }

    pub(crate) fn compacted_term(&self) -> Term {
        self.compacted_term
    }

    /// Offset of `index` in `entries`
    fn to_array_index(&self, index: LogIndex) -> Option<usize> {
        if index < self.start {
            return None;
        }
        let idx = (index.0 - self.start.0) as usize;
        (idx < self.entries.len()).then_some(idx)
    }

    /// Verify that `entries` continue this log without gaps
    pub(crate) fn check_contiguous(&self, entries: &[Entry]) -> Result<()> {
        let mut expected = self.last_index().next();
        for entry in entries {
            if entry.index != expected {
                return Err(RaftError::LogIntegrity(format!(
                    "expected entry {} but got {}",
                    expected, entry.index
                )));
            }
            expected.increment();
        }
        Ok(())
    }
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        self.check_contiguous(&entries)?;
        self.entries.extend(entries);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        Ok(self
            .to_array_index(index)
            .and_then(|idx| self.entries.get(idx).cloned()))
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        if start < self.start {
            return Err(RaftError::LogIndexOutOfRange(start));
        }
        let start_idx = ((start.0 - self.start.0) as usize).min(self.entries.len());
        let end_idx = (end.0.saturating_sub(self.start.0) as usize)
            .min(self.entries.len())
            .max(start_idx);

        Ok(self.entries[start_idx..end_idx].to_vec())
    }

    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.get_range(start, self.last_index().next())
    }

    fn delete_from(&mut self, index: LogIndex) -> Result<()> {
        if index < self.start {
            return Err(RaftError::LogIntegrity(format!(
                "cannot truncate at {}, entries before {} are compacted",
                index, self.start
            )));
        }
        if let Some(idx) = self.to_array_index(index) {
            self.entries.truncate(idx);
        }
        Ok(())
    }

    fn first_index(&self) -> LogIndex {
        self.start
    }

    fn last_index(&self) -> LogIndex {
        self.start + self.entries.len() as u64 - 1
    }

    fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.compacted_term)
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == LogIndex::ZERO {
            return Ok(Some(Term(0)));
        }
        if index == self.start.prev() {
            return Ok(Some(self.compacted_term));
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.metadata.last_included_index {
                return Ok(Some(snapshot.metadata.last_included_term));
            }
        }

        Ok(self.get(index)?.map(|e| e.term))
    }

    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn get_snapshot(&self) -> Option<Snapshot> {
        self.snapshot.clone()
    }

    fn compact(&mut self, through_index: LogIndex) -> Result<()> {
        let through = through_index.min(self.last_index());
        if let Some(idx) = self.to_array_index(through) {
            self.compacted_term = self.entries[idx].term;
            self.entries.drain(0..=idx);
            self.start = through.next();
        }
        Ok(())
    }

    fn reset(&mut self, snapshot: Snapshot) -> Result<()> {
        self.entries.clear();
        self.start = snapshot.metadata.last_included_index.next();
        self.compacted_term = snapshot.metadata.last_included_term;
        self.snapshot = Some(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Configuration, Member};
    use crate::types::{NodeId, SnapshotMetadata};

    fn three_entries() -> Vec<Entry> {
        vec![
            Entry::application(Term(1), LogIndex(1), b"cmd1".to_vec()),
            Entry::application(Term(1), LogIndex(2), b"cmd2".to_vec()),
            Entry::application(Term(2), LogIndex(3), b"cmd3".to_vec()),
        ]
    }

    fn snapshot_at(index: u64, term: u64) -> Snapshot {
        Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(index),
                last_included_term: Term(term),
                configuration: Configuration::bootstrap(vec![Member::active(NodeId(1))]),
            },
            data: b"snapshot_data".to_vec().into(),
        }
    }

    #[test]
    fn test_append_and_get() {
        let mut log = MemoryLogStorage::new();
        log.append(three_entries()).unwrap();

        assert_eq!(log.last_index(), LogIndex(3));
        assert_eq!(log.last_term(), Term(2));

        let entry = log.get(LogIndex(2)).unwrap().unwrap();
        assert_eq!(entry, Entry::application(Term(1), LogIndex(2), b"cmd2".to_vec()));
    }

    #[test]
    fn test_append_rejects_gap() {
        let mut log = MemoryLogStorage::new();
        log.append(three_entries()).unwrap();

        let gap = vec![Entry::application(Term(2), LogIndex(5), b"cmd5".to_vec())];
        assert!(matches!(log.append(gap), Err(RaftError::LogIntegrity(_))));
        assert_eq!(log.last_index(), LogIndex(3));
    }

    #[test]
    fn test_delete_from() {
        let mut log = MemoryLogStorage::new();
        log.append(three_entries()).unwrap();
        log.delete_from(LogIndex(2)).unwrap();

        assert_eq!(log.last_index(), LogIndex(1));
        assert!(log.get(LogIndex(2)).unwrap().is_none());
    }

    #[test]
    fn test_get_range() {
        let mut log = MemoryLogStorage::new();
        log.append(three_entries()).unwrap();

        let range = log.get_range(LogIndex(1), LogIndex(3)).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].index, LogIndex(1));
        assert_eq!(range[1].index, LogIndex(2));

        assert!(log.get_range(LogIndex(9), LogIndex(12)).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_compaction() {
        let mut log = MemoryLogStorage::new();
        log.append(three_entries()).unwrap();

        log.set_snapshot(snapshot_at(2, 1)).unwrap();
        log.compact(LogIndex(2)).unwrap();

        assert_eq!(log.first_index(), LogIndex(3));
        assert_eq!(log.last_index(), LogIndex(3));
        assert!(log.get(LogIndex(1)).unwrap().is_none());
        assert_eq!(log.get_term(LogIndex(2)).unwrap(), Some(Term(1)));
        assert!(matches!(
            log.get_range(LogIndex(1), LogIndex(3)),
            Err(RaftError::LogIndexOutOfRange(_))
        ));
    }

    #[test]
    fn test_reset_to_snapshot() {
        let mut log = MemoryLogStorage::new();
        log.append(three_entries()).unwrap();

        log.reset(snapshot_at(10, 4)).unwrap();
        assert_eq!(log.first_index(), LogIndex(11));
        assert_eq!(log.last_index(), LogIndex(10));
        assert_eq!(log.last_term(), Term(4));

        log.append(vec![Entry::application(Term(4), LogIndex(11), b"next".to_vec())])
            .unwrap();
        assert_eq!(log.last_index(), LogIndex(11));
    }
}
