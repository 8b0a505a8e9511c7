//! Identifiers, entries and snapshots of the replicated log

use crate::membership::Configuration;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a member of a replication group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Election term number
///
/// Election epoch; at most one leader exists per term
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Term(pub u64);

impl Term {
    pub fn increment(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

/// Position of an entry in the log, starting at 1
///
/// Indexes start at 1; `LogIndex::ZERO` denotes "before the first entry".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn increment(&mut self) {
        self.0 += 1;
    }

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    /// The preceding index, saturating at zero
    pub fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogIndex({})", self.0)
    }
}

impl std::ops::Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for LogIndex {
    type Output = LogIndex;

    fn sub(self, rhs: u64) -> Self::Output {
        LogIndex(self.0.saturating_sub(rhs))
    }
}

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by every new leader at the start of its term
    Noop,

    /// A membership change; takes effect as soon as it is appended
    Configuration(Configuration),

    /// Opaque application data proposed by a client
    Application(Bytes),
}

/// One replicated entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Term of the leader that appended it
    pub term: Term,

    pub index: LogIndex,

    /// The entry's content
    pub payload: EntryPayload,
}

impl Entry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    pub fn application(term: Term, index: LogIndex, data: impl Into<Bytes>) -> Self {
        Self::new(term, index, EntryPayload::Application(data.into()))
    }

    /// Approximate encoded size, used to bound append batches
    pub fn size_hint(&self) -> usize {
        let payload = match &self.payload {
            EntryPayload::Noop => 0,
            EntryPayload::Configuration(config) => 64 * config.member_count(),
            EntryPayload::Application(data) => data.len(),
        };
        payload + 24
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        match &self.payload {
            EntryPayload::Configuration(config) => Some(config),
            _ => None,
        }
    }
}

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Last entry the snapshot replaces
    pub last_included_index: LogIndex,

    pub last_included_term: Term,

    /// Membership as of `last_included_index`
    pub configuration: Configuration,
}

/// A complete snapshot of the replicated state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_increment() {
        let mut term = Term(5);
        term.increment();
        assert_eq!(term, Term(6));
    }

    #[test]
    fn test_log_index_ops() {
        let idx = LogIndex(10);
        assert_eq!(idx + 5, LogIndex(15));
        assert_eq!(idx - 3, LogIndex(7));
        assert_eq!(LogIndex(2) - 5, LogIndex::ZERO);
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
        assert_eq!(idx.next(), LogIndex(11));
    }

    #[test]
    fn test_log_index_ordering() {
        assert!(LogIndex(1) < LogIndex(2));
        assert!(LogIndex(100) > LogIndex(50));
    }

    #[test]
    fn test_entry_size_hint_tracks_payload() {
        let small = Entry::application(Term(1), LogIndex(1), vec![0u8; 10]);
        let large = Entry::application(Term(1), LogIndex(2), vec![0u8; 1000]);
        assert!(large.size_hint() > small.size_hint());
        assert!(Entry::new(Term(1), LogIndex(3), EntryPayload::Noop).configuration().is_none());
    }
}
