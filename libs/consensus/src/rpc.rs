//! Messages exchanged between the members of a replication group
//!
//! Every response carries the responder's term so that a stale leader or
//! candidate learns about the newer term and steps down.

use crate::membership::Configuration;
use crate::types::{Entry, LogIndex, NodeId, Term};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sent by a candidate to every voting member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    /// Position of the candidate's last entry; voters refuse candidates whose
    /// log is behind their own
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicates entries; without entries it only asserts leadership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Entry the follower must hold for `entries` to follow it
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Index of the last entry carried, or `prev_log_index` if empty
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.prev_log_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success the last index now matching the leader; otherwise where
    /// the follower suggests replication resumes
    pub match_index: LogIndex,
    pub commit_index: LogIndex,
}

/// One chunk of the leader's snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// The snapshot replaces every entry up to and including this index
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Membership as of `last_included_index`
    pub configuration: Configuration,
    /// Position of `data` within the snapshot
    pub offset: u64,
    pub data: Bytes,
    /// Set on the final chunk
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    /// False if the chunk did not continue the transfer in progress; the
    /// leader then restarts at offset 0
    pub success: bool,
}
