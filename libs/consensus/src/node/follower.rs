//! Handling of RPCs received from candidates and leaders

use super::RaftNodeInner;
use crate::membership::Configuration;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::state::RaftRole;
use crate::types::{LogIndex, NodeId, Snapshot, SnapshotMetadata, Term};
use crate::{RaftError, Result};
use bytes::BytesMut;
use tracing::{debug, info, warn};

/// A snapshot being assembled from InstallSnapshot chunks
pub(super) struct IncomingSnapshot {
    index: LogIndex,
    term: Term,
    configuration: Configuration,
    data: BytesMut,
}

impl RaftNodeInner {
    /// Handle RequestVote RPC
    pub(super) fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        if request.term > self.state.current_term() {
            self.step_down(request.term, None)?;
        }

        let term = self.state.current_term();
        let mut vote_granted = false;

        // Grant vote if:
        // 1. Candidate's term is current
        // 2. We haven't voted for anyone else this term
        // 3. Candidate's log is at least as up-to-date as ours
        // 4. We are allowed to vote at all
        if request.term == term && self.cluster.is_voting_member(self.state.id) {
            let can_vote = match self.state.persistent.voted_for {
                None => true,
                Some(id) => id == request.candidate_id,
            };
            let last_term = self.log.last_term();
            let last_index = self.log.last_index();
            let log_ok = request.last_log_term > last_term
                || (request.last_log_term == last_term && request.last_log_index >= last_index);

            if can_vote && log_ok {
                vote_granted = true;
                self.state.persistent.voted_for = Some(request.candidate_id);
                self.persist_vote()?;
                self.reset_election_timeout();
                debug!(
                    "Node {} granted vote to {} for {}",
                    self.state.id, request.candidate_id, term
                );
            }
        }

        Ok(RequestVoteResponse { term, vote_granted })
    }

    /// Handle AppendEntries RPC
    pub(super) fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if request.term < self.state.current_term() {
            return Ok(self.append_rejected(self.log.last_index()));
        }
        self.follow(request.term, request.leader_id)?;

        // Consistency check on the entry preceding the new ones
        let prev = request.prev_log_index;
        let last_index = self.log.last_index();
        if prev > last_index {
            return Ok(self.append_rejected(last_index));
        }
        if let Some(term) = self.log.get_term(prev)? {
            if term != request.prev_log_term {
                debug!(
                    "Node {} rejecting entries after {}: term {} != {}",
                    self.state.id, prev, term, request.prev_log_term
                );
                return Ok(self.append_rejected(prev.prev()));
            }
        }
        // A compacted predecessor was committed and therefore matches

        let last_new = request.last_index();
        let first_index = self.log.first_index();
        let mut to_append = Vec::new();
        for entry in request.entries {
            if entry.index < first_index {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.log.get_term(entry.index)? {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if entry.index <= self.state.volatile.commit_index {
                        return Err(RaftError::LogIntegrity(format!(
                            "leader {} conflicts with committed entry {}",
                            request.leader_id, entry.index
                        )));
                    }
                    self.truncate_from(entry.index)?;
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }

        if let Some(first) = to_append.first() {
            let prev = first.index.prev();
            let configuration = to_append
                .iter()
                .rev()
                .find_map(|entry| entry.configuration().cloned());
            self.log.append_after(prev, to_append)?;
            // Configurations take effect as soon as they are in the log
            if let Some(configuration) = configuration {
                self.apply_configuration(configuration)?;
            }
        }

        if request.leader_commit > self.state.volatile.commit_index {
            self.advance_commit(request.leader_commit.min(last_new));
        }

        Ok(AppendEntriesResponse {
            term: self.state.current_term(),
            success: true,
            match_index: last_new,
            commit_index: self.state.volatile.commit_index,
        })
    }

    /// Handle one InstallSnapshot chunk
    pub(super) fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if request.term < self.state.current_term() {
            return Ok(InstallSnapshotResponse {
                term: self.state.current_term(),
                success: false,
            });
        }
        self.follow(request.term, request.leader_id)?;
        let term = self.state.current_term();

        if request.offset == 0 {
            self.incoming_snapshot = Some(IncomingSnapshot {
                index: request.last_included_index,
                term: request.last_included_term,
                configuration: request.configuration,
                data: BytesMut::new(),
            });
        }

        let continues = self.incoming_snapshot.as_ref().map_or(false, |incoming| {
            incoming.index == request.last_included_index
                && incoming.data.len() as u64 == request.offset
        });
        if !continues {
            warn!(
                "Node {} dropping out-of-order snapshot chunk at offset {}",
                self.state.id, request.offset
            );
            self.incoming_snapshot = None;
            return Ok(InstallSnapshotResponse {
                term,
                success: false,
            });
        }

        if let Some(incoming) = self.incoming_snapshot.as_mut() {
            incoming.data.extend_from_slice(&request.data);
        }

        if request.done {
            if let Some(incoming) = self.incoming_snapshot.take() {
                self.install_snapshot(incoming)?;
            }
        }

        Ok(InstallSnapshotResponse {
            term,
            success: true,
        })
    }

    fn install_snapshot(&mut self, incoming: IncomingSnapshot) -> Result<()> {
        let metadata = SnapshotMetadata {
            last_included_index: incoming.index,
            last_included_term: incoming.term,
            configuration: incoming.configuration,
        };
        let snapshot = Snapshot {
            metadata: metadata.clone(),
            data: incoming.data.freeze(),
        };

        // Keep the entries following the snapshot if the log agrees with it
        let retains_suffix = incoming.index <= self.log.last_index()
            && self.log.get_term(incoming.index)? == Some(incoming.term);
        if retains_suffix {
            self.log.set_snapshot(snapshot)?;
            self.log.compact(incoming.index)?;
        } else {
            self.log.reset_to_snapshot(snapshot)?;
        }

        info!(
            "Node {} installed snapshot at {} ({})",
            self.state.id, metadata.last_included_index, metadata.last_included_term
        );

        if !retains_suffix || self.cluster.configuration().index <= metadata.configuration.index {
            self.apply_configuration(metadata.configuration.clone())?;
        }
        self.advance_commit(metadata.last_included_index);
        self.snapshot_tx.send_replace(Some(metadata));
        Ok(())
    }

    /// Accept `leader` as the leader of `term`
    fn follow(&mut self, term: Term, leader: NodeId) -> Result<()> {
        let current = self.state.current_term();
        if term > current || self.state.role == RaftRole::Candidate || self.leader.is_some() {
            self.step_down(term, Some(leader))?;
        } else if self.state.leader_id != Some(leader) {
            info!("Node {} following {} in {}", self.state.id, leader, term);
            self.state.leader_id = Some(leader);
            self.publish_status();
        }
        self.reset_election_timeout();
        Ok(())
    }

    /// Drop uncommitted entries from `index`, reverting their configurations
    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        warn!(
            "Node {} truncating uncommitted entries from {}",
            self.state.id, index
        );
        self.log.delete_from(index)?;

        if self.cluster.configuration().index >= index {
            let configuration = self
                .log
                .last_configuration_before(index)?
                .unwrap_or_else(|| self.bootstrap_configuration.clone());
            self.apply_configuration(configuration)?;
        }
        Ok(())
    }

    fn append_rejected(&self, hint: LogIndex) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.state.current_term(),
            success: false,
            match_index: hint,
            commit_index: self.state.volatile.commit_index,
        }
    }
}
