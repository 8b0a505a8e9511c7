//! Leader duties: proposals, replication, commitment and reconfiguration

use super::{RaftEvent, RaftNodeInner};
use crate::membership::{Configuration, Member, SnapshotTransfer};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
use crate::state::RaftRole;
use crate::types::{Entry, EntryPayload, LogIndex, NodeId, Snapshot, SnapshotMetadata, Term};
use crate::{RaftError, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Failures logged individually before switching to sampled logging
const LOGGED_FAILURES: u32 = 3;
const FAILURE_LOG_INTERVAL: u32 = 100;

enum ReconfigurationStage {
    /// Waiting for the joint configuration at this index to commit
    Joint(LogIndex),
    /// Waiting for the final configuration at this index to commit
    Final(LogIndex),
}

struct Reconfiguration {
    members: Vec<Member>,
    stage: ReconfigurationStage,
    /// Absent when a new leader finishes a change started by its predecessor
    response: Option<oneshot::Sender<Result<Configuration>>>,
}

/// Bookkeeping that only exists while this node leads
pub(super) struct LeaderState {
    /// Index of the entry appended on election
    initial_index: LogIndex,
    pub(super) ready: bool,
    since: Instant,
    pending: BTreeMap<LogIndex, oneshot::Sender<Result<LogIndex>>>,
    reconfiguration: Option<Reconfiguration>,
}

impl LeaderState {
    fn new(initial_index: LogIndex) -> Self {
        Self {
            initial_index,
            ready: false,
            since: Instant::now(),
            pending: BTreeMap::new(),
            reconfiguration: None,
        }
    }

    /// Fail every waiting caller after losing leadership
    pub(super) fn fail_all(self, reason: impl Fn() -> RaftError) {
        for (_, response) in self.pending {
            let _ = response.send(Err(reason()));
        }
        if let Some(Reconfiguration {
            response: Some(response),
            ..
        }) = self.reconfiguration
        {
            let _ = response.send(Err(reason()));
        }
    }
}

impl RaftNodeInner {
    /// Transition to leader after winning an election
    pub(super) fn become_leader(&mut self) -> Result<()> {
        self.state.become_leader();
        let term = self.state.current_term();
        info!("Node {} became leader for term {}", self.state.id, term);

        self.cluster.reset_progress(self.log.last_index().next());
        let initial_index = self.append_local(EntryPayload::Noop)?;
        let mut leader = LeaderState::new(initial_index);

        // Finish a membership change the previous leader left in joint consensus
        if self.cluster.in_joint_consensus() {
            let members = self.cluster.configuration().new_members.clone();
            let index = self.append_configuration(Configuration {
                index: LogIndex::ZERO,
                term,
                time: chrono::Utc::now().timestamp_millis(),
                new_members: members.clone(),
                old_members: Vec::new(),
            })?;
            leader.reconfiguration = Some(Reconfiguration {
                members,
                stage: ReconfigurationStage::Final(index),
                response: None,
            });
        }

        self.leader = Some(leader);
        self.publish_status();
        self.replicate_all()?;
        self.commit_entries()
    }

    pub(super) fn handle_propose(
        &mut self,
        data: Bytes,
        response: oneshot::Sender<Result<LogIndex>>,
    ) -> Result<()> {
        let Some(leader) = self.leader.as_ref() else {
            let _ = response.send(Err(RaftError::NotLeader(self.state.leader_id)));
            return Ok(());
        };
        if leader.pending.len() >= self.config.max_inflight_proposals {
            let _ = response.send(Err(RaftError::Backpressure));
            return Ok(());
        }

        let index = self.append_local(EntryPayload::Application(data))?;
        if let Some(leader) = self.leader.as_mut() {
            leader.pending.insert(index, response);
            self.metrics.pending_proposals.set(leader.pending.len() as i64);
        }

        self.replicate_all()?;
        self.commit_entries()
    }

    pub(super) fn handle_reconfigure(
        &mut self,
        members: Vec<Member>,
        response: oneshot::Sender<Result<Configuration>>,
    ) -> Result<()> {
        let rejection = match self.leader.as_ref() {
            None => Some(RaftError::NotLeader(self.state.leader_id)),
            Some(leader) if !leader.ready => Some(RaftError::Configuration(
                "leader has not committed an entry in its term yet".into(),
            )),
            Some(leader)
                if leader.reconfiguration.is_some() || self.cluster.in_joint_consensus() =>
            {
                Some(RaftError::Configuration(
                    "another configuration change is in progress".into(),
                ))
            }
            Some(_) if !members.iter().any(|m| m.member_type.is_voting()) => Some(
                RaftError::Configuration("a configuration needs an active member".into()),
            ),
            Some(_) => None,
        };
        if let Some(err) = rejection {
            let _ = response.send(Err(err));
            return Ok(());
        }

        let current = self.cluster.configuration().clone();
        if current.has_same_members(&members) {
            let _ = response.send(Ok(current));
            return Ok(());
        }

        info!(
            "Node {} entering joint consensus: {:?} -> {:?}",
            self.state.id,
            current.member_ids(),
            members.iter().map(|m| m.id).collect::<Vec<_>>()
        );
        let index = self.append_configuration(Configuration {
            index: LogIndex::ZERO,
            term: self.state.current_term(),
            time: chrono::Utc::now().timestamp_millis(),
            new_members: members.clone(),
            old_members: current.new_members,
        })?;
        if let Some(leader) = self.leader.as_mut() {
            leader.reconfiguration = Some(Reconfiguration {
                members,
                stage: ReconfigurationStage::Joint(index),
                response: Some(response),
            });
        }

        self.replicate_all()?;
        self.commit_entries()
    }

    /// Record a snapshot of the state machine and compact the log behind it
    pub(super) fn register_snapshot(&mut self, index: LogIndex, data: Bytes) -> Result<()> {
        if index > self.state.volatile.commit_index {
            return Err(RaftError::LogIndexOutOfRange(index));
        }
        if let Some(existing) = self.log.get_snapshot() {
            if existing.metadata.last_included_index >= index {
                return Ok(());
            }
        }

        let term = self
            .log
            .get_term(index)?
            .ok_or(RaftError::LogIndexOutOfRange(index))?;
        let configuration = if self.cluster.configuration().index <= index {
            self.cluster.configuration().clone()
        } else {
            self.log
                .last_configuration_before(index.next())?
                .unwrap_or_else(|| self.bootstrap_configuration.clone())
        };

        self.log.set_snapshot(Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: index,
                last_included_term: term,
                configuration,
            },
            data,
        })?;

        let compact_through = index - self.config.snapshot_trailing_logs;
        if compact_through >= self.log.first_index() {
            self.log.compact(compact_through)?;
        }
        debug!(
            "Node {} registered snapshot at {}, log now starts at {}",
            self.state.id,
            index,
            self.log.first_index()
        );
        Ok(())
    }

    /// Heartbeat tick: check quorum liveness and replicate to idle members
    pub(super) fn on_heartbeat(&mut self) -> Result<()> {
        let Some(leader) = self.leader.as_ref() else {
            return Ok(());
        };

        if !self.cluster.is_single_member_cluster() {
            let now = Instant::now();
            let since = leader.since;
            let oldest = self.cluster.quorum_for(now, |member| {
                member.last_response.unwrap_or(since).max(since)
            });
            if let Some(oldest) = oldest {
                if now.duration_since(oldest) > self.config.quorum_response_timeout {
                    warn!(
                        "Node {} has not heard from a quorum for {:?}, stepping down",
                        self.state.id,
                        now.duration_since(oldest)
                    );
                    return self.step_down(self.state.current_term(), None);
                }
            }
        }

        self.replicate_all()
    }

    fn append_local(&mut self, payload: EntryPayload) -> Result<LogIndex> {
        let index = self.log.last_index().next();
        self.log
            .append(vec![Entry::new(self.state.current_term(), index, payload)])?;
        Ok(index)
    }

    /// Append a configuration entry and put it into effect
    fn append_configuration(&mut self, mut configuration: Configuration) -> Result<LogIndex> {
        configuration.index = self.log.last_index().next();
        configuration.term = self.state.current_term();
        let index = self.append_local(EntryPayload::Configuration(configuration.clone()))?;
        self.apply_configuration(configuration)?;
        Ok(index)
    }

    fn replicate_all(&mut self) -> Result<()> {
        for id in self.cluster.replication_targets() {
            if self.state.role != RaftRole::Leader {
                break;
            }
            self.replicate_to(id)?;
        }
        Ok(())
    }

    /// Send the next AppendEntries or snapshot chunk to `id` if it is idle
    fn replicate_to(&mut self, id: NodeId) -> Result<()> {
        let Some(member) = self.cluster.member(id) else {
            return Ok(());
        };
        if !member.is_available(Instant::now()) {
            return Ok(());
        }
        let next_index = member.next_index;

        if let Some(snapshot) = self.log.get_snapshot() {
            let snapshot_index = snapshot.metadata.last_included_index;
            let lag = snapshot_index.0.saturating_sub(next_index.0);
            if next_index < self.log.first_index()
                || lag > self.config.snapshot_replication_threshold
            {
                return self.send_snapshot_chunk(id, snapshot);
            }
        }

        let prev_log_index = next_index.prev();
        let prev_log_term = match self.log.get_term(prev_log_index)? {
            Some(term) => term,
            None => match self.log.get_snapshot() {
                Some(snapshot) => return self.send_snapshot_chunk(id, snapshot),
                None => {
                    return Err(RaftError::LogIntegrity(format!(
                        "no entry or snapshot covers {}",
                        prev_log_index
                    )))
                }
            },
        };

        let term = self.state.current_term();
        let request = AppendEntriesRequest {
            term,
            leader_id: self.state.id,
            prev_log_index,
            prev_log_term,
            entries: self.collect_entries(next_index)?,
            leader_commit: self.state.volatile.commit_index,
        };
        let last_sent = request.last_index();

        if let Some(member) = self.cluster.member_mut(id) {
            member.in_flight = true;
        }
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport.append_entries(id, request).await;
            let _ = events.send(RaftEvent::AppendResult {
                term,
                to: id,
                last_sent,
                result,
            });
        });
        Ok(())
    }

    /// Entries from `start`, bounded by count and size but never empty when
    /// entries exist
    fn collect_entries(&self, start: LogIndex) -> Result<Vec<Entry>> {
        let end = (start + self.config.max_append_entries as u64).min(self.log.last_index().next());
        if start >= end {
            return Ok(Vec::new());
        }
        let mut bytes = 0;
        let mut entries = Vec::new();
        for entry in self.log.get_range(start, end)? {
            bytes += entry.size_hint();
            if !entries.is_empty() && bytes > self.config.max_append_bytes {
                break;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn send_snapshot_chunk(&mut self, id: NodeId, snapshot: Snapshot) -> Result<()> {
        let Some(member) = self.cluster.member_mut(id) else {
            return Ok(());
        };
        let index = snapshot.metadata.last_included_index;
        let offset = match member.snapshot_transfer {
            Some(transfer) if transfer.index == index => transfer.offset,
            _ => 0,
        };
        member.snapshot_transfer = Some(SnapshotTransfer { index, offset });
        member.in_flight = true;

        let start = (offset as usize).min(snapshot.data.len());
        let end = (start + self.config.snapshot_chunk_size).min(snapshot.data.len());
        let done = end == snapshot.data.len();
        if offset == 0 {
            info!(
                "Node {} sending snapshot at {} to {} ({} bytes)",
                self.state.id,
                index,
                id,
                snapshot.data.len()
            );
        }

        let term = self.state.current_term();
        let request = InstallSnapshotRequest {
            term,
            leader_id: self.state.id,
            last_included_index: index,
            last_included_term: snapshot.metadata.last_included_term,
            configuration: snapshot.metadata.configuration,
            offset,
            data: snapshot.data.slice(start..end),
            done,
        };

        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport.install_snapshot(id, request).await;
            let _ = events.send(RaftEvent::SnapshotResult {
                term,
                to: id,
                index,
                next_offset: end as u64,
                done,
                result,
            });
        });
        Ok(())
    }

    pub(super) fn handle_append_result(
        &mut self,
        term: Term,
        to: NodeId,
        last_sent: LogIndex,
        result: Result<AppendEntriesResponse>,
    ) -> Result<()> {
        if self.leader.is_none() || term != self.state.current_term() {
            return Ok(());
        }
        let now = Instant::now();
        let Some(member) = self.cluster.member_mut(to) else {
            return Ok(());
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let backoff = self.config.retry_backoff(member.failure_count + 1);
                member.record_failure(now, backoff);
                let failures = member.failure_count;
                self.metrics
                    .replication_failures_total
                    .with_label_values(&[&to.0.to_string()])
                    .inc();
                if failures <= LOGGED_FAILURES || failures % FAILURE_LOG_INTERVAL == 0 {
                    warn!(
                        "Node {} failed to replicate to {} ({} consecutive failures): {}",
                        self.state.id, to, failures, e
                    );
                }
                return Ok(());
            }
        };

        member.record_response(now);
        if response.term > term {
            return self.step_down(response.term, None);
        }

        if response.success {
            if last_sent > member.match_index {
                member.match_index = last_sent;
            }
            member.next_index = member.next_index.max(last_sent.next());
            self.commit_entries()?;
        } else {
            // Back up using the follower's hint, at least one entry at a time
            let hinted = response.match_index.next();
            let stepped = member.next_index.prev().max(LogIndex(1));
            member.next_index = hinted.min(stepped).max(member.match_index.next());
            debug!(
                "Node {} backing up {} to {}",
                self.state.id, to, member.next_index
            );
        }

        if self.state.role == RaftRole::Leader {
            let behind = self
                .cluster
                .member(to)
                .map_or(false, |m| m.next_index <= self.log.last_index());
            if behind {
                self.replicate_to(to)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_snapshot_result(
        &mut self,
        term: Term,
        to: NodeId,
        index: LogIndex,
        next_offset: u64,
        done: bool,
        result: Result<InstallSnapshotResponse>,
    ) -> Result<()> {
        if self.leader.is_none() || term != self.state.current_term() {
            return Ok(());
        }
        let now = Instant::now();
        let Some(member) = self.cluster.member_mut(to) else {
            return Ok(());
        };

        match result {
            Err(e) => {
                let backoff = self.config.retry_backoff(member.failure_count + 1);
                member.record_failure(now, backoff);
                member.snapshot_transfer = None;
                self.metrics
                    .replication_failures_total
                    .with_label_values(&[&to.0.to_string()])
                    .inc();
                warn!(
                    "Node {} failed to send snapshot chunk to {}: {}",
                    self.state.id, to, e
                );
                return Ok(());
            }
            Ok(response) => {
                member.record_response(now);
                if response.term > term {
                    return self.step_down(response.term, None);
                }
                if !response.success {
                    member.snapshot_transfer = None;
                } else if done {
                    member.snapshot_transfer = None;
                    member.match_index = member.match_index.max(index);
                    member.next_index = member.next_index.max(index.next());
                    self.metrics.snapshots_sent_total.inc();
                    info!(
                        "Node {} finished sending snapshot at {} to {}",
                        self.state.id, index, to
                    );
                    self.commit_entries()?;
                } else {
                    member.snapshot_transfer = Some(SnapshotTransfer {
                        index,
                        offset: next_offset,
                    });
                }
            }
        }

        if self.state.role == RaftRole::Leader {
            self.replicate_to(to)?;
        }
        Ok(())
    }

    /// Advance the commit index to what a quorum has replicated
    fn commit_entries(&mut self) -> Result<()> {
        let Some(initial_index) = self.leader.as_ref().map(|l| l.initial_index) else {
            return Ok(());
        };
        let last_index = self.log.last_index();
        let Some(quorum_index) = self.cluster.quorum_for(last_index, |m| m.match_index) else {
            return Ok(());
        };
        // Only entries of the current term are committed by counting replicas
        if quorum_index < initial_index || quorum_index <= self.state.volatile.commit_index {
            return Ok(());
        }

        self.advance_commit(quorum_index);

        let mut became_ready = false;
        if let Some(leader) = self.leader.as_mut() {
            let still_pending = leader.pending.split_off(&quorum_index.next());
            let committed = std::mem::replace(&mut leader.pending, still_pending);
            for (index, response) in committed {
                let _ = response.send(Ok(index));
            }
            self.metrics.pending_proposals.set(leader.pending.len() as i64);

            if !leader.ready {
                leader.ready = true;
                became_ready = true;
            }
        }
        if became_ready {
            info!("Node {} is ready to lead at {}", self.state.id, quorum_index);
            self.publish_status();
        }

        self.advance_reconfiguration(quorum_index)
    }

    fn advance_reconfiguration(&mut self, commit_index: LogIndex) -> Result<()> {
        let Some(stage) = self
            .leader
            .as_ref()
            .and_then(|l| l.reconfiguration.as_ref())
            .map(|r| match r.stage {
                ReconfigurationStage::Joint(index) => (true, index),
                ReconfigurationStage::Final(index) => (false, index),
            })
        else {
            return Ok(());
        };

        match stage {
            (true, index) if commit_index >= index => {
                let members = self
                    .leader
                    .as_ref()
                    .and_then(|l| l.reconfiguration.as_ref())
                    .map(|r| r.members.clone())
                    .unwrap_or_default();
                info!("Node {} leaving joint consensus", self.state.id);
                let final_index = self.append_configuration(Configuration {
                    index: LogIndex::ZERO,
                    term: self.state.current_term(),
                    time: chrono::Utc::now().timestamp_millis(),
                    new_members: members,
                    old_members: Vec::new(),
                })?;
                if let Some(reconfiguration) =
                    self.leader.as_mut().and_then(|l| l.reconfiguration.as_mut())
                {
                    reconfiguration.stage = ReconfigurationStage::Final(final_index);
                }
                self.replicate_all()?;
                self.commit_entries()
            }
            (false, index) if commit_index >= index => {
                let reconfiguration = self
                    .leader
                    .as_mut()
                    .and_then(|l| l.reconfiguration.take());
                let configuration = self.cluster.configuration().clone();
                info!(
                    "Node {} committed configuration {:?} at {}",
                    self.state.id,
                    configuration.member_ids(),
                    index
                );
                if let Some(Reconfiguration {
                    response: Some(response),
                    ..
                }) = reconfiguration
                {
                    let _ = response.send(Ok(configuration));
                }

                if !self.cluster.is_voting_member(self.state.id) {
                    info!(
                        "Node {} is no longer a voting member, stepping down",
                        self.state.id
                    );
                    return self.step_down(self.state.current_term(), None);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
