//! Core Raft node implementation
//!
//! A [`RaftNode`] is a cheap, cloneable handle. All state lives in a single
//! task (`RaftNodeInner::run`) that owns the log, the membership and the
//! persisted term/vote. Client requests and incoming RPCs arrive through a
//! bounded queue; outgoing RPCs run on spawned tasks whose completions are
//! posted back to the loop as [`RaftEvent`]s, so no handler ever blocks on
//! the network.

mod candidate;
mod follower;
mod leader;

use crate::config::RaftConfig;
use crate::log::RaftLog;
use crate::membership::{ClusterMembership, Configuration, Member};
use crate::meta::{MemoryMetaStore, MetaStore};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::state::{NodeState, PersistentState, RaftRole};
use crate::transport::RaftTransport;
use crate::types::{LogIndex, NodeId, SnapshotMetadata, Term};
use crate::{RaftError, Result};
use bytes::Bytes;
use flowline_metrics::RaftMetrics;
use follower::IncomingSnapshot;
use leader::LeaderState;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{error, info};

/// Liveness of the node's state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftHealth {
    Healthy,
    /// An unrecoverable error stopped the node
    Dead(String),
}

/// Observable state of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader: Option<NodeId>,
    /// Leader only: the entry appended on election has been committed
    pub ready: bool,
    pub health: RaftHealth,
}

impl RaftStatus {
    pub fn is_ready_leader(&self) -> bool {
        self.role == RaftRole::Leader && self.ready
    }
}

/// Requests sent to the Raft node
enum RaftCommand {
    /// Propose application data (only works on leader)
    Propose {
        data: Bytes,
        response: oneshot::Sender<Result<LogIndex>>,
    },

    /// Change the group membership (only works on leader)
    Reconfigure {
        members: Vec<Member>,
        response: oneshot::Sender<Result<Configuration>>,
    },

    GetConfiguration {
        response: oneshot::Sender<Configuration>,
    },

    /// Record a snapshot taken at `index` and compact the log behind it
    RegisterSnapshot {
        index: LogIndex,
        data: Bytes,
        response: oneshot::Sender<Result<()>>,
    },

    /// Handle RequestVote RPC
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },

    /// Handle AppendEntries RPC
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },

    /// Handle InstallSnapshot RPC
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },

    /// Shutdown the node
    Shutdown { response: oneshot::Sender<()> },
}

/// Completions of outgoing RPCs, posted back onto the node's loop
enum RaftEvent {
    VoteResult {
        term: Term,
        from: NodeId,
        result: Result<RequestVoteResponse>,
    },
    AppendResult {
        term: Term,
        to: NodeId,
        last_sent: LogIndex,
        result: Result<AppendEntriesResponse>,
    },
    SnapshotResult {
        term: Term,
        to: NodeId,
        index: LogIndex,
        next_offset: u64,
        done: bool,
        result: Result<InstallSnapshotResponse>,
    },
}

/// Handle to a running Raft node
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    command_tx: mpsc::Sender<RaftCommand>,
    status_rx: watch::Receiver<RaftStatus>,
    commit_rx: watch::Receiver<LogIndex>,
    snapshot_rx: watch::Receiver<Option<SnapshotMetadata>>,
    log: RaftLog,
}

impl RaftNode {
    pub fn builder(id: NodeId) -> RaftNodeBuilder {
        RaftNodeBuilder::new(id)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Propose application data to the group
    ///
    /// Resolves with the entry's index once it is committed. Fails with
    /// [`RaftError::NotLeader`] on followers and [`RaftError::Backpressure`]
    /// when too many proposals are outstanding.
    pub async fn propose(&self, data: Bytes) -> Result<LogIndex> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .try_send(RaftCommand::Propose { data, response: tx })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RaftError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => RaftError::ShuttingDown,
            })?;

        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Replace the membership through joint consensus
    ///
    /// Resolves once the final configuration is committed.
    pub async fn reconfigure(&self, members: Vec<Member>) -> Result<Configuration> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftCommand::Reconfigure {
            members,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Add a member, or change the type of an existing one
    pub async fn join(&self, member: Member) -> Result<Configuration> {
        let current = self.configuration().await?;
        let mut members: Vec<Member> = current
            .new_members
            .into_iter()
            .filter(|m| m.id != member.id)
            .collect();
        members.push(member);
        self.reconfigure(members).await
    }

    /// Remove a member from the group
    pub async fn leave(&self, id: NodeId) -> Result<Configuration> {
        let current = self.configuration().await?;
        let members = current
            .new_members
            .into_iter()
            .filter(|m| m.id != id)
            .collect();
        self.reconfigure(members).await
    }

    pub async fn configuration(&self) -> Result<Configuration> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftCommand::GetConfiguration { response: tx })
            .await?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Hand a snapshot of the replicated state to the log
    ///
    /// The snapshot becomes available for follower catch-up and entries up to
    /// `index - snapshot_trailing_logs` are compacted.
    pub async fn register_snapshot(&self, index: LogIndex, data: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftCommand::RegisterSnapshot {
            index,
            data,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Handle RequestVote RPC
    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftCommand::RequestVote {
            request,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Handle AppendEntries RPC
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftCommand::AppendEntries {
            request,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Handle InstallSnapshot RPC
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftCommand::InstallSnapshot {
            request,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub fn status(&self) -> RaftStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RaftStatus> {
        self.status_rx.clone()
    }

    pub fn commit_index(&self) -> LogIndex {
        *self.commit_rx.borrow()
    }

    pub fn subscribe_commits(&self) -> watch::Receiver<LogIndex> {
        self.commit_rx.clone()
    }

    /// Notified whenever a snapshot received from the leader was installed
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<SnapshotMetadata>> {
        self.snapshot_rx.clone()
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Shutdown the node gracefully
    ///
    /// Pending proposals fail with [`RaftError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::Shutdown { response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: RaftCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| RaftError::ShuttingDown)
    }
}

/// Builder for [`RaftNode`]
pub struct RaftNodeBuilder {
    id: NodeId,
    config: RaftConfig,
    members: Vec<Member>,
    log: Option<RaftLog>,
    meta: Option<Box<dyn MetaStore>>,
    transport: Option<Arc<dyn RaftTransport>>,
    metrics: Option<RaftMetrics>,
}

impl RaftNodeBuilder {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            config: RaftConfig::default(),
            members: Vec::new(),
            log: None,
            meta: None,
            transport: None,
            metrics: None,
        }
    }

    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    /// Members to bootstrap with when no configuration was persisted
    pub fn members(mut self, members: Vec<Member>) -> Self {
        self.members = members;
        self
    }

    pub fn log(mut self, log: RaftLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn meta_store(mut self, meta: impl MetaStore + 'static) -> Self {
        self.meta = Some(Box::new(meta));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RaftTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn metrics(mut self, metrics: RaftMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load persisted state and spawn the node's main loop
    pub async fn start(self) -> Result<RaftNode> {
        self.config.validate().map_err(RaftError::Configuration)?;
        let transport = self
            .transport
            .ok_or_else(|| RaftError::Configuration("a transport is required".into()))?;
        let log = self.log.unwrap_or_else(RaftLog::new_memory);
        let mut meta = self
            .meta
            .unwrap_or_else(|| Box::new(MemoryMetaStore::new()));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => RaftMetrics::standalone().map_err(|e| RaftError::Internal(e.to_string()))?,
        };

        let persisted = meta.load()?;
        let bootstrap = Configuration::bootstrap(self.members);
        let configuration = match persisted.configuration {
            Some(configuration) => configuration,
            None if !bootstrap.new_members.is_empty() => {
                meta.store_configuration(&bootstrap)?;
                bootstrap.clone()
            }
            None => {
                return Err(RaftError::Configuration(
                    "no persisted configuration and no initial members".into(),
                ))
            }
        };

        // Everything compacted or covered by a snapshot was committed
        let snapshot_index = log
            .get_snapshot()
            .map(|s| s.metadata.last_included_index)
            .unwrap_or(LogIndex::ZERO);
        let commit_index = snapshot_index.max(log.first_index().prev());

        let state = NodeState::new(
            self.id,
            PersistentState {
                current_term: persisted.term,
                voted_for: persisted.voted_for,
            },
        );
        let initial_status = RaftStatus {
            id: self.id,
            role: RaftRole::Bootstrapping,
            term: persisted.term,
            leader: None,
            ready: false,
            health: RaftHealth::Healthy,
        };

        let (command_tx, command_rx) = mpsc::channel(self.config.request_queue_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(initial_status);
        let (commit_tx, commit_rx) = watch::channel(commit_index);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);

        let mut inner = RaftNodeInner {
            state,
            cluster: ClusterMembership::new(self.id, configuration),
            bootstrap_configuration: bootstrap,
            config: self.config,
            log: log.clone(),
            meta,
            transport,
            events_tx,
            election_deadline: Instant::now(),
            leader: None,
            incoming_snapshot: None,
            health: RaftHealth::Healthy,
            halted: false,
            status_tx,
            commit_tx,
            snapshot_tx,
            metrics,
        };
        inner.state.volatile.commit_index = commit_index;
        inner.enter_resting_role(None);

        info!(
            "Node {} starting as {} in {} with log {}..={}",
            self.id,
            inner.state.role,
            inner.state.current_term(),
            log.first_index(),
            log.last_index()
        );

        tokio::spawn(inner.run(command_rx, events_rx));

        Ok(RaftNode {
            id: self.id,
            command_tx,
            status_rx,
            commit_rx,
            snapshot_rx,
            log,
        })
    }
}

/// State owned by the node's task
struct RaftNodeInner {
    state: NodeState,
    cluster: ClusterMembership,
    /// Fallback when truncation removes every configuration entry
    bootstrap_configuration: Configuration,
    config: RaftConfig,
    log: RaftLog,
    meta: Box<dyn MetaStore>,
    transport: Arc<dyn RaftTransport>,
    events_tx: mpsc::UnboundedSender<RaftEvent>,
    election_deadline: Instant,
    /// Present only while leading
    leader: Option<LeaderState>,
    /// Snapshot being received from the leader
    incoming_snapshot: Option<IncomingSnapshot>,
    health: RaftHealth,
    halted: bool,
    status_tx: watch::Sender<RaftStatus>,
    commit_tx: watch::Sender<LogIndex>,
    snapshot_tx: watch::Sender<Option<SnapshotMetadata>>,
    metrics: RaftMetrics,
}

impl RaftNodeInner {
    /// Main node event loop
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<RaftCommand>,
        mut events_rx: mpsc::UnboundedReceiver<RaftEvent>,
    ) {
        let mut heartbeat_timer = interval(self.config.heartbeat_interval);
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.halted {
            let deadline = tokio::time::Instant::from_std(self.election_deadline);
            let campaigning = self.state.role.can_campaign();

            let result = tokio::select! {
                command = command_rx.recv() => match command {
                    Some(RaftCommand::Shutdown { response }) => {
                        info!("Node {} shutting down", self.state.id);
                        self.abandon_leadership(|| RaftError::ShuttingDown);
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                Some(event) = events_rx.recv() => self.handle_event(event),

                // Check for election timeout
                _ = sleep_until(deadline), if campaigning => self.start_election(),

                // Send heartbeats if leader
                _ = heartbeat_timer.tick() => self.on_heartbeat(),
            };

            if let Err(err) = result {
                self.halt(err);
            }
        }
    }

    fn handle_command(&mut self, command: RaftCommand) -> Result<()> {
        match command {
            RaftCommand::Propose { data, response } => self.handle_propose(data, response),
            RaftCommand::Reconfigure { members, response } => {
                self.handle_reconfigure(members, response)
            }
            RaftCommand::GetConfiguration { response } => {
                let _ = response.send(self.cluster.configuration().clone());
                Ok(())
            }
            RaftCommand::RegisterSnapshot {
                index,
                data,
                response,
            } => {
                let result = self.register_snapshot(index, data);
                if let Err(err) = &result {
                    if err.is_fatal() {
                        return result;
                    }
                }
                let _ = response.send(result);
                Ok(())
            }
            RaftCommand::RequestVote { request, response } => {
                let reply = self.handle_request_vote(request)?;
                let _ = response.send(reply);
                Ok(())
            }
            RaftCommand::AppendEntries { request, response } => {
                let reply = self.handle_append_entries(request)?;
                let _ = response.send(reply);
                Ok(())
            }
            RaftCommand::InstallSnapshot { request, response } => {
                let reply = self.handle_install_snapshot(request)?;
                let _ = response.send(reply);
                Ok(())
            }
            // Handled by the loop itself
            RaftCommand::Shutdown { response } => {
                let _ = response.send(());
                Ok(())
            }
        }
    }

    fn handle_event(&mut self, event: RaftEvent) -> Result<()> {
        match event {
            RaftEvent::VoteResult { term, from, result } => {
                self.handle_vote_result(term, from, result)
            }
            RaftEvent::AppendResult {
                term,
                to,
                last_sent,
                result,
            } => self.handle_append_result(term, to, last_sent, result),
            RaftEvent::SnapshotResult {
                term,
                to,
                index,
                next_offset,
                done,
                result,
            } => self.handle_snapshot_result(term, to, index, next_offset, done, result),
        }
    }

    /// Persist the current term and vote
    fn persist_vote(&mut self) -> Result<()> {
        self.meta.store_vote(
            self.state.persistent.current_term,
            self.state.persistent.voted_for,
        )
    }

    /// Reset election timeout (called when hearing from a valid leader)
    fn reset_election_timeout(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    /// Take the non-leading role matching the local member type
    fn enter_resting_role(&mut self, leader: Option<NodeId>) {
        self.state
            .become_follower(self.cluster.local_member_type(), leader);
        if self.cluster.is_single_member_cluster() && leader.is_none() {
            // Nobody to wait for
            self.election_deadline = Instant::now();
        } else {
            self.reset_election_timeout();
        }
        self.publish_status();
    }

    /// Step down after observing `term`, persisting it if it is newer
    fn step_down(&mut self, term: Term, leader: Option<NodeId>) -> Result<()> {
        if self.state.observe_term(term) {
            self.persist_vote()?;
        }
        self.abandon_leadership(|| RaftError::NotLeader(leader));
        self.enter_resting_role(leader);
        Ok(())
    }

    /// Fail everything that was waiting on this node's leadership
    fn abandon_leadership(&mut self, reason: impl Fn() -> RaftError) {
        if let Some(leader_state) = self.leader.take() {
            info!(
                "Node {} stepping down as leader in {}",
                self.state.id,
                self.state.current_term()
            );
            leader_state.fail_all(reason);
            self.metrics.pending_proposals.set(0);
        }
    }

    /// Persist and apply a configuration seen in the log
    fn apply_configuration(&mut self, configuration: Configuration) -> Result<()> {
        self.meta.store_configuration(&configuration)?;
        let next_index = self.log.last_index().next();
        info!(
            "Node {} applying configuration from {} (joint: {})",
            self.state.id,
            configuration.index,
            configuration.requires_joint_consensus()
        );
        self.cluster.configure(configuration, next_index);

        let resting = RaftRole::for_member_type(self.cluster.local_member_type());
        let should_rest = match self.state.role {
            RaftRole::Leader => false,
            RaftRole::Candidate => resting != RaftRole::Follower,
            role => role != resting,
        };
        if should_rest {
            let leader = self.state.leader_id;
            self.enter_resting_role(leader);
        }
        Ok(())
    }

    fn advance_commit(&mut self, index: LogIndex) {
        if self.state.advance_commit(index) {
            self.commit_tx.send_replace(index);
            self.metrics.commit_index.set(index.0 as i64);
        }
    }

    fn publish_status(&self) {
        let status = RaftStatus {
            id: self.state.id,
            role: self.state.role,
            term: self.state.current_term(),
            leader: self.state.leader_id,
            ready: self.leader.as_ref().map_or(false, |l| l.ready),
            health: self.health.clone(),
        };
        self.metrics.role.set(role_code(status.role));
        self.metrics.term.set(status.term.0 as i64);
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    /// Stop the node after an unrecoverable error
    fn halt(&mut self, err: RaftError) {
        error!("Node {} halted: {}", self.state.id, err);
        self.abandon_leadership(|| RaftError::ShuttingDown);
        self.health = RaftHealth::Dead(err.to_string());
        self.state.become_follower(crate::membership::MemberType::Inactive, None);
        self.publish_status();
        self.halted = true;
    }
}

fn role_code(role: RaftRole) -> i64 {
    match role {
        RaftRole::Bootstrapping => 0,
        RaftRole::Follower => 1,
        RaftRole::Candidate => 2,
        RaftRole::Leader => 3,
        RaftRole::Passive => 4,
        RaftRole::Inactive => 5,
    }
}
