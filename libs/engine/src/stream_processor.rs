//! Replay and processing of a partition's record stream
//!
//! One processor task runs per partition replica. Followers replay: events
//! written by the leader are applied to the state. The leader processes:
//! every committed command is handed to its processor, and the resulting
//! records are written back through consensus before the state transaction
//! commits. Either way the state is a function of the committed log.

use crate::distribution::{CommandDistributionBehavior, InterPartitionSender};
use crate::error::{EngineError, ProcessingError, Result};
use crate::log_stream::{LogStream, LogStreamReader, ReadBatch, ReadOutcome};
use crate::partition::{CommandResponse, PartitionHealth, PendingResponses};
use crate::processing::{EventAppliers, ProcessingContext, RecordProcessors, SideEffect};
use crate::record::{LoggedRecord, Position, RecordBatch, RecordType, RejectionKind};
use crate::snapshot_controller::{SnapshotController, TakenSnapshot};
use crate::state::{self, DistributionState, ProcessingState};
use flowline_consensus::{LogIndex, RaftHealth, RaftNode};
use flowline_metrics::ProcessingMetrics;
use flowline_storage::{SnapshotMetadata, StateDb, Transaction};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Replay,
    Processing,
}

/// Applies the events of committed batches to a state
///
/// An event is applied only if the command it was produced for lies beyond
/// the last processed position; applying it marks that command processed.
pub struct Replayer {
    db: StateDb,
    appliers: EventAppliers,
    last_processed: Position,
}

impl Replayer {
    pub fn new(partition_id: u32, db: StateDb) -> Result<Self> {
        let last_processed = state::last_processed_position(&db)?;
        Ok(Self {
            db,
            appliers: EventAppliers::new(partition_id),
            last_processed,
        })
    }

    pub fn last_processed(&self) -> Position {
        self.last_processed
    }

    pub fn state(&self) -> ProcessingState {
        ProcessingState::new(self.db.clone())
    }

    /// Apply all events of a batch in one transaction
    pub fn replay_batch(&mut self, batch: &ReadBatch) -> Result<usize> {
        let floor = self.last_processed;
        let mut txn = self.db.transaction();
        let mut applied = 0;
        for record in &batch.records {
            if self.replay_record(&mut txn, record, floor)? {
                applied += 1;
            }
        }
        txn.commit();
        Ok(applied)
    }

    /// Apply one record of a batch that started after `floor`; returns
    /// whether it counted as replayed
    fn replay_record(
        &mut self,
        txn: &mut Transaction,
        record: &LoggedRecord,
        floor: Position,
    ) -> Result<bool> {
        if record.record.is_command() {
            return Ok(false);
        }
        let Some(source) = record.record.source_position else {
            return Ok(false);
        };
        if source <= floor {
            return Ok(false);
        }
        if record.record.record_type == RecordType::Event {
            self.appliers.apply(txn, &record.record)?;
        }
        state::mark_processed(txn, source)?;
        self.last_processed = self.last_processed.max(source);
        Ok(true)
    }

    fn set_last_processed(&mut self, position: Position) {
        self.last_processed = position;
    }
}

type SnapshotTask = JoinHandle<Result<TakenSnapshot>>;

/// A command read during replay whose results are not in the state yet
#[derive(Debug, Clone, Copy)]
struct Unprocessed {
    index: LogIndex,
    base_position: Position,
    position: Position,
}

pub(crate) struct StreamProcessor {
    partition_id: u32,
    partition_count: u32,
    node_id: u64,
    node: RaftNode,
    log_stream: LogStream,
    reader: LogStreamReader,
    db: StateDb,
    replayer: Replayer,
    processors: RecordProcessors,
    distribution: CommandDistributionBehavior,
    sender: Arc<dyn InterPartitionSender>,
    responses: PendingResponses,
    snapshots: SnapshotController,
    /// Snapshot being persisted and registered in the background
    snapshot_task: Option<SnapshotTask>,
    mode: ProcessingMode,
    unprocessed: VecDeque<Unprocessed>,
    /// Last batch read, as (index, position of its last record)
    last_read: (LogIndex, Position),
    snapshot_period: Duration,
    redistribution_interval: Duration,
    health_tx: watch::Sender<PartitionHealth>,
    snapshot_tx: watch::Sender<Option<SnapshotMetadata>>,
    metrics: ProcessingMetrics,
    cancel: CancellationToken,
}

pub(crate) struct StreamProcessorContext {
    pub partition_id: u32,
    pub partition_count: u32,
    pub node: RaftNode,
    pub log_stream: LogStream,
    pub db: StateDb,
    pub processors: RecordProcessors,
    pub sender: Arc<dyn InterPartitionSender>,
    pub responses: PendingResponses,
    pub snapshots: SnapshotController,
    pub snapshot_period: Duration,
    pub redistribution_interval: Duration,
    pub health_tx: watch::Sender<PartitionHealth>,
    pub snapshot_tx: watch::Sender<Option<SnapshotMetadata>>,
    pub metrics: ProcessingMetrics,
    pub cancel: CancellationToken,
}

impl StreamProcessor {
    /// Recover the state and position the reader behind it
    pub fn recover(ctx: StreamProcessorContext) -> Result<Self> {
        let StreamProcessorContext {
            partition_id,
            partition_count,
            node,
            log_stream,
            db,
            processors,
            sender,
            responses,
            mut snapshots,
            snapshot_period,
            redistribution_interval,
            health_tx,
            snapshot_tx,
            metrics,
            cancel,
        } = ctx;

        let snapshot = snapshots.recover(&db)?;
        let mut replayer = Replayer::new(partition_id, db.clone())?;
        replayer.set_last_processed(replayer.last_processed().max(snapshot.processed_position));
        let reader = log_stream.reader(
            LogIndex(snapshot.index).next(),
            snapshot.written_position + 1,
        );
        snapshot_tx.send_replace(snapshots.latest().cloned());
        metrics
            .last_processed_position
            .set(replayer.last_processed() as i64);

        Ok(Self {
            partition_id,
            partition_count,
            node_id: node.id().0,
            node,
            log_stream,
            reader,
            db,
            replayer,
            processors,
            distribution: CommandDistributionBehavior,
            sender,
            responses,
            snapshots,
            snapshot_task: None,
            mode: ProcessingMode::Replay,
            unprocessed: VecDeque::new(),
            last_read: (LogIndex(snapshot.index), snapshot.written_position),
            snapshot_period,
            redistribution_interval,
            health_tx,
            snapshot_tx,
            metrics,
            cancel,
        })
    }

    pub async fn run(mut self) {
        let mut commits = self.node.subscribe_commits();
        let mut status = self.node.subscribe_status();
        let mut installed = self.node.subscribe_snapshots();
        let mut snapshot_tick = interval_at(
            tokio::time::Instant::now() + self.snapshot_period,
            self.snapshot_period,
        );
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut redistribution_tick = interval_at(
            tokio::time::Instant::now() + self.redistribution_interval,
            self.redistribution_interval,
        );
        redistribution_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Partition {} stream processor started after position {}",
            self.partition_id,
            self.replayer.last_processed()
        );

        loop {
            if let Err(err) = self.catch_up().await {
                self.halt(err);
                break;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = commits.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let health = status.borrow_and_update().health.clone();
                    if let RaftHealth::Dead(reason) = health {
                        self.halt(EngineError::Processing(format!("consensus halted: {}", reason)));
                        break;
                    }
                }
                changed = installed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    installed.borrow_and_update();
                }
                result = snapshot_done(&mut self.snapshot_task),
                    if self.snapshot_task.is_some() =>
                {
                    self.snapshot_task = None;
                    self.snapshot_finished(result);
                }
                _ = snapshot_tick.tick() => self.start_snapshot(),
                _ = redistribution_tick.tick() => self.redistribute(),
            }
        }

        if let Some(task) = self.snapshot_task.take() {
            match task.await {
                Ok(Ok(taken)) => {
                    self.snapshots.completed(&taken);
                }
                Ok(Err(err)) => debug!("Partition {} dropped snapshot: {}", self.partition_id, err),
                Err(err) => debug!("Partition {} snapshot task failed: {}", self.partition_id, err),
            }
        }

        info!("Partition {} stream processor stopped", self.partition_id);
    }

    /// Handle every committed batch not read yet
    ///
    /// Returns between batches once cancelled.
    async fn catch_up(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.mode == ProcessingMode::Processing && !self.node.status().is_ready_leader() {
                self.enter_replay("leadership lost");
            }
            if self.reader.next_index() < self.node.log().first_index() {
                self.install_snapshot().await?;
            }

            match self.reader.read(self.node.commit_index())? {
                ReadOutcome::Batch(batch) => self.handle_batch(batch).await?,
                ReadOutcome::Compacted(index) => {
                    debug!(
                        "Partition {} lost entry {} while reading, installing snapshot",
                        self.partition_id, index
                    );
                    self.install_snapshot().await?;
                }
                ReadOutcome::CaughtUp => {
                    if self.mode == ProcessingMode::Replay && self.node.status().is_ready_leader() {
                        self.enter_processing();
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn handle_batch(&mut self, batch: ReadBatch) -> Result<()> {
        let floor = self.replayer.last_processed();
        let mut txn = self.db.transaction();
        let mut replayed = 0;
        for record in &batch.records {
            if !record.record.is_command() {
                if self.replayer.replay_record(&mut txn, record, floor)? {
                    replayed += 1;
                    let source = self.replayer.last_processed();
                    while self.unprocessed.front().is_some_and(|c| c.position <= source) {
                        self.unprocessed.pop_front();
                    }
                }
                continue;
            }
            if record.position <= self.replayer.last_processed() {
                continue;
            }

            match self.mode {
                ProcessingMode::Replay => self.unprocessed.push_back(Unprocessed {
                    index: batch.index,
                    base_position: batch.base_position,
                    position: record.position,
                }),
                ProcessingMode::Processing => {
                    // Events earlier in the batch must be visible to the handler
                    std::mem::replace(&mut txn, self.db.transaction()).commit();
                    if !self.process_command(&batch, record).await? {
                        self.enter_replay("results could not be written");
                        self.unprocessed.push_back(Unprocessed {
                            index: batch.index,
                            base_position: batch.base_position,
                            position: record.position,
                        });
                    }
                }
            }
        }
        txn.commit();

        if replayed > 0 {
            self.metrics.events_replayed_total.inc_by(replayed);
            self.metrics
                .last_processed_position
                .set(self.replayer.last_processed() as i64);
        }
        self.last_read = (batch.index, batch.last_position());
        Ok(())
    }

    /// Process one command; returns false if its results were not written
    async fn process_command(&mut self, batch: &ReadBatch, command: &LoggedRecord) -> Result<bool> {
        let started = Instant::now();
        let mut txn = self.db.transaction();
        let (records, mut side_effects) = {
            let mut ctx = ProcessingContext::new(
                &mut txn,
                &self.replayer.appliers,
                self.partition_count,
                command.position,
            );
            match self.processors.process(&mut ctx, command) {
                Ok(()) => {}
                Err(ProcessingError::Rejected { kind, reason }) => {
                    ctx.rollback();
                    self.metrics
                        .rejections_total
                        .with_label_values(&[kind.as_str()])
                        .inc();
                    ctx.append_rejection(command, kind, reason);
                }
                Err(ProcessingError::Unexpected(reason)) => {
                    warn!(
                        "Partition {} failed to process {} at position {}: {}",
                        self.partition_id, command.record.intent, command.position, reason
                    );
                    ctx.rollback();
                    let kind = RejectionKind::ProcessingError;
                    self.metrics
                        .rejections_total
                        .with_label_values(&[kind.as_str()])
                        .inc();
                    ctx.append_rejection(command, kind, reason);
                }
                Err(ProcessingError::Fatal(reason)) => {
                    return Err(EngineError::Processing(format!(
                        "{} at position {}: {}",
                        command.record.intent, command.position, reason
                    )));
                }
            }
            ctx.into_parts()
        };

        if let Some((origin, ack)) = self
            .distribution
            .acknowledgement(self.partition_id, &command.record)
        {
            side_effects.push(SideEffect::Send {
                partition_id: origin,
                command: ack,
            });
        }

        if !records.is_empty() {
            state::mark_processed(&mut txn, command.position)?;
            let results = RecordBatch::new(records);
            if let Err(err) = self.log_stream.write(&results).await {
                debug!(
                    "Partition {} could not write results of position {} (entry {}): {}",
                    self.partition_id, command.position, batch.index, err
                );
                return Ok(false);
            }
            txn.commit();
            self.respond(command, &results);
        }
        self.replayer.set_last_processed(command.position);

        for effect in side_effects {
            match effect {
                SideEffect::Send {
                    partition_id,
                    command,
                } => self.sender.send(partition_id, command),
            }
        }

        self.metrics
            .commands_processed_total
            .with_label_values(&[command.record.value_type().as_str()])
            .inc();
        self.metrics
            .last_processed_position
            .set(command.position as i64);
        self.metrics
            .processing_latency
            .observe(started.elapsed().as_secs_f64());
        Ok(true)
    }

    fn respond(&self, command: &LoggedRecord, results: &RecordBatch) {
        let Some(request) = command.request_on(self.node_id) else {
            return;
        };
        let Some((_, response_tx)) = self.responses.remove(&request.request_id) else {
            return;
        };
        if let Some(result) = results.records.first() {
            let _ = response_tx.send(CommandResponse::from_record(result));
        }
    }

    fn enter_processing(&mut self) {
        if let Some(first) = self.unprocessed.front() {
            self.reader.seek(first.index, first.base_position);
        }
        self.unprocessed.clear();
        self.mode = ProcessingMode::Processing;
        info!(
            "Partition {} processing commands after position {}",
            self.partition_id,
            self.replayer.last_processed()
        );
    }

    fn enter_replay(&mut self, reason: &str) {
        self.mode = ProcessingMode::Replay;
        info!("Partition {} back to replay: {}", self.partition_id, reason);
    }

    /// Replace the state with the snapshot consensus installed
    async fn install_snapshot(&mut self) -> Result<()> {
        let metadata = self.snapshots.install(&self.db).await?;
        if LogIndex(metadata.index).next() < self.node.log().first_index() {
            return Err(EngineError::Snapshot(format!(
                "snapshot {} does not reach the log start {}",
                metadata.id(),
                self.node.log().first_index()
            )));
        }
        self.replayer.set_last_processed(metadata.processed_position);
        self.unprocessed.clear();
        self.reader
            .seek(LogIndex(metadata.index).next(), metadata.written_position + 1);
        self.last_read = (LogIndex(metadata.index), metadata.written_position);
        self.metrics
            .last_processed_position
            .set(metadata.processed_position as i64);
        self.snapshot_tx.send_replace(Some(metadata));
        Ok(())
    }

    /// Capture the state for a snapshot, never past an unprocessed command
    ///
    /// Persisting and registering the snapshot runs in its own task so that
    /// processing continues meanwhile.
    fn start_snapshot(&mut self) {
        if self.snapshot_task.is_some() {
            return;
        }
        let (index, written_position) = match self.unprocessed.front() {
            Some(first) => (first.index.prev(), first.base_position - 1),
            None => self.last_read,
        };
        let processed = self.replayer.last_processed();
        match self
            .snapshots
            .capture(&self.db, index, processed, written_position)
        {
            Ok(Some(pending)) => {
                debug!(
                    "Partition {} persists snapshot {}",
                    self.partition_id,
                    pending.metadata().id()
                );
                self.snapshot_task = Some(tokio::spawn(pending.complete().in_current_span()));
            }
            Ok(None) => {}
            Err(err) => self.snapshot_failed(err),
        }
    }

    fn snapshot_finished(&mut self, result: Result<TakenSnapshot>) {
        match result {
            Ok(taken) => {
                if !self.snapshots.completed(&taken) {
                    return;
                }
                self.snapshot_tx.send_replace(Some(taken.metadata));
                self.health_tx.send_if_modified(|health| {
                    if matches!(health, PartitionHealth::Unhealthy(_)) {
                        *health = PartitionHealth::Healthy;
                        return true;
                    }
                    false
                });
            }
            Err(err) => self.snapshot_failed(err),
        }
    }

    fn snapshot_failed(&self, err: EngineError) {
        warn!("Partition {} failed to take a snapshot: {}", self.partition_id, err);
        self.health_tx.send_if_modified(|health| {
            if *health == PartitionHealth::Healthy {
                *health = PartitionHealth::Unhealthy(format!("snapshot failed: {}", err));
                return true;
            }
            false
        });
    }

    /// Re-send distributions no partition acknowledged yet
    fn redistribute(&self) {
        if self.mode != ProcessingMode::Processing {
            return;
        }
        let view = DistributionState::new(&self.db);
        match self.distribution.pending_sends(self.partition_id, &view) {
            Ok(sends) => {
                if !sends.is_empty() {
                    debug!(
                        "Partition {} re-sends {} pending distributions",
                        self.partition_id,
                        sends.len()
                    );
                }
                for (partition_id, command) in sends {
                    self.sender.send(partition_id, command);
                }
            }
            Err(err) => warn!(
                "Partition {} could not read pending distributions: {}",
                self.partition_id, err
            ),
        }
    }

    fn halt(&mut self, err: EngineError) {
        error!("Partition {} halts: {}", self.partition_id, err);
        self.health_tx
            .send_replace(PartitionHealth::Dead(err.to_string()));
        // Nobody will answer the waiting requests
        self.responses.clear();
    }
}

async fn snapshot_done(task: &mut Option<SnapshotTask>) -> Result<TakenSnapshot> {
    match task {
        Some(task) => task.await?,
        None => std::future::pending().await,
    }
}
