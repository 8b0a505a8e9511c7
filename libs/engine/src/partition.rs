//! One replica of a partition and the tasks driving it

use crate::config::PartitionConfig;
use crate::distribution::{InterPartitionSender, PartitionRouter};
use crate::error::{EngineError, Result, SubmitError};
use crate::log_stream::LogStream;
use crate::processing::RecordProcessors;
use crate::record::{
    Intent, Record, RecordBatch, RecordType, RecordValue, Rejection, RejectionKind,
    RequestMetadata, TenantIntent, TenantRecord,
};
use crate::snapshot_controller::SnapshotController;
use crate::state::ProcessingState;
use crate::stream_processor::{StreamProcessor, StreamProcessorContext};
use dashmap::DashMap;
use flowline_consensus::{FileMetaStore, RaftLog, RaftNode, RaftStatus, RaftTransport};
use flowline_metrics::PartitionMetrics;
use flowline_storage::{FileSnapshotStore, SnapshotMetadata, StateDb};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, Instrument};

/// Requests waiting for the result of their command, by request id
pub(crate) type PendingResponses = Arc<DashMap<u64, oneshot::Sender<CommandResponse>>>;

/// Liveness of a partition replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionHealth {
    Healthy,
    /// Working, but something needs attention
    Unhealthy(String),
    /// Processing stopped for good
    Dead(String),
}

/// A command submitted by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub intent: Intent,
    pub key: u64,
    pub value: RecordValue,
}

impl CommandRequest {
    pub fn new(intent: Intent, key: u64, value: RecordValue) -> Self {
        Self { intent, key, value }
    }

    pub fn create_tenant(tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::tenant(TenantIntent::Create, tenant_id.into(), name.into())
    }

    pub fn update_tenant(tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::tenant(TenantIntent::Update, tenant_id.into(), name.into())
    }

    pub fn delete_tenant(tenant_id: impl Into<String>) -> Self {
        Self::tenant(TenantIntent::Delete, tenant_id.into(), String::new())
    }

    fn tenant(intent: TenantIntent, tenant_id: String, name: String) -> Self {
        Self::new(
            Intent::Tenant(intent),
            0,
            RecordValue::Tenant(TenantRecord {
                tenant_key: 0,
                tenant_id,
                name,
            }),
        )
    }
}

/// The first record written for a command: its main event or its rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub record_type: RecordType,
    pub intent: Intent,
    pub key: u64,
    pub value: RecordValue,
    pub rejection: Option<Rejection>,
}

impl CommandResponse {
    pub(crate) fn from_record(record: &Record) -> Self {
        Self {
            record_type: record.record_type,
            intent: record.intent,
            key: record.key,
            value: record.value.clone(),
            rejection: record.rejection.clone(),
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }

    pub fn rejection_kind(&self) -> Option<RejectionKind> {
        self.rejection.as_ref().map(|r| r.kind)
    }
}

/// One replica of a partition
pub struct Partition {
    config: PartitionConfig,
    node: RaftNode,
    log_stream: LogStream,
    state: ProcessingState,
    responses: PendingResponses,
    next_request_id: AtomicU64,
    health_rx: watch::Receiver<PartitionHealth>,
    snapshot_rx: watch::Receiver<Option<SnapshotMetadata>>,
    metrics: Arc<PartitionMetrics>,
    router: PartitionRouter,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Partition {
    pub fn builder(config: PartitionConfig) -> PartitionBuilder {
        PartitionBuilder::new(config)
    }

    pub fn id(&self) -> u32 {
        self.config.partition_id
    }

    pub fn node(&self) -> &RaftNode {
        &self.node
    }

    pub fn status(&self) -> RaftStatus {
        self.node.status()
    }

    /// Write a command and wait for its result
    ///
    /// Only the leader accepts commands. A response that does not arrive
    /// within the request timeout (for example because leadership changed
    /// after the command was written) yields [`SubmitError::Timeout`]; the
    /// command may still be processed.
    pub async fn submit(
        &self,
        request: CommandRequest,
    ) -> std::result::Result<CommandResponse, SubmitError> {
        if self.cancel.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();
        self.responses.insert(request_id, response_tx);

        let mut command = Record::command(request.intent, request.key, request.value);
        command.request = Some(RequestMetadata {
            node_id: self.node.id().0,
            request_id,
        });

        let timeout = self.config.engine.request_timeout;
        let result = tokio::time::timeout(timeout, async {
            self.log_stream.write(&RecordBatch::single(command)).await?;
            response_rx.await.map_err(|_| SubmitError::ShuttingDown)
        })
        .await;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                self.responses.remove(&request_id);
                Err(err)
            }
            Err(_) => {
                self.responses.remove(&request_id);
                Err(SubmitError::Timeout)
            }
        }
    }

    /// Read-only view of the processing state
    pub fn state(&self) -> ProcessingState {
        self.state.clone()
    }

    pub fn health(&self) -> PartitionHealth {
        self.health_rx.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<PartitionHealth> {
        self.health_rx.clone()
    }

    /// The snapshot the state was last recovered from or saved to
    pub fn latest_snapshot(&self) -> Option<SnapshotMetadata> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<SnapshotMetadata>> {
        self.snapshot_rx.clone()
    }

    pub fn metrics(&self) -> &PartitionMetrics {
        &self.metrics
    }

    /// Stop processing after the current atomic unit and shut down consensus
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.router.unregister(self.id(), self.node.id());
        self.node.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.responses.clear();
        info!("Partition {} on {} shut down", self.id(), self.node.id());
    }
}

pub struct PartitionBuilder {
    config: PartitionConfig,
    transport: Option<Arc<dyn RaftTransport>>,
    router: Option<PartitionRouter>,
    processors: Option<RecordProcessors>,
}

impl PartitionBuilder {
    pub fn new(config: PartitionConfig) -> Self {
        Self {
            config,
            transport: None,
            router: None,
            processors: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn RaftTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Router connecting the partitions; a private one is used if unset
    pub fn router(mut self, router: PartitionRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn processors(mut self, processors: RecordProcessors) -> Self {
        self.processors = Some(processors);
        self
    }

    /// Start consensus, recover the state and spawn the processor
    pub async fn start(self) -> Result<Partition> {
        let config = self.config;
        config.engine.validate()?;
        let partition_id = config.partition_id;
        let node_id = config.node_id();
        let transport = self
            .transport
            .ok_or_else(|| EngineError::Config("a transport is required".into()))?;
        let router = self.router.unwrap_or_default();
        let metrics = Arc::new(PartitionMetrics::new(partition_id)?);

        let node = RaftNode::builder(node_id)
            .config(config.engine.raft.clone())
            .members(config.members.clone())
            .transport(transport)
            .metrics(metrics.raft.clone());
        let (node, store) = match config.partition_dir() {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                let node = node
                    .log(RaftLog::open(dir.join("log"))?)
                    .meta_store(FileMetaStore::open(dir.join("meta"))?);
                (node, Some(FileSnapshotStore::open(dir.join("snapshots"))?))
            }
            None => (node, None),
        };
        let node = node.start().await?;

        let db = StateDb::new();
        let log_stream = LogStream::new(partition_id, node.clone());
        let responses: PendingResponses = Arc::new(DashMap::new());
        let (health_tx, health_rx) = watch::channel(PartitionHealth::Healthy);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let span = flowline_tracing::partition_span(partition_id, node_id.0);

        let processor = StreamProcessor::recover(StreamProcessorContext {
            partition_id,
            partition_count: config.partition_count(),
            node: node.clone(),
            log_stream: log_stream.clone(),
            db: db.clone(),
            processors: self.processors.unwrap_or_default(),
            sender: Arc::new(router.clone()) as Arc<dyn InterPartitionSender>,
            responses: responses.clone(),
            snapshots: SnapshotController::new(
                partition_id,
                node.clone(),
                store,
                metrics.snapshot.clone(),
            ),
            snapshot_period: config.engine.snapshot_period,
            redistribution_interval: config.engine.redistribution_interval,
            health_tx,
            snapshot_tx,
            metrics: metrics.processing.clone(),
            cancel: cancel.clone(),
        });
        let processor = match processor {
            Ok(processor) => processor,
            Err(err) => {
                node.shutdown().await;
                return Err(err);
            }
        };

        let inbox = router.register(partition_id, node_id);
        let tasks = vec![
            tokio::spawn(processor.run().instrument(span.clone())),
            tokio::spawn(
                forward_inbox(log_stream.clone(), node.clone(), inbox, cancel.clone())
                    .instrument(span),
            ),
        ];
        info!("Partition {} started on {}", partition_id, node_id);

        Ok(Partition {
            config,
            node,
            log_stream,
            state: ProcessingState::new(db),
            responses,
            next_request_id: AtomicU64::new(1),
            health_rx,
            snapshot_rx,
            metrics,
            router,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Write commands received from other partitions, in arrival order
async fn forward_inbox(
    log_stream: LogStream,
    node: RaftNode,
    inbox: async_channel::Receiver<Record>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = inbox.recv() => match command {
                Ok(command) => command,
                Err(_) => break,
            },
        };
        // Every replica receives the command; the origin re-sends whatever
        // the leader misses
        if !node.status().is_ready_leader() {
            trace!("Not the leader, dropping {} from another partition", command.intent);
            continue;
        }
        if let Err(err) = log_stream.write(&RecordBatch::single(command)).await {
            debug!("Could not write command from another partition: {}", err);
        }
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.config.partition_id)
            .field("node", &self.node.id())
            .finish()
    }
}
