//! Snapshots of a partition's processing state
//!
//! A snapshot is persisted to the partition's [`FileSnapshotStore`] (when it
//! has a data directory) and registered with consensus, which keeps it for
//! lagging followers and compacts the log behind it. The data handed to
//! consensus is an [`EngineSnapshot`]: the state checkpoint together with the
//! positions it covers.

use crate::error::{EngineError, Result};
use bytes::Bytes;
use flowline_consensus::{LogIndex, RaftNode};
use flowline_metrics::SnapshotMetrics;
use flowline_storage::{FileSnapshotStore, SnapshotMetadata, StateDb, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Snapshot payload replicated through consensus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub metadata: SnapshotMetadata,
    pub state: Vec<u8>,
}

impl EngineSnapshot {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

pub struct SnapshotController {
    partition_id: u32,
    node: RaftNode,
    store: Option<Arc<FileSnapshotStore>>,
    latest: Option<SnapshotMetadata>,
    metrics: SnapshotMetrics,
}

impl SnapshotController {
    pub fn new(
        partition_id: u32,
        node: RaftNode,
        store: Option<FileSnapshotStore>,
        metrics: SnapshotMetrics,
    ) -> Self {
        Self {
            partition_id,
            node,
            store: store.map(Arc::new),
            latest: None,
            metrics,
        }
    }

    pub fn latest(&self) -> Option<&SnapshotMetadata> {
        self.latest.as_ref()
    }

    /// Restore `db` from the newest usable snapshot
    ///
    /// Candidates are the newest valid snapshot in the store not beyond the
    /// commit index, and the snapshot held by the replicated log. Without
    /// either the state starts empty.
    pub fn recover(&mut self, db: &StateDb) -> Result<SnapshotMetadata> {
        let commit_index = self.node.commit_index();
        let stored = match &self.store {
            Some(store) => store
                .latest_valid(commit_index.0)?
                .map(|(persisted, state)| EngineSnapshot {
                    metadata: persisted.metadata,
                    state,
                }),
            None => None,
        };
        let replicated = match self.node.log().get_snapshot() {
            Some(snapshot) => Some(EngineSnapshot::decode(&snapshot.data)?),
            None => None,
        };

        let newest = match (stored, replicated) {
            (Some(stored), Some(replicated)) => {
                if replicated.metadata.index > stored.metadata.index {
                    Some(replicated)
                } else {
                    Some(stored)
                }
            }
            (stored, replicated) => stored.or(replicated),
        };

        match newest {
            Some(snapshot) => {
                db.restore(&snapshot.state)?;
                info!(
                    "Partition {} recovered from snapshot {}",
                    self.partition_id,
                    snapshot.metadata.id()
                );
                self.latest = Some(snapshot.metadata.clone());
                Ok(snapshot.metadata)
            }
            None => {
                db.clear();
                debug!("Partition {} starts from an empty state", self.partition_id);
                Ok(SnapshotMetadata::bootstrap())
            }
        }
    }

    /// Capture the state of `db` for a snapshot covering the log up to `index`
    ///
    /// Only the checkpoint is taken here; the returned [`PendingSnapshot`] does
    /// the slow part. Returns `None` if there is nothing newer than the latest
    /// snapshot.
    pub fn capture(
        &self,
        db: &StateDb,
        index: LogIndex,
        processed_position: u64,
        written_position: u64,
    ) -> Result<Option<PendingSnapshot>> {
        if index == LogIndex::ZERO || self.latest.as_ref().is_some_and(|l| l.index >= index.0) {
            return Ok(None);
        }
        let Some(term) = self.node.log().get_term(index)? else {
            debug!(
                "Partition {} skips snapshot, entry {} is no longer in the log",
                self.partition_id, index
            );
            return Ok(None);
        };

        Ok(Some(PendingSnapshot {
            snapshot: EngineSnapshot {
                metadata: SnapshotMetadata {
                    index: index.0,
                    term: term.0,
                    processed_position,
                    written_position,
                    bootstrap: false,
                },
                state: db.checkpoint()?,
            },
            node: self.node.clone(),
            store: self.store.clone(),
            started: Instant::now(),
        }))
    }

    /// Record a snapshot whose [`PendingSnapshot::complete`] succeeded
    ///
    /// Returns false if a newer snapshot was installed in the meantime.
    pub fn completed(&mut self, taken: &TakenSnapshot) -> bool {
        if self
            .latest
            .as_ref()
            .is_some_and(|l| l.index >= taken.metadata.index)
        {
            return false;
        }
        self.metrics.snapshots_taken_total.inc();
        self.metrics
            .snapshot_duration
            .observe(taken.duration.as_secs_f64());
        self.metrics.snapshot_size_bytes.set(taken.size as i64);
        info!(
            "Partition {} took snapshot {} ({} bytes)",
            self.partition_id,
            taken.metadata.id(),
            taken.size
        );
        self.latest = Some(taken.metadata.clone());
        true
    }

    /// Replace `db` with the snapshot consensus received from the leader
    pub async fn install(&mut self, db: &StateDb) -> Result<SnapshotMetadata> {
        let snapshot = self.node.log().get_snapshot().ok_or_else(|| {
            EngineError::Snapshot("the log holds no snapshot".into())
        })?;
        let snapshot = EngineSnapshot::decode(&snapshot.data)?;
        let snapshot = match persist(self.store.clone(), snapshot.clone()).await {
            Ok(persisted) => persisted,
            // Already received before a restart
            Err(EngineError::Storage(StorageError::SnapshotAlreadyExists(_))) => snapshot,
            Err(err) => return Err(err),
        };
        db.restore(&snapshot.state)?;

        self.metrics.snapshots_installed_total.inc();
        info!(
            "Partition {} installed snapshot {} from the leader",
            self.partition_id,
            snapshot.metadata.id()
        );
        self.latest = Some(snapshot.metadata.clone());
        Ok(snapshot.metadata)
    }
}

/// A captured state on its way to the store and to consensus
pub struct PendingSnapshot {
    snapshot: EngineSnapshot,
    node: RaftNode,
    store: Option<Arc<FileSnapshotStore>>,
    started: Instant,
}

/// Outcome of a completed [`PendingSnapshot`]
#[derive(Debug, Clone)]
pub struct TakenSnapshot {
    pub metadata: SnapshotMetadata,
    pub size: usize,
    pub duration: Duration,
}

impl PendingSnapshot {
    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.snapshot.metadata
    }

    /// Persist the snapshot and register it with consensus, which may then
    /// compact the log behind it
    pub async fn complete(self) -> Result<TakenSnapshot> {
        let index = LogIndex(self.snapshot.metadata.index);
        let snapshot = persist(self.store, self.snapshot).await?;
        self.node.register_snapshot(index, snapshot.encode()?).await?;
        Ok(TakenSnapshot {
            size: snapshot.state.len(),
            metadata: snapshot.metadata,
            duration: self.started.elapsed(),
        })
    }
}

/// Write the snapshot to the store off the async runtime
async fn persist(
    store: Option<Arc<FileSnapshotStore>>,
    snapshot: EngineSnapshot,
) -> Result<EngineSnapshot> {
    let Some(store) = store else {
        return Ok(snapshot);
    };
    let snapshot = tokio::task::spawn_blocking(move || {
        store
            .persist(&snapshot.metadata, &snapshot.state)
            .map(|_| snapshot)
    })
    .await??;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_consensus::{InMemoryNetwork, Member, NodeId};
    use flowline_metrics::PartitionMetrics;
    use flowline_storage::ReadContext;
    use std::time::Duration;

    async fn single_node() -> RaftNode {
        let network = InMemoryNetwork::new();
        let node = RaftNode::builder(NodeId(1))
            .members(vec![Member::active(NodeId(1))])
            .transport(network.transport(NodeId(1)))
            .start()
            .await
            .unwrap();
        network.register(node.clone());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !node.status().is_ready_leader() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        node
    }

    fn put(db: &StateDb, key: &[u8]) {
        let mut txn = db.transaction();
        txn.put(1, key.to_vec(), b"value".to_vec());
        txn.commit();
    }

    #[tokio::test]
    async fn test_capture_leaves_persistence_to_the_pending_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node().await;
        let index = node.propose(Bytes::from_static(b"entry")).await.unwrap();
        let metrics = PartitionMetrics::new(1).unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        let mut controller =
            SnapshotController::new(1, node.clone(), Some(store), metrics.snapshot.clone());

        let db = StateDb::new();
        put(&db, b"before");
        let pending = controller
            .capture(&db, index, 4, 7)
            .unwrap()
            .expect("snapshot captured");
        assert_eq!(pending.metadata().index, index.0);

        // Processing goes on while nothing is written yet
        put(&db, b"after");
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());
        assert!(controller.latest().is_none());
        assert!(node.log().get_snapshot().is_none());

        let taken = pending.complete().await.unwrap();
        assert!(controller.completed(&taken));
        assert_eq!(controller.latest(), Some(&taken.metadata));
        assert_eq!(metrics.snapshot.snapshots_taken_total.get(), 1);
        assert_eq!(
            node.log().get_snapshot().unwrap().metadata.last_included_index,
            index
        );

        // The stored state is the one captured
        let (persisted, state) = store.latest_valid(index.0).unwrap().expect("persisted");
        assert_eq!(persisted.metadata.processed_position, 4);
        let restored = StateDb::new();
        restored.restore(&state).unwrap();
        assert!(restored.get(1, b"before").is_some());
        assert!(restored.get(1, b"after").is_none());

        // Nothing newer to capture, and a late completion is ignored
        assert!(controller.capture(&db, index, 4, 7).unwrap().is_none());
        assert!(!controller.completed(&taken));
        assert_eq!(metrics.snapshot.snapshots_taken_total.get(), 1);

        node.shutdown().await;
    }
}
