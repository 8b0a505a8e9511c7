#![allow(dead_code)]

use flowline_consensus::{InMemoryNetwork, LogIndex, Member, NodeId, RaftConfig, RaftNode};
use flowline_engine::{EngineConfig, LogStream, Partition, PartitionRouter, ReadBatch};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn fast_raft_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(20),
        quorum_response_timeout: Duration::from_millis(300),
        retry_backoff_base: Duration::from_millis(10),
        retry_backoff_max: Duration::from_millis(100),
        ..Default::default()
    }
}

pub fn fast_config(node_id: u64, partition_count: u32) -> EngineConfig {
    EngineConfig {
        node_id: NodeId(node_id),
        partition_count,
        redistribution_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(5),
        raft: fast_raft_config(),
        ..Default::default()
    }
}

/// Replicas of one partition, each on its own node
pub struct TestPartition {
    pub network: InMemoryNetwork,
    pub replicas: BTreeMap<NodeId, Partition>,
}

impl TestPartition {
    pub async fn start(partition_id: u32, size: u64) -> anyhow::Result<Self> {
        Self::start_with(partition_id, size, |id| fast_config(id, 1), None).await
    }

    /// Start `size` replicas configured by `config`, all routing through
    /// `router` if given
    pub async fn start_with(
        partition_id: u32,
        size: u64,
        config: impl Fn(u64) -> EngineConfig,
        router: Option<PartitionRouter>,
    ) -> anyhow::Result<Self> {
        flowline_tracing::init_test_tracing();
        let network = InMemoryNetwork::new();
        let members: Vec<Member> = (1..=size).map(|id| Member::active(NodeId(id))).collect();
        let mut replicas = BTreeMap::new();
        for member in &members {
            let config = config(member.id.0).partition(partition_id, members.clone())?;
            let mut builder = Partition::builder(config).transport(network.transport(member.id));
            if let Some(router) = &router {
                builder = builder.router(router.clone());
            }
            let partition = builder.start().await?;
            network.register(partition.node().clone());
            replicas.insert(member.id, partition);
        }
        Ok(Self { network, replicas })
    }

    pub fn replica(&self, id: u64) -> &Partition {
        &self.replicas[&NodeId(id)]
    }

    pub async fn wait_for_leader(&self) -> &Partition {
        wait_until(|| {
            self.replicas
                .values()
                .find(|p| p.status().is_ready_leader())
        })
        .await
        .expect("no leader elected")
    }

    pub fn followers_of<'a>(&'a self, leader: &Partition) -> Vec<&'a Partition> {
        self.replicas
            .values()
            .filter(|p| p.node().id() != leader.node().id())
            .collect()
    }

    /// Wait until every replica's state matches the leader's
    pub async fn wait_for_convergence(&self, leader: &Partition) -> bool {
        wait_until(|| {
            let expected = leader.state().checksum().ok()?;
            self.replicas
                .values()
                .all(|p| p.state().checksum().ok().as_ref() == Some(&expected))
                .then_some(())
        })
        .await
        .is_some()
    }

    pub async fn shutdown(self) {
        for replica in self.replicas.values() {
            replica.shutdown().await;
        }
    }
}

pub fn data_dir(root: &tempfile::TempDir, node_id: u64) -> PathBuf {
    root.path().join(format!("node-{}", node_id))
}

/// Every committed batch of a partition's log
pub fn read_all(node: &RaftNode) -> anyhow::Result<Vec<ReadBatch>> {
    let mut reader = LogStream::new(1, node.clone()).reader(LogIndex(1), 1);
    let mut batches = Vec::new();
    while let Some(batch) = reader.next_batch(node.commit_index())? {
        batches.push(batch);
    }
    Ok(batches)
}

/// Poll `check` until it yields a value or [`WAIT`] elapses
pub async fn wait_until<T, F>(mut check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .ok()
}
