#![allow(dead_code)]

use flowline_consensus::{InMemoryNetwork, Member, NodeId, RaftConfig, RaftNode};
use std::collections::BTreeMap;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn fast_config() -> RaftConfig {
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

pub struct TestCluster {
    pub network: InMemoryNetwork,
    pub nodes: BTreeMap<NodeId, RaftNode>,
}

impl TestCluster {
    pub async fn start(size: u64) -> anyhow::Result<Self> {
        Self::start_with(size, fast_config()).await
    }

    pub async fn start_with(size: u64, config: RaftConfig) -> anyhow::Result<Self> {
        let network = InMemoryNetwork::new();
        let members: Vec<Member> = (1..=size).map(|id| Member::active(NodeId(id))).collect();
        let mut nodes = BTreeMap::new();
        for member in &members {
            let node = RaftNode::builder(member.id)
                .config(config.clone())
                .members(members.clone())
                .transport(network.transport(member.id))
                .start()
                .await?;
            network.register(node.clone());
            nodes.insert(member.id, node);
        }
        Ok(Self { network, nodes })
    }

    pub fn node(&self, id: u64) -> &RaftNode {
        &self.nodes[&NodeId(id)]
    }

    /// The ready leader among the nodes that are not isolated
    pub async fn wait_for_leader(&self, excluding: &[NodeId]) -> RaftNode {
        let candidates: Vec<RaftNode> = self
            .nodes
            .values()
            .filter(|n| !excluding.contains(&n.id()))
            .cloned()
            .collect();
        wait_until(|| {
            candidates
                .iter()
                .find(|n| n.status().is_ready_leader())
                .cloned()
        })
        .await
        .expect("no leader elected")
    }

    pub fn followers_of(&self, leader: NodeId) -> Vec<RaftNode> {
        self.nodes
            .values()
            .filter(|n| n.id() != leader)
            .cloned()
            .collect()
    }

    pub async fn shutdown(self) {
        for node in self.nodes.values() {
            node.shutdown().await;
        }
    }
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
