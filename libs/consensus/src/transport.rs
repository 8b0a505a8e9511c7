//! Transport abstraction for Raft RPCs
//!
//! The node only talks to peers through [`RaftTransport`]. The in-memory
//! network routes requests straight into the target node's request queue and
//! can isolate nodes or cut individual links for failure testing.

use crate::node::RaftNode;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::types::NodeId;
use crate::{RaftError, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::debug;

/// Sends Raft RPCs to other members of the group
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

#[derive(Default)]
struct NetworkInner {
    nodes: DashMap<NodeId, RaftNode>,
    isolated: DashSet<NodeId>,
    /// Directed links that drop every request
    cut_links: DashSet<(NodeId, NodeId)>,
}

/// A process-local network connecting [`RaftNode`]s
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a node reachable for its peers
    pub fn register(&self, node: RaftNode) {
        self.inner.nodes.insert(node.id(), node);
    }

    pub fn unregister(&self, id: NodeId) -> Option<RaftNode> {
        self.inner.nodes.remove(&id).map(|(_, node)| node)
    }

    /// Drop all traffic from and to `id`
    pub fn isolate(&self, id: NodeId) {
        debug!("Isolating {}", id);
        self.inner.isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        debug!("Healing {}", id);
        self.inner.isolated.remove(&id);
    }

    /// Drop traffic between `a` and `b` in both directions
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        self.inner.cut_links.insert((a, b));
        self.inner.cut_links.insert((b, a));
    }

    pub fn reconnect(&self, a: NodeId, b: NodeId) {
        self.inner.cut_links.remove(&(a, b));
        self.inner.cut_links.remove(&(b, a));
    }

    /// The transport a node with id `from` uses to reach its peers
    pub fn transport(&self, from: NodeId) -> Arc<dyn RaftTransport> {
        Arc::new(InMemoryTransport {
            from,
            network: self.clone(),
        })
    }

    fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        let inner = &self.inner;
        !(inner.isolated.contains(&from)
            || inner.isolated.contains(&to)
            || inner.cut_links.contains(&(from, to)))
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftNode> {
        if !self.is_reachable(from, to) {
            return Err(RaftError::Rpc(format!("{} unreachable from {}", to, from)));
        }
        self.inner
            .nodes
            .get(&to)
            .map(|node| node.clone())
            .ok_or_else(|| RaftError::Rpc(format!("{} is not registered", to)))
    }
}

struct InMemoryTransport {
    from: NodeId,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    /// Responses travel the reverse link and can be lost as well
    fn check_return(&self, to: NodeId) -> Result<()> {
        if self.network.is_reachable(to, self.from) {
            Ok(())
        } else {
            Err(RaftError::Rpc(format!("response from {} lost", to)))
        }
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let node = self.network.route(self.from, target)?;
        let response = node.request_vote(request).await?;
        self.check_return(target)?;
        Ok(response)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.network.route(self.from, target)?;
        let response = node.append_entries(request).await?;
        self.check_return(target)?;
        Ok(response)
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = self.network.route(self.from, target)?;
        let response = node.install_snapshot(request).await?;
        self.check_return(target)?;
        Ok(response)
    }
}
