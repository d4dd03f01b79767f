//! ---
//! lreg_section: "03-cluster-registry"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Replicated license registry and coordinator actions."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use crate::actions::{ForwardedRequest, MutationResponse};
use crate::error::{RegistryError, RegistryResult};
use crate::node::RegistryNode;
use crate::state::ClusterState;

/// Node-to-node plumbing used by the coordinator.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Deliver a mutation to `to` (the leader) and wait for its answer.
    async fn forward(
        &self,
        from: &str,
        to: &str,
        request: ForwardedRequest,
    ) -> RegistryResult<MutationResponse>;

    /// Deliver a new cluster state to `to`. `Ok` means the peer acknowledged.
    async fn publish(&self, from: &str, to: &str, state: Arc<ClusterState>) -> RegistryResult<()>;

    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// In-process transport connecting the nodes of a [`crate::LocalCluster`].
///
/// An isolated node can neither send nor receive; calls involving it fail
/// with [`RegistryError::Unreachable`].
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    peers: RwLock<HashMap<String, Weak<RegistryNode>>>,
    isolated: RwLock<HashSet<String>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable under its id.
    pub fn attach(&self, node: &Arc<RegistryNode>) {
        self.peers
            .write()
            .insert(node.id().to_owned(), Arc::downgrade(node));
    }

    /// Cut `node_id` off from every other node.
    pub fn isolate(&self, node_id: &str) {
        self.isolated.write().insert(node_id.to_owned());
    }

    pub fn reconnect(&self, node_id: &str) {
        self.isolated.write().remove(node_id);
    }

    pub fn is_isolated(&self, node_id: &str) -> bool {
        self.isolated.read().contains(node_id)
    }

    fn route(&self, from: &str, to: &str) -> RegistryResult<Arc<RegistryNode>> {
        {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                return Err(RegistryError::Unreachable(to.to_owned()));
            }
        }
        self.peers
            .read()
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RegistryError::Unreachable(to.to_owned()))
    }
}

#[async_trait]
impl ClusterTransport for InMemoryTransport {
    async fn forward(
        &self,
        from: &str,
        to: &str,
        request: ForwardedRequest,
    ) -> RegistryResult<MutationResponse> {
        let peer = self.route(from, to)?;
        trace!(from, to, request = %request.request_id, "forwarding mutation");
        peer.handle_forwarded(request).await
    }

    async fn publish(&self, from: &str, to: &str, state: Arc<ClusterState>) -> RegistryResult<()> {
        let peer = self.route(from, to)?;
        trace!(from, to, version = state.version, "publishing state");
        peer.handle_publish(state)
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
