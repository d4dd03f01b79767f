//! ---
//! lreg_section: "03-cluster-registry"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Replicated license registry and coordinator actions."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use lreg_common::config::{AppConfig, ClusterConfig, SnapshotConfig};
use lreg_common::time::{Clock, SystemClock};
use lreg_licensing::Verifier;
use lreg_metrics::{ElectionMetrics, SharedRegistry};
use lreg_persistence::{PersistenceMetrics, SnapshotStore};
use lreg_redundancy::{FailoverEvent, MemberContext, RedundancySupervisor};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::metrics::RegistryMetrics;
use crate::node::RegistryNode;
use crate::settings::{load_verifier, RegistrySettings};
use crate::state::ClusterState;
use crate::store::LicenseStore;
use crate::sweeper::ExpirySweeper;
use crate::transport::{ClusterTransport, InMemoryTransport};

/// Configures and starts a [`LocalCluster`].
pub struct LocalClusterBuilder {
    cluster: ClusterConfig,
    verifier: Verifier,
    snapshots: Option<SnapshotConfig>,
    clock: Arc<dyn Clock>,
    registry: Option<SharedRegistry>,
}

impl LocalClusterBuilder {
    pub fn new(cluster: ClusterConfig, verifier: Verifier) -> Self {
        Self {
            cluster,
            verifier,
            snapshots: None,
            clock: Arc::new(SystemClock),
            registry: None,
        }
    }

    /// Persist every node's state below `config.directory/<node>`.
    pub fn snapshots(mut self, config: SnapshotConfig) -> Self {
        self.snapshots = config.enabled.then_some(config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register registry, election and persistence metrics in `registry`.
    pub fn metrics(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build every node, recover persisted state and elect the first leader.
    pub fn start(self) -> Result<LocalCluster> {
        self.cluster.validate()?;
        let settings = Arc::new(RegistrySettings::new(&self.cluster, self.verifier));
        let supervisor = Arc::new(RedundancySupervisor::new(self.cluster.name.clone()));
        let transport = Arc::new(InMemoryTransport::new());
        let shared_transport: Arc<dyn ClusterTransport> = transport.clone();

        let registry_metrics = self
            .registry
            .clone()
            .map(RegistryMetrics::new)
            .transpose()
            .context("unable to register registry metrics")?;
        let member_ids: Vec<String> = self.cluster.nodes.keys().cloned().collect();
        let election_metrics = self
            .registry
            .as_ref()
            .map(|registry| ElectionMetrics::new(registry, &self.cluster.name, &member_ids))
            .transpose()
            .context("unable to register election metrics")?;
        let persistence_metrics = self
            .registry
            .clone()
            .map(PersistenceMetrics::new)
            .transpose()
            .context("unable to register persistence metrics")?;

        let mut nodes = IndexMap::with_capacity(self.cluster.nodes.len());
        for (node_id, node_config) in &self.cluster.nodes {
            supervisor.register(MemberContext::from_config(&self.cluster, node_id, node_config));

            let mut store = LicenseStore::new(node_id.as_str(), &self.cluster.name);
            if let Some(snapshot_config) = &self.snapshots {
                let mut snapshots = SnapshotStore::from_config(snapshot_config, node_id)
                    .with_context(|| format!("unable to open snapshot directory for {node_id}"))?;
                if let Some(metrics) = &persistence_metrics {
                    snapshots = snapshots.with_metrics(metrics.clone());
                }
                store = store.with_snapshots(snapshots);
            }

            let mut node = RegistryNode::new(
                node_id.as_str(),
                settings.clone(),
                store,
                supervisor.clone(),
                shared_transport.clone(),
                self.clock.clone(),
            );
            if let Some(metrics) = &registry_metrics {
                node = node.with_metrics(metrics.clone());
            }
            let node = Arc::new(node);
            transport.attach(&node);
            nodes.insert(node_id.clone(), node);
        }

        let (shutdown, _) = broadcast::channel(1);
        let cluster = LocalCluster {
            name: self.cluster.name.clone(),
            heartbeat_interval: self.cluster.heartbeat_interval,
            settings,
            supervisor,
            transport,
            nodes,
            election_metrics,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            sweepers: Mutex::new(Vec::new()),
        };
        cluster.recover()?;
        cluster.heartbeat_all();
        cluster.observe_leadership();
        for node in cluster.nodes.values() {
            node.mark_ready();
        }
        info!(
            cluster = %cluster.name,
            nodes = cluster.nodes.len(),
            leader = cluster.supervisor.leader().as_deref().unwrap_or("none"),
            "registry cluster ready"
        );
        Ok(cluster)
    }
}

/// Every node of one cluster running in this process, wired through an
/// [`InMemoryTransport`].
pub struct LocalCluster {
    name: String,
    heartbeat_interval: Duration,
    settings: Arc<RegistrySettings>,
    supervisor: Arc<RedundancySupervisor>,
    transport: Arc<InMemoryTransport>,
    nodes: IndexMap<String, Arc<RegistryNode>>,
    election_metrics: Option<ElectionMetrics>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sweepers: Mutex<Vec<ExpirySweeper>>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("name", &self.name)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("leader", &self.supervisor.leader())
            .finish_non_exhaustive()
    }
}

impl LocalCluster {
    pub fn builder(cluster: ClusterConfig, verifier: Verifier) -> LocalClusterBuilder {
        LocalClusterBuilder::new(cluster, verifier)
    }

    /// Start the cluster described by a loaded application config.
    pub fn start(config: &AppConfig, clock: Arc<dyn Clock>, registry: Option<SharedRegistry>) -> Result<Self> {
        config.validate()?;
        let verifier = load_verifier(&config.license)?;
        let mut builder = Self::builder(config.cluster.clone(), verifier)
            .snapshots(config.persistence.clone())
            .clock(clock);
        if let Some(registry) = registry {
            builder = builder.metrics(registry);
        }
        builder.start()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<RegistryNode>> {
        self.nodes.get(node_id).cloned()
    }

    /// Node by declaration order.
    pub fn node_at(&self, index: usize) -> Option<Arc<RegistryNode>> {
        self.nodes.get_index(index).map(|(_, node)| node.clone())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<RegistryNode>> {
        self.nodes.values()
    }

    pub fn leader(&self) -> Option<Arc<RegistryNode>> {
        self.supervisor.leader().and_then(|id| self.node(&id))
    }

    pub fn supervisor(&self) -> &Arc<RedundancySupervisor> {
        &self.supervisor
    }

    pub fn transport(&self) -> &Arc<InMemoryTransport> {
        &self.transport
    }

    /// Record a heartbeat for every reachable node.
    pub fn heartbeat_all(&self) {
        heartbeat_round(&self.supervisor, &self.transport, self.nodes.keys(), Instant::now());
    }

    /// Re-check leader liveness, failing over if its heartbeat is missing.
    pub fn evaluate(&self) -> Option<FailoverEvent> {
        let event = self.supervisor.evaluate(Instant::now());
        if let Some(event) = &event {
            self.record_failover(event);
        }
        event
    }

    /// Take `node_id` offline. Leadership moves to the next eligible node.
    pub fn stop_node(&self, node_id: &str) {
        self.transport.isolate(node_id);
        self.heartbeat_all();
        let now = Instant::now();
        match self.supervisor.mark_down(node_id, now) {
            Some(event) => self.record_failover(&event),
            None if self.supervisor.leader().is_none() => {
                warn!(cluster = %self.name, node = node_id, "no leader after stopping node")
            }
            None => {}
        }
        info!(cluster = %self.name, node = node_id, "node stopped");
    }

    /// Bring a stopped node back and catch it up with the leader.
    pub fn restart_node(&self, node_id: &str) -> Result<()> {
        let node = self
            .node(node_id)
            .with_context(|| format!("unknown node '{node_id}'"))?;
        self.transport.reconnect(node_id);
        self.supervisor.heartbeat(node_id, Instant::now());
        if self.supervisor.leader().is_none() {
            self.evaluate();
        }
        self.catch_up(&node)?;
        info!(cluster = %self.name, node = node_id, version = node.state().version, "node restarted");
        Ok(())
    }

    /// Cut the listed nodes off from the rest without marking them down.
    pub fn partition<S: AsRef<str>>(&self, node_ids: &[S]) {
        for node_id in node_ids {
            self.transport.isolate(node_id.as_ref());
        }
        info!(cluster = %self.name, isolated = node_ids.len(), "network partitioned");
    }

    /// Reconnect every node and bring them up to date.
    pub fn heal(&self) -> Result<()> {
        for node_id in self.nodes.keys() {
            self.transport.reconnect(node_id);
        }
        self.heartbeat_all();
        for node in self.nodes.values() {
            self.catch_up(node)?;
        }
        info!(cluster = %self.name, "network healed");
        Ok(())
    }

    /// Beat every reachable node and evaluate the leader each heartbeat
    /// interval until [`LocalCluster::shutdown`].
    pub fn spawn_heartbeats(&self) {
        let supervisor = self.supervisor.clone();
        let transport = self.transport.clone();
        let nodes = self.nodes.clone();
        let node_ids: Vec<String> = self.nodes.keys().cloned().collect();
        let metrics = self.election_metrics.clone();
        let cluster = self.name.clone();
        let period = self.heartbeat_interval;
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(%cluster, "heartbeat task shutdown");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        heartbeat_round(&supervisor, &transport, node_ids.iter(), now);
                        if let Some(event) = supervisor.evaluate(now) {
                            adopt_newest_state(&nodes, &transport, &event.activated_node, event.term);
                            if let Some(metrics) = &metrics {
                                metrics.observe_failover(&event);
                            }
                            info!(cluster = %event.cluster, node = %event.activated_node, reason = ?event.reason, "failover event");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Start one [`ExpirySweeper`] per node when a sweep interval is set.
    pub fn spawn_sweepers(&self) {
        let Some(period) = self.settings.sweep_interval else {
            debug!(cluster = %self.name, "expiry sweeper disabled");
            return;
        };
        let mut sweepers = self.sweepers.lock();
        for node in self.nodes.values() {
            sweepers.push(ExpirySweeper::spawn(node.clone(), period, self.shutdown.subscribe()));
        }
    }

    /// Stop background tasks and wait for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let sweepers: Vec<ExpirySweeper> = self.sweepers.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(cluster = %self.name, error = %err, "background task failed");
            }
        }
        for sweeper in sweepers {
            sweeper.join().await;
        }
        info!(cluster = %self.name, "registry cluster stopped");
    }

    /// Restore every node from its snapshots and converge on the newest
    /// one. The supervisor's term moves past every recovered term so the
    /// first leader outranks anything written before the restart.
    fn recover(&self) -> Result<()> {
        let mut newest: Option<Arc<ClusterState>> = None;
        let mut highest_term = 0;
        for node in self.nodes.values() {
            let restored = node
                .store()
                .restore()
                .with_context(|| format!("unable to restore node '{}'", node.id()))?;
            if let Some(state) = restored {
                highest_term = highest_term.max(state.term);
                if newest.as_ref().map_or(true, |best| best.is_superseded_by(&state)) {
                    newest = Some(state);
                }
            }
        }
        let Some(state) = newest else {
            debug!(cluster = %self.name, "no persisted state to recover");
            return Ok(());
        };
        for node in self.nodes.values() {
            node.handle_publish(state.clone())?;
        }
        let term = self.supervisor.advance_term_past(highest_term);
        if let Some(leader) = self.leader() {
            leader.assume_leadership(term)?;
        }
        info!(
            cluster = %self.name,
            term = state.term,
            version = state.version,
            licenses = state.licenses.len(),
            "recovered persisted state"
        );
        Ok(())
    }

    fn catch_up(&self, node: &RegistryNode) -> Result<()> {
        let Some(leader) = self.leader() else {
            return Ok(());
        };
        if leader.id() == node.id() {
            return Ok(());
        }
        match node.handle_publish(leader.state()) {
            Err(RegistryError::StalePublication { local, published }) => {
                debug!(node = %node.id(), ?local, ?published, "node already ahead of leader");
                Ok(())
            }
            other => Ok(other?),
        }
    }

    fn observe_leadership(&self) {
        if let Some(metrics) = &self.election_metrics {
            metrics.observe_leader(self.supervisor.leader().as_deref(), self.supervisor.term());
        }
    }

    fn record_failover(&self, event: &FailoverEvent) {
        adopt_newest_state(&self.nodes, &self.transport, &event.activated_node, event.term);
        if let Some(metrics) = &self.election_metrics {
            metrics.observe_failover(event);
        }
    }
}

fn heartbeat_round<'a>(
    supervisor: &RedundancySupervisor,
    transport: &InMemoryTransport,
    node_ids: impl Iterator<Item = &'a String>,
    now: Instant,
) {
    for node_id in node_ids {
        if !transport.is_isolated(node_id) {
            supervisor.heartbeat(node_id, now);
        }
    }
}

/// Hand a freshly promoted leader the newest state held by any reachable
/// node and re-stamp it with the new `term`, so acknowledged writes survive
/// the failover and outrank anything the deposed leader committed alone.
fn adopt_newest_state(
    nodes: &IndexMap<String, Arc<RegistryNode>>,
    transport: &InMemoryTransport,
    leader_id: &str,
    term: u64,
) {
    let Some(leader) = nodes.get(leader_id) else {
        return;
    };
    let newest = nodes
        .values()
        .filter(|node| !transport.is_isolated(node.id()))
        .map(|node| node.state())
        .max_by_key(|state| state.key());
    if let Some(state) = newest {
        match leader.handle_publish(state) {
            Ok(()) | Err(RegistryError::StalePublication { .. }) => {}
            Err(err) => warn!(node = leader_id, error = %err, "new leader could not adopt newest state"),
        }
    }
    if let Err(err) = leader.assume_leadership(term) {
        warn!(node = leader_id, term, error = %err, "new leader could not re-stamp its state");
    }
}

