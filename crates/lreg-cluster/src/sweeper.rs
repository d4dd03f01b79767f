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
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::node::RegistryNode;

/// Periodically removes expired licenses from the replicated state.
///
/// Runs on every node but only acts while its node is the leader, so the
/// removal travels through the normal CAS + publish path.
#[derive(Debug)]
pub struct ExpirySweeper {
    node_id: String,
    task: JoinHandle<()>,
}

impl ExpirySweeper {
    pub fn spawn(
        node: Arc<RegistryNode>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let node_id = node.id().to_owned();
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(node = %node.id(), "expiry sweeper shutdown");
                        break;
                    }
                    _ = ticker.tick() => {
                        match node.sweep_once().await {
                            Ok(Some(version)) => debug!(node = %node.id(), version, "expiry sweep complete"),
                            Ok(None) => {}
                            Err(err) => warn!(node = %node.id(), code = %err.code(), error = %err, "expiry sweep failed"),
                        }
                    }
                }
            }
        });
        Self { node_id, task }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Wait for the sweeper to stop after shutdown was signalled.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(node = %self.node_id, error = %err, "expiry sweeper task failed");
        }
    }
}
