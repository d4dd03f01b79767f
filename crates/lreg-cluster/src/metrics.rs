//! ---
//! lreg_section: "03-cluster-registry"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Replicated license registry and coordinator actions."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::time::Duration;

use lreg_metrics::SharedRegistry;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

/// Prometheus handles for coordinator activity, labelled by node.
#[derive(Clone)]
pub struct RegistryMetrics {
    requests: IntCounterVec,
    cas_conflicts: IntCounterVec,
    publish_acks: IntCounterVec,
    state_version: IntGaugeVec,
    active_licenses: IntGaugeVec,
    request_latency: HistogramVec,
}

impl RegistryMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self, prometheus::Error> {
        let requests = IntCounterVec::new(
            Opts::new(
                "lreg_requests_total",
                "Coordinator requests by node, action and outcome",
            ),
            &["node", "action", "outcome"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let cas_conflicts = IntCounterVec::new(
            Opts::new(
                "lreg_cas_conflicts_total",
                "Compare-and-set attempts that observed a newer version",
            ),
            &["node"],
        )?;
        registry.register(Box::new(cas_conflicts.clone()))?;

        let publish_acks = IntCounterVec::new(
            Opts::new(
                "lreg_publish_acks_total",
                "Acknowledgements received for published cluster states",
            ),
            &["node"],
        )?;
        registry.register(Box::new(publish_acks.clone()))?;

        let state_version = IntGaugeVec::new(
            Opts::new(
                "lreg_state_version",
                "Version of the cluster state held by a node",
            ),
            &["node"],
        )?;
        registry.register(Box::new(state_version.clone()))?;

        let active_licenses = IntGaugeVec::new(
            Opts::new(
                "lreg_active_licenses",
                "Number of features licensed in a node's replicated state",
            ),
            &["node"],
        )?;
        registry.register(Box::new(active_licenses.clone()))?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "lreg_request_duration_seconds",
                "End-to-end latency of Put/Delete requests",
            )
            .buckets(prometheus::exponential_buckets(0.0005, 2.0, 14)?),
            &["action"],
        )?;
        registry.register(Box::new(request_latency.clone()))?;

        Ok(Self {
            requests,
            cas_conflicts,
            publish_acks,
            state_version,
            active_licenses,
            request_latency,
        })
    }

    pub fn record_request(&self, node: &str, action: &str, outcome: &str, elapsed: Duration) {
        self.requests
            .with_label_values(&[node, action, outcome])
            .inc();
        self.request_latency
            .with_label_values(&[action])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_cas_conflict(&self, node: &str) {
        self.cas_conflicts.with_label_values(&[node]).inc();
    }

    pub fn record_publish_acks(&self, node: &str, acks: usize) {
        self.publish_acks
            .with_label_values(&[node])
            .inc_by(acks as u64);
    }

    pub fn set_state(&self, node: &str, version: u64, licenses: usize) {
        self.state_version
            .with_label_values(&[node])
            .set(version as i64);
        self.active_licenses
            .with_label_values(&[node])
            .set(licenses as i64);
    }

    pub fn requests_total(&self, node: &str, action: &str, outcome: &str) -> u64 {
        self.requests
            .with_label_values(&[node, action, outcome])
            .get()
    }

    pub fn state_version(&self, node: &str) -> i64 {
        self.state_version.with_label_values(&[node]).get()
    }
}

impl std::fmt::Debug for RegistryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_requests_and_state() {
        let metrics = RegistryMetrics::new(lreg_metrics::new_registry()).unwrap();
        metrics.record_request("node-0", "put", "acknowledged", Duration::from_millis(3));
        metrics.set_state("node-0", 4, 1);
        assert_eq!(metrics.requests_total("node-0", "put", "acknowledged"), 1);
        assert_eq!(metrics.state_version("node-0"), 4);
    }
}
