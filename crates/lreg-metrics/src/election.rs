//! ---
//! lreg_section: "06-observability"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Metrics collection and export utilities."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use lreg_redundancy::FailoverEvent;
use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Leadership as seen by the supervisor of one cluster. Every series
/// carries the cluster name as a constant label.
#[derive(Clone, Debug)]
pub struct ElectionMetrics {
    members: Vec<String>,
    leader: IntGaugeVec,
    term: IntGauge,
    failovers: IntCounterVec,
}

impl ElectionMetrics {
    pub fn new(registry: &Registry, cluster: &str, members: &[String]) -> prometheus::Result<Self> {
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("cluster", cluster);

        let member_count = IntGauge::with_opts(opts(
            "lreg_cluster_members",
            "Nodes registered with the leader election supervisor",
        ))?;
        registry.register(Box::new(member_count.clone()))?;
        member_count.set(members.len() as i64);

        let leader = IntGaugeVec::new(
            opts("lreg_cluster_leader", "1 for the node currently holding leadership"),
            &["node"],
        )?;
        registry.register(Box::new(leader.clone()))?;

        let term = IntGauge::with_opts(opts("lreg_leader_term", "Current leadership term"))?;
        registry.register(Box::new(term.clone()))?;

        let failovers = IntCounterVec::new(
            opts("lreg_failovers_total", "Leader promotions by promoted node and reason"),
            &["node", "reason"],
        )?;
        registry.register(Box::new(failovers.clone()))?;

        Ok(Self {
            members: members.to_vec(),
            leader,
            term,
            failovers,
        })
    }

    /// Publish the current leader (if any) and its term.
    pub fn observe_leader(&self, leader: Option<&str>, term: u64) {
        for member in &self.members {
            let holds = leader == Some(member.as_str());
            self.leader.with_label_values(&[member.as_str()]).set(i64::from(holds));
        }
        self.term.set(term as i64);
    }

    pub fn observe_failover(&self, event: &FailoverEvent) {
        self.failovers
            .with_label_values(&[event.activated_node.as_str(), event.reason.as_ref()])
            .inc();
        self.observe_leader(Some(event.activated_node.as_str()), event.term);
    }
}
