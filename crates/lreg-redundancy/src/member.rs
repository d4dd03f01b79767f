//! ---
//! lreg_section: "05-leader-coordination"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Leader election and failover for registry nodes."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use lreg_common::config::{ClusterConfig, NodeConfig};

/// Identity and election parameters of one cluster member.
#[derive(Debug, Clone)]
pub struct MemberContext {
    pub cluster: String,
    pub node_id: String,
    pub leader_eligible: bool,
    /// Lower values win elections.
    pub priority: u32,
    pub heartbeat_interval: Duration,
    pub watchdog_timeout: Duration,
}

impl MemberContext {
    pub fn from_config(cluster: &ClusterConfig, node_id: &str, node: &NodeConfig) -> Self {
        Self {
            cluster: cluster.name.clone(),
            node_id: node_id.to_owned(),
            leader_eligible: node.leader_eligible,
            priority: node.priority,
            heartbeat_interval: cluster.heartbeat_interval,
            watchdog_timeout: cluster.watchdog_timeout,
        }
    }
}

/// Liveness bookkeeping the supervisor keeps per member.
#[derive(Debug, Clone)]
pub struct MemberRuntimeState {
    pub context: MemberContext,
    last_heartbeat: Option<Instant>,
    pub is_leader: bool,
    /// Set when the member was removed or timed out; cleared by a heartbeat.
    pub is_down: bool,
    failure_count: u32,
}

impl MemberRuntimeState {
    pub fn new(context: MemberContext) -> Self {
        Self {
            context,
            last_heartbeat: None,
            is_leader: false,
            is_down: false,
            failure_count: 0,
        }
    }

    pub fn record_heartbeat(&mut self, now: Instant) -> HeartbeatStatus {
        let status = match self.last_heartbeat {
            Some(previous) => {
                let delta = now.saturating_duration_since(previous);
                if delta <= self.context.heartbeat_interval + Duration::from_millis(50) {
                    HeartbeatStatus::OnTime
                } else {
                    HeartbeatStatus::Late(delta.saturating_sub(self.context.heartbeat_interval))
                }
            }
            None => HeartbeatStatus::OnTime,
        };
        self.last_heartbeat = Some(now);
        self.is_down = false;
        status
    }

    pub fn evaluate(&mut self, now: Instant) -> HeartbeatStatus {
        match self.last_heartbeat {
            Some(previous) => {
                let delta = now.saturating_duration_since(previous);
                if delta > self.context.watchdog_timeout {
                    self.failure_count += 1;
                    HeartbeatStatus::Missing(delta - self.context.watchdog_timeout)
                } else {
                    HeartbeatStatus::OnTime
                }
            }
            None => {
                self.failure_count += 1;
                HeartbeatStatus::Missing(self.context.watchdog_timeout)
            }
        }
    }

    /// Whether the member may be promoted at `now`.
    ///
    /// A member that has never sent a heartbeat is a candidate until it is
    /// explicitly marked down.
    pub fn is_candidate(&self, now: Instant) -> bool {
        if !self.context.leader_eligible || self.is_down {
            return false;
        }
        match self.last_heartbeat {
            Some(previous) => {
                now.saturating_duration_since(previous) <= self.context.watchdog_timeout
            }
            None => true,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Result of a heartbeat evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeartbeatStatus {
    OnTime,
    Late(Duration),
    Missing(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(eligible: bool) -> MemberContext {
        MemberContext {
            cluster: "test".into(),
            node_id: "node-0".into(),
            leader_eligible: eligible,
            priority: 0,
            heartbeat_interval: Duration::from_millis(10),
            watchdog_timeout: Duration::from_millis(20),
        }
    }

    #[test]
    fn late_and_missing_heartbeats() {
        let mut state = MemberRuntimeState::new(context(true));
        let start = Instant::now();
        assert_eq!(state.record_heartbeat(start), HeartbeatStatus::OnTime);
        assert!(matches!(
            state.record_heartbeat(start + Duration::from_millis(100)),
            HeartbeatStatus::Late(_)
        ));
        assert!(matches!(
            state.evaluate(start + Duration::from_millis(200)),
            HeartbeatStatus::Missing(_)
        ));
        assert_eq!(state.failure_count(), 1);
    }

    #[test]
    fn ineligible_member_is_never_a_candidate() {
        let state = MemberRuntimeState::new(context(false));
        assert!(!state.is_candidate(Instant::now()));
    }

    #[test]
    fn stale_member_stops_being_a_candidate() {
        let mut state = MemberRuntimeState::new(context(true));
        let start = Instant::now();
        assert!(state.is_candidate(start));
        state.record_heartbeat(start);
        assert!(!state.is_candidate(start + Duration::from_millis(50)));
        state.is_down = true;
        assert!(!state.is_candidate(start));
    }
}
