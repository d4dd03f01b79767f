//! ---
//! lreg_section: "05-leader-coordination"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Leader election and failover for registry nodes."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use strum::AsRefStr;
use tracing::{debug, info, warn};

use crate::member::{HeartbeatStatus, MemberContext, MemberRuntimeState};

#[derive(Debug)]
struct SupervisorInner {
    leader: Option<String>,
    /// Incremented on every activation; never reused within one supervisor.
    term: u64,
    members: HashMap<String, MemberRuntimeState>,
}

/// Elects one leader among the leader-eligible members of a cluster and
/// mediates failover when it stops heartbeating.
#[derive(Debug)]
pub struct RedundancySupervisor {
    cluster: String,
    inner: Mutex<SupervisorInner>,
}

impl RedundancySupervisor {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            inner: Mutex::new(SupervisorInner {
                leader: None,
                term: 0,
                members: HashMap::new(),
            }),
        }
    }

    /// Add or refresh a member. An eligible member takes leadership if there
    /// is no leader yet or it outranks the current one.
    pub fn register(&self, context: MemberContext) -> Option<FailoverEvent> {
        let mut inner = self.inner.lock();
        let node_id = context.node_id.clone();
        let should_lead = context.leader_eligible
            && match inner.leader.as_ref() {
                None => true,
                Some(leader) if leader == &node_id => true,
                Some(leader) => inner
                    .members
                    .get(leader)
                    .map(|state| context_cmp(&context, &state.context) == Ordering::Less)
                    .unwrap_or(true),
            };

        match inner.members.get_mut(&node_id) {
            Some(state) => state.context = context,
            None => {
                inner
                    .members
                    .insert(node_id.clone(), MemberRuntimeState::new(context));
            }
        }
        debug!(cluster = %self.cluster, node = %node_id, "registered member");

        if should_lead && inner.leader.as_deref() != Some(node_id.as_str()) {
            return Some(self.activate_locked(&mut inner, &node_id, FailoverReason::Startup));
        }
        None
    }

    pub fn heartbeat(&self, node_id: &str, now: Instant) -> HeartbeatStatus {
        let mut inner = self.inner.lock();
        let Some(state) = inner.members.get_mut(node_id) else {
            warn!(cluster = %self.cluster, node = node_id, "received heartbeat for unknown member");
            return HeartbeatStatus::Missing(Default::default());
        };
        let status = state.record_heartbeat(now);
        if inner.leader.as_deref() != Some(node_id) {
            debug!(cluster = %self.cluster, node = node_id, "heartbeat from standby");
        }
        status
    }

    /// Current leader, if any.
    pub fn leader(&self) -> Option<String> {
        self.inner.lock().leader.clone()
    }

    pub fn is_leader(&self, node_id: &str) -> bool {
        self.inner.lock().leader.as_deref() == Some(node_id)
    }

    /// Current leadership term.
    pub fn term(&self) -> u64 {
        self.inner.lock().term
    }

    /// The term `node_id` leads under, or `None` if it is not the leader.
    pub fn leader_term(&self, node_id: &str) -> Option<u64> {
        let inner = self.inner.lock();
        (inner.leader.as_deref() == Some(node_id)).then_some(inner.term)
    }

    /// Move the current term past `seen`, e.g. a term recovered from disk.
    /// Returns the resulting term.
    pub fn advance_term_past(&self, seen: u64) -> u64 {
        let mut inner = self.inner.lock();
        if inner.term <= seen {
            inner.term = seen + 1;
            debug!(cluster = %self.cluster, term = inner.term, "term advanced past recovered state");
        }
        inner.term
    }

    /// Registered member ids.
    pub fn members(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut members: Vec<String> = inner.members.keys().cloned().collect();
        members.sort();
        members
    }

    /// Evaluate leader liveness and promote a standby if required.
    pub fn evaluate(&self, now: Instant) -> Option<FailoverEvent> {
        let mut inner = self.inner.lock();
        let Some(leader_id) = inner.leader.clone() else {
            return self.promote_next_locked(&mut inner, now, FailoverReason::Startup, None);
        };

        let Some(leader) = inner.members.get_mut(&leader_id) else {
            return self.promote_next_locked(
                &mut inner,
                now,
                FailoverReason::Missing,
                Some(leader_id.as_str()),
            );
        };

        match leader.evaluate(now) {
            HeartbeatStatus::Missing(_) => {
                warn!(cluster = %self.cluster, node = %leader_id, "leader heartbeat missing; initiating failover");
                leader.is_leader = false;
                self.promote_next_locked(
                    &mut inner,
                    now,
                    FailoverReason::HeartbeatTimeout,
                    Some(leader_id.as_str()),
                )
            }
            HeartbeatStatus::Late(delay) => {
                debug!(cluster = %self.cluster, node = %leader_id, delay_ms = delay.as_millis() as u64, "late heartbeat");
                None
            }
            HeartbeatStatus::OnTime => None,
        }
    }

    /// Mark a member unreachable. If it was the leader, a standby is promoted.
    pub fn mark_down(&self, node_id: &str, now: Instant) -> Option<FailoverEvent> {
        let mut inner = self.inner.lock();
        let state = inner.members.get_mut(node_id)?;
        state.is_down = true;
        state.is_leader = false;
        info!(cluster = %self.cluster, node = node_id, "member marked down");
        if inner.leader.as_deref() == Some(node_id) {
            return self.promote_next_locked(&mut inner, now, FailoverReason::Missing, Some(node_id));
        }
        None
    }

    /// Hand leadership to `node_id` if it is a live eligible member.
    pub fn promote(&self, node_id: &str, now: Instant) -> Option<FailoverEvent> {
        let mut inner = self.inner.lock();
        let eligible = inner
            .members
            .get(node_id)
            .is_some_and(|state| state.is_candidate(now));
        if !eligible {
            warn!(cluster = %self.cluster, node = node_id, "manual promotion refused");
            return None;
        }
        if inner.leader.as_deref() == Some(node_id) {
            return None;
        }
        Some(self.activate_locked(&mut inner, node_id, FailoverReason::Manual))
    }

    fn promote_next_locked(
        &self,
        inner: &mut SupervisorInner,
        now: Instant,
        reason: FailoverReason,
        exclude: Option<&str>,
    ) -> Option<FailoverEvent> {
        let Some((next_id, _)) = inner
            .members
            .iter()
            .filter(|(id, state)| {
                !state.is_leader
                    && state.is_candidate(now)
                    && exclude.map_or(true, |ex| id.as_str() != ex)
            })
            .min_by(|(a_id, a), (b_id, b)| context_cmp(&a.context, &b.context).then(a_id.cmp(b_id)))
        else {
            warn!(cluster = %self.cluster, "no leader-eligible member available for promotion");
            inner.leader = None;
            return None;
        };
        let next_id = next_id.clone();
        Some(self.activate_locked(inner, &next_id, reason))
    }

    fn activate_locked(
        &self,
        inner: &mut SupervisorInner,
        node_id: &str,
        reason: FailoverReason,
    ) -> FailoverEvent {
        inner.term += 1;
        let previous = inner.leader.replace(node_id.to_owned());
        if let Some(previous_id) = previous.as_deref() {
            if let Some(state) = inner.members.get_mut(previous_id) {
                state.is_leader = false;
            }
        }
        if let Some(next) = inner.members.get_mut(node_id) {
            next.is_leader = true;
        }
        let event = FailoverEvent {
            cluster: self.cluster.clone(),
            activated_node: node_id.to_owned(),
            previous_leader: previous,
            term: inner.term,
            triggered_at: Utc::now(),
            reason,
        };
        info!(cluster = %event.cluster, node = %event.activated_node, term = event.term, ?reason, "leader promoted");
        event
    }
}

fn context_cmp(a: &MemberContext, b: &MemberContext) -> Ordering {
    a.priority.cmp(&b.priority)
}

/// Emitted whenever leadership changes hands.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverEvent {
    pub cluster: String,
    pub activated_node: String,
    pub previous_leader: Option<String>,
    /// Term the activated node leads under.
    pub term: u64,
    pub triggered_at: DateTime<Utc>,
    pub reason: FailoverReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailoverReason {
    Startup,
    Manual,
    HeartbeatTimeout,
    Missing,
}
