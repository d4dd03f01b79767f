//! ---
//! lreg_section: "03-cluster-registry"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Replicated license registry and coordinator actions."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use lreg_common::time::{format_millis, Clock};
use lreg_licensing::{logging as license_log, LicenseSet, VerifyError};
use lreg_redundancy::RedundancySupervisor;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::actions::{
    DeleteRequest, DeleteResponse, ForwardedRequest, GetResponse, Mutation, MutationResponse,
    PutRequest, PutResponse, RequestPhase, RequestTrace,
};
use crate::error::{RegistryError, RegistryResult, StoreError};
use crate::metrics::RegistryMetrics;
use crate::settings::RegistrySettings;
use crate::state::ClusterState;
use crate::store::{CasOutcome, LicenseStore};
use crate::transport::ClusterTransport;

/// One member of the registry cluster.
///
/// Any node accepts Put/Delete and forwards them to the current leader; only
/// the leader mutates its [`LicenseStore`] and publishes the result. Get is
/// served from the local replica.
pub struct RegistryNode {
    id: String,
    settings: Arc<RegistrySettings>,
    store: LicenseStore,
    supervisor: Arc<RedundancySupervisor>,
    transport: Arc<dyn ClusterTransport>,
    clock: Arc<dyn Clock>,
    metrics: Option<RegistryMetrics>,
    ready: AtomicBool,
}

impl std::fmt::Debug for RegistryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryNode")
            .field("id", &self.id)
            .field("transport", &self.transport.name())
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl RegistryNode {
    pub fn new(
        id: impl Into<String>,
        settings: Arc<RegistrySettings>,
        store: LicenseStore,
        supervisor: Arc<RedundancySupervisor>,
        transport: Arc<dyn ClusterTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: id.into(),
            settings,
            store,
            supervisor,
            transport,
            clock,
            metrics: None,
            ready: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: RegistryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &LicenseStore {
        &self.store
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.store.snapshot()
    }

    pub fn is_leader(&self) -> bool {
        self.supervisor.is_leader(&self.id)
    }

    /// Whether recovery finished and mutations are accepted.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.observe_state();
    }

    /// Install signed licenses cluster-wide.
    pub async fn put(&self, request: PutRequest) -> RegistryResult<PutResponse> {
        let response = self.submit(Mutation::Put(request)).await?;
        Ok(PutResponse {
            acknowledged: response.acknowledged,
            version: response.version,
        })
    }

    /// Active licenses from the local replica, expiry-filtered now.
    pub fn get(&self) -> GetResponse {
        let started = Instant::now();
        let state = self.store.snapshot();
        let licenses = LicenseSet::builder()
            .at(self.clock.now_millis())
            .licenses(&state.licenses)
            .build();
        if let Some(metrics) = &self.metrics {
            metrics.record_request(&self.id, "get", "ok", started.elapsed());
        }
        GetResponse {
            licenses,
            version: state.version,
        }
    }

    /// Revoke licenses cluster-wide. Succeeds even when nothing matched.
    pub async fn delete(&self, request: DeleteRequest) -> RegistryResult<DeleteResponse> {
        let response = self.submit(Mutation::Delete(request)).await?;
        Ok(DeleteResponse {
            acknowledged: response.acknowledged,
            version: response.version,
        })
    }

    /// Drop expired licenses from the replicated state. Does nothing unless
    /// this node is the ready leader; returns the resulting version otherwise.
    pub async fn sweep_once(&self) -> RegistryResult<Option<u64>> {
        if !self.is_ready() || !self.is_leader() {
            return Ok(None);
        }
        let mut trace = RequestTrace::new("sweep");
        let response = match timeout(
            self.settings.request_timeout,
            self.lead(&mut trace, Mutation::Sweep),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(RegistryError::Timeout(self.settings.request_timeout)),
        };
        Ok(Some(response.version))
    }

    /// Leader side of a forwarded mutation.
    pub async fn handle_forwarded(&self, request: ForwardedRequest) -> RegistryResult<MutationResponse> {
        let mut trace = RequestTrace::with_id(request.request_id, request.mutation.action());
        trace.advance(RequestPhase::ForwardedToLeader);
        debug!(node = %self.id, origin = %request.origin, request = %trace.id, action = trace.action, "received forwarded mutation");
        self.lead(&mut trace, request.mutation).await
    }

    /// Follower side of a publication. States ordered before the local one
    /// are refused, so a deposed leader never collects acknowledgements.
    pub fn handle_publish(&self, state: Arc<ClusterState>) -> RegistryResult<()> {
        let (term, version) = state.key();
        let adopted = self
            .store
            .apply_published(state)
            .map_err(|err| self.store_failure(err))?;
        if adopted {
            debug!(node = %self.id, term, version, "adopted published state");
            self.observe_state();
        }
        Ok(())
    }

    /// Take over the replicated state under a newly won `term`.
    pub fn assume_leadership(&self, term: u64) -> RegistryResult<Arc<ClusterState>> {
        let state = self
            .store
            .assume_term(term)
            .map_err(|err| self.store_failure(err))?;
        info!(node = %self.id, term, version = state.version, "assumed leadership");
        Ok(state)
    }

    async fn submit(&self, mutation: Mutation) -> RegistryResult<MutationResponse> {
        let started = Instant::now();
        let mut trace = RequestTrace::new(mutation.action());

        let outcome = if !self.is_ready() {
            Err(RegistryError::NoLeader)
        } else {
            match timeout(self.settings.request_timeout, self.route(&mut trace, mutation)).await {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Timeout(self.settings.request_timeout)),
            }
        };

        let label = match &outcome {
            Ok(response) => {
                trace.phase = response.phase;
                debug!(node = %self.id, request = %trace, version = response.version, "request acknowledged");
                "acknowledged".to_owned()
            }
            Err(err) => {
                warn!(node = %self.id, request = %trace, code = %err.code(), error = %err, "request failed");
                err.code().to_string()
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_request(&self.id, trace.action, &label, started.elapsed());
        }
        outcome
    }

    /// Resolve the leader and hand it the mutation, re-resolving while the
    /// leader is unreachable or changing.
    async fn route(
        &self,
        trace: &mut RequestTrace,
        mutation: Mutation,
    ) -> RegistryResult<MutationResponse> {
        loop {
            let leader = self.supervisor.leader().ok_or(RegistryError::NoLeader)?;
            let result = if leader == self.id {
                self.lead(trace, mutation.clone()).await
            } else {
                trace.advance(RequestPhase::ForwardedToLeader);
                let request = ForwardedRequest {
                    request_id: trace.id,
                    origin: self.id.clone(),
                    mutation: mutation.clone(),
                };
                self.transport.forward(&self.id, &leader, request).await
            };
            match result {
                Err(err) if err.is_rerouteable() => {
                    debug!(node = %self.id, leader = %leader, error = %err, "leader unavailable; retrying");
                    sleep(self.settings.retry_interval).await;
                }
                other => return other,
            }
        }
    }

    async fn lead(
        &self,
        trace: &mut RequestTrace,
        mutation: Mutation,
    ) -> RegistryResult<MutationResponse> {
        let Some(term) = self.supervisor.leader_term(&self.id) else {
            return Err(RegistryError::NotLeader(self.id.clone()));
        };
        if !self.is_ready() {
            return Err(RegistryError::NoLeader);
        }

        if let Err(err) = self.validate(&mutation) {
            trace.advance(RequestPhase::Rejected);
            warn!(node = %self.id, request = %trace, code = %err.code(), error = %err, "mutation rejected");
            return Err(err);
        }
        trace.advance(RequestPhase::Validated);

        let outcome = self.commit_with(trace, term, |current| {
            self.next_licenses(current, &mutation, self.clock.now_millis())
        })?;
        trace.advance(RequestPhase::Applied);

        if outcome.changed {
            let acks = self.publish(outcome.state.clone()).await?;
            trace.advance(RequestPhase::Published);
            info!(
                node = %self.id,
                request = %trace.id,
                action = trace.action,
                version = outcome.state.version,
                licenses = outcome.state.licenses.len(),
                acks,
                "state published"
            );
        }
        trace.advance(RequestPhase::Acknowledged);
        Ok(MutationResponse {
            acknowledged: true,
            version: outcome.state.version,
            phase: trace.phase,
        })
    }

    fn validate(&self, mutation: &Mutation) -> RegistryResult<()> {
        let Mutation::Put(request) = mutation else {
            return Ok(());
        };
        if request.documents().is_empty() {
            return Err(RegistryError::MalformedDocument(
                "put request carries no license".to_owned(),
            ));
        }
        let now = self.clock.now_millis();
        for document in request.documents() {
            if let Err(err) = document.validate() {
                license_log::record_license_rejected(&document.uid, "MALFORMED");
                return Err(RegistryError::MalformedDocument(err.to_string()));
            }
            if document.is_expired_at(now) {
                license_log::record_license_rejected(&document.uid, "EXPIRED");
                return Err(RegistryError::MalformedDocument(format!(
                    "license '{}' expired at {}",
                    document.uid,
                    format_millis(document.expiry_date)
                )));
            }
            if let Err(reason) = self.settings.verifier.verify(document) {
                license_log::record_license_rejected(&document.uid, reason.reason());
                return Err(match reason {
                    VerifyError::Malformed(detail) => RegistryError::MalformedDocument(detail),
                    reason => RegistryError::InvalidSignature {
                        uid: document.uid.clone(),
                        reason,
                    },
                });
            }
        }
        for document in request.documents() {
            license_log::record_license_accepted(document);
        }
        Ok(())
    }

    /// Bounded compare-and-set loop. `next` derives the new set from the
    /// state read at the start of each attempt, outside the store's commit
    /// lock, so a publication landing in between forces another attempt.
    fn commit_with<F>(&self, trace: &mut RequestTrace, term: u64, mut next: F) -> RegistryResult<CasOutcome>
    where
        F: FnMut(&LicenseSet) -> LicenseSet,
    {
        let attempts = self.settings.cas_max_retries;
        for attempt in 1..=attempts {
            let current = self.store.snapshot();
            let licenses = next(&current.licenses);
            match self.store.compare_and_set(current.version, term, licenses) {
                Ok(outcome) => return Ok(outcome),
                Err(StoreError::Conflict { expected, actual }) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cas_conflict(&self.id);
                    }
                    debug!(node = %self.id, request = %trace.id, attempt, expected, actual, "compare-and-set conflict");
                    trace.advance(RequestPhase::Validated);
                }
                Err(err) => return Err(self.store_failure(err)),
            }
        }
        Err(RegistryError::ConflictExceeded { attempts })
    }

    fn next_licenses(&self, current: &LicenseSet, mutation: &Mutation, now: i64) -> LicenseSet {
        match mutation {
            Mutation::Put(request) => LicenseSet::builder()
                .verified_by(&self.settings.verifier)
                .at(now)
                .licenses(current)
                .add_all(request.documents().iter().cloned())
                .build(),
            Mutation::Delete(request) => LicenseSet::builder()
                .at(now)
                .add_all(current.iter().filter(|doc| !request.matches(doc)).cloned())
                .build(),
            Mutation::Sweep => LicenseSet::builder().at(now).licenses(current).build(),
        }
    }

    /// Fan `state` out to every other member until a quorum (this node
    /// included) has acknowledged. Unacknowledged peers are retried for as
    /// long as this node still leads the term `state` was committed under.
    async fn publish(&self, state: Arc<ClusterState>) -> RegistryResult<usize> {
        self.observe_state();
        let quorum = self.settings.quorum;
        let mut acked: HashSet<String> = HashSet::from([self.id.clone()]);

        while acked.len() < quorum {
            if self.supervisor.leader_term(&self.id) != Some(state.term) {
                return Err(RegistryError::NotLeader(self.id.clone()));
            }
            let mut deliveries: FuturesUnordered<_> = self
                .supervisor
                .members()
                .into_iter()
                .filter(|member| !acked.contains(member))
                .map(|peer| {
                    let transport = self.transport.clone();
                    let from = self.id.clone();
                    let state = state.clone();
                    tokio::spawn(async move {
                        let result = transport.publish(&from, &peer, state).await;
                        (peer, result)
                    })
                })
                .collect();

            while let Some(joined) = deliveries.next().await {
                match joined {
                    Ok((peer, Ok(()))) => {
                        acked.insert(peer);
                    }
                    Ok((peer, Err(err))) => {
                        debug!(node = %self.id, peer = %peer, version = state.version, error = %err, "publication not acknowledged");
                    }
                    Err(err) => warn!(node = %self.id, error = %err, "publication task failed"),
                }
                if acked.len() >= quorum {
                    break;
                }
            }
            if acked.len() < quorum {
                sleep(self.settings.retry_interval).await;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_publish_acks(&self.id, acked.len());
        }
        Ok(acked.len())
    }

    fn observe_state(&self) {
        if let Some(metrics) = &self.metrics {
            let state = self.store.snapshot();
            metrics.set_state(&self.id, state.version, state.licenses.len());
        }
    }

    fn store_failure(&self, err: StoreError) -> RegistryError {
        match err {
            StoreError::Persistence(err) => RegistryError::Storage(err),
            StoreError::Conflict { .. } => RegistryError::ConflictExceeded { attempts: 1 },
            StoreError::Deposed { .. } => RegistryError::NotLeader(self.id.clone()),
            StoreError::Stale { local, published } => {
                RegistryError::StalePublication { local, published }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::transport::InMemoryTransport;
    use lreg_common::config::ClusterConfig;
    use lreg_common::time::ManualClock;
    use lreg_testharness::TestSigner;

    fn lone_node(cas_max_retries: u32) -> RegistryNode {
        let mut config = ClusterConfig::with_nodes("cas", 1);
        config.cas_max_retries = cas_max_retries;
        let settings = Arc::new(RegistrySettings::new(&config, TestSigner::default().verifier()));
        RegistryNode::new(
            "node-0",
            settings,
            LicenseStore::new("node-0", "cas"),
            Arc::new(RedundancySupervisor::new("cas")),
            Arc::new(InMemoryTransport::new()),
            Arc::new(ManualClock::at_date("2015-01-01").unwrap()),
        )
    }

    /// Simulates a publication landing between the read and the write.
    fn bump_version(node: &RegistryNode) {
        let state = node.state();
        let bumped = state.next(state.licenses.clone(), state.term);
        node.store().apply_published(Arc::new(bumped)).unwrap();
    }

    #[test]
    fn persistent_conflicts_exhaust_retries() {
        let node = lone_node(2);
        let mut trace = RequestTrace::new("put");
        let mut calls = 0;
        let err = node
            .commit_with(&mut trace, 1, |current| {
                calls += 1;
                bump_version(&node);
                current.clone()
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::ConflictExceeded { attempts: 2 }));
        assert_eq!(err.code(), ErrorCode::ConflictExceeded);
        assert!(err.is_transient());
        assert_eq!(calls, 2);
        assert_eq!(node.state().version, 2);
    }

    #[test]
    fn conflict_is_retried_against_fresh_state() {
        let node = lone_node(3);
        let mut trace = RequestTrace::new("put");
        let mut calls = 0;
        let outcome = node
            .commit_with(&mut trace, 1, |current| {
                calls += 1;
                if calls == 1 {
                    bump_version(&node);
                }
                current.clone()
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert!(!outcome.changed);
        assert_eq!(outcome.state.version, 1);
    }

    #[test]
    fn commit_from_an_older_term_is_refused() {
        let node = lone_node(3);
        node.store().assume_term(5).unwrap();
        let mut trace = RequestTrace::new("sweep");
        let err = node
            .commit_with(&mut trace, 4, |current| current.clone())
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotLeader(ref id) if id == "node-0"));
    }
}
