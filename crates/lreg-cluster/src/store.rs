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

use lreg_licensing::LicenseSet;
use lreg_persistence::SnapshotStore;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::state::ClusterState;

/// Result of a successful compare-and-set.
#[derive(Debug, Clone)]
pub struct CasOutcome {
    pub state: Arc<ClusterState>,
    /// `false` when the mutation returned the current set unchanged.
    pub changed: bool,
}

/// One node's copy of the replicated [`ClusterState`].
///
/// Readers take the current `Arc` under a short read lock and never wait on
/// I/O. Writers are serialised by a separate commit lock, persist the new
/// state, and only then swap it in. The commit lock also guards the last
/// snapshot sequence so file order follows adoption order, not version.
#[derive(Debug)]
pub struct LicenseStore {
    node_id: String,
    current: RwLock<Arc<ClusterState>>,
    commit: Mutex<u64>,
    snapshots: Option<SnapshotStore>,
}

impl LicenseStore {
    pub fn new(node_id: impl Into<String>, cluster_name: &str) -> Self {
        Self {
            node_id: node_id.into(),
            current: RwLock::new(Arc::new(ClusterState::empty(cluster_name))),
            commit: Mutex::new(0),
            snapshots: None,
        }
    }

    /// Persist every accepted state through `snapshots`.
    #[must_use]
    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Current state, shared.
    pub fn snapshot(&self) -> Arc<ClusterState> {
        self.current.read().clone()
    }

    /// Current license set and version.
    pub fn current_version(&self) -> (LicenseSet, u64) {
        let state = self.snapshot();
        (state.licenses.clone(), state.version)
    }

    /// Install `licenses` under `term` if the store is still at
    /// `expected_version`.
    ///
    /// A set equal to the current one commits nothing and leaves the
    /// version as is.
    pub fn compare_and_set(
        &self,
        expected_version: u64,
        term: u64,
        licenses: LicenseSet,
    ) -> Result<CasOutcome, StoreError> {
        let mut sequence = self.commit.lock();
        let current = self.snapshot();
        if current.term > term {
            return Err(StoreError::Deposed {
                term,
                current: current.term,
            });
        }
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        if licenses == current.licenses {
            debug!(node = %self.node_id, version = current.version, "mutation is a no-op");
            return Ok(CasOutcome {
                state: current,
                changed: false,
            });
        }
        let next = Arc::new(current.next(licenses, term));
        self.persist(&mut sequence, &next)?;
        *self.current.write() = next.clone();
        debug!(node = %self.node_id, term, version = next.version, "state committed");
        Ok(CasOutcome {
            state: next,
            changed: true,
        })
    }

    /// Adopt a state published by a leader if it orders after ours.
    ///
    /// Returns whether the state was adopted; re-delivery of the current
    /// state is acknowledged without effect, an older one is refused.
    pub fn apply_published(&self, state: Arc<ClusterState>) -> Result<bool, StoreError> {
        let mut sequence = self.commit.lock();
        let current = self.snapshot();
        if current.key() == state.key() {
            return Ok(false);
        }
        if !current.is_superseded_by(&state) {
            debug!(
                node = %self.node_id,
                local = ?current.key(),
                published = ?state.key(),
                "refusing stale publication"
            );
            return Err(StoreError::Stale {
                local: current.key(),
                published: state.key(),
            });
        }
        self.persist(&mut sequence, &state)?;
        *self.current.write() = state;
        Ok(true)
    }

    /// Re-stamp the current state with a newer leader `term`, leaving the
    /// version and licenses untouched. Returns the resulting state.
    pub fn assume_term(&self, term: u64) -> Result<Arc<ClusterState>, StoreError> {
        let mut sequence = self.commit.lock();
        let current = self.snapshot();
        if current.term >= term {
            return Ok(current);
        }
        let stamped = Arc::new(current.with_term(term));
        self.persist(&mut sequence, &stamped)?;
        *self.current.write() = stamped.clone();
        debug!(node = %self.node_id, term, version = stamped.version, "state re-stamped");
        Ok(stamped)
    }

    /// Load the newest intact snapshot into memory. Returns the restored
    /// state, or `None` when nothing was persisted yet.
    pub fn restore(&self) -> Result<Option<Arc<ClusterState>>, StoreError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(None);
        };
        let mut sequence = self.commit.lock();
        let Some((state, path)) = snapshots.load_latest::<ClusterState>()? else {
            return Ok(None);
        };
        if let Some(restored) = SnapshotStore::sequence_of(&path) {
            *sequence = restored;
        }
        let state = Arc::new(state);
        info!(
            node = %self.node_id,
            term = state.term,
            version = state.version,
            path = %path.display(),
            "restored state from snapshot"
        );
        *self.current.write() = state.clone();
        Ok(Some(state))
    }

    fn persist(&self, sequence: &mut u64, state: &ClusterState) -> Result<(), StoreError> {
        if let Some(snapshots) = &self.snapshots {
            snapshots.write(*sequence + 1, state)?;
            *sequence += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lreg_licensing::FeatureType;
    use lreg_testharness::{FeatureAttributes, TestSigner};
    use tempfile::tempdir;

    fn shield_set() -> LicenseSet {
        let signer = TestSigner::default();
        let document = signer
            .license(&FeatureAttributes::new(FeatureType::Shield, 2, "2014-12-13", "2015-12-13").with_uid("shield-1"))
            .unwrap();
        LicenseSet::builder()
            .at(1_420_070_400_000)
            .add(document)
            .build()
    }

    #[test]
    fn compare_and_set_advances_version() {
        let store = LicenseStore::new("node-0", "lreg");
        let outcome = store.compare_and_set(0, 1, shield_set()).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.state.version, 1);
        assert_eq!(store.current_version().1, 1);
    }

    #[test]
    fn stale_expected_version_conflicts() {
        let store = LicenseStore::new("node-0", "lreg");
        store.compare_and_set(0, 1, shield_set()).unwrap();
        let err = store.compare_and_set(0, 1, LicenseSet::empty()).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, actual: 1 }));
        assert_eq!(store.current_version().0.len(), 1);
    }

    #[test]
    fn unchanged_set_does_not_bump_version() {
        let store = LicenseStore::new("node-0", "lreg");
        let outcome = store.compare_and_set(0, 1, LicenseSet::empty()).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.state.version, 0);
    }

    #[test]
    fn followers_refuse_stale_publications() {
        let store = LicenseStore::new("node-1", "lreg");
        let v2 = Arc::new(ClusterState::empty("lreg").next(shield_set(), 1).next(shield_set(), 1));
        let v1 = Arc::new(ClusterState::empty("lreg").next(LicenseSet::empty(), 1));
        assert!(store.apply_published(v2.clone()).unwrap());
        assert!(!store.apply_published(v2.clone()).unwrap());
        let err = store.apply_published(v1).unwrap_err();
        assert!(matches!(err, StoreError::Stale { local: (1, 2), published: (1, 1) }));
        assert_eq!(store.snapshot(), v2);
    }

    #[test]
    fn newer_term_replaces_same_version() {
        let store = LicenseStore::new("node-0", "lreg");
        store.compare_and_set(0, 1, shield_set()).unwrap();
        let successor = Arc::new(ClusterState::empty("lreg").next(LicenseSet::empty(), 2));
        assert!(store.apply_published(successor.clone()).unwrap());
        assert_eq!(store.snapshot(), successor);

        let err = store.compare_and_set(1, 1, shield_set()).unwrap_err();
        assert!(matches!(err, StoreError::Deposed { term: 1, current: 2 }));
    }

    #[test]
    fn assume_term_keeps_content() {
        let store = LicenseStore::new("node-0", "lreg");
        store.compare_and_set(0, 1, shield_set()).unwrap();
        let stamped = store.assume_term(4).unwrap();
        assert_eq!(stamped.key(), (4, 1));
        assert_eq!(stamped.licenses, shield_set());
        assert_eq!(store.assume_term(2).unwrap().key(), (4, 1));
    }

    #[test]
    fn restore_prefers_last_adopted_over_higher_version() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path(), "node-0", 5).unwrap();
        let store = LicenseStore::new("node-0", "lreg").with_snapshots(snapshots.clone());
        store.compare_and_set(0, 1, shield_set()).unwrap();
        store.compare_and_set(1, 1, LicenseSet::empty()).unwrap();
        let successor = Arc::new(ClusterState::empty("lreg").next(shield_set(), 2));
        store.apply_published(successor.clone()).unwrap();

        let reopened = LicenseStore::new("node-0", "lreg").with_snapshots(snapshots);
        assert_eq!(reopened.restore().unwrap(), Some(successor));
    }

    #[test]
    fn restores_latest_persisted_state() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path(), "node-0", 3).unwrap();
        let store = LicenseStore::new("node-0", "lreg").with_snapshots(snapshots.clone());
        store.compare_and_set(0, 1, shield_set()).unwrap();

        let reopened = LicenseStore::new("node-0", "lreg").with_snapshots(snapshots);
        let restored = reopened.restore().unwrap().expect("snapshot present");
        assert_eq!(restored.version, 1);
        assert_eq!(reopened.current_version().0, shield_set());
    }
}
