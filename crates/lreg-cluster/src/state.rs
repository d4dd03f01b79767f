//! ---
//! lreg_section: "03-cluster-registry"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Replicated license registry and coordinator actions."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use lreg_licensing::LicenseSet;
use serde::{Deserialize, Serialize};

/// The replicated metadata blob carried by every node.
///
/// Version 0 is the empty initial state; each committed mutation produces
/// the next version. States are ordered by `(term, version)`: a leader
/// stamps everything it commits with its term, so a state committed by a
/// deposed leader never outranks one from its successor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    #[serde(default)]
    pub term: u64,
    pub version: u64,
    pub licenses: LicenseSet,
}

impl ClusterState {
    pub fn empty(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            term: 0,
            version: 0,
            licenses: LicenseSet::empty(),
        }
    }

    /// Successor state carrying `licenses`, committed under `term`.
    pub fn next(&self, licenses: LicenseSet, term: u64) -> Self {
        Self {
            cluster_name: self.cluster_name.clone(),
            term,
            version: self.version + 1,
            licenses,
        }
    }

    /// Same content, re-stamped with a newer leader term.
    pub fn with_term(&self, term: u64) -> Self {
        Self {
            term,
            ..self.clone()
        }
    }

    /// Replication order key.
    pub fn key(&self) -> (u64, u64) {
        (self.term, self.version)
    }

    /// Whether `other` should replace this state.
    pub fn is_superseded_by(&self, other: &ClusterState) -> bool {
        other.key() > self.key()
    }
}
