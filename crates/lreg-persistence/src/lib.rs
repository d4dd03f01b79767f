//! ---
//! lreg_section: "04-persistence"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Snapshot persistence for replicated registry state."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Hash-verified snapshots of replicated state, one directory per node, with
//! retention and restore of the newest intact snapshot.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for CBOR serialization issues.
    #[error("cbor serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    /// Reported when a snapshot fails integrity verification.
    #[error("snapshot hash mismatch")]
    HashMismatch,
    /// Reported when a snapshot was written by an incompatible format version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub mod metrics;
pub mod snapshot;
pub mod store;

pub use metrics::PersistenceMetrics;
pub use snapshot::{load_snapshot, save_snapshot, verify_snapshot, SNAPSHOT_VERSION};
pub use store::SnapshotStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_readable() {
        assert_eq!(format!("{}", PersistenceError::HashMismatch), "snapshot hash mismatch");
        assert_eq!(
            format!("{}", PersistenceError::UnsupportedVersion(9)),
            "unsupported snapshot version 9"
        );
    }
}
