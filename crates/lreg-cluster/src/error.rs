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

use lreg_licensing::VerifyError;
use lreg_persistence::PersistenceError;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Wire-level classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Structurally invalid input; retrying the same request cannot succeed.
    MalformedDocument,
    /// Signature did not verify; logged as potential tampering.
    InvalidSignature,
    /// The compare-and-set retry bound was exhausted.
    ConflictExceeded,
    /// The request did not complete within the configured timeout.
    Timeout,
    /// No leader is currently elected or the cluster is still recovering.
    NoLeader,
    /// Local snapshot persistence failed.
    Storage,
}

impl ErrorCode {
    /// Whether the client may safely retry the whole operation.
    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorCode::MalformedDocument | ErrorCode::InvalidSignature)
    }
}

/// Errors returned by the coordinator actions.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("malformed license document: {0}")]
    MalformedDocument(String),

    #[error("license '{uid}' rejected: {reason}")]
    InvalidSignature { uid: String, reason: VerifyError },

    #[error("compare-and-set still conflicting after {attempts} attempts")]
    ConflictExceeded { attempts: u32 },

    #[error("request did not complete within {0:?}")]
    Timeout(Duration),

    #[error("no leader available")]
    NoLeader,

    /// The target stopped being leader while the request was in flight.
    #[error("node '{0}' is not the leader")]
    NotLeader(String),

    #[error("node '{0}' is unreachable")]
    Unreachable(String),

    /// A follower refused a publication ordered before its own state.
    #[error("publication {published:?} is older than local state {local:?}")]
    StalePublication { local: (u64, u64), published: (u64, u64) },

    #[error("storage failure: {0}")]
    Storage(#[from] PersistenceError),
}

impl RegistryError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::MalformedDocument(_) => ErrorCode::MalformedDocument,
            RegistryError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
            RegistryError::ConflictExceeded { .. } => ErrorCode::ConflictExceeded,
            RegistryError::Timeout(_) | RegistryError::Unreachable(_) => ErrorCode::Timeout,
            RegistryError::NoLeader
            | RegistryError::NotLeader(_)
            | RegistryError::StalePublication { .. } => ErrorCode::NoLeader,
            RegistryError::Storage(_) => ErrorCode::Storage,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }

    /// Whether the requester should re-resolve the leader and try again
    /// within the same request deadline.
    pub(crate) fn is_rerouteable(&self) -> bool {
        matches!(self, RegistryError::NotLeader(_) | RegistryError::Unreachable(_))
    }
}

/// Failure of a [`crate::LicenseStore`] write.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store moved past the version the caller read.
    #[error("expected version {expected}, store is at {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// The store already holds a state from a newer leader term.
    #[error("term {term} is behind the stored term {current}")]
    Deposed { term: u64, current: u64 },

    /// A published state orders before the stored one.
    #[error("published {published:?} is older than stored {local:?}")]
    Stale { local: (u64, u64), published: (u64, u64) },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
