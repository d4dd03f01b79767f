//! ---
//! lreg_section: "02-license-model"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "License documents, verification, and set construction."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
//! Error types for the licensing crate.

use thiserror::Error;

/// Reason a document failed signature verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// The document or its signature cannot be decoded.
    #[error("malformed license: {0}")]
    Malformed(String),
    /// The signature is well formed but does not match the document.
    #[error("license signature does not match its contents")]
    SignatureMismatch,
    /// No trusted key is configured for the document's issuer.
    #[error("no trusted key for issuer '{issuer}'")]
    UnknownKey {
        /// Issuer named by the rejected document.
        issuer: String,
    },
}

impl VerifyError {
    /// Stable reason code for logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            VerifyError::Malformed(_) => "MALFORMED",
            VerifyError::SignatureMismatch => "SIGNATURE_MISMATCH",
            VerifyError::UnknownKey { .. } => "UNKNOWN_KEY",
        }
    }
}

/// Licensing errors surfaced to callers.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// The document is structurally invalid.
    #[error("malformed license document: {0}")]
    Malformed(String),

    /// Signature verification failed.
    #[error("license signature rejected: {0}")]
    Signature(#[from] VerifyError),

    /// Public key material could not be decoded.
    #[error("invalid public key material: {0}")]
    InvalidKey(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
