//! ---
//! lreg_section: "02-license-model"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "License documents, verification, and set construction."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH};

use crate::document::LicenseDocument;
use crate::error::{LicenseError, LicenseResult, VerifyError};

/// Verify a document's signature against one public key.
///
/// Pure: never panics on malformed input and has no side effects.
pub fn verify_document(document: &LicenseDocument, key: &VerifyingKey) -> Result<(), VerifyError> {
    let digest = document.digest()?;
    let signature_bytes = general_purpose::STANDARD
        .decode(document.signature.trim())
        .map_err(|err| VerifyError::Malformed(format!("signature must be base64 encoded: {err}")))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|_| VerifyError::Malformed("invalid license signature length".to_owned()))?;
    key.verify_strict(&digest, &signature)
        .map_err(|_| VerifyError::SignatureMismatch)
}

/// Decode an Ed25519 public key given as hex (64 chars) or base64 text.
pub fn parse_public_key(text: &str) -> LicenseResult<VerifyingKey> {
    let text = text.trim();
    let bytes = if text.len() == PUBLIC_KEY_LENGTH * 2 && text.chars().all(|c| c.is_ascii_hexdigit())
    {
        hex::decode(text).map_err(|err| LicenseError::InvalidKey(err.to_string()))?
    } else {
        general_purpose::STANDARD
            .decode(text)
            .map_err(|err| LicenseError::InvalidKey(format!("expected hex or base64: {err}")))?
    };
    let array: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        LicenseError::InvalidKey(format!(
            "public key must be {PUBLIC_KEY_LENGTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&array).map_err(|err| LicenseError::InvalidKey(err.to_string()))
}

/// Trusted key material: a default key plus keys pinned to specific issuers.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    default_key: Option<VerifyingKey>,
    issuer_keys: BTreeMap<String, VerifyingKey>,
}

impl Verifier {
    /// Trust `key` for every issuer.
    #[must_use]
    pub fn new(key: VerifyingKey) -> Self {
        Self {
            default_key: Some(key),
            issuer_keys: BTreeMap::new(),
        }
    }

    /// Build from raw public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> LicenseResult<Self> {
        let key =
            VerifyingKey::from_bytes(bytes).map_err(|err| LicenseError::InvalidKey(err.to_string()))?;
        Ok(Self::new(key))
    }

    /// Trust `key` for documents signed by `issuer`, taking precedence over
    /// the default key.
    #[must_use]
    pub fn with_issuer_key(mut self, issuer: impl Into<String>, key: VerifyingKey) -> Self {
        self.issuer_keys.insert(issuer.into(), key);
        self
    }

    /// Key used for documents from `issuer`, if any.
    #[must_use]
    pub fn key_for(&self, issuer: &str) -> Option<&VerifyingKey> {
        self.issuer_keys.get(issuer).or(self.default_key.as_ref())
    }

    /// Whether any key is configured at all.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.default_key.is_some() || !self.issuer_keys.is_empty()
    }

    /// Verify a document, resolving the key by issuer.
    pub fn verify(&self, document: &LicenseDocument) -> Result<(), VerifyError> {
        let key = self
            .key_for(&document.issuer)
            .ok_or_else(|| VerifyError::UnknownKey {
                issuer: document.issuer.clone(),
            })?;
        verify_document(document, key)
    }

    /// Boolean form of [`Verifier::verify`].
    #[must_use]
    pub fn is_valid(&self, document: &LicenseDocument) -> bool {
        self.verify(document).is_ok()
    }
}
