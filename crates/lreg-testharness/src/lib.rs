//! ---
//! lreg_section: "08-test-harness"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Test signer and license fixtures."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
//! Stand-in for the external license signer: a deterministic Ed25519 key
//! pair plus helpers that turn human-readable feature attributes into signed
//! documents and signer output text.

use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use tracing::debug;
use uuid::Uuid;

use lreg_common::time::parse_date_millis;
use lreg_licensing::{write_licenses, FeatureType, LicenseDocument, Verifier};

const DEFAULT_SEED: [u8; 32] = [42u8; 32];

/// Attributes of a license to generate. Dates are `YYYY-MM-DD`.
#[derive(Debug, Clone)]
pub struct FeatureAttributes {
    pub uid: Option<String>,
    pub feature: FeatureType,
    pub subscription_type: String,
    pub license_type: String,
    pub issued_to: String,
    pub issuer: String,
    pub max_nodes: u32,
    pub issue_date: String,
    pub expiry_date: String,
}

impl FeatureAttributes {
    /// Platinum subscription for `foo bar Inc.` issued by `elasticsearch`.
    pub fn new(
        feature: FeatureType,
        max_nodes: u32,
        issue_date: impl Into<String>,
        expiry_date: impl Into<String>,
    ) -> Self {
        Self {
            uid: None,
            feature,
            subscription_type: "subscription".to_owned(),
            license_type: "platinum".to_owned(),
            issued_to: "foo bar Inc.".to_owned(),
            issuer: "elasticsearch".to_owned(),
            max_nodes,
            issue_date: issue_date.into(),
            expiry_date: expiry_date.into(),
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_issued_to(mut self, issued_to: impl Into<String>) -> Self {
        self.issued_to = issued_to.into();
        self
    }
}

/// Deterministic signer. Two signers built from the same seed produce
/// identical signatures.
#[derive(Debug, Clone)]
pub struct TestSigner {
    key: SigningKey,
}

impl Default for TestSigner {
    fn default() -> Self {
        Self::from_seed(DEFAULT_SEED)
    }
}

impl TestSigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Public key as the hex text accepted by `[license] public_key`.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().as_bytes())
    }

    /// Verifier trusting this signer for every issuer.
    pub fn verifier(&self) -> Verifier {
        Verifier::new(self.public_key())
    }

    /// Replace the document's signature with one from this signer.
    pub fn sign(&self, mut document: LicenseDocument) -> Result<LicenseDocument> {
        let digest = document.digest()?;
        document.signature = general_purpose::STANDARD.encode(self.key.sign(&digest).to_bytes());
        Ok(document)
    }

    /// Build and sign one document.
    pub fn license(&self, attributes: &FeatureAttributes) -> Result<LicenseDocument> {
        let document = LicenseDocument {
            uid: attributes
                .uid
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            feature: attributes.feature,
            subscription_type: attributes.subscription_type.clone(),
            license_type: attributes.license_type.clone(),
            issued_to: attributes.issued_to.clone(),
            issuer: attributes.issuer.clone(),
            max_nodes: attributes.max_nodes,
            issue_date: parse_date_millis(&attributes.issue_date)?,
            expiry_date: parse_date_millis(&attributes.expiry_date)?,
            signature: String::new(),
        };
        let signed = self.sign(document)?;
        debug!(uid = %signed.uid, feature = %signed.feature, "generated test license");
        Ok(signed)
    }

    /// Sign every attribute set.
    pub fn licenses(&self, attributes: &[FeatureAttributes]) -> Result<Vec<LicenseDocument>> {
        attributes.iter().map(|entry| self.license(entry)).collect()
    }

    /// Signer output text for `attributes`, as a client would submit it.
    pub fn generate_licenses(&self, attributes: &[FeatureAttributes]) -> Result<String> {
        let documents = self.licenses(attributes)?;
        Ok(write_licenses(&documents)?)
    }
}
