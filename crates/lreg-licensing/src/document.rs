//! ---
//! lreg_section: "02-license-model"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "License documents, verification, and set construction."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LicenseError, LicenseResult, VerifyError};
use crate::features::FeatureType;

/// Delimiter between fields of the canonical signing encoding.
pub const CANONICAL_DELIMITER: char = '\n';

/// One signed grant of a feature to a licensee.
///
/// Dates are epoch milliseconds. `signature` is the base64 Ed25519 signature
/// produced by the external signer over [`LicenseDocument::digest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LicenseDocument {
    /// Identifier of the grant record.
    pub uid: String,
    /// Capability granted.
    pub feature: FeatureType,
    /// Commercial subscription classification.
    pub subscription_type: String,
    /// Commercial tier.
    #[serde(rename = "type")]
    pub license_type: String,
    /// Licensee identity.
    pub issued_to: String,
    /// Signer identity.
    pub issuer: String,
    /// Entitlement cap on cluster size.
    pub max_nodes: u32,
    /// Issue instant in epoch milliseconds.
    pub issue_date: i64,
    /// Expiry instant in epoch milliseconds.
    pub expiry_date: i64,
    /// Base64 signature over the canonical encoding.
    pub signature: String,
}

impl LicenseDocument {
    /// Canonical text covered by the signature: fixed field order, one
    /// [`CANONICAL_DELIMITER`] between fields.
    pub fn canonical_encoding(&self) -> Result<String, VerifyError> {
        let max_nodes = self.max_nodes.to_string();
        let issue_date = self.issue_date.to_string();
        let expiry_date = self.expiry_date.to_string();
        let fields: [(&str, &str); 9] = [
            ("uid", self.uid.as_str()),
            ("feature", self.feature.as_str()),
            ("subscription_type", self.subscription_type.as_str()),
            ("type", self.license_type.as_str()),
            ("issued_to", self.issued_to.as_str()),
            ("issuer", self.issuer.as_str()),
            ("max_nodes", max_nodes.as_str()),
            ("issue_date", issue_date.as_str()),
            ("expiry_date", expiry_date.as_str()),
        ];
        if let Some((name, _)) = fields
            .iter()
            .find(|(_, value)| value.contains(CANONICAL_DELIMITER))
        {
            return Err(VerifyError::Malformed(format!(
                "field '{name}' contains the canonical delimiter"
            )));
        }
        let mut encoded = String::new();
        for (index, (_, value)) in fields.iter().enumerate() {
            if index > 0 {
                encoded.push(CANONICAL_DELIMITER);
            }
            encoded.push_str(value);
        }
        Ok(encoded)
    }

    /// SHA-256 digest of the canonical encoding; this is what gets signed.
    pub fn digest(&self) -> Result<[u8; 32], VerifyError> {
        let encoded = self.canonical_encoding()?;
        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        Ok(hasher.finalize().into())
    }

    /// Schema checks that do not need key material.
    pub fn validate(&self) -> LicenseResult<()> {
        let required = [
            ("uid", self.uid.as_str()),
            ("issuer", self.issuer.as_str()),
            ("issued_to", self.issued_to.as_str()),
            ("signature", self.signature.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(LicenseError::Malformed(format!("'{name}' must not be empty")));
            }
        }
        if self.max_nodes < 1 {
            return Err(LicenseError::Malformed(format!(
                "license '{}' must allow at least one node",
                self.uid
            )));
        }
        if self.expiry_date <= self.issue_date {
            return Err(LicenseError::Malformed(format!(
                "license '{}' expires ({}) before it is issued ({})",
                self.uid, self.expiry_date, self.issue_date
            )));
        }
        self.canonical_encoding()
            .map_err(|err| LicenseError::Malformed(err.to_string()))?;
        Ok(())
    }

    /// Whether the license is no longer active at `now_millis`.
    #[must_use]
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.expiry_date <= now_millis
    }

    /// Compare the attributes that define a grant; `issuer` is not
    /// compared.
    #[must_use]
    pub fn same_grant(&self, other: &LicenseDocument) -> bool {
        self.uid == other.uid
            && self.feature == other.feature
            && self.subscription_type == other.subscription_type
            && self.license_type == other.license_type
            && self.issued_to == other.issued_to
            && self.signature == other.signature
            && self.expiry_date == other.expiry_date
            && self.issue_date == other.issue_date
            && self.max_nodes == other.max_nodes
    }
}

/// JSON envelope exchanged with the external signer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicensesEnvelope {
    /// Documents in the envelope, in signer order.
    pub licenses: Vec<LicenseDocument>,
}

/// Decode the signer's output text into documents.
///
/// Only the structure is checked here; signatures are checked by the
/// [`crate::Verifier`].
pub fn read_licenses_from_str(raw: &str) -> LicenseResult<Vec<LicenseDocument>> {
    let envelope: LicensesEnvelope = serde_json::from_str(raw.trim())
        .map_err(|err| LicenseError::Malformed(format!("invalid licenses document: {err}")))?;
    Ok(envelope.licenses)
}

/// Encode documents in the signer's envelope format.
pub fn write_licenses<'a, I>(documents: I) -> LicenseResult<String>
where
    I: IntoIterator<Item = &'a LicenseDocument>,
{
    let envelope = LicensesEnvelope {
        licenses: documents.into_iter().cloned().collect(),
    };
    Ok(serde_json::to_string_pretty(&envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{document, DAY};

    #[test]
    fn canonical_encoding_uses_fixed_field_order() {
        let doc = document("uid-1", FeatureType::Shield, 0, 10 * DAY, 2);
        let encoded = doc.canonical_encoding().unwrap();
        let fields: Vec<&str> = encoded.split(CANONICAL_DELIMITER).collect();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[0], "uid-1");
        assert_eq!(fields[1], "shield");
        assert_eq!(fields[6], "2");
        assert_eq!(fields[8], (10 * DAY).to_string());
    }

    #[test]
    fn delimiter_inside_a_field_is_malformed() {
        let mut doc = document("uid-1", FeatureType::Shield, 0, DAY, 1);
        doc.issued_to = "foo\nbar".into();
        assert!(matches!(doc.digest(), Err(VerifyError::Malformed(_))));
        assert!(matches!(doc.validate(), Err(LicenseError::Malformed(_))));
    }

    #[test]
    fn validate_checks_schema_invariants() {
        let doc = document("uid-1", FeatureType::Marvel, 0, DAY, 1);
        doc.validate().unwrap();

        let mut inverted = doc.clone();
        inverted.expiry_date = inverted.issue_date;
        assert!(inverted.validate().is_err());

        let mut no_nodes = doc.clone();
        no_nodes.max_nodes = 0;
        assert!(no_nodes.validate().is_err());

        let mut anonymous = doc;
        anonymous.issuer = "  ".into();
        assert!(anonymous.validate().is_err());
    }

    #[test]
    fn reads_signer_envelope() {
        let doc = document("uid-7", FeatureType::Shield, DAY, 2 * DAY, 3);
        let text = write_licenses([&doc]).unwrap();
        assert!(text.contains("\"type\""));
        let decoded = read_licenses_from_str(&text).unwrap();
        assert_eq!(decoded, vec![doc]);
    }

    #[test]
    fn unknown_feature_is_malformed() {
        let raw = r#"{"licenses":[{"uid":"u","feature":"watcher","subscription_type":"s",
            "type":"t","issued_to":"i","issuer":"x","max_nodes":1,"issue_date":0,
            "expiry_date":1,"signature":"AA=="}]}"#;
        assert!(matches!(
            read_licenses_from_str(raw),
            Err(LicenseError::Malformed(_))
        ));
        assert!(read_licenses_from_str("not json").is_err());
    }
}
