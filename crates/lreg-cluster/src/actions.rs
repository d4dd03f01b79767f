//! ---
//! lreg_section: "03-cluster-registry"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Replicated license registry and coordinator actions."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::fmt;

use lreg_licensing::{read_licenses_from_str, FeatureSelector, LicenseDocument, LicenseSet};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::error::{RegistryError, RegistryResult};

/// Install one or more signed documents. All-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutRequest {
    documents: Vec<LicenseDocument>,
}

impl PutRequest {
    pub fn new(document: LicenseDocument) -> Self {
        Self {
            documents: vec![document],
        }
    }

    pub fn from_documents(documents: impl IntoIterator<Item = LicenseDocument>) -> Self {
        Self {
            documents: documents.into_iter().collect(),
        }
    }

    /// Decode the signer's output text.
    pub fn from_signed_str(raw: &str) -> RegistryResult<Self> {
        let documents = read_licenses_from_str(raw)
            .map_err(|err| RegistryError::MalformedDocument(err.to_string()))?;
        Ok(Self { documents })
    }

    pub fn documents(&self) -> &[LicenseDocument] {
        &self.documents
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    pub acknowledged: bool,
    /// Cluster state version after the request.
    pub version: u64,
}

/// Locally replicated licenses, expiry-filtered at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    pub licenses: LicenseSet,
    pub version: u64,
}

/// Remove licenses by feature, optionally restricted to one issuer.
///
/// Feature names match exactly but case-insensitively, `*` matches every
/// feature, and unknown names match nothing. The issuer, when present, must
/// equal the document's issuer exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    issuer: Option<String>,
    features: Vec<String>,
}

impl DeleteRequest {
    /// Remove `feature` licenses issued by `issuer`.
    pub fn new(issuer: impl Into<String>, feature: impl Into<String>) -> Self {
        Self {
            issuer: Some(issuer.into()),
            features: vec![feature.into()],
        }
    }

    /// Remove the listed features whoever issued them.
    pub fn features<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            issuer: None,
            features: features.into_iter().map(Into::into).collect(),
        }
    }

    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    pub fn selectors(&self) -> Vec<FeatureSelector> {
        self.features
            .iter()
            .map(|name| FeatureSelector::parse(name))
            .collect()
    }

    /// Whether `document` is removed by this request.
    pub fn matches(&self, document: &LicenseDocument) -> bool {
        if let Some(issuer) = &self.issuer {
            if issuer != &document.issuer {
                return false;
            }
        }
        self.selectors()
            .iter()
            .any(|selector| selector.matches(document.feature))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub acknowledged: bool,
    pub version: u64,
}

/// A state change routed to the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    Put(PutRequest),
    Delete(DeleteRequest),
    /// Rebuild the current set to drop expired licenses.
    Sweep,
}

impl Mutation {
    pub fn action(&self) -> &'static str {
        match self {
            Mutation::Put(_) => "put",
            Mutation::Delete(_) => "delete",
            Mutation::Sweep => "sweep",
        }
    }
}

/// Envelope for a mutation forwarded from the receiving node to the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedRequest {
    pub request_id: Uuid,
    pub origin: String,
    pub mutation: Mutation,
}

/// Leader's answer to a forwarded mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub acknowledged: bool,
    pub version: u64,
    pub phase: RequestPhase,
}

/// Lifecycle of a Put/Delete request.
///
/// `Received → ForwardedToLeader → Validated → Applied → Published →
/// Acknowledged`, with `Rejected` after a failed validation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPhase {
    Received,
    ForwardedToLeader,
    Validated,
    Applied,
    Published,
    Acknowledged,
    Rejected,
}

/// Identifier plus last reached phase of one request, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTrace {
    pub id: Uuid,
    pub action: &'static str,
    pub phase: RequestPhase,
}

impl RequestTrace {
    pub fn new(action: &'static str) -> Self {
        Self::with_id(Uuid::new_v4(), action)
    }

    pub fn with_id(id: Uuid, action: &'static str) -> Self {
        Self {
            id,
            action,
            phase: RequestPhase::Received,
        }
    }

    pub fn advance(&mut self, phase: RequestPhase) {
        tracing::trace!(request = %self.id, action = self.action, from = %self.phase, to = %phase, "request phase");
        self.phase = phase;
    }
}

impl fmt::Display for RequestTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.action, self.id, self.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lreg_licensing::FeatureType;
    use lreg_testharness::{FeatureAttributes, TestSigner};

    fn document(feature: FeatureType, issuer: &str) -> LicenseDocument {
        TestSigner::default()
            .license(&FeatureAttributes::new(feature, 1, "2014-12-13", "2015-12-13").with_issuer(issuer))
            .unwrap()
    }

    #[test]
    fn issuer_scoped_delete_requires_exact_issuer() {
        let request = DeleteRequest::new("elasticsearch", "SHIELD");
        assert!(request.matches(&document(FeatureType::Shield, "elasticsearch")));
        assert!(!request.matches(&document(FeatureType::Shield, "Elasticsearch")));
        assert!(!request.matches(&document(FeatureType::Marvel, "elasticsearch")));
    }

    #[test]
    fn feature_scoped_delete_ignores_issuer() {
        let request = DeleteRequest::features(["marvel", "shield"]);
        assert!(request.matches(&document(FeatureType::Shield, "anyone")));
        assert!(request.matches(&document(FeatureType::Marvel, "elasticsearch")));
        assert_eq!(request.issuer(), None);
    }

    #[test]
    fn wildcard_and_unknown_selectors() {
        assert!(DeleteRequest::features(["*"]).matches(&document(FeatureType::Marvel, "x")));
        assert!(!DeleteRequest::features(["shieldx"]).matches(&document(FeatureType::Shield, "x")));
        assert!(!DeleteRequest::features(Vec::<String>::new()).matches(&document(FeatureType::Shield, "x")));
    }

    #[test]
    fn put_from_signed_text() {
        let text = TestSigner::default()
            .generate_licenses(&[
                FeatureAttributes::new(FeatureType::Shield, 2, "2014-12-13", "2015-12-13"),
                FeatureAttributes::new(FeatureType::Marvel, 2, "2014-12-13", "2015-12-13"),
            ])
            .unwrap();
        let request = PutRequest::from_signed_str(&text).unwrap();
        assert_eq!(request.documents().len(), 2);

        let err = PutRequest::from_signed_str("{\"licenses\": 3}").unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::MalformedDocument);
    }

    #[test]
    fn mutations_carry_their_action_on_the_wire() {
        let mutation = Mutation::Delete(DeleteRequest::features(["*"]));
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["action"], "delete");
        assert_eq!(Mutation::Sweep.action(), "sweep");
        assert_eq!(RequestPhase::ForwardedToLeader.to_string(), "FORWARDED_TO_LEADER");
    }
}
