//! ---
//! lreg_section: "02-license-model"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "License documents, verification, and set construction."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::{LicenseDocument, LicensesEnvelope};
use crate::features::FeatureType;
use crate::verifier::Verifier;

/// The active licenses: at most one document per feature.
///
/// Instances are only produced by [`LicensesBuilder::build`] (or decoded from
/// a previously built set) and are never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LicensesEnvelope", into = "LicensesEnvelope")]
pub struct LicenseSet {
    licenses: BTreeMap<FeatureType, LicenseDocument>,
}

impl LicenseSet {
    /// Start a builder with no verifier and the wall clock as build instant.
    #[must_use]
    pub fn builder<'a>() -> LicensesBuilder<'a> {
        LicensesBuilder::new()
    }

    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of active features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.licenses.len()
    }

    /// Whether no feature is licensed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.licenses.is_empty()
    }

    /// Active document for `feature`.
    #[must_use]
    pub fn get(&self, feature: FeatureType) -> Option<&LicenseDocument> {
        self.licenses.get(&feature)
    }

    /// Licensed features in ascending order.
    #[must_use]
    pub fn features(&self) -> BTreeSet<FeatureType> {
        self.licenses.keys().copied().collect()
    }

    /// Documents ordered by feature.
    pub fn iter(&self) -> impl Iterator<Item = &LicenseDocument> {
        self.licenses.values()
    }
}

impl<'a> IntoIterator for &'a LicenseSet {
    type Item = &'a LicenseDocument;
    type IntoIter = std::collections::btree_map::Values<'a, FeatureType, LicenseDocument>;

    fn into_iter(self) -> Self::IntoIter {
        self.licenses.values()
    }
}

impl From<LicenseSet> for LicensesEnvelope {
    fn from(set: LicenseSet) -> Self {
        LicensesEnvelope {
            licenses: set.licenses.into_values().collect(),
        }
    }
}

impl TryFrom<LicensesEnvelope> for LicenseSet {
    type Error = String;

    fn try_from(envelope: LicensesEnvelope) -> Result<Self, Self::Error> {
        let mut licenses = BTreeMap::new();
        for document in envelope.licenses {
            let feature = document.feature;
            if licenses.insert(feature, document).is_some() {
                return Err(format!("license set holds more than one '{feature}' license"));
            }
        }
        Ok(Self { licenses })
    }
}

/// Collects candidate documents and resolves them into a [`LicenseSet`].
///
/// `build` unions every candidate, drops documents that fail verification
/// (when a verifier is attached) or are expired at the build instant, and
/// keeps one document per feature: latest `issue_date`, then larger
/// `max_nodes`, then smaller `uid`.
#[derive(Debug, Default)]
pub struct LicensesBuilder<'a> {
    verifier: Option<&'a Verifier>,
    now_millis: Option<i64>,
    candidates: Vec<LicenseDocument>,
}

impl<'a> LicensesBuilder<'a> {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard candidates that `verifier` rejects.
    #[must_use]
    pub fn verified_by(mut self, verifier: &'a Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Evaluate expiry at `now_millis` instead of the wall clock.
    #[must_use]
    pub fn at(mut self, now_millis: i64) -> Self {
        self.now_millis = Some(now_millis);
        self
    }

    /// Add every document of an existing set.
    #[must_use]
    pub fn licenses(mut self, set: &LicenseSet) -> Self {
        self.candidates.extend(set.iter().cloned());
        self
    }

    /// Add one document.
    #[must_use]
    pub fn add(mut self, document: LicenseDocument) -> Self {
        self.candidates.push(document);
        self
    }

    /// Add many documents.
    #[must_use]
    pub fn add_all<I>(mut self, documents: I) -> Self
    where
        I: IntoIterator<Item = LicenseDocument>,
    {
        self.candidates.extend(documents);
        self
    }

    /// Resolve the candidates into an immutable set.
    #[must_use]
    pub fn build(self) -> LicenseSet {
        let now = self
            .now_millis
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let mut licenses: BTreeMap<FeatureType, LicenseDocument> = BTreeMap::new();
        for candidate in self.candidates {
            if candidate.is_expired_at(now) {
                debug!(uid = %candidate.uid, feature = %candidate.feature, expiry = candidate.expiry_date, "dropping expired license");
                continue;
            }
            if let Some(verifier) = self.verifier {
                if let Err(err) = verifier.verify(&candidate) {
                    debug!(uid = %candidate.uid, reason = err.reason(), "dropping unverifiable license");
                    continue;
                }
            }
            match licenses.get(&candidate.feature) {
                Some(current) if preference(current, &candidate) != Ordering::Greater => {}
                _ => {
                    licenses.insert(candidate.feature, candidate);
                }
            }
        }
        LicenseSet { licenses }
    }
}

/// `Less` when `a` should be kept over `b`.
fn preference(a: &LicenseDocument, b: &LicenseDocument) -> Ordering {
    b.issue_date
        .cmp(&a.issue_date)
        .then_with(|| b.max_nodes.cmp(&a.max_nodes))
        .then_with(|| a.uid.cmp(&b.uid))
        // Only keeps `build` deterministic when two documents share a uid.
        .then_with(|| a.signature.cmp(&b.signature))
}

/// Whether two sets grant the same licenses once both are rebuilt at the
/// current instant.
#[must_use]
pub fn same_licenses(first: &LicenseSet, second: &LicenseSet) -> bool {
    same_licenses_at(first, second, Utc::now().timestamp_millis())
}

/// [`same_licenses`] evaluated at `now_millis`.
#[must_use]
pub fn same_licenses_at(first: &LicenseSet, second: &LicenseSet, now_millis: i64) -> bool {
    let first = LicenseSet::builder().at(now_millis).licenses(first).build();
    let second = LicenseSet::builder().at(now_millis).licenses(second).build();

    if first.features() != second.features() {
        return false;
    }
    let same = first.iter().all(|license| {
        second
            .get(license.feature)
            .is_some_and(|other| license.same_grant(other))
    });
    same
}
