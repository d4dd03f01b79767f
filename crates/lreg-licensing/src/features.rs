//! ---
//! lreg_section: "02-license-model"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "License documents, verification, and set construction."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Product capability gated by a license.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FeatureType {
    /// Security subsystem.
    Shield,
    /// Monitoring subsystem.
    Marvel,
}

impl FeatureType {
    /// Stable identifier string used on the wire and in canonical encodings.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }
}

/// Feature scope of a delete request.
///
/// Names match exactly but case-insensitively; `*` selects every feature and
/// an unknown name selects nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureSelector {
    /// Every feature.
    All,
    /// A single known feature.
    Feature(FeatureType),
    /// A name that is not a known feature.
    Unknown(String),
}

impl FeatureSelector {
    /// Parse a selector from its textual form.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            return FeatureSelector::All;
        }
        match FeatureType::from_str(raw) {
            Ok(feature) => FeatureSelector::Feature(feature),
            Err(_) => FeatureSelector::Unknown(raw.to_owned()),
        }
    }

    /// Whether the selector covers `feature`.
    #[must_use]
    pub fn matches(&self, feature: FeatureType) -> bool {
        match self {
            FeatureSelector::All => true,
            FeatureSelector::Feature(selected) => *selected == feature,
            FeatureSelector::Unknown(_) => false,
        }
    }

    /// Features covered by the selector.
    pub fn features(&self) -> impl Iterator<Item = FeatureType> + '_ {
        FeatureType::iter().filter(move |feature| self.matches(*feature))
    }
}
