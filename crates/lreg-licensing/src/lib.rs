//! ---
//! lreg_section: "02-license-model"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "License documents, verification, and set construction."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! lreg licensing crate: the signed per-feature license document, its wire
//! codec, Ed25519 signature verification, and the builder that turns any
//! collection of documents into the active [`LicenseSet`].

pub mod builder;
pub mod document;
pub mod error;
pub mod features;
pub mod logging;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_support;

pub use builder::{same_licenses, same_licenses_at, LicenseSet, LicensesBuilder};
pub use document::{read_licenses_from_str, write_licenses, LicenseDocument, LicensesEnvelope};
pub use error::{LicenseError, LicenseResult, VerifyError};
pub use features::{FeatureSelector, FeatureType};
pub use verifier::{parse_public_key, verify_document, Verifier};
