//! ---
//! lreg_section: "02-license-model"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "License documents, verification, and set construction."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use tracing::{info, warn};

use crate::document::LicenseDocument;

static LICENSE_ACCEPTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lreg_license_accepted_total",
        "Total number of license documents that passed verification"
    )
    .expect("metric registration to succeed")
});

static LICENSE_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lreg_license_rejected_total",
        "Total number of license documents rejected, by reason",
        &["reason"]
    )
    .expect("metric registration to succeed")
});

/// Record a document that passed verification.
pub fn record_license_accepted(document: &LicenseDocument) {
    LICENSE_ACCEPTED_TOTAL.inc();
    info!(
        uid = %document.uid,
        feature = %document.feature,
        issued_to = %document.issued_to,
        expiry_date = document.expiry_date,
        "license accepted"
    );
}

/// Record a rejected document. `reason` is a stable code such as
/// `SIGNATURE_MISMATCH`.
pub fn record_license_rejected(uid: &str, reason: &str) {
    LICENSE_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    warn!(uid = uid, reason = reason, "license rejected");
}

/// Accepted documents recorded since process start.
#[must_use]
pub fn accepted_total() -> u64 {
    LICENSE_ACCEPTED_TOTAL.get()
}

/// Rejections recorded for `reason` since process start.
#[must_use]
pub fn rejected_total(reason: &str) -> u64 {
    LICENSE_REJECTED_TOTAL.with_label_values(&[reason]).get()
}
