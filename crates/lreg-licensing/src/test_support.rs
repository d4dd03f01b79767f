use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signer, SigningKey};

use crate::document::LicenseDocument;
use crate::features::FeatureType;

pub const DAY: i64 = 24 * 60 * 60 * 1000;

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub fn other_signing_key() -> SigningKey {
    SigningKey::from_bytes(&[9u8; 32])
}

pub fn sign(mut doc: LicenseDocument, key: &SigningKey) -> LicenseDocument {
    let digest = doc.digest().expect("test documents are well formed");
    doc.signature = general_purpose::STANDARD.encode(key.sign(&digest).to_bytes());
    doc
}

pub fn document(
    uid: &str,
    feature: FeatureType,
    issue_date: i64,
    expiry_date: i64,
    max_nodes: u32,
) -> LicenseDocument {
    let unsigned = LicenseDocument {
        uid: uid.to_owned(),
        feature,
        subscription_type: "subscription".to_owned(),
        license_type: "platinum".to_owned(),
        issued_to: "foo bar Inc.".to_owned(),
        issuer: "elasticsearch".to_owned(),
        max_nodes,
        issue_date,
        expiry_date,
        signature: String::new(),
    };
    sign(unsigned, &signing_key())
}
