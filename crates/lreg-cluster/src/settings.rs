//! ---
//! lreg_section: "03-cluster-registry"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Replicated license registry and coordinator actions."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use lreg_common::config::{AppConfig, ClusterConfig, LicenseConfig};
use lreg_licensing::{parse_public_key, Verifier};
use tracing::{info, warn};

const MAX_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Per-node runtime settings derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub cluster_name: String,
    pub request_timeout: Duration,
    pub cas_max_retries: u32,
    /// Acknowledgements (leader included) required before a mutation is
    /// acknowledged to the client.
    pub quorum: usize,
    /// Pause before re-routing a request or re-sending a publication.
    pub retry_interval: Duration,
    pub sweep_interval: Option<Duration>,
    pub verifier: Verifier,
}

impl RegistrySettings {
    pub fn new(cluster: &ClusterConfig, verifier: Verifier) -> Self {
        Self {
            cluster_name: cluster.name.clone(),
            request_timeout: cluster.request_timeout,
            cas_max_retries: cluster.cas_max_retries,
            quorum: cluster.quorum(),
            retry_interval: cluster.heartbeat_interval.min(MAX_RETRY_INTERVAL),
            sweep_interval: cluster.sweep_interval,
            verifier,
        }
    }

    /// Validate `config` and load the trusted key material it names.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let verifier = load_verifier(&config.license)?;
        Ok(Self::new(&config.cluster, verifier))
    }
}

/// Build a [`Verifier`] from configuration.
///
/// The default key comes from, in order: the inline `public_key`, the file at
/// `public_key_path`, then the environment variable named by `env_var`.
pub fn load_verifier(config: &LicenseConfig) -> Result<Verifier> {
    let default_key = if let Some(inline) = &config.public_key {
        Some(parse_public_key(inline).context("invalid inline license.public_key")?)
    } else if let Some(path) = &config.public_key_path {
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read public key file {}", path.display()))?;
        Some(
            parse_public_key(&text)
                .with_context(|| format!("invalid public key in {}", path.display()))?,
        )
    } else {
        match std::env::var(&config.env_var) {
            Ok(text) if !text.trim().is_empty() => Some(
                parse_public_key(&text)
                    .with_context(|| format!("invalid public key in ${}", config.env_var))?,
            ),
            _ => None,
        }
    };

    let mut verifier = match default_key {
        Some(key) => Verifier::new(key),
        None => Verifier::default(),
    };
    for (issuer, text) in &config.issuer_keys {
        let key = parse_public_key(text)
            .with_context(|| format!("invalid license.issuer_keys.{issuer}"))?;
        verifier = verifier.with_issuer_key(issuer.clone(), key);
    }

    if verifier.has_keys() {
        info!(issuers = config.issuer_keys.len(), "license verification keys loaded");
    } else {
        warn!("no license verification key configured; every Put will be rejected");
    }
    Ok(verifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lreg_licensing::FeatureType;
    use lreg_testharness::{FeatureAttributes, TestSigner};
    use tempfile::tempdir;

    fn shield(signer: &TestSigner) -> lreg_licensing::LicenseDocument {
        signer
            .license(&FeatureAttributes::new(FeatureType::Shield, 2, "2014-12-13", "2015-12-13"))
            .unwrap()
    }

    #[test]
    fn loads_key_from_file() {
        let signer = TestSigner::default();
        let dir = tempdir().unwrap();
        let path = dir.path().join("public.key");
        fs::write(&path, format!("{}\n", signer.public_key_hex())).unwrap();

        let config = LicenseConfig {
            public_key_path: Some(path),
            ..LicenseConfig::default()
        };
        let verifier = load_verifier(&config).unwrap();
        assert!(verifier.is_valid(&shield(&signer)));
    }

    #[test]
    fn issuer_keys_are_loaded() {
        let signer = TestSigner::from_seed([5u8; 32]);
        let mut config = LicenseConfig {
            env_var: "LREG_TEST_UNSET_PUBLIC_KEY".into(),
            ..LicenseConfig::default()
        };
        config
            .issuer_keys
            .insert("elasticsearch".into(), signer.public_key_hex());
        let verifier = load_verifier(&config).unwrap();
        assert!(verifier.is_valid(&shield(&signer)));
        assert!(verifier.key_for("someone-else").is_none());
    }

    #[test]
    fn rejects_garbage_key() {
        let config = LicenseConfig {
            public_key: Some("not a key".into()),
            ..LicenseConfig::default()
        };
        assert!(load_verifier(&config).is_err());
    }

    #[test]
    fn settings_follow_cluster_config() {
        let cluster = ClusterConfig::with_nodes("lreg", 10);
        let settings = RegistrySettings::new(&cluster, Verifier::default());
        assert_eq!(settings.quorum, 6);
        assert_eq!(settings.cas_max_retries, cluster.cas_max_retries);
        assert!(settings.retry_interval <= MAX_RETRY_INTERVAL);
    }
}
