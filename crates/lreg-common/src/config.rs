//! ---
//! lreg_section: "01-core-functionality"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Shared primitives and utilities for the registry runtime."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_cluster_name() -> String {
    "lreg".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_cas_max_retries() -> u32 {
    5
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_watchdog_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_sweep_interval() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

fn default_leader_eligible() -> bool {
    true
}

fn default_env_public_key_var() -> String {
    "LREG_PUBLIC_KEY".to_owned()
}

fn default_snapshot_enabled() -> bool {
    true
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("target/lreg/snapshots")
}

fn default_retain_last() -> usize {
    5
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/lreg/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for an lreg deployment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub license: LicenseConfig,
    #[serde(default)]
    pub persistence: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "LREG_CONFIG";

    /// Load configuration from disk, respecting the `LREG_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Cluster membership as seen by the registry plus coordination bounds.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Upper bound for forward + CAS + publish of a single mutation.
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Number of CAS attempts before a mutation fails with a conflict.
    #[serde(default = "default_cas_max_retries")]
    pub cas_max_retries: u32,
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_watchdog_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub watchdog_timeout: Duration,
    /// Background expiry sweep period; `None` disables the sweeper.
    #[serde(default = "default_sweep_interval")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub sweep_interval: Option<Duration>,
    #[serde(default)]
    pub nodes: IndexMap<String, NodeConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            request_timeout: default_request_timeout(),
            cas_max_retries: default_cas_max_retries(),
            heartbeat_interval: default_heartbeat_interval(),
            watchdog_timeout: default_watchdog_timeout(),
            sweep_interval: default_sweep_interval(),
            nodes: IndexMap::new(),
        }
    }
}

impl ClusterConfig {
    /// Build a cluster description of `count` leader-eligible nodes named `node-0..`.
    pub fn with_nodes(name: impl Into<String>, count: usize) -> Self {
        let nodes = (0..count)
            .map(|ordinal| {
                (
                    format!("node-{ordinal}"),
                    NodeConfig {
                        priority: ordinal as u32,
                        ..NodeConfig::default()
                    },
                )
            })
            .collect();
        Self {
            name: name.into(),
            nodes,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(anyhow!(
                "cluster '{}' must declare at least one node",
                self.name
            ));
        }
        if !self.nodes.values().any(|node| node.leader_eligible) {
            return Err(anyhow!(
                "cluster '{}' must define a leader-eligible node",
                self.name
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("cluster.request_timeout must be greater than zero"));
        }
        if self.cas_max_retries == 0 {
            return Err(anyhow!("cluster.cas_max_retries must be at least 1"));
        }
        Ok(())
    }

    /// Number of acknowledgements (leader included) required for a publish.
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_leader_eligible")]
    pub leader_eligible: bool,
    /// Lower values win leader elections.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub metadata: IndexMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            leader_eligible: default_leader_eligible(),
            priority: 0,
            metadata: IndexMap::new(),
        }
    }
}

/// Trusted public key material for license verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    /// File holding the default public key (hex or base64).
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
    /// Inline default public key (hex or base64); wins over the file.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default = "default_env_public_key_var")]
    pub env_var: String,
    /// Keys trusted only for documents from a given issuer.
    #[serde(default)]
    pub issuer_keys: IndexMap<String, String>,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            public_key_path: None,
            public_key: None,
            env_var: default_env_public_key_var(),
            issuer_keys: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_enabled")]
    pub enabled: bool,
    #[serde(default = "default_snapshot_path")]
    pub directory: PathBuf,
    #[serde(default = "default_retain_last")]
    pub retain_last: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: default_snapshot_enabled(),
            directory: default_snapshot_path(),
            retain_last: default_retain_last(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [cluster]
        name = "prod-eu"
        request_timeout = 1500
        cas_max_retries = 3
        sweep_interval = 30000

        [cluster.nodes.alpha]
        priority = 0

        [cluster.nodes.beta]
        priority = 1

        [cluster.nodes.gamma]
        leader_eligible = false

        [license]
        public_key = "00ff"

        [license.issuer_keys]
        elasticsearch = "abcd"

        [persistence]
        directory = "/var/lib/lreg"
        retain_last = 2
    "#;

    #[test]
    fn parses_cluster_layout() {
        let config: AppConfig = SAMPLE.parse().expect("sample config parses");
        assert_eq!(config.cluster.name, "prod-eu");
        assert_eq!(config.cluster.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.cluster.cas_max_retries, 3);
        assert_eq!(config.cluster.sweep_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.cluster.nodes.len(), 3);
        assert!(!config.cluster.nodes["gamma"].leader_eligible);
        assert_eq!(config.cluster.quorum(), 2);
        assert_eq!(config.license.issuer_keys["elasticsearch"], "abcd");
        assert_eq!(config.persistence.retain_last, 2);
        assert!(config.persistence.enabled);
    }

    #[test]
    fn rejects_cluster_without_eligible_leader() {
        let err = r#"
            [cluster.nodes.only]
            leader_eligible = false
        "#
        .parse::<AppConfig>()
        .expect_err("no leader-eligible node");
        assert!(err.to_string().contains("leader-eligible"));
    }

    #[test]
    fn rejects_empty_cluster() {
        assert!("".parse::<AppConfig>().is_err());
    }

    #[test]
    fn generated_cluster_is_valid() {
        let cluster = ClusterConfig::with_nodes("test", 10);
        cluster.validate().unwrap();
        assert_eq!(cluster.quorum(), 6);
        assert_eq!(cluster.nodes.get_index(3).unwrap().0, "node-3");
    }

    #[test]
    fn shipped_example_parses() {
        let config: AppConfig = include_str!("../../../configs/lregd.example.toml")
            .parse()
            .unwrap();
        assert_eq!(config.cluster.nodes.len(), 3);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.metrics.listen.port(), 9899);
    }
}
