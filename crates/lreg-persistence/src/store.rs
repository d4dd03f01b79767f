//! ---
//! lreg_section: "04-persistence"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Snapshot persistence for replicated registry state."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use lreg_common::config::SnapshotConfig;

use crate::metrics::PersistenceMetrics;
use crate::snapshot::{load_snapshot, save_snapshot};
use crate::Result;

const SNAPSHOT_EXTENSION: &str = "json";

/// Snapshot directory of a single node.
///
/// Files are named by zero-padded sequence number so lexical order is
/// numeric order; the newest `retain_last` files are kept.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    node: String,
    root: PathBuf,
    retain_last: usize,
    metrics: Option<PersistenceMetrics>,
}

impl SnapshotStore {
    /// Open `<config.directory>/<node>`, creating it if needed.
    pub fn from_config(config: &SnapshotConfig, node: &str) -> Result<Self> {
        Self::open(config.directory.join(node), node, config.retain_last)
    }

    /// Open a snapshot directory at an explicit location.
    pub fn open(root: impl Into<PathBuf>, node: &str, retain_last: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            node: node.to_owned(),
            root,
            retain_last: retain_last.max(1),
            metrics: None,
        })
    }

    /// Attach Prometheus counters.
    #[must_use]
    pub fn with_metrics(mut self, metrics: PersistenceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Persist `state` under `sequence` and prune older snapshots.
    pub fn write<T: Serialize>(&self, sequence: u64, state: &T) -> Result<PathBuf> {
        let path = self
            .root
            .join(format!("{sequence:020}.{SNAPSHOT_EXTENSION}"));
        if let Err(err) = save_snapshot(state, &path) {
            if let Some(metrics) = &self.metrics {
                metrics.record_snapshot_failed(&self.node);
            }
            return Err(err);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot_saved(&self.node);
        }
        self.prune_old()?;
        debug!(
            node = %self.node,
            sequence,
            path = %path.display(),
            "snapshot persisted"
        );
        Ok(path)
    }

    /// Newest snapshot that passes verification. Corrupt files are skipped
    /// and left on disk for inspection.
    pub fn load_latest<T: DeserializeOwned>(&self) -> Result<Option<(T, PathBuf)>> {
        let started = Instant::now();
        let mut entries = self.snapshots()?;
        entries.reverse();
        let mut restored = None;
        for path in entries {
            match load_snapshot::<T>(&path) {
                Ok(state) => {
                    restored = Some((state, path));
                    break;
                }
                Err(err) => {
                    warn!(node = %self.node, path = %path.display(), error = %err, "skipping unreadable snapshot");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_snapshot_corrupt(&self.node);
                    }
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_restore_duration(&self.node, started.elapsed().as_secs_f64());
        }
        Ok(restored)
    }

    /// Snapshot files in ascending sequence order.
    pub fn snapshots(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension().and_then(|ext| ext.to_str()) == Some(SNAPSHOT_EXTENSION)
            })
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Return the directory where this node's snapshots are stored.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sequence number encoded in a snapshot file name.
    pub fn sequence_of(path: &Path) -> Option<u64> {
        path.file_stem()?.to_str()?.parse().ok()
    }

    fn prune_old(&self) -> Result<()> {
        let entries = self.snapshots()?;
        if entries.len() <= self.retain_last {
            return Ok(());
        }
        let excess = entries.len() - self.retain_last;
        for path in entries.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed pruning snapshot");
            }
        }
        Ok(())
    }
}
