//! ---
//! lreg_section: "04-persistence"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Snapshot persistence for replicated registry state."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the persistence subsystem.
#[derive(Clone)]
pub struct PersistenceMetrics {
    snapshots_saved: IntCounterVec,
    snapshots_failed: IntCounterVec,
    snapshots_corrupt: IntCounterVec,
    restore_duration: HistogramVec,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let snapshots_saved = IntCounterVec::new(
            Opts::new(
                "lreg_snapshots_saved_total",
                "Total number of state snapshots successfully persisted",
            ),
            &["node"],
        )?;
        registry.register(Box::new(snapshots_saved.clone()))?;

        let snapshots_failed = IntCounterVec::new(
            Opts::new(
                "lreg_snapshots_failed_total",
                "Total number of snapshot persist operations that failed",
            ),
            &["node"],
        )?;
        registry.register(Box::new(snapshots_failed.clone()))?;

        let snapshots_corrupt = IntCounterVec::new(
            Opts::new(
                "lreg_snapshots_corrupt_total",
                "Snapshots skipped during restore because they failed verification",
            ),
            &["node"],
        )?;
        registry.register(Box::new(snapshots_corrupt.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "lreg_snapshot_restore_duration_seconds",
            "Duration spent locating and restoring the latest snapshot",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 12)?);
        let restore_duration = HistogramVec::new(histogram_opts, &["node"])?;
        registry.register(Box::new(restore_duration.clone()))?;

        Ok(Self {
            snapshots_saved,
            snapshots_failed,
            snapshots_corrupt,
            restore_duration,
        })
    }

    /// Record a successful snapshot for `node`.
    pub fn record_snapshot_saved(&self, node: &str) {
        self.snapshots_saved.with_label_values(&[node]).inc();
    }

    /// Record a failed snapshot persist attempt.
    pub fn record_snapshot_failed(&self, node: &str) {
        self.snapshots_failed.with_label_values(&[node]).inc();
    }

    /// Record a snapshot skipped during restore.
    pub fn record_snapshot_corrupt(&self, node: &str) {
        self.snapshots_corrupt.with_label_values(&[node]).inc();
    }

    /// Observe the duration spent restoring a node's state.
    pub fn observe_restore_duration(&self, node: &str, seconds: f64) {
        self.restore_duration
            .with_label_values(&[node])
            .observe(seconds);
    }

    /// Snapshots saved for `node` so far.
    pub fn saved_total(&self, node: &str) -> u64 {
        self.snapshots_saved.with_label_values(&[node]).get()
    }

    /// Snapshots rejected during restore for `node` so far.
    pub fn corrupt_total(&self, node: &str) -> u64 {
        self.snapshots_corrupt.with_label_values(&[node]).get()
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
