//! ---
//! lreg_section: "01-core-functionality"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Shared primitives and utilities for the registry runtime."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
//! Shared primitives for the lreg workspace.
//! This crate exposes configuration loading, tracing initialisation, and the
//! clock abstraction that every time-dependent component is built against.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, ClusterConfig, LicenseConfig, LoggingConfig, MetricsConfig, NodeConfig,
    SnapshotConfig,
};
pub use logging::{init_tracing, LogFormat, LogGuard};
pub use time::{Clock, ManualClock, SystemClock};
