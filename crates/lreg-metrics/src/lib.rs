//! ---
//! lreg_section: "06-observability"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Metrics collection and export utilities."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
//! Prometheus plumbing shared by lreg processes: the `/metrics` exporter,
//! leader-election gauges and the daemon's startup facts. Coordinator and
//! snapshot metrics live next to the code that records them.

use std::sync::Arc;

use prometheus::Registry;

mod election;
mod exporter;
mod process;

pub use election::ElectionMetrics;
pub use exporter::MetricsExporter;
pub use process::record_startup;

/// Registry handle passed to every component that registers collectors.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}
