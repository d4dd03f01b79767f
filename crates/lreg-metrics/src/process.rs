//! ---
//! lreg_section: "06-observability"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Metrics collection and export utilities."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Gauge, IntGaugeVec, Opts, Registry};

/// Register the facts a daemon knows once at startup: which build is
/// running and how long configuration loading took.
pub fn record_startup(
    registry: &Registry,
    version: &str,
    profile: &str,
    config_load: Duration,
) -> prometheus::Result<()> {
    let build = IntGaugeVec::new(
        Opts::new("lregd_build_info", "Constant 1, labelled with the running build"),
        &["version", "profile"],
    )?;
    registry.register(Box::new(build.clone()))?;
    build.with_label_values(&[version, profile]).set(1);

    let load = Gauge::with_opts(Opts::new(
        "lregd_config_load_seconds",
        "Time spent loading and validating configuration at startup",
    ))?;
    registry.register(Box::new(load.clone()))?;
    load.set(config_load.as_secs_f64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample;

    #[test]
    fn startup_facts_are_exported() {
        let registry = Registry::new();
        record_startup(&registry, "0.1.0", "debug", Duration::from_millis(250)).unwrap();
        assert_eq!(sample(&registry, "lregd_build_info", ("version", "0.1.0")), Some(1.0));
        assert!(record_startup(&registry, "0.1.0", "debug", Duration::ZERO).is_err());
    }
}
