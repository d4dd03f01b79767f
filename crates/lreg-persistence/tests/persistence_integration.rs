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
use std::sync::Arc;

use lreg_common::config::SnapshotConfig;
use lreg_persistence::{PersistenceMetrics, SnapshotStore};
use prometheus::Registry;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn store_from_config_uses_per_node_directories() {
    let dir = tempdir().unwrap();
    let config = SnapshotConfig {
        enabled: true,
        directory: dir.path().to_path_buf(),
        retain_last: 3,
    };
    let first = SnapshotStore::from_config(&config, "node-0").unwrap();
    let second = SnapshotStore::from_config(&config, "node-1").unwrap();

    first.write(7, &json!({"version": 7})).unwrap();
    assert!(first.root().ends_with("node-0"));
    assert!(second.load_latest::<serde_json::Value>().unwrap().is_none());

    let (state, _) = first.load_latest::<serde_json::Value>().unwrap().unwrap();
    assert_eq!(state["version"], 7);
}

#[test]
fn metrics_track_saves_and_corruption() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(Registry::new());
    let metrics = PersistenceMetrics::new(registry.clone()).unwrap();
    let store = SnapshotStore::open(dir.path(), "node-3", 4)
        .unwrap()
        .with_metrics(metrics.clone());

    store.write(1, &json!({"licenses": []})).unwrap();
    let path = store.write(2, &json!({"licenses": ["x"]})).unwrap();
    assert_eq!(metrics.saved_total("node-3"), 2);

    fs::write(&path, b"garbage").unwrap();
    let (state, _) = store.load_latest::<serde_json::Value>().unwrap().unwrap();
    assert_eq!(state, json!({"licenses": []}));
    assert_eq!(metrics.corrupt_total("node-3"), 1);

    let names: Vec<String> = registry
        .gather()
        .iter()
        .map(|family| family.get_name().to_owned())
        .collect();
    assert!(names.contains(&"lreg_snapshots_saved_total".to_owned()));
}
