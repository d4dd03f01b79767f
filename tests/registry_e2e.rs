//! ---
//! lreg_section: "15-testing-qa-runbook"
//! lreg_subsection: "integration-tests"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "End-to-end scenarios for a ten node license registry."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lreg_cluster::{DeleteRequest, ErrorCode, LocalCluster, PutRequest};
use lreg_common::config::{ClusterConfig, SnapshotConfig};
use lreg_common::time::{parse_date_millis, Clock, ManualClock};
use lreg_licensing::{same_licenses, FeatureType, LicenseDocument, LicenseSet};
use lreg_testharness::{FeatureAttributes, TestSigner};
use tempfile::tempdir;

const NODES: usize = 10;

fn cluster_config() -> ClusterConfig {
    let mut config = ClusterConfig::with_nodes("e2e", NODES);
    config.request_timeout = Duration::from_millis(400);
    config.sweep_interval = None;
    config
}

struct Harness {
    cluster: LocalCluster,
    clock: Arc<ManualClock>,
    signer: TestSigner,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(cluster_config(), None)
    }

    fn start_with(config: ClusterConfig, snapshots: Option<SnapshotConfig>) -> Self {
        let signer = TestSigner::default();
        let clock = Arc::new(ManualClock::at_date("2015-01-01").unwrap());
        let mut builder = LocalCluster::builder(config, signer.verifier()).clock(clock.clone());
        if let Some(snapshots) = snapshots {
            builder = builder.snapshots(snapshots);
        }
        Self {
            cluster: builder.start().unwrap(),
            clock,
            signer,
        }
    }

    fn license(&self, attributes: FeatureAttributes) -> LicenseDocument {
        self.signer.license(&attributes).unwrap()
    }

    fn shield(&self) -> LicenseDocument {
        self.license(FeatureAttributes::new(FeatureType::Shield, 2, "2014-12-13", "2015-12-13"))
    }

    fn marvel(&self) -> LicenseDocument {
        self.license(FeatureAttributes::new(FeatureType::Marvel, 2, "2014-12-13", "2015-12-13"))
    }

    /// Set a client would expect to read back at the current clock.
    fn expected(&self, documents: impl IntoIterator<Item = LicenseDocument>) -> LicenseSet {
        LicenseSet::builder()
            .at(self.clock.now_millis())
            .add_all(documents)
            .build()
    }

    fn node(&self, index: usize) -> Arc<lreg_cluster::RegistryNode> {
        self.cluster.node_at(index).unwrap()
    }

    /// Wait until every reachable node holds at least `version`.
    async fn converged(&self, version: u64) {
        for _ in 0..400 {
            if self.cluster.nodes().all(|node| node.get().version >= version) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cluster did not converge on version {version}");
    }

    fn assert_everywhere(&self, expected: &LicenseSet) {
        for node in self.cluster.nodes() {
            let view = node.get();
            assert!(
                same_licenses(&view.licenses, expected),
                "{} disagrees: {:?}",
                node.id(),
                view.licenses.features()
            );
        }
    }
}

#[tokio::test]
async fn fresh_cluster_has_no_licenses() {
    let harness = Harness::start();
    assert_eq!(harness.cluster.len(), NODES);
    for node in harness.cluster.nodes() {
        let view = node.get();
        assert!(view.licenses.is_empty());
        assert_eq!(view.version, 0);
    }
}

#[tokio::test]
async fn put_shield_is_visible_on_every_node() {
    let harness = Harness::start();
    let shield = harness.shield();
    let response = harness
        .node(0)
        .put(PutRequest::new(shield.clone()))
        .await
        .unwrap();
    assert!(response.acknowledged);
    harness.converged(response.version).await;

    let expected = harness.expected([shield]);
    assert_eq!(expected.len(), 1);
    harness.assert_everywhere(&expected);

    let view = harness.node(9).get();
    assert_eq!(view.licenses.len(), 1);
    let document = view.licenses.get(FeatureType::Shield).unwrap();
    assert_eq!(document.max_nodes, 2);
    assert_eq!(document.issue_date, parse_date_millis("2014-12-13").unwrap());
    assert_eq!(document.expiry_date, parse_date_millis("2015-12-13").unwrap());
}

#[tokio::test]
async fn put_through_follower_replicates() {
    let harness = Harness::start();
    let text = harness
        .signer
        .generate_licenses(&[
            FeatureAttributes::new(FeatureType::Shield, 2, "2014-12-13", "2015-12-13"),
            FeatureAttributes::new(FeatureType::Marvel, 5, "2014-12-13", "2015-12-13"),
        ])
        .unwrap();
    let request = PutRequest::from_signed_str(&text).unwrap();
    let response = harness.node(7).put(request).await.unwrap();
    harness.converged(response.version).await;

    for node in harness.cluster.nodes() {
        assert_eq!(node.get().licenses.len(), 2, "{}", node.id());
    }
}

#[tokio::test]
async fn delete_removes_matching_features() {
    let harness = Harness::start();
    harness
        .node(3)
        .put(PutRequest::from_documents([harness.shield(), harness.marvel()]))
        .await
        .unwrap();

    let response = harness
        .node(4)
        .delete(DeleteRequest::new("elasticsearch", "SHIELD"))
        .await
        .unwrap();
    assert!(response.acknowledged);
    harness.converged(response.version).await;
    for node in harness.cluster.nodes() {
        let features = node.get().licenses.features();
        assert_eq!(features.into_iter().collect::<Vec<_>>(), vec![FeatureType::Marvel]);
    }

    let unknown = harness
        .node(5)
        .delete(DeleteRequest::features(["watcher"]))
        .await
        .unwrap();
    assert_eq!(unknown.version, response.version);

    let wrong_issuer = harness
        .node(5)
        .delete(DeleteRequest::new("someone-else", "marvel"))
        .await
        .unwrap();
    assert_eq!(wrong_issuer.version, response.version);

    let everything = harness
        .node(6)
        .delete(DeleteRequest::features(["*"]))
        .await
        .unwrap();
    harness.converged(everything.version).await;
    harness.assert_everywhere(&LicenseSet::empty());
}

#[tokio::test]
async fn concurrent_puts_resolve_to_latest_issue() {
    let harness = Harness::start();
    let older = harness.shield();
    let newer = harness.license(FeatureAttributes::new(
        FeatureType::Shield,
        2,
        "2014-12-20",
        "2015-12-13",
    ));
    let marvel = harness.marvel();

    let requests = [
        (2, PutRequest::new(older)),
        (7, PutRequest::new(newer.clone())),
        (5, PutRequest::new(marvel.clone())),
    ];
    let responses = join_all(
        requests
            .into_iter()
            .map(|(index, request)| {
                let node = harness.node(index);
                async move { node.put(request).await }
            }),
    )
    .await;
    let mut latest = 0;
    for response in responses {
        let response = response.unwrap();
        assert!(response.acknowledged);
        latest = latest.max(response.version);
    }
    harness.converged(latest).await;

    let expected = harness.expected([newer, marvel]);
    harness.assert_everywhere(&expected);
}

#[tokio::test]
async fn tampered_documents_are_rejected() {
    let harness = Harness::start();
    let mut tampered = harness.shield();
    tampered.max_nodes = 100;

    let err = harness
        .node(1)
        .put(PutRequest::new(tampered.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSignature);
    assert!(!err.is_transient());

    // All or nothing: the valid document in the same request is not installed.
    let err = harness
        .node(1)
        .put(PutRequest::from_documents([harness.marvel(), tampered]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSignature);

    let foreign = TestSigner::from_seed([3u8; 32])
        .license(&FeatureAttributes::new(FeatureType::Marvel, 2, "2014-12-13", "2015-12-13"))
        .unwrap();
    let err = harness.node(2).put(PutRequest::new(foreign)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSignature);

    for node in harness.cluster.nodes() {
        assert_eq!(node.get().version, 0);
    }
}

#[tokio::test]
async fn malformed_documents_are_rejected() {
    let harness = Harness::start();
    let err = PutRequest::from_signed_str("{ not a license").unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedDocument);

    let expired = harness.license(FeatureAttributes::new(
        FeatureType::Shield,
        2,
        "2014-01-01",
        "2014-06-01",
    ));
    let err = harness.node(0).put(PutRequest::new(expired)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedDocument);

    let err = harness
        .node(0)
        .put(PutRequest::from_documents(Vec::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedDocument);

    let mut unsigned = harness.marvel();
    unsigned.signature.clear();
    let err = harness.node(4).put(PutRequest::new(unsigned)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedDocument);
}

#[tokio::test]
async fn no_eligible_leader_reports_no_leader() {
    let mut config = cluster_config();
    for (_, node) in config.nodes.iter_mut().skip(1) {
        node.leader_eligible = false;
    }
    let harness = Harness::start_with(config, None);
    harness.cluster.stop_node("node-0");

    let err = harness
        .node(6)
        .put(PutRequest::new(harness.shield()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoLeader);

    let err = harness
        .node(6)
        .delete(DeleteRequest::features(["*"]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoLeader);

    // Reads keep working from the local replica.
    assert!(harness.node(6).get().licenses.is_empty());
}

#[tokio::test]
async fn partitioned_majority_times_out() {
    let harness = Harness::start();
    harness
        .cluster
        .partition(&["node-1", "node-2", "node-3", "node-4", "node-5"]);

    let err = harness
        .node(8)
        .put(PutRequest::new(harness.shield()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(err.is_transient());

    harness.cluster.heal().unwrap();
    let response = harness
        .node(8)
        .put(PutRequest::new(harness.marvel()))
        .await
        .unwrap();
    harness.converged(response.version).await;
    assert!(harness.node(3).get().licenses.get(FeatureType::Marvel).is_some());
}

#[tokio::test]
async fn failover_keeps_installed_licenses() {
    let harness = Harness::start();
    let response = harness
        .node(4)
        .put(PutRequest::new(harness.shield()))
        .await
        .unwrap();
    harness.converged(response.version).await;

    harness.cluster.stop_node("node-0");
    let leader = harness.cluster.leader().unwrap();
    assert_eq!(leader.id(), "node-1");
    assert!(leader.get().licenses.get(FeatureType::Shield).is_some());

    let response = harness
        .node(9)
        .put(PutRequest::new(harness.marvel()))
        .await
        .unwrap();
    assert!(response.acknowledged);
    assert_eq!(leader.get().licenses.len(), 2);

    harness.cluster.restart_node("node-0").unwrap();
    assert_eq!(harness.node(0).get().licenses.len(), 2);
}

#[tokio::test]
async fn restart_restores_from_snapshots() {
    let dir = tempdir().unwrap();
    let snapshots = SnapshotConfig {
        enabled: true,
        directory: dir.path().to_path_buf(),
        retain_last: 3,
    };

    let shield = {
        let harness = Harness::start_with(cluster_config(), Some(snapshots.clone()));
        let shield = harness.shield();
        let response = harness
            .node(2)
            .put(PutRequest::new(shield.clone()))
            .await
            .unwrap();
        harness.converged(response.version).await;
        harness.cluster.shutdown().await;
        shield
    };

    let harness = Harness::start_with(cluster_config(), Some(snapshots));
    let expected = harness.expected([shield]);
    harness.assert_everywhere(&expected);
    assert_eq!(harness.node(5).get().version, 1);

    let response = harness
        .node(5)
        .put(PutRequest::new(harness.marvel()))
        .await
        .unwrap();
    assert_eq!(response.version, 2);
}

#[tokio::test]
async fn expired_licenses_disappear_then_get_swept() {
    let harness = Harness::start();
    let short = harness.license(FeatureAttributes::new(
        FeatureType::Shield,
        2,
        "2014-12-13",
        "2015-02-01",
    ));
    let response = harness
        .node(1)
        .put(PutRequest::from_documents([short, harness.marvel()]))
        .await
        .unwrap();
    harness.converged(response.version).await;

    harness
        .clock
        .set(parse_date_millis("2015-03-01").unwrap());
    for node in harness.cluster.nodes() {
        assert_eq!(node.get().licenses.len(), 1);
    }

    let leader = harness.cluster.leader().unwrap();
    let swept = leader.sweep_once().await.unwrap().unwrap();
    assert_eq!(swept, response.version + 1);
    harness.converged(swept).await;
    for node in harness.cluster.nodes() {
        assert!(node.state().licenses.get(FeatureType::Shield).is_none());
    }
}
