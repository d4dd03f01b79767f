//! ---
//! lreg_section: "03-cluster-registry"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Replicated license registry and coordinator actions."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
//! Cluster-wide license registry.
//!
//! Every node keeps a replica of the [`ClusterState`]. Put and Delete are
//! routed to the leader elected by [`lreg_redundancy::RedundancySupervisor`],
//! applied there with a bounded compare-and-set, and published to the other
//! nodes; the client is acknowledged once a majority holds the new version.

mod actions;
mod cluster;
mod error;
mod metrics;
mod node;
mod settings;
mod state;
mod store;
mod sweeper;
mod transport;

pub use actions::{
    DeleteRequest, DeleteResponse, ForwardedRequest, GetResponse, Mutation, MutationResponse,
    PutRequest, PutResponse, RequestPhase, RequestTrace,
};
pub use cluster::{LocalCluster, LocalClusterBuilder};
pub use error::{ErrorCode, RegistryError, RegistryResult, StoreError};
pub use metrics::RegistryMetrics;
pub use node::RegistryNode;
pub use settings::{load_verifier, RegistrySettings};
pub use state::ClusterState;
pub use store::{CasOutcome, LicenseStore};
pub use sweeper::ExpirySweeper;
pub use transport::{ClusterTransport, InMemoryTransport};
