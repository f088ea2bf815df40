//! k3forge - k3s cluster bootstrap and rollout over SSH
//!
//! k3forge takes a set of machines described in one configuration file,
//! installs k3s on them and then brings the cluster to a declared state with
//! raw manifests and helm charts.
//!
//! # Architecture
//!
//! - Every node is driven over its own SSH session; the runtime step fans out
//!   to all nodes at once and reports every node that failed
//! - The first master forms the cluster and publishes the join token that the
//!   other nodes wait on
//! - Chart and manifest steps talk to the control plane through the admin
//!   kubeconfig read back from the initializing node
//! - Uninstall runs the same steps in reverse
//!
//! # Modules
//!
//! - [`remote`] - Command execution and file transfer on a node
//! - [`node`] - Per-node packages, images and runtime bootstrap
//! - [`reconcile`] - Create-or-apply and delete of raw manifests
//! - [`chart`] - Helm release lifecycle and rollout policy
//! - [`pipeline`] - Ordered install/uninstall steps
//! - [`orchestrator`] - Builds the pipeline from configuration

#![deny(missing_docs)]

pub mod chart;
pub mod node;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod remote;

pub use k3forge_common::{
    api_server_url, config, error, kube_utils, poll, Error, Result, API_SERVER_PORT,
    DEFAULT_NAMESPACE, FIELD_MANAGER,
};
