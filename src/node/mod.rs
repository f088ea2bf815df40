//! Per-machine bootstrap
//!
//! A [`Node`] is the configuration-derived description of one machine; a
//! [`NodeBootstrapper`] drives it through package install, image preload
//! and runtime install over its own [`RemoteSession`](crate::remote::RemoteSession).

mod bootstrap;
pub mod package;
pub mod runtime;
pub mod token;

use std::path::PathBuf;

pub use bootstrap::{BootstrapState, BootstrapTimings, NodeBootstrapper};
pub use package::Package;
pub use runtime::RuntimeStatus;
pub use token::ClusterToken;

pub use crate::config::NodeRole;
pub use crate::remote::SystemFacts;

use crate::config::{Config, NodeSpec, Requirement};

/// One machine in the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Name in the configuration file
    pub name: String,
    /// SSH address
    pub address: String,
    /// SSH port
    pub ssh_port: u16,
    /// Cluster role
    pub role: NodeRole,
    /// This master forms the cluster and issues the join token
    pub cluster_init: bool,
    /// Package tasks, in declared order
    pub packages: Vec<Package>,
    /// Local image archives to preload
    pub images: Vec<PathBuf>,
    /// Minimum resources
    pub requirement: Option<Requirement>,
}

impl Node {
    /// Build from a validated node entry
    pub fn from_config(name: &str, spec: &NodeSpec, config: &Config, cluster_init: bool) -> Self {
        let packages = spec
            .install_packages
            .iter()
            .filter_map(|pkg| config.packages.get(pkg).map(|s| Package::from_spec(pkg, s)))
            .collect();
        let images = spec
            .preload_images
            .iter()
            .filter_map(|img| config.images.get(img).map(|i| i.path.clone()))
            .collect();
        Self {
            name: name.to_string(),
            address: spec.address.clone(),
            ssh_port: spec.ssh_port,
            role: spec.role,
            cluster_init,
            packages,
            images,
            requirement: spec.requirement.clone(),
        }
    }
}
