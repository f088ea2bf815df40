//! Control-plane client helpers using kube-rs

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from a kubeconfig file with default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from a kubeconfig file with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let target = kubeconfig.display().to_string();
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to read kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    debug!(cluster_url = %config.cluster_url, "building control-plane client");
    Client::try_from(config)
        .map_err(|e| Error::connection(target, format!("failed to create client: {}", e)))
}

/// Split an apiVersion into (group, version). Core resources have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Point every cluster entry of a kubeconfig at `server`.
///
/// The bootstrap-generated kubeconfig names the loopback address of the node
/// it was read from; callers outside the cluster need the stable entry address.
pub fn rewrite_kubeconfig_server(kubeconfig: &str, server: &str) -> Result<String, Error> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(kubeconfig).map_err(|e| {
        Error::internal_with_context("kubeconfig", format!("failed to parse kubeconfig: {}", e))
    })?;

    let mut updated = 0;
    if let Some(clusters) = doc.get_mut("clusters").and_then(|c| c.as_sequence_mut()) {
        for cluster in clusters {
            if let Some(current) = cluster
                .get_mut("cluster")
                .and_then(|c| c.get_mut("server"))
            {
                let old = current.as_str().unwrap_or("unknown").to_string();
                *current = serde_yaml::Value::String(server.to_string());
                info!(old_server = %old, new_server = %server, "updated kubeconfig server");
                updated += 1;
            }
        }
    }

    if updated == 0 {
        return Err(Error::internal_with_context(
            "kubeconfig",
            "kubeconfig has no cluster server entries",
        ));
    }

    serde_yaml::to_string(&doc).map_err(|e| {
        Error::internal_with_context("kubeconfig", format!("failed to encode kubeconfig: {}", e))
    })
}
