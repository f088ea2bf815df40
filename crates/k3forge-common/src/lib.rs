//! Common types for k3forge: configuration, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod poll;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "k3forge";

/// Port the cluster API server listens on at the entry address
pub const API_SERVER_PORT: u16 = 6443;

/// Namespace used for namespaced resources and charts that name none
pub const DEFAULT_NAMESPACE: &str = "default";

/// Build the API server URL for the cluster entry address
pub fn api_server_url(entry_address: &str) -> String {
    format!("https://{}:{}", entry_address, API_SERVER_PORT)
}
