//! Error types for k3forge
//!
//! Errors are structured with fields so that a failure deep inside a node
//! task or a manifest directory still says which host, command, resource or
//! release it came from once it reaches the top-level caller.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// One node's failure inside a parallel fan-out step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    /// Node name
    pub node: String,
    /// Rendered error of the node task
    pub error: String,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.node, self.error)
    }
}

/// Main error type for k3forge operations
#[derive(Debug, Error)]
pub enum Error {
    /// Transport or authentication failure reaching a node or the control plane
    #[error("connection error [{target}]: {message}")]
    Connection {
        /// Address that could not be reached
        target: String,
        /// Description of what failed
        message: String,
    },

    /// A remote command exited non-zero
    #[error("remote command failed on {host} (exit {}): {command}: {output}", .exit_status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()))]
    RemoteCommand {
        /// Host the command ran on
        host: String,
        /// The command line
        command: String,
        /// Exit status, if the channel reported one
        exit_status: Option<u32>,
        /// Combined stdout and stderr, trimmed
        output: String,
    },

    /// Remote target already exists and overwrite was not requested
    #[error("file exists on {host}: {path}")]
    FileExists {
        /// Host holding the file
        host: String,
        /// Remote path
        path: String,
    },

    /// A control-plane lookup found nothing
    #[error("resource not found: {kind}/{name}{}", .namespace.as_ref().map(|ns| format!(" in namespace {}", ns)).unwrap_or_default())]
    ResourceNotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Namespace, `None` for cluster-scoped resources
        namespace: Option<String>,
    },

    /// No chart release exists under that name
    #[error("release {release} not found in namespace {namespace}")]
    ReleaseNotFound {
        /// Release name
        release: String,
        /// Release namespace
        namespace: String,
    },

    /// A polling deadline elapsed
    #[error("timed out after {timeout:?} waiting for {probe}")]
    Timeout {
        /// What was being waited for
        probe: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Configuration problem
    #[error("validation error{}: {message}", .field.as_ref().map(|f| format!(" at {}", f)).unwrap_or_default())]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "nodes.node1.address")
        field: Option<String>,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Manifest decode or encode failure
    #[error("manifest error in {path}: {message}")]
    Manifest {
        /// Manifest file the document came from
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Chart lifecycle failure
    #[error("chart error [{release}]: {message}")]
    Chart {
        /// Release name
        release: String,
        /// Description of what failed
        message: String,
    },

    /// One or more nodes failed a fan-out step
    #[error("{step} failed on {} node(s): {}", .failures.len(), .failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
    NodeFailures {
        /// Step that fanned out
        step: String,
        /// Every node that failed
        failures: Vec<NodeFailure>,
    },

    /// Local filesystem error
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a connection error
    pub fn connection(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a configuration field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a manifest error for a file
    pub fn manifest(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a chart error for a release
    pub fn chart(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Chart {
            release: release.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(probe: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            probe: probe.into(),
            timeout,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when a control-plane lookup found nothing
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True when a create lost to an object of the same name
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae),
            } if ae.code == 409
        )
    }

    /// True when no chart release exists
    pub fn is_release_not_found(&self) -> bool {
        matches!(self, Error::ReleaseNotFound { .. })
    }

    /// True when a remote copy or write hit an existing file
    pub fn is_file_exists(&self) -> bool {
        matches!(self, Error::FileExists { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
