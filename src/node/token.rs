//! Write-once cluster join token shared by every node task

use std::sync::OnceLock;
use std::time::Duration;

use tracing::{debug, info};

use crate::poll::poll_until;
use crate::Result;

const WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Join secret issued by the cluster-initializing server.
///
/// The first [`publish`](Self::publish) wins; later ones are ignored. Joining
/// nodes block in [`wait`](Self::wait) until a value is present.
#[derive(Debug, Default)]
pub struct ClusterToken {
    value: OnceLock<String>,
}

impl ClusterToken {
    /// Empty token
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the token; returns false if one was already set
    pub fn publish(&self, token: impl Into<String>) -> bool {
        let token = token.into().trim().to_string();
        let stored = self.value.set(token).is_ok();
        if stored {
            info!("cluster token published");
        } else {
            debug!("cluster token already published, ignoring");
        }
        stored
    }

    /// Current token, if published
    pub fn get(&self) -> Option<&str> {
        self.value.get().map(String::as_str)
    }

    /// Wait up to `timeout` for the token to be published
    pub async fn wait(&self, timeout: Duration) -> Result<String> {
        if let Some(token) = self.get() {
            return Ok(token.to_string());
        }
        poll_until(timeout, WAIT_INTERVAL, "cluster join token", move || async move {
            Ok(self.get().is_some())
        })
        .await?;
        Ok(self.get().map(str::to_string).unwrap_or_default())
    }
}
