//! CLI commands

use std::path::PathBuf;

use clap::Args;
use tracing::debug;

use k3forge::config::Config;

use crate::{Error, Result};

pub mod install;
pub mod uninstall;

/// Location of the cluster configuration file
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to the cluster configuration file
    #[arg(short = 'f', long = "config", env = "K3FORGE_CONFIG")]
    pub config: PathBuf,
}

impl ConfigArgs {
    /// Read and validate the configuration file
    pub fn load(&self) -> Result<Config> {
        if !self.config.is_file() {
            return Err(Error::ConfigNotFound {
                path: self.config.clone(),
            });
        }
        let config = Config::load(&self.config)?;
        debug!(path = %self.config.display(), "configuration loaded");
        Ok(config)
    }
}
