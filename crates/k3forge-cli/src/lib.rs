//! k3forge CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// k3forge - k3s cluster bootstrap and rollout
#[derive(Parser, Debug)]
#[command(name = "k3forge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap the cluster and run every step
    Install(commands::install::InstallArgs),
    /// Undo every step in reverse order
    Uninstall(commands::uninstall::UninstallArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Install(args) => commands::install::run(args).await,
            Commands::Uninstall(args) => commands::uninstall::run(args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn install_takes_config_flag() {
        let cli = Cli::try_parse_from(["k3forge", "install", "-f", "cluster.yaml"]).unwrap();
        match cli.command {
            Commands::Install(args) => assert_eq!(args.config.config, Path::new("cluster.yaml")),
            other => panic!("expected install, got {:?}", other),
        }
    }

    #[test]
    fn uninstall_takes_long_config_flag() {
        let cli =
            Cli::try_parse_from(["k3forge", "uninstall", "--config", "/etc/k3forge.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Uninstall(_)));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["k3forge", "upgrade", "-f", "c.yaml"]).is_err());
    }
}
