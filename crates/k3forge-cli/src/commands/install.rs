//! Install command - bootstrap nodes and run every configured step
//!
//! Usage: k3forge install -f <config>

use clap::Args;
use tracing::info;

use k3forge::orchestrator::ClusterOrchestrator;

use super::ConfigArgs;
use crate::Result;

/// Install the cluster described by a configuration file
#[derive(Args, Debug)]
pub struct InstallArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(args: InstallArgs) -> Result<()> {
    let config = args.config.load()?;
    info!(
        config = %args.config.config.display(),
        nodes = config.nodes.len(),
        steps = config.steps.len(),
        "installing cluster"
    );
    ClusterOrchestrator::new(config).install().await?;
    Ok(())
}
