//! Uninstall command - undo every configured step in reverse order
//!
//! Usage: k3forge uninstall -f <config>
//!
//! Charts with no release are skipped and manifests whose objects are already
//! gone count as deleted, so a partially installed cluster can be torn down.

use clap::Args;
use tracing::info;

use k3forge::orchestrator::ClusterOrchestrator;

use super::ConfigArgs;
use crate::Result;

/// Tear down the cluster described by a configuration file
#[derive(Args, Debug)]
pub struct UninstallArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(args: UninstallArgs) -> Result<()> {
    let config = args.config.load()?;
    info!(
        config = %args.config.config.display(),
        steps = config.steps.len(),
        "uninstalling cluster"
    );
    ClusterOrchestrator::new(config).uninstall().await?;
    Ok(())
}
