//! Chart release lifecycle
//!
//! [`ChartManager`] talks to the release store; [`rollout`] decides what to
//! do with a chart given the release that is already there.

pub mod helm;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

pub use helm::{HelmBinary, HelmChartManager, HelmCli, HelmOutput};

use crate::config::ChartSpec;
use crate::reconcile::ManifestApplier;
use crate::{Result, DEFAULT_NAMESPACE};

/// Release status that means the chart is installed and healthy
pub const STATUS_DEPLOYED: &str = "deployed";

/// A chart ready to install
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chart {
    /// Catalog name
    pub name: String,
    /// Release name
    pub release: String,
    /// Target namespace
    pub namespace: String,
    /// Packaged chart archive
    pub package: PathBuf,
    /// Values file passed with `-f`
    pub values_file: Option<PathBuf>,
    /// `key=value` overrides
    pub set_values: Vec<String>,
    /// Install timeout
    pub timeout: Duration,
    /// Manifests applied before install and deleted after uninstall
    pub before: Option<PathBuf>,
    /// Manifests applied after install and deleted before uninstall
    pub after: Option<PathBuf>,
}

impl Chart {
    /// Build from a validated catalog entry
    pub fn from_spec(name: &str, spec: &ChartSpec) -> Self {
        Self {
            name: name.to_string(),
            release: spec
                .release_name
                .clone()
                .unwrap_or_else(|| name.to_string()),
            namespace: spec
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            package: spec.package.clone(),
            values_file: spec.values_file.clone(),
            set_values: spec.set_values.clone(),
            timeout: Duration::from_secs(spec.timeout),
            before: spec.before.clone(),
            after: spec.after.clone(),
        }
    }
}

impl fmt::Display for Chart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.release)
    }
}

/// A live release as reported by the release store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Release {
    /// Release name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Status, e.g. `deployed`, `failed`, `pending-install`
    pub status: String,
}

impl Release {
    /// Installed and healthy
    pub fn is_deployed(&self) -> bool {
        self.status == STATUS_DEPLOYED
    }
}

/// Release store operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartManager: Send + Sync {
    /// Current release; [`Error::ReleaseNotFound`](crate::Error::ReleaseNotFound)
    /// when there is none
    async fn get_release(&self, name: &str, namespace: &str) -> Result<Release>;

    /// Apply the before hook, install, then apply the after hook
    async fn install(&self, chart: &Chart) -> Result<()>;

    /// Delete the after hook, uninstall, then delete the before hook
    async fn uninstall(&self, chart: &Chart) -> Result<()>;
}

/// What [`rollout`] does for a chart
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutAction {
    /// No release yet
    Install,
    /// Release is deployed; only the after hook is re-applied
    RefreshHooks,
    /// Release exists in some other state; remove it and install again
    Reinstall,
}

/// Choose the action for the release lookup result.
///
/// Lookup errors other than a missing release are returned as is.
pub fn plan_rollout(release: Result<Release>) -> Result<RolloutAction> {
    match release {
        Err(e) if e.is_release_not_found() => Ok(RolloutAction::Install),
        Err(e) => Err(e),
        Ok(r) if r.is_deployed() => Ok(RolloutAction::RefreshHooks),
        Ok(_) => Ok(RolloutAction::Reinstall),
    }
}

/// Bring one chart to a deployed release
pub async fn rollout(
    charts: &dyn ChartManager,
    manifests: &dyn ManifestApplier,
    chart: &Chart,
) -> Result<RolloutAction> {
    let release = charts.get_release(&chart.release, &chart.namespace).await;
    let action = plan_rollout(release)?;
    info!(chart = %chart, action = ?action, "rolling out chart");
    match action {
        RolloutAction::Install => charts.install(chart).await?,
        RolloutAction::RefreshHooks => apply_hook(manifests, chart.after.as_deref()).await?,
        RolloutAction::Reinstall => {
            charts.uninstall(chart).await?;
            charts.install(chart).await?;
        }
    }
    Ok(action)
}

async fn apply_hook(manifests: &dyn ManifestApplier, hook: Option<&Path>) -> Result<()> {
    match hook {
        Some(path) => manifests.apply(path).await,
        None => Ok(()),
    }
}
