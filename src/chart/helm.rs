//! [`ChartManager`] over the helm command line

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Chart, ChartManager, Release, STATUS_DEPLOYED};
use crate::reconcile::ManifestApplier;
use crate::{Error, Result};

/// Uninstall wait window, in seconds
const UNINSTALL_TIMEOUT_SECS: u64 = 120;

/// Captured result of one helm invocation
#[derive(Clone, Debug, Default)]
pub struct HelmOutput {
    /// Exit status was zero
    pub success: bool,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl From<std::process::Output> for HelmOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Runs helm (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmCli: Send + Sync {
    /// Run helm with `args`; a non-zero exit is reported in the output, not as an error
    async fn run(&self, args: Vec<String>) -> Result<HelmOutput>;
}

/// The helm binary, pointed at one cluster
#[derive(Clone, Debug)]
pub struct HelmBinary {
    binary: String,
    kubeconfig: PathBuf,
}

impl HelmBinary {
    /// Use `binary` with the credentials in `kubeconfig`
    pub fn new(binary: impl Into<String>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: kubeconfig.into(),
        }
    }
}

#[async_trait]
impl HelmCli for HelmBinary {
    async fn run(&self, args: Vec<String>) -> Result<HelmOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--kubeconfig").arg(&self.kubeconfig).args(&args);
        debug!(command = ?cmd, "executing helm");
        let output = cmd.output().await.map_err(|e| {
            Error::internal_with_context("helm", format!("failed to execute {}: {}", self.binary, e))
        })?;
        Ok(output.into())
    }
}

/// Release JSON printed by `helm status -o json` and `helm install -o json`
#[derive(Debug, Deserialize)]
struct HelmRelease {
    name: String,
    namespace: String,
    info: HelmReleaseInfo,
}

#[derive(Debug, Deserialize)]
struct HelmReleaseInfo {
    status: String,
}

fn parse_release(release: &str, stdout: &str) -> Result<Release> {
    let parsed: HelmRelease = serde_json::from_str(stdout)
        .map_err(|e| Error::chart(release, format!("unreadable helm output: {}", e)))?;
    Ok(Release {
        name: parsed.name,
        namespace: parsed.namespace,
        status: parsed.info.status,
    })
}

fn failure(release: &str, action: &str, output: &HelmOutput) -> Error {
    Error::chart(release, format!("{} failed: {}", action, output.stderr.trim()))
}

pub(crate) fn status_args(name: &str, namespace: &str) -> Vec<String> {
    ["status", name, "-n", namespace, "-o", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn install_args(chart: &Chart) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        chart.release.clone(),
        chart.package.display().to_string(),
        "-n".to_string(),
        chart.namespace.clone(),
        "--create-namespace".to_string(),
        "--wait".to_string(),
        "--timeout".to_string(),
        format!("{}s", chart.timeout.as_secs()),
    ];
    if let Some(values) = &chart.values_file {
        args.push("-f".to_string());
        args.push(values.display().to_string());
    }
    for value in &chart.set_values {
        args.push("--set".to_string());
        args.push(value.clone());
    }
    args.push("-o".to_string());
    args.push("json".to_string());
    args
}

pub(crate) fn uninstall_args(chart: &Chart) -> Vec<String> {
    vec![
        "uninstall".to_string(),
        chart.release.clone(),
        "-n".to_string(),
        chart.namespace.clone(),
        "--wait".to_string(),
        "--timeout".to_string(),
        format!("{}s", UNINSTALL_TIMEOUT_SECS),
    ]
}

/// [`ChartManager`] that shells out to helm and runs hooks through a
/// [`ManifestApplier`]
#[derive(Clone)]
pub struct HelmChartManager {
    helm: Arc<dyn HelmCli>,
    manifests: Arc<dyn ManifestApplier>,
}

impl HelmChartManager {
    /// Manage releases through `helm`, hooks through `manifests`
    pub fn new(helm: Arc<dyn HelmCli>, manifests: Arc<dyn ManifestApplier>) -> Self {
        Self { helm, manifests }
    }

    async fn apply_hook(&self, hook: Option<&Path>) -> Result<()> {
        if let Some(path) = hook {
            self.manifests.apply(path).await?;
        }
        Ok(())
    }

    async fn delete_hook(&self, hook: Option<&Path>) -> Result<()> {
        if let Some(path) = hook {
            self.manifests.delete(path).await?;
        }
        Ok(())
    }
}

/// helm status stderr when the release does not exist
const RELEASE_NOT_FOUND: &str = "release: not found";

#[async_trait]
impl ChartManager for HelmChartManager {
    async fn get_release(&self, name: &str, namespace: &str) -> Result<Release> {
        let output = self.helm.run(status_args(name, namespace)).await?;
        if !output.success {
            if output.stderr.contains(RELEASE_NOT_FOUND) {
                return Err(Error::ReleaseNotFound {
                    release: name.to_string(),
                    namespace: namespace.to_string(),
                });
            }
            return Err(failure(name, "status", &output));
        }
        parse_release(name, &output.stdout)
    }

    async fn install(&self, chart: &Chart) -> Result<()> {
        self.apply_hook(chart.before.as_deref()).await?;

        info!(chart = %chart, package = %chart.package.display(), "installing release");
        let output = self.helm.run(install_args(chart)).await?;
        if !output.success {
            return Err(failure(&chart.release, "install", &output));
        }
        let release = parse_release(&chart.release, &output.stdout)?;
        if release.status != STATUS_DEPLOYED {
            return Err(Error::chart(
                &chart.release,
                format!("release is {}, expected {}", release.status, STATUS_DEPLOYED),
            ));
        }

        self.apply_hook(chart.after.as_deref()).await
    }

    async fn uninstall(&self, chart: &Chart) -> Result<()> {
        self.delete_hook(chart.after.as_deref()).await?;

        info!(chart = %chart, "uninstalling release");
        let output = self.helm.run(uninstall_args(chart)).await?;
        if !output.success {
            return Err(failure(&chart.release, "uninstall", &output));
        }

        self.delete_hook(chart.before.as_deref()).await
    }
}
