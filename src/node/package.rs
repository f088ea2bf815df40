//! Packages installed on a node before the runtime

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::PackageSpec;
use crate::remote::{shell_quote, RemoteSession};
use crate::{Error, Result};

/// Executables land here
pub const BIN_DIR: &str = "/usr/local/bin";
/// rpm archives are staged under `<STAGING_DIR>/<package>`
pub const STAGING_DIR: &str = "/tmp";

/// A package install task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Package {
    /// Single executable copied to [`BIN_DIR`]
    File {
        /// Catalog name
        name: String,
        /// Local file
        local: PathBuf,
        /// Remote path
        target: String,
    },
    /// Directory tree copied to a fixed location
    Directory {
        /// Catalog name
        name: String,
        /// Local directory
        local: PathBuf,
        /// Remote directory
        target: String,
    },
    /// rpm archives installed with yum
    Rpm {
        /// Catalog name
        name: String,
        /// Local file or directory of `.rpm` files
        local: PathBuf,
    },
    /// Kernel rpms; installed like [`Package::Rpm`], never removed
    Kernel {
        /// Catalog name
        name: String,
        /// Local file or directory of `.rpm` files
        local: PathBuf,
    },
}

impl Package {
    /// Build the task for a catalog entry
    pub fn from_spec(name: &str, spec: &PackageSpec) -> Self {
        let name = name.to_string();
        match spec {
            PackageSpec::File { path } => {
                let base = path
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_else(|| name.clone());
                Package::File {
                    target: format!("{}/{}", BIN_DIR, base),
                    local: path.clone(),
                    name,
                }
            }
            PackageSpec::Directory { path, target_path } => Package::Directory {
                name,
                local: path.clone(),
                target: target_path.clone(),
            },
            PackageSpec::Rpm { path } => Package::Rpm {
                name,
                local: path.clone(),
            },
            PackageSpec::Kernel { path } => Package::Kernel {
                name,
                local: path.clone(),
            },
        }
    }

    /// Catalog name
    pub fn name(&self) -> &str {
        match self {
            Package::File { name, .. }
            | Package::Directory { name, .. }
            | Package::Rpm { name, .. }
            | Package::Kernel { name, .. } => name,
        }
    }

    /// Install on the node behind `session`
    pub async fn install(&self, session: &RemoteSession) -> Result<()> {
        info!(package = %self.name(), "installing package");
        match self {
            Package::File { local, target, .. } | Package::Directory { local, target, .. } => {
                session.copy(local, target, true).await
            }
            Package::Rpm { name, local } | Package::Kernel { name, local } => {
                install_rpms(session, name, local).await
            }
        }
    }

    /// Remove from the node behind `session`
    pub async fn uninstall(&self, session: &RemoteSession) -> Result<()> {
        info!(package = %self.name(), "uninstalling package");
        match self {
            Package::File { target, .. } | Package::Directory { target, .. } => {
                session.remove(target).await
            }
            Package::Rpm { local, .. } => {
                let names = rpm_names(&local_rpms(local)?);
                let installed = installed_subset(session, &names).await?;
                if installed.is_empty() {
                    return Ok(());
                }
                session
                    .run(&format!("yum remove -y {}", installed.join(" ")))
                    .await?;
                Ok(())
            }
            Package::Kernel { name, .. } => {
                warn!(package = %name, "kernel packages cannot be uninstalled, skipping");
                Ok(())
            }
        }
    }
}

async fn install_rpms(session: &RemoteSession, name: &str, local: &Path) -> Result<()> {
    let files = local_rpms(local)?;
    if files.is_empty() {
        warn!(package = %name, path = %local.display(), "no rpm archives found");
        return Ok(());
    }

    let staging = format!("{}/{}", STAGING_DIR, name);
    if local.is_dir() {
        session.copy(local, &staging, true).await?;
    } else {
        session
            .copy(local, &format!("{}/{}", staging, files[0]), true)
            .await?;
    }

    let names = rpm_names(&files);
    if installed_subset(session, &names).await?.len() == names.len() {
        info!(package = %name, "rpms already installed");
        return Ok(());
    }

    let archives: Vec<String> = files
        .iter()
        .map(|f| shell_quote(&format!("{}/{}", staging, f)))
        .collect();
    let output = session
        .run(&format!("yum localinstall -y {}", archives.join(" ")))
        .await?;
    for line in output.lines() {
        tracing::debug!(package = %name, "{}", line);
    }
    Ok(())
}

/// `.rpm` file names under `path` (or `path` itself), sorted
fn local_rpms(path: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let file = entry.file_name().to_string_lossy().to_string();
            if file.ends_with(".rpm") {
                files.push(file);
            }
        }
    } else {
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| {
                Error::validation(format!("rpm package path {} has no file name", path.display()))
            })?;
        files.push(file);
    }
    files.sort();
    Ok(files)
}

fn rpm_names(files: &[String]) -> Vec<String> {
    files
        .iter()
        .map(|f| f.strip_suffix(".rpm").unwrap_or(f).to_string())
        .collect()
}

async fn installed_subset(session: &RemoteSession, names: &[String]) -> Result<Vec<String>> {
    let output = session.run("rpm -qa").await?;
    let installed: HashSet<&str> = output.lines().map(str::trim).collect();
    Ok(names
        .iter()
        .filter(|n| installed.contains(n.as_str()))
        .cloned()
        .collect())
}
