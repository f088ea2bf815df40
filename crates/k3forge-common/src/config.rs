//! Cluster configuration file model and validation
//!
//! The file is YAML with camelCase keys. [`Config::load`] reads, parses and
//! validates it; validation also normalises the model in place (defaults
//! filled, relative paths resolved against `settings.rootPath`, passwords
//! decoded), so everything downstream can trust the values it sees.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result, DEFAULT_NAMESPACE};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default chart install timeout in seconds
pub const DEFAULT_CHART_TIMEOUT_SECS: u64 = 60;
/// Default time a joining node waits for the cluster token, in seconds
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 300;
/// Only the rpm/yum family is supported on nodes
pub const SUPPORTED_OS: &str = "centos";

/// Top-level configuration document
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Cluster-wide settings
    #[serde(default)]
    pub settings: Settings,
    /// Machines, keyed by node name
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSpec>,
    /// Package catalog
    #[serde(default)]
    pub packages: BTreeMap<String, PackageSpec>,
    /// Image archives available for preloading
    #[serde(default)]
    pub images: BTreeMap<String, ImageSpec>,
    /// Chart catalog
    #[serde(default)]
    pub charts: BTreeMap<String, ChartSpec>,
    /// Ordered install steps
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// Cluster-wide settings
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Base directory for every relative path in the file
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,
    /// Stable cluster entry address
    #[serde(default, rename = "haIP")]
    pub ha_ip: String,
    /// Master node that initializes the cluster; first master by name if unset
    #[serde(default)]
    pub cluster_init: Option<String>,
    /// Runtime feature toggles
    #[serde(default, alias = "config")]
    pub runtime: RuntimeToggles,
    /// Private registries
    #[serde(default)]
    pub registries: Vec<RegistrySpec>,
    /// Uninstall node packages when the runtime is removed
    #[serde(default)]
    pub purge_packages: bool,
    /// How long joining nodes wait for the cluster token
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    /// Helm executable
    #[serde(default = "default_helm_binary")]
    pub helm_binary: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            ha_ip: String::new(),
            cluster_init: None,
            runtime: RuntimeToggles::default(),
            registries: Vec::new(),
            purge_packages: false,
            join_timeout_secs: DEFAULT_JOIN_TIMEOUT_SECS,
            helm_binary: default_helm_binary(),
        }
    }
}

fn default_root_path() -> PathBuf {
    PathBuf::from("./")
}

fn default_join_timeout() -> u64 {
    DEFAULT_JOIN_TIMEOUT_SECS
}

fn default_helm_binary() -> String {
    "helm".to_string()
}

/// Runtime components that can be switched off
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeToggles {
    /// Run without the flannel overlay
    #[serde(default)]
    pub disable_flannel: bool,
    /// Skip the bundled service load balancer
    #[serde(default, rename = "disableServiceLB")]
    pub disable_service_lb: bool,
    /// Skip the bundled ingress controller
    #[serde(default)]
    pub disable_traefik: bool,
    /// Skip the local-path storage provisioner
    #[serde(default)]
    pub disable_local_path: bool,
}

/// A private registry the runtime should trust
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    /// Registry host (and optional port)
    pub address: String,
    /// Username
    #[serde(default)]
    pub username: Option<String>,
    /// Password
    #[serde(default)]
    pub password: Option<String>,
    /// CA certificate path on the node
    #[serde(default, alias = "cacert")]
    pub ca_cert: Option<String>,
}

/// Node role in the cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Control-plane server
    Master,
    /// Agent
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// How to authenticate to a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// Root password, already decoded
    Password(String),
    /// Private key file
    PrivateKey(PathBuf),
}

/// One machine
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Address reachable over SSH
    #[serde(default)]
    pub address: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Root password, base64 encoded in the file and decoded by validation
    #[serde(default)]
    pub root_password: Option<String>,
    /// Private key path
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Cluster role
    pub role: NodeRole,
    /// Operating system hint
    #[serde(default = "default_os")]
    pub os: String,
    /// Package names from the catalog
    #[serde(default)]
    pub install_packages: Vec<String>,
    /// Image names from the catalog
    #[serde(default)]
    pub preload_images: Vec<String>,
    /// Minimum resources the machine must have
    #[serde(default)]
    pub requirement: Option<Requirement>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_os() -> String {
    SUPPORTED_OS.to_string()
}

impl NodeSpec {
    /// Credentials to log in with; the private key wins when both are set
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.private_key, &self.root_password) {
            (Some(key), _) => Some(Credentials::PrivateKey(key.clone())),
            (None, Some(password)) => Some(Credentials::Password(password.clone())),
            (None, None) => None,
        }
    }
}

/// Minimum machine resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Minimum CPU count
    #[serde(default)]
    pub cpu: Option<u32>,
    /// Minimum memory, e.g. `4Gi`
    #[serde(default)]
    pub memory: Option<String>,
}

/// Package catalog entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PackageSpec {
    /// Single executable installed into `/usr/local/bin`
    File {
        /// Local file
        path: PathBuf,
    },
    /// Directory tree copied to `targetPath`
    Directory {
        /// Local directory
        path: PathBuf,
        /// Remote directory
        #[serde(rename = "targetPath")]
        target_path: String,
    },
    /// Directory (or single file) of rpm archives
    Rpm {
        /// Local path
        path: PathBuf,
    },
    /// Kernel rpm archives
    Kernel {
        /// Local path
        path: PathBuf,
    },
}

impl PackageSpec {
    /// Local source path
    pub fn path(&self) -> &Path {
        match self {
            PackageSpec::File { path }
            | PackageSpec::Directory { path, .. }
            | PackageSpec::Rpm { path }
            | PackageSpec::Kernel { path } => path,
        }
    }

    fn path_mut(&mut self) -> &mut PathBuf {
        match self {
            PackageSpec::File { path }
            | PackageSpec::Directory { path, .. }
            | PackageSpec::Rpm { path }
            | PackageSpec::Kernel { path } => path,
        }
    }
}

/// Image archive entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ImageSpec {
    /// Local archive file
    pub path: PathBuf,
}

/// Chart catalog entry
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Directory holding the packaged chart, `charts/<name>` by default
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Chart version; the package is `<path>/<name>-<version>.tgz`
    #[serde(default)]
    pub version: String,
    /// Release name, the catalog key by default
    #[serde(default)]
    pub release_name: Option<String>,
    /// Target namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Install timeout in seconds
    #[serde(default = "default_chart_timeout")]
    pub timeout: u64,
    /// `--set` overrides
    #[serde(default)]
    pub set_values: Vec<String>,
    /// Resolved package archive
    #[serde(skip)]
    pub package: PathBuf,
    /// Sibling `values.yaml`, when present
    #[serde(skip)]
    pub values_file: Option<PathBuf>,
    /// Sibling `before/` manifests, when present
    #[serde(skip)]
    pub before: Option<PathBuf>,
    /// Sibling `after/` manifests, when present
    #[serde(skip)]
    pub after: Option<PathBuf>,
}

fn default_chart_timeout() -> u64 {
    DEFAULT_CHART_TIMEOUT_SECS
}

/// One pipeline step
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepSpec {
    /// Runtime bootstrap on every node
    K3s,
    /// Chart rollout
    Chart {
        /// Chart names from the catalog, in install order
        #[serde(default)]
        charts: Vec<String>,
    },
    /// Raw manifest rollout
    Manifest {
        /// Manifest files or directories
        #[serde(default, alias = "manifest")]
        manifests: Vec<PathBuf>,
    },
}

impl Config {
    /// Read, parse and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&raw)?;
        config.validate()?;
        debug!(
            path = %path.display(),
            nodes = config.nodes.len(),
            steps = config.steps.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    /// Parse without validating
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| Error::validation(format!("invalid configuration: {}", e)))
    }

    /// Validate and normalise in place
    pub fn validate(&mut self) -> Result<()> {
        self.validate_settings()?;
        self.validate_packages()?;
        self.validate_images()?;
        self.validate_nodes()?;
        self.validate_charts()?;
        self.validate_steps()?;
        Ok(())
    }

    /// Resolve a path from the file against `settings.rootPath`
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.settings.root_path.join(path)
    }

    /// Names of master nodes, in name order
    pub fn masters(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.role == NodeRole::Master)
            .map(|(name, _)| name.as_str())
    }

    /// Names of worker nodes, in name order
    pub fn workers(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.role == NodeRole::Worker)
            .map(|(name, _)| name.as_str())
    }

    fn validate_settings(&mut self) -> Result<()> {
        if self.settings.ha_ip.is_empty() {
            return Err(Error::validation_for_field(
                "settings.haIP",
                "missing cluster entry address",
            ));
        }
        if self.settings.root_path.as_os_str().is_empty() {
            self.settings.root_path = default_root_path();
        }
        if self.settings.helm_binary.is_empty() {
            self.settings.helm_binary = default_helm_binary();
        }
        for (i, registry) in self.settings.registries.iter().enumerate() {
            if registry.address.is_empty() {
                return Err(Error::validation_for_field(
                    format!("settings.registries[{}].address", i),
                    "missing registry address",
                ));
            }
        }
        if let Some(init) = &self.settings.cluster_init {
            match self.nodes.get(init) {
                Some(node) if node.role == NodeRole::Master => {}
                Some(_) => {
                    return Err(Error::validation_for_field(
                        "settings.clusterInit",
                        format!("node <{}> is not a master", init),
                    ))
                }
                None => {
                    return Err(Error::validation_for_field(
                        "settings.clusterInit",
                        format!("unknown node <{}>", init),
                    ))
                }
            }
        }
        if !self.nodes.is_empty() && self.masters().next().is_none() {
            return Err(Error::validation_for_field(
                "nodes",
                "at least one master node is required",
            ));
        }
        Ok(())
    }

    fn validate_packages(&mut self) -> Result<()> {
        let root = self.settings.root_path.clone();
        for (name, pkg) in self.packages.iter_mut() {
            let field = format!("packages.{}.path", name);
            if pkg.path().as_os_str().is_empty() {
                return Err(Error::validation_for_field(field, "missing path"));
            }
            let resolved = root.join(pkg.path());
            let meta = std::fs::metadata(&resolved).map_err(|e| {
                Error::validation_for_field(
                    field.clone(),
                    format!("{}: {}", resolved.display(), e),
                )
            })?;
            match pkg {
                PackageSpec::File { .. } if meta.is_dir() => {
                    return Err(Error::validation_for_field(field, "not an executable file"))
                }
                PackageSpec::Directory { target_path, .. } => {
                    if !meta.is_dir() {
                        return Err(Error::validation_for_field(field, "not a directory"));
                    }
                    if target_path.is_empty() {
                        return Err(Error::validation_for_field(
                            format!("packages.{}.targetPath", name),
                            "missing target path",
                        ));
                    }
                }
                _ => {}
            }
            *pkg.path_mut() = resolved;
        }
        Ok(())
    }

    fn validate_images(&mut self) -> Result<()> {
        let root = self.settings.root_path.clone();
        for (name, image) in self.images.iter_mut() {
            let field = format!("images.{}.path", name);
            let resolved = root.join(&image.path);
            let meta = std::fs::metadata(&resolved).map_err(|e| {
                Error::validation_for_field(
                    field.clone(),
                    format!("{}: {}", resolved.display(), e),
                )
            })?;
            if !meta.is_file() {
                return Err(Error::validation_for_field(field, "image is not a file"));
            }
            image.path = resolved;
        }
        Ok(())
    }

    fn validate_nodes(&mut self) -> Result<()> {
        for (name, node) in self.nodes.iter_mut() {
            if node.address.is_empty() {
                return Err(Error::validation_for_field(
                    format!("nodes.{}.address", name),
                    "missing address",
                ));
            }
            if node.ssh_port == 0 {
                node.ssh_port = DEFAULT_SSH_PORT;
            }
            if node.os.is_empty() {
                node.os = default_os();
            }
            if node.os != SUPPORTED_OS {
                return Err(Error::validation_for_field(
                    format!("nodes.{}.os", name),
                    format!("unsupported os '{}'", node.os),
                ));
            }

            match (&node.private_key, &node.root_password) {
                (None, None) => {
                    return Err(Error::validation_for_field(
                        format!("nodes.{}.rootPassword", name),
                        "missing root password or private key",
                    ))
                }
                (None, Some(encoded)) => {
                    let decoded = STANDARD
                        .decode(encoded.trim())
                        .ok()
                        .and_then(|bytes| String::from_utf8(bytes).ok())
                        .ok_or_else(|| {
                            Error::validation_for_field(
                                format!("nodes.{}.rootPassword", name),
                                "password is not valid base64",
                            )
                        })?;
                    node.root_password = Some(decoded);
                }
                (Some(key), _) => {
                    node.private_key = Some(self.settings.root_path.join(key));
                }
            }

            if let Some(req) = &node.requirement {
                if let Some(memory) = &req.memory {
                    parse_capacity(memory).ok_or_else(|| {
                        Error::validation_for_field(
                            format!("nodes.{}.requirement.memory", name),
                            format!("invalid quantity '{}'", memory),
                        )
                    })?;
                }
            }

            for pkg in &node.install_packages {
                if !self.packages.contains_key(pkg) {
                    return Err(Error::validation_for_field(
                        format!("nodes.{}.installPackages", name),
                        format!("missing package <{}>", pkg),
                    ));
                }
            }
            for image in &node.preload_images {
                if !self.images.contains_key(image) {
                    return Err(Error::validation_for_field(
                        format!("nodes.{}.preloadImages", name),
                        format!("missing image <{}>", image),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_charts(&mut self) -> Result<()> {
        let root = self.settings.root_path.clone();
        for (name, chart) in self.charts.iter_mut() {
            if chart.version.is_empty() {
                return Err(Error::validation_for_field(
                    format!("charts.{}.version", name),
                    "missing version",
                ));
            }
            let dir = root.join(
                chart
                    .path
                    .clone()
                    .unwrap_or_else(|| Path::new("charts").join(name)),
            );
            let package = dir.join(format!("{}-{}.tgz", name, chart.version));
            if !package.is_file() {
                return Err(Error::validation_for_field(
                    format!("charts.{}.path", name),
                    format!("chart package {} does not exist", package.display()),
                ));
            }
            for value in &chart.set_values {
                if !value.contains('=') {
                    return Err(Error::validation_for_field(
                        format!("charts.{}.setValues", name),
                        format!("'{}' is not key=value", value),
                    ));
                }
            }

            let values = dir.join("values.yaml");
            let before = dir.join("before");
            let after = dir.join("after");
            chart.values_file = values.is_file().then_some(values);
            chart.before = before.exists().then_some(before);
            chart.after = after.exists().then_some(after);
            chart.package = package;
            chart.path = Some(dir);
            if chart.release_name.as_deref().map_or(true, str::is_empty) {
                chart.release_name = Some(name.clone());
            }
            if chart.namespace.as_deref().map_or(true, str::is_empty) {
                chart.namespace = Some(DEFAULT_NAMESPACE.to_string());
            }
        }
        Ok(())
    }

    fn validate_steps(&mut self) -> Result<()> {
        let root = self.settings.root_path.clone();
        for (i, step) in self.steps.iter_mut().enumerate() {
            match step {
                StepSpec::K3s => {
                    if self.nodes.is_empty() {
                        return Err(Error::validation_for_field(
                            format!("steps[{}]", i),
                            "k3s step without nodes",
                        ));
                    }
                }
                StepSpec::Chart { charts } => {
                    for chart in charts.iter() {
                        if !self.charts.contains_key(chart) {
                            return Err(Error::validation_for_field(
                                format!("steps[{}].charts", i),
                                format!("missing chart <{}>", chart),
                            ));
                        }
                    }
                }
                StepSpec::Manifest { manifests } => {
                    for manifest in manifests.iter_mut() {
                        let resolved = root.join(&*manifest);
                        if !resolved.exists() {
                            return Err(Error::validation_for_field(
                                format!("steps[{}].manifests", i),
                                format!("{} does not exist", resolved.display()),
                            ));
                        }
                        *manifest = resolved;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parse a capacity quantity like `4Gi`, `512Mi` or `2G` into bytes
pub fn parse_capacity(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (number, unit) = quantity.split_at(split);
    let number: u64 = number.parse().ok()?;
    let multiplier: u64 = match unit {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "K" | "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    /// Lay out a root directory holding every artifact the sample config names
    fn fixture_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/k3s"), b"#!/bin/sh").unwrap();
        fs::create_dir_all(root.join("rpms/containerd")).unwrap();
        fs::write(root.join("rpms/containerd/containerd-1.6.rpm"), b"rpm").unwrap();
        fs::create_dir_all(root.join("scripts")).unwrap();
        fs::write(root.join("scripts/install.sh"), b"#!/bin/sh").unwrap();
        fs::create_dir_all(root.join("images")).unwrap();
        fs::write(root.join("images/k3s-airgap.tar"), b"tar").unwrap();
        fs::create_dir_all(root.join("charts/traefik/after")).unwrap();
        fs::write(root.join("charts/traefik/traefik-10.3.0.tgz"), b"tgz").unwrap();
        fs::write(root.join("charts/traefik/values.yaml"), b"replicas: 1").unwrap();
        fs::create_dir_all(root.join("manifests")).unwrap();
        fs::write(root.join("manifests/ns.yaml"), b"kind: Namespace").unwrap();
        dir
    }

    fn sample_yaml(root: &Path) -> String {
        format!(
            r#"
settings:
  rootPath: {root}
  haIP: 10.0.0.100
  runtime:
    disableTraefik: true
  registries:
    - address: registry.local:5000
nodes:
  node2:
    address: 10.0.0.2
    rootPassword: c2VjcmV0
    role: worker
    installPackages: [containerd]
  node1:
    address: 10.0.0.1
    sshPort: 2222
    rootPassword: c2VjcmV0
    role: master
    installPackages: [k3s, scripts]
    preloadImages: [airgap]
    requirement:
      cpu: 2
      memory: 4Gi
packages:
  k3s:
    type: file
    path: bin/k3s
  scripts:
    type: directory
    path: scripts
    targetPath: /opt/k3s
  containerd:
    type: rpm
    path: rpms/containerd
images:
  airgap:
    path: images/k3s-airgap.tar
charts:
  traefik:
    version: 10.3.0
    namespace: kube-system
steps:
  - type: k3s
  - type: chart
    charts: [traefik]
  - type: manifest
    manifests: [manifests/ns.yaml]
"#,
            root = root.display()
        )
    }

    #[test]
    fn loads_and_normalises_a_full_config() {
        let root = fixture_root();
        let path = root.path().join("cluster.yaml");
        fs::write(&path, sample_yaml(root.path())).unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.settings.ha_ip, "10.0.0.100");
        assert!(config.settings.runtime.disable_traefik);
        assert_eq!(config.settings.join_timeout_secs, DEFAULT_JOIN_TIMEOUT_SECS);
        assert_eq!(config.settings.helm_binary, "helm");

        let node1 = &config.nodes["node1"];
        assert_eq!(node1.ssh_port, 2222);
        assert_eq!(node1.os, "centos");
        assert_eq!(
            node1.credentials(),
            Some(Credentials::Password("secret".to_string()))
        );
        assert_eq!(config.nodes["node2"].ssh_port, DEFAULT_SSH_PORT);

        assert_eq!(
            config.packages["k3s"].path(),
            root.path().join("bin/k3s").as_path()
        );
        assert_eq!(
            config.images["airgap"].path,
            root.path().join("images/k3s-airgap.tar")
        );

        let chart = &config.charts["traefik"];
        assert_eq!(chart.release_name.as_deref(), Some("traefik"));
        assert_eq!(chart.namespace.as_deref(), Some("kube-system"));
        assert_eq!(chart.timeout, DEFAULT_CHART_TIMEOUT_SECS);
        assert_eq!(
            chart.package,
            root.path().join("charts/traefik/traefik-10.3.0.tgz")
        );
        assert!(chart.values_file.is_some());
        assert!(chart.after.is_some());
        assert!(chart.before.is_none());

        assert_eq!(config.steps.len(), 3);
        assert_eq!(config.steps[0], StepSpec::K3s);
        assert_eq!(
            config.steps[2],
            StepSpec::Manifest {
                manifests: vec![root.path().join("manifests/ns.yaml")]
            }
        );
        assert_eq!(config.masters().collect::<Vec<_>>(), vec!["node1"]);
        assert_eq!(config.workers().collect::<Vec<_>>(), vec!["node2"]);
    }

    #[test]
    fn chart_defaults_release_and_namespace() {
        let root = fixture_root();
        let mut config = Config::from_yaml(&format!(
            "settings:\n  rootPath: {}\n  haIP: 1.2.3.4\ncharts:\n  traefik:\n    version: 10.3.0\n",
            root.path().display()
        ))
        .unwrap();
        config.validate().unwrap();

        let chart = &config.charts["traefik"];
        assert_eq!(chart.release_name.as_deref(), Some("traefik"));
        assert_eq!(chart.namespace.as_deref(), Some("default"));
    }

    #[rstest]
    #[case::missing_ha_ip("settings: {}\n", "settings.haIP")]
    #[case::missing_address(
        "settings: {haIP: 1.1.1.1}\nnodes:\n  n1: {role: master, rootPassword: eA==}\n",
        "nodes.n1.address"
    )]
    #[case::missing_credentials(
        "settings: {haIP: 1.1.1.1}\nnodes:\n  n1: {role: master, address: 1.1.1.2}\n",
        "nodes.n1.rootPassword"
    )]
    #[case::bad_base64(
        "settings: {haIP: 1.1.1.1}\nnodes:\n  n1: {role: master, address: 1.1.1.2, rootPassword: '***'}\n",
        "nodes.n1.rootPassword"
    )]
    #[case::unknown_package(
        "settings: {haIP: 1.1.1.1}\nnodes:\n  n1: {role: master, address: a, rootPassword: eA==, installPackages: [nope]}\n",
        "nodes.n1.installPackages"
    )]
    #[case::no_master(
        "settings: {haIP: 1.1.1.1}\nnodes:\n  n1: {role: worker, address: a, rootPassword: eA==}\n",
        "nodes"
    )]
    #[case::cluster_init_worker(
        "settings: {haIP: 1.1.1.1, clusterInit: n2}\nnodes:\n  n1: {role: master, address: a, rootPassword: eA==}\n  n2: {role: worker, address: b, rootPassword: eA==}\n",
        "settings.clusterInit"
    )]
    #[case::chart_without_version(
        "settings: {haIP: 1.1.1.1}\ncharts:\n  x: {}\n",
        "charts.x.version"
    )]
    #[case::unknown_chart_in_step(
        "settings: {haIP: 1.1.1.1}\nsteps:\n  - type: chart\n    charts: [ghost]\n",
        "steps[0].charts"
    )]
    fn rejects_invalid_config(#[case] yaml: &str, #[case] field: &str) {
        let mut config = Config::from_yaml(yaml).unwrap();
        match config.validate() {
            Err(Error::Validation {
                field: Some(actual),
                ..
            }) => assert_eq!(actual, field),
            other => panic!("expected validation error at {}, got {:?}", field, other),
        }
    }

    #[test]
    fn unknown_package_type_is_a_parse_error() {
        let err = Config::from_yaml(
            "settings: {haIP: 1.1.1.1}\npackages:\n  d:\n    type: docker\n    path: x\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn private_key_takes_precedence_and_is_resolved() {
        let mut config = Config::from_yaml(
            "settings: {haIP: 1.1.1.1, rootPath: /srv/cluster}\nnodes:\n  n1: {role: master, address: a, privateKey: keys/id_ed25519}\n",
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.nodes["n1"].credentials(),
            Some(Credentials::PrivateKey(PathBuf::from(
                "/srv/cluster/keys/id_ed25519"
            )))
        );
    }

    #[rstest]
    #[case("4Gi", Some(4 * 1024 * 1024 * 1024))]
    #[case("512Mi", Some(512 * 1024 * 1024))]
    #[case("2G", Some(2_000_000_000))]
    #[case("1024", Some(1024))]
    #[case("4 GB", None)]
    #[case("Gi", None)]
    fn parses_capacity(#[case] input: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_capacity(input), expected);
    }
}
