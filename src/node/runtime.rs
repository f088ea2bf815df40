//! Cluster runtime (k3s) files, commands and status on a node

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{NodeRole, RegistrySpec, Settings};
use crate::{api_server_url, Error, Result};

/// Runtime config file read by the installer
pub const CONFIG_PATH: &str = "/etc/rancher/k3s/config.yaml";
/// Private registry config
pub const REGISTRIES_PATH: &str = "/etc/rancher/k3s/registries.yaml";
/// Join token written by the initializing server
pub const TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/token";
/// Admin kubeconfig written by every server
pub const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";
/// Image archives here are imported when the runtime starts
pub const IMAGES_DIR: &str = "/var/lib/rancher/k3s/agent/images";

/// Contents of [`CONFIG_PATH`]
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// Set only on the cluster-initializing server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_init: Option<bool>,
    /// Existing server to join
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Join token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Permission bits for the admin kubeconfig
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_kubeconfig_mode: Option<String>,
    /// Overlay backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flannel_backend: Option<String>,
    /// Extra SANs on the serving certificate
    #[serde(rename = "tls-san", skip_serializing_if = "Vec::is_empty")]
    pub tls_san: Vec<String>,
    /// Bundled components to skip
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disable: Vec<String>,
}

impl RuntimeConfig {
    /// Build the config for a node.
    ///
    /// `token` is the join token for every node except the initializing server.
    pub fn for_node(role: NodeRole, cluster_init: bool, settings: &Settings, token: Option<&str>) -> Self {
        let mut config = Self::default();
        if role == NodeRole::Master {
            let toggles = &settings.runtime;
            config.write_kubeconfig_mode = Some("0644".to_string());
            config.flannel_backend = Some(
                if toggles.disable_flannel { "none" } else { "vxlan" }.to_string(),
            );
            config.tls_san = vec![settings.ha_ip.clone()];
            if toggles.disable_service_lb {
                config.disable.push("servicelb".to_string());
            }
            if toggles.disable_traefik {
                config.disable.push("traefik".to_string());
            }
            if toggles.disable_local_path {
                config.disable.push("local-storage".to_string());
            }
        }
        if cluster_init {
            config.cluster_init = Some(true);
        } else {
            config.server = Some(api_server_url(&settings.ha_ip));
            config.token = token.map(str::to_string);
        }
        config
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::internal_with_context("runtime_config", e.to_string()))
    }
}

/// Contents of [`REGISTRIES_PATH`]
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct RegistriesConfig {
    mirrors: BTreeMap<String, Mirror>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    configs: BTreeMap<String, RegistryConfig>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
struct Mirror {
    endpoint: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
struct RegistryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<RegistryAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<RegistryTls>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
struct RegistryAuth {
    username: String,
    password: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
struct RegistryTls {
    ca_file: String,
}

impl RegistriesConfig {
    /// Mirror each registry to itself, with auth and CA when given
    pub fn from_registries(registries: &[RegistrySpec]) -> Self {
        let mut config = Self::default();
        for registry in registries {
            config.mirrors.insert(
                registry.address.clone(),
                Mirror {
                    endpoint: vec![format!("https://{}", registry.address)],
                },
            );
            let auth = match (&registry.username, &registry.password) {
                (Some(username), Some(password)) => Some(RegistryAuth {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => None,
            };
            let tls = registry.ca_cert.as_ref().map(|ca| RegistryTls {
                ca_file: ca.clone(),
            });
            if auth.is_some() || tls.is_some() {
                config
                    .configs
                    .insert(registry.address.clone(), RegistryConfig { auth, tls });
            }
        }
        config
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::internal_with_context("registries_config", e.to_string()))
    }
}

/// Observed state of the runtime service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Service is running
    Active,
    /// Installed but stopped
    Inactive,
    /// Anything else; treated as not installed
    Missing(String),
}

impl RuntimeStatus {
    /// Interpret `systemctl is-active` output
    pub fn parse(output: &str) -> Self {
        match output.trim() {
            "active" => RuntimeStatus::Active,
            "inactive" => RuntimeStatus::Inactive,
            other => RuntimeStatus::Missing(other.to_string()),
        }
    }

    /// Runtime has been installed on the node
    pub fn is_installed(&self) -> bool {
        !matches!(self, RuntimeStatus::Missing(_))
    }
}

/// systemd unit name
pub fn service_name(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Master => "k3s",
        NodeRole::Worker => "k3s-agent",
    }
}

/// Status probe command
pub fn status_command(role: NodeRole) -> String {
    format!("systemctl is-active {}", service_name(role))
}

/// Restart command
pub fn restart_command(role: NodeRole) -> String {
    format!("systemctl restart {}", service_name(role))
}

/// Offline install command; artifacts are pre-staged by package install
pub fn install_command(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Master => "INSTALL_K3S_SKIP_DOWNLOAD=true install.sh",
        NodeRole::Worker => "INSTALL_K3S_SKIP_DOWNLOAD=true INSTALL_K3S_EXEC=agent install.sh",
    }
}

/// Uninstall script written by the installer
pub fn uninstall_command(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Master => "k3s-uninstall.sh",
        NodeRole::Worker => "k3s-agent-uninstall.sh",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeToggles;
    use rstest::rstest;

    fn settings() -> Settings {
        Settings {
            ha_ip: "10.0.0.100".to_string(),
            runtime: RuntimeToggles {
                disable_traefik: true,
                disable_local_path: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn initializing_server_config() {
        let yaml = RuntimeConfig::for_node(NodeRole::Master, true, &settings(), None)
            .to_yaml()
            .unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(doc["cluster-init"].as_bool(), Some(true));
        assert_eq!(doc["write-kubeconfig-mode"].as_str(), Some("0644"));
        assert_eq!(doc["flannel-backend"].as_str(), Some("vxlan"));
        assert_eq!(doc["tls-san"][0].as_str(), Some("10.0.0.100"));
        assert_eq!(doc["disable"][0].as_str(), Some("traefik"));
        assert_eq!(doc["disable"][1].as_str(), Some("local-storage"));
        assert!(doc.get("server").is_none());
        assert!(doc.get("token").is_none());
    }

    #[test]
    fn joining_server_points_at_entry_address() {
        let config =
            RuntimeConfig::for_node(NodeRole::Master, false, &settings(), Some("K10abc::server:xyz"));
        assert_eq!(config.cluster_init, None);
        assert_eq!(config.server.as_deref(), Some("https://10.0.0.100:6443"));
        assert_eq!(config.token.as_deref(), Some("K10abc::server:xyz"));
        assert_eq!(config.tls_san, vec!["10.0.0.100".to_string()]);
    }

    #[test]
    fn agent_config_only_joins() {
        let mut settings = settings();
        settings.runtime.disable_flannel = true;
        let config = RuntimeConfig::for_node(NodeRole::Worker, false, &settings, Some("tok"));
        assert_eq!(
            config,
            RuntimeConfig {
                server: Some("https://10.0.0.100:6443".to_string()),
                token: Some("tok".to_string()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn registries_render_mirror_auth_and_ca() {
        let config = RegistriesConfig::from_registries(&[
            RegistrySpec {
                address: "registry.local:5000".to_string(),
                username: Some("admin".to_string()),
                password: Some("pw".to_string()),
                ca_cert: Some("/etc/ssl/registry.crt".to_string()),
            },
            RegistrySpec {
                address: "mirror.local".to_string(),
                username: None,
                password: None,
                ca_cert: None,
            },
        ]);
        let doc: serde_yaml::Value = serde_yaml::from_str(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(
            doc["mirrors"]["registry.local:5000"]["endpoint"][0].as_str(),
            Some("https://registry.local:5000")
        );
        assert_eq!(
            doc["configs"]["registry.local:5000"]["auth"]["username"].as_str(),
            Some("admin")
        );
        assert_eq!(
            doc["configs"]["registry.local:5000"]["tls"]["ca_file"].as_str(),
            Some("/etc/ssl/registry.crt")
        );
        assert!(doc["configs"].get("mirror.local").is_none());
        assert_eq!(
            RegistriesConfig::from_registries(&[]).to_yaml().unwrap().trim(),
            "mirrors: {}"
        );
    }

    #[rstest]
    #[case("active\n", RuntimeStatus::Active)]
    #[case("inactive\n", RuntimeStatus::Inactive)]
    #[case("unknown\n", RuntimeStatus::Missing("unknown".to_string()))]
    #[case("failed", RuntimeStatus::Missing("failed".to_string()))]
    fn parses_service_status(#[case] output: &str, #[case] expected: RuntimeStatus) {
        assert_eq!(RuntimeStatus::parse(output), expected);
    }

    #[test]
    fn commands_follow_role() {
        assert_eq!(status_command(NodeRole::Master), "systemctl is-active k3s");
        assert_eq!(restart_command(NodeRole::Worker), "systemctl restart k3s-agent");
        assert!(install_command(NodeRole::Worker).contains("INSTALL_K3S_EXEC=agent"));
        assert!(!install_command(NodeRole::Master).contains("INSTALL_K3S_EXEC"));
        assert_eq!(uninstall_command(NodeRole::Worker), "k3s-agent-uninstall.sh");
    }
}
