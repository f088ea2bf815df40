//! Node bootstrap state machine

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use super::runtime::{self, RegistriesConfig, RuntimeConfig, RuntimeStatus};
use super::token::ClusterToken;
use super::Node;
use crate::config::{parse_capacity, Settings};
use crate::poll::poll_until;
use crate::remote::{RemoteSession, SystemFacts};
use crate::{Error, Result};

/// Where a node is in its bootstrap
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nothing written yet
    Unconfigured,
    /// Runtime config is on the node
    ConfigWritten,
    /// Installer ran, waiting for the service
    Installing,
    /// Runtime reports active
    Running,
    /// A step failed; holds the error text
    Failed(String),
}

/// Polling windows used while waiting on the runtime
#[derive(Clone, Copy, Debug)]
pub struct BootstrapTimings {
    /// How long to wait for the service to become active
    pub runtime_timeout: Duration,
    /// Probe interval on joining nodes
    pub runtime_interval: Duration,
    /// Probe interval on the initializing server
    pub init_interval: Duration,
    /// How long a joining node waits for the join token
    pub join_timeout: Duration,
}

impl BootstrapTimings {
    /// Defaults, with the join timeout taken from settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            runtime_timeout: Duration::from_secs(120),
            runtime_interval: Duration::from_secs(2),
            init_interval: Duration::from_secs(3),
            join_timeout: Duration::from_secs(settings.join_timeout_secs),
        }
    }
}

/// Drives one node from bare machine to running runtime
pub struct NodeBootstrapper {
    node: Node,
    session: RemoteSession,
    settings: Arc<Settings>,
    token: Arc<ClusterToken>,
    timings: BootstrapTimings,
    state: Mutex<BootstrapState>,
}

impl std::fmt::Debug for NodeBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBootstrapper")
            .field("node", &self.node.name)
            .field("address", &self.node.address)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl NodeBootstrapper {
    /// Bootstrapper for `node` talking over `session`
    pub fn new(
        node: Node,
        session: RemoteSession,
        settings: Arc<Settings>,
        token: Arc<ClusterToken>,
    ) -> Self {
        let timings = BootstrapTimings::from_settings(&settings);
        Self {
            node,
            session,
            settings,
            token,
            timings,
            state: Mutex::new(BootstrapState::Unconfigured),
        }
    }

    /// The node being driven
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Remote session to the node
    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    /// Current state
    pub fn state(&self) -> BootstrapState {
        self.state.lock().clone()
    }

    fn set_state(&self, state: BootstrapState) {
        debug!(node = %self.node.name, state = ?state, "bootstrap state");
        *self.state.lock() = state;
    }

    fn span(&self) -> tracing::Span {
        info_span!("node", host = %self.node.address, role = %self.node.role)
    }

    /// Check requirements, install packages, then stage preload images.
    ///
    /// Stops at the first package that fails. Images already on the node are
    /// left alone.
    pub async fn prepare(&self) -> Result<()> {
        async {
            let facts = self.session.system_facts().await?;
            info!(hostname = %facts.hostname, cpus = facts.cpus, memory_bytes = facts.memory_bytes, "gathered system facts");
            self.check_requirement(&facts)?;

            for package in &self.node.packages {
                package.install(&self.session).await?;
            }

            for image in &self.node.images {
                let file = image
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .ok_or_else(|| {
                        Error::validation(format!("image path {} has no file name", image.display()))
                    })?;
                let target = format!("{}/{}", runtime::IMAGES_DIR, file);
                match self.session.copy(image, &target, false).await {
                    Ok(()) => info!(image = %file, "image staged"),
                    Err(e) if e.is_file_exists() => debug!(image = %file, "image already staged"),
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        .instrument(self.span())
        .await
    }

    fn check_requirement(&self, facts: &SystemFacts) -> Result<()> {
        let Some(req) = &self.node.requirement else {
            return Ok(());
        };
        if let Some(cpu) = req.cpu {
            if facts.cpus < cpu {
                return Err(Error::validation_for_field(
                    format!("nodes.{}.requirement.cpu", self.node.name),
                    format!("node has {} cpus, {} required", facts.cpus, cpu),
                ));
            }
        }
        if let Some(memory) = &req.memory {
            let required = parse_capacity(memory).ok_or_else(|| {
                Error::validation_for_field(
                    format!("nodes.{}.requirement.memory", self.node.name),
                    format!("invalid quantity '{}'", memory),
                )
            })?;
            if facts.memory_bytes < required {
                return Err(Error::validation_for_field(
                    format!("nodes.{}.requirement.memory", self.node.name),
                    format!(
                        "node has {} bytes of memory, {} required",
                        facts.memory_bytes, memory
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Bring the runtime to running.
    ///
    /// Running nodes are left alone, stopped ones restarted, and anything else
    /// configured and installed from scratch. The initializing server also
    /// publishes the join token once its runtime is running.
    pub async fn install_runtime(&self) -> Result<()> {
        let result = self.drive_install().instrument(self.span()).await;
        match &result {
            Ok(()) => self.set_state(BootstrapState::Running),
            Err(e) => self.set_state(BootstrapState::Failed(e.to_string())),
        }
        result
    }

    async fn drive_install(&self) -> Result<()> {
        let role = self.node.role;
        match self.status().await? {
            RuntimeStatus::Active => {
                info!("runtime already running");
            }
            RuntimeStatus::Inactive => {
                info!("runtime stopped, restarting");
                self.session.run(&runtime::restart_command(role)).await?;
                self.wait_active().await?;
            }
            RuntimeStatus::Missing(reported) => {
                debug!(status = %reported, "runtime not installed");
                let token = if self.node.cluster_init {
                    None
                } else {
                    Some(self.token.wait(self.timings.join_timeout).await?)
                };
                self.write_config(token.as_deref()).await?;
                self.set_state(BootstrapState::ConfigWritten);

                info!("installing runtime");
                self.set_state(BootstrapState::Installing);
                self.session.run(runtime::install_command(role)).await?;
                self.wait_active().await?;
                info!("runtime installed");
            }
        }

        if self.node.cluster_init {
            self.publish_token().await?;
        }
        Ok(())
    }

    async fn write_config(&self, token: Option<&str>) -> Result<()> {
        let config = RuntimeConfig::for_node(
            self.node.role,
            self.node.cluster_init,
            &self.settings,
            token,
        );
        self.session
            .write_file(runtime::CONFIG_PATH, config.to_yaml()?.as_bytes(), true)
            .await?;

        // Always written; an empty file clears mirrors left by an earlier install
        let registries = RegistriesConfig::from_registries(&self.settings.registries);
        self.session
            .write_file(
                runtime::REGISTRIES_PATH,
                registries.to_yaml()?.as_bytes(),
                true,
            )
            .await?;
        Ok(())
    }

    async fn publish_token(&self) -> Result<()> {
        let token = self.session.read_file(runtime::TOKEN_PATH).await?;
        if token.trim().is_empty() {
            return Err(Error::internal_with_context(
                "cluster_token",
                format!("{} is empty on {}", runtime::TOKEN_PATH, self.node.address),
            ));
        }
        self.token.publish(token);
        Ok(())
    }

    async fn status(&self) -> Result<RuntimeStatus> {
        let output = self
            .session
            .execute(&runtime::status_command(self.node.role))
            .await?;
        Ok(RuntimeStatus::parse(&output.stdout))
    }

    async fn wait_active(&self) -> Result<()> {
        let interval = if self.node.cluster_init {
            self.timings.init_interval
        } else {
            self.timings.runtime_interval
        };
        poll_until(
            self.timings.runtime_timeout,
            interval,
            format!(
                "{} active on {}",
                runtime::service_name(self.node.role),
                self.node.address
            ),
            move || async move { Ok(self.status().await? == RuntimeStatus::Active) },
        )
        .await
    }

    /// Run the role's uninstall script; skipped when the runtime was never installed
    pub async fn uninstall_runtime(&self) -> Result<()> {
        async {
            let status = self.status().await?;
            if !status.is_installed() {
                warn!("runtime not installed, nothing to uninstall");
                return Ok(());
            }
            info!("uninstalling runtime");
            self.session
                .run(runtime::uninstall_command(self.node.role))
                .await?;
            self.set_state(BootstrapState::Unconfigured);
            Ok(())
        }
        .instrument(self.span())
        .await
    }

    /// Uninstall every package, in declared order
    pub async fn remove_packages(&self) -> Result<()> {
        async {
            for package in &self.node.packages {
                package.uninstall(&self.session).await?;
            }
            Ok(())
        }
        .instrument(self.span())
        .await
    }

    /// Post-uninstall hook; nothing to do yet
    pub async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Admin kubeconfig written by the runtime on this node
    pub async fn kubeconfig(&self) -> Result<String> {
        self.session.read_file(runtime::KUBECONFIG_PATH).await
    }
}
