//! Turns a validated configuration into a running pipeline
//!
//! The orchestrator orders nodes (masters first), picks the node that
//! initializes the cluster, opens one SSH session per node and builds the
//! step list. Sessions are opened concurrently; a node that cannot be
//! reached fails on its own inside the runtime step while the others carry
//! on. Every session that was opened is closed once the pipeline is done,
//! whether it succeeded or not.
//!
//! Control-plane clients are only built when a chart or manifest step first
//! asks for them: the admin kubeconfig is read from the initializing node,
//! pointed at the cluster entry address and kept in a private temporary file
//! for as long as the clients live.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tempfile::NamedTempFile;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::chart::{Chart, ChartManager, HelmBinary, HelmChartManager};
use crate::config::{Config, Credentials, Settings, StepSpec};
use crate::kube_utils::{create_client, rewrite_kubeconfig_server};
use crate::node::{ClusterToken, Node, NodeBootstrapper};
use crate::pipeline::{
    ChartRolloutStep, ControlPlane, ManifestRolloutStep, NodeTask, Pipeline, RuntimeBootstrapStep,
    Step,
};
use crate::reconcile::{KubeResourceStore, ManifestApplier, ResourceReconciler};
use crate::remote::ssh::DEFAULT_CONNECT_TIMEOUT;
use crate::remote::{RemoteSession, SshTransport, Transport};
use crate::{api_server_url, Error, Result};

/// Login used on every node
pub const SSH_USER: &str = "root";

/// Opens the command channel to a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `node` with its configured credentials
    async fn connect(
        &self,
        node: &Node,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn Transport>>;
}

/// [`Connector`] that opens SSH sessions
#[derive(Clone, Debug)]
pub struct SshConnector {
    user: String,
    timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            user: SSH_USER.to_string(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        node: &Node,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn Transport>> {
        let credentials = credentials.ok_or_else(|| {
            Error::connection(&node.address, format!("node {} has no credentials", node.name))
        })?;
        let transport = SshTransport::connect(
            &node.address,
            node.ssh_port,
            &self.user,
            &credentials,
            self.timeout,
        )
        .await?;
        Ok(Arc::new(transport))
    }
}

/// Nodes in bootstrap order: masters, then workers, each by name.
///
/// `settings.clusterInit` names the initializing node; otherwise it is the
/// first master.
pub fn build_node_plan(config: &Config) -> Vec<Node> {
    let init = config
        .settings
        .cluster_init
        .as_deref()
        .or_else(|| config.masters().next());

    config
        .masters()
        .chain(config.workers())
        .filter_map(|name| {
            config
                .nodes
                .get(name)
                .map(|spec| Node::from_config(name, spec, config, Some(name) == init))
        })
        .collect()
}

/// Steps in configured order
pub fn build_steps(
    config: &Config,
    nodes: &[Arc<dyn NodeTask>],
    control: Arc<dyn ControlPlane>,
) -> Result<Vec<Step>> {
    config
        .steps
        .iter()
        .enumerate()
        .map(|(i, spec)| match spec {
            StepSpec::K3s => Ok(Step::RuntimeBootstrap(RuntimeBootstrapStep::new(
                nodes.to_vec(),
                config.settings.purge_packages,
            ))),
            StepSpec::Chart { charts } => {
                let charts = charts
                    .iter()
                    .map(|name| {
                        config
                            .charts
                            .get(name)
                            .map(|spec| Chart::from_spec(name, spec))
                            .ok_or_else(|| {
                                Error::validation_for_field(
                                    format!("steps[{}].charts", i),
                                    format!("missing chart <{}>", name),
                                )
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Step::ChartRollout(ChartRolloutStep::new(
                    charts,
                    control.clone(),
                )))
            }
            StepSpec::Manifest { manifests } => Ok(Step::ManifestRollout(
                ManifestRolloutStep::new(manifests.clone(), control.clone()),
            )),
        })
        .collect()
}

/// Read the admin kubeconfig from `init`, point it at the entry address and
/// keep it in a private temporary file
pub async fn fetch_kubeconfig(init: &NodeBootstrapper, entry_address: &str) -> Result<NamedTempFile> {
    let raw = init.kubeconfig().await?;
    let rewritten = rewrite_kubeconfig_server(&raw, &api_server_url(entry_address))?;
    let mut file = NamedTempFile::new()?;
    file.write_all(rewritten.as_bytes())?;
    file.flush()?;
    debug!(path = %file.path().display(), "wrote cluster kubeconfig");
    Ok(file)
}

struct Clients {
    manifests: Arc<dyn ManifestApplier>,
    charts: Arc<dyn ChartManager>,
    // Deleted on drop; helm reads it on every call
    _kubeconfig: NamedTempFile,
}

/// [`ControlPlane`] that connects on first use and reuses the clients after.
///
/// Not meant to be raced on first use: steps run one at a time, so only one
/// caller ever triggers the connect.
pub struct LazyControlPlane {
    init: Option<Arc<NodeBootstrapper>>,
    settings: Arc<Settings>,
    clients: OnceCell<Clients>,
}

impl LazyControlPlane {
    /// Read credentials from `init` when first needed
    pub fn new(init: Option<Arc<NodeBootstrapper>>, settings: Arc<Settings>) -> Self {
        Self {
            init,
            settings,
            clients: OnceCell::new(),
        }
    }

    async fn clients(&self) -> Result<&Clients> {
        self.clients.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<Clients> {
        let init = self.init.as_ref().ok_or_else(|| {
            Error::validation("no cluster-initializing node to read cluster credentials from")
        })?;
        info!(
            node = %init.node().name,
            server = %api_server_url(&self.settings.ha_ip),
            "connecting to control plane"
        );
        let kubeconfig = fetch_kubeconfig(init, &self.settings.ha_ip).await?;
        let client = create_client(kubeconfig.path()).await?;

        let manifests: Arc<dyn ManifestApplier> = Arc::new(ResourceReconciler::new(Arc::new(
            KubeResourceStore::new(client),
        )));
        let helm = Arc::new(HelmBinary::new(
            self.settings.helm_binary.clone(),
            kubeconfig.path(),
        ));
        let charts: Arc<dyn ChartManager> =
            Arc::new(HelmChartManager::new(helm, manifests.clone()));
        Ok(Clients {
            manifests,
            charts,
            _kubeconfig: kubeconfig,
        })
    }
}

#[async_trait]
impl ControlPlane for LazyControlPlane {
    async fn manifests(&self) -> Result<Arc<dyn ManifestApplier>> {
        Ok(self.clients().await?.manifests.clone())
    }

    async fn charts(&self) -> Result<Arc<dyn ChartManager>> {
        Ok(self.clients().await?.charts.clone())
    }
}

/// Node whose session could not be opened; every runtime task on it fails
/// with the connection error
struct UnreachableNode {
    name: String,
    target: String,
    message: String,
}

impl UnreachableNode {
    fn new(node: &Node, err: Error) -> Self {
        let (target, message) = match err {
            Error::Connection { target, message } => (target, message),
            other => (node.address.clone(), other.to_string()),
        };
        Self {
            name: node.name.clone(),
            target,
            message,
        }
    }

    fn error(&self) -> Error {
        Error::connection(&self.target, &self.message)
    }
}

#[async_trait]
impl NodeTask for UnreachableNode {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn install(&self) -> Result<()> {
        Err(self.error())
    }

    async fn uninstall(&self, _purge_packages: bool) -> Result<()> {
        Err(self.error())
    }
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    Install,
    Uninstall,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Install => write!(f, "install"),
            Direction::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// A built pipeline and the sessions it runs over
struct Rollout {
    pipeline: Pipeline,
    connected: Vec<Arc<NodeBootstrapper>>,
}

async fn close_sessions(nodes: &[Arc<NodeBootstrapper>]) {
    for node in nodes {
        node.session().close().await;
    }
}

/// Entry point for install and uninstall
pub struct ClusterOrchestrator {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
}

impl ClusterOrchestrator {
    /// Orchestrate `config` over SSH
    pub fn new(config: Config) -> Self {
        Self::with_connector(config, Arc::new(SshConnector::default()))
    }

    /// Orchestrate `config`, opening node channels through `connector`
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
        }
    }

    /// Open a session to every node at once.
    ///
    /// Returns one task per node in plan order, and the bootstrappers whose
    /// session is open.
    async fn connect_nodes(
        &self,
        settings: &Arc<Settings>,
        token: &Arc<ClusterToken>,
    ) -> (Vec<Arc<dyn NodeTask>>, Vec<Arc<NodeBootstrapper>>) {
        let pending: Vec<_> = build_node_plan(&self.config)
            .into_iter()
            .map(|node| {
                let credentials = self
                    .config
                    .nodes
                    .get(&node.name)
                    .and_then(|spec| spec.credentials());
                let connector = self.connector.clone();
                let target = node.clone();
                let handle =
                    tokio::spawn(async move { connector.connect(&target, credentials).await });
                (node, handle)
            })
            .collect();

        let mut tasks: Vec<Arc<dyn NodeTask>> = Vec::new();
        let mut connected = Vec::new();
        for (node, handle) in pending {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::connection(
                    &node.address,
                    format!("connect task aborted: {}", e),
                )),
            };
            match result {
                Ok(transport) => {
                    debug!(node = %node.name, init = node.cluster_init, "node connected");
                    let session = RemoteSession::new(node.address.clone(), transport);
                    let boot = Arc::new(NodeBootstrapper::new(
                        node,
                        session,
                        settings.clone(),
                        token.clone(),
                    ));
                    tasks.push(boot.clone());
                    connected.push(boot);
                }
                Err(e) => {
                    error!(node = %node.name, error = %e, "node unreachable");
                    tasks.push(Arc::new(UnreachableNode::new(&node, e)));
                }
            }
        }
        (tasks, connected)
    }

    /// Connect to every node and build the pipeline
    async fn build(&self) -> Result<Rollout> {
        let settings = Arc::new(self.config.settings.clone());
        let token = Arc::new(ClusterToken::new());
        let (tasks, connected) = self.connect_nodes(&settings, &token).await;

        let init = connected.iter().find(|n| n.node().cluster_init).cloned();
        if init.is_none() && !tasks.is_empty() {
            warn!("cluster-initializing node is unreachable");
        }
        let control: Arc<dyn ControlPlane> = Arc::new(LazyControlPlane::new(init, settings));
        match build_steps(&self.config, &tasks, control) {
            Ok(steps) => Ok(Rollout {
                pipeline: Pipeline::new(steps),
                connected,
            }),
            Err(e) => {
                close_sessions(&connected).await;
                Err(e)
            }
        }
    }

    async fn run(&self, direction: Direction) -> Result<()> {
        let rollout = self.build().await?;
        info!(steps = rollout.pipeline.len(), "starting {}", direction);
        let result = match direction {
            Direction::Install => rollout.pipeline.install().await,
            Direction::Uninstall => rollout.pipeline.uninstall().await,
        };
        close_sessions(&rollout.connected).await;
        result?;
        info!("{} complete", direction);
        Ok(())
    }

    /// Run every step forward
    pub async fn install(&self) -> Result<()> {
        self.run(Direction::Install).await
    }

    /// Undo every step in reverse
    pub async fn uninstall(&self) -> Result<()> {
        self.run(Direction::Uninstall).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;
    use crate::node::runtime::KUBECONFIG_PATH;
    use crate::remote::tests::ok;
    use crate::remote::{shell_quote, MockTransport, Stdin};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CONFIG: &str = r#"
settings:
  haIP: 10.0.0.100
nodes:
  w1:
    address: 10.0.0.21
    role: worker
    rootPassword: secret
  m2:
    address: 10.0.0.12
    role: master
    rootPassword: secret
  m1:
    address: 10.0.0.11
    role: master
    rootPassword: secret
charts:
  ingress:
    version: 1.2.0
    namespace: edge
steps:
  - type: k3s
  - type: chart
    charts: [ingress]
  - type: manifest
    manifests: [manifests/app.yaml]
"#;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: default
  cluster:
    certificate-authority-data: Zm9v
    server: https://127.0.0.1:6443
contexts:
- name: default
  context:
    cluster: default
    user: default
current-context: default
users:
- name: default
  user:
    token: abc
"#;

    fn config() -> Config {
        Config::from_yaml(CONFIG).unwrap()
    }

    fn silent_connector() -> MockConnector {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|_, _| Ok(Arc::new(MockTransport::new()) as Arc<dyn Transport>));
        connector
    }

    fn bootstrapper(transport: MockTransport) -> NodeBootstrapper {
        let config = config();
        let node = build_node_plan(&config).remove(0);
        NodeBootstrapper::new(
            node,
            RemoteSession::new("10.0.0.11", Arc::new(transport)),
            Arc::new(config.settings.clone()),
            Arc::new(ClusterToken::new()),
        )
    }

    #[test]
    fn masters_come_first_and_first_master_initializes() {
        let plan = build_node_plan(&config());
        let names: Vec<&str> = plan.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["m1", "m2", "w1"]);
        assert!(plan[0].cluster_init);
        assert!(!plan[1].cluster_init);
        assert!(!plan[2].cluster_init);
        assert_eq!(plan[2].role, NodeRole::Worker);
    }

    #[test]
    fn cluster_init_setting_picks_the_initializer() {
        let mut config = config();
        config.settings.cluster_init = Some("m2".to_string());
        let plan = build_node_plan(&config);
        let init: Vec<&str> = plan
            .iter()
            .filter(|n| n.cluster_init)
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(init, vec!["m2"]);
    }

    #[tokio::test]
    async fn build_connects_each_node_and_keeps_step_order() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .withf(|node: &Node, creds: &Option<Credentials>| {
                node.ssh_port == 22 && matches!(creds, Some(Credentials::Password(p)) if p == "secret")
            })
            .times(3)
            .returning(|_, _| Ok(Arc::new(MockTransport::new()) as Arc<dyn Transport>));
        let orchestrator = ClusterOrchestrator::with_connector(config(), Arc::new(connector));

        let rollout = orchestrator.build().await.unwrap();
        assert_eq!(rollout.connected.len(), 3);
        let kinds: Vec<&str> = rollout
            .pipeline
            .steps()
            .iter()
            .map(|s| match s {
                Step::RuntimeBootstrap(_) => "runtime",
                Step::ChartRollout(_) => "chart",
                Step::ManifestRollout(_) => "manifest",
            })
            .collect();
        assert_eq!(kinds, vec!["runtime", "chart", "manifest"]);
        assert_eq!(rollout.pipeline.steps()[1].to_string(), "charts [ingress]");
    }

    /// Answers the commands a node with a running runtime sees during install
    fn running_node(closed: Arc<AtomicUsize>) -> Arc<dyn Transport> {
        let mut transport = MockTransport::new();
        transport.expect_exec().returning(|cmd, _| match cmd {
            "nproc" => ok("4\n"),
            "cat /proc/meminfo" => ok("MemTotal: 8000000 kB\n"),
            "hostname" => ok("node\n"),
            "systemctl is-active k3s" => ok("active\n"),
            "cat '/var/lib/rancher/k3s/server/token'" => ok("K10token\n"),
            other => panic!("unexpected command {}", other),
        });
        transport.expect_close().times(1).returning(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        });
        Arc::new(transport)
    }

    /// Story: the worker cannot be reached, yet both masters still come up;
    /// the run fails with the worker as the only node failure and every
    /// opened session is closed afterwards.
    #[tokio::test]
    async fn unreachable_node_fails_alone_and_sessions_are_closed() {
        let mut config = config();
        config.steps = vec![StepSpec::K3s];
        let closed = Arc::new(AtomicUsize::new(0));

        let mut connector = MockConnector::new();
        let counter = closed.clone();
        connector.expect_connect().returning(move |node, _| {
            if node.name == "w1" {
                Err(Error::connection("10.0.0.21:22", "connection refused"))
            } else {
                Ok(running_node(counter.clone()))
            }
        });
        let orchestrator = ClusterOrchestrator::with_connector(config, Arc::new(connector));

        match orchestrator.install().await.unwrap_err() {
            Error::NodeFailures { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].node, "w1");
                assert!(failures[0].error.contains("connection refused"));
            }
            other => panic!("expected node failures, got {:?}", other),
        }
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sessions_are_closed_after_uninstall() {
        let mut config = config();
        config.steps.clear();
        let closed = Arc::new(AtomicUsize::new(0));

        let mut connector = MockConnector::new();
        let counter = closed.clone();
        connector.expect_connect().times(3).returning(move |_, _| {
            let counter = counter.clone();
            let mut transport = MockTransport::new();
            transport.expect_close().times(1).returning(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            Ok(Arc::new(transport) as Arc<dyn Transport>)
        });
        let orchestrator = ClusterOrchestrator::with_connector(config, Arc::new(connector));

        orchestrator.uninstall().await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn chart_step_with_unknown_chart_is_rejected() {
        let mut config = config();
        config.steps = vec![StepSpec::Chart {
            charts: vec!["missing".to_string()],
        }];
        let control: Arc<dyn ControlPlane> =
            Arc::new(LazyControlPlane::new(None, Arc::new(config.settings.clone())));
        let err = build_steps(&config, &[], control).err().unwrap();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn uninstall_with_empty_pipeline_connects_nothing() {
        let mut config = config();
        config.nodes.clear();
        config.steps.clear();
        let mut connector = MockConnector::new();
        connector.expect_connect().never();
        let orchestrator = ClusterOrchestrator::with_connector(config, Arc::new(connector));

        orchestrator.uninstall().await.unwrap();
    }

    #[tokio::test]
    async fn kubeconfig_is_pointed_at_entry_address() {
        let mut transport = MockTransport::new();
        let expected = format!("cat {}", shell_quote(KUBECONFIG_PATH));
        transport
            .expect_exec()
            .withf(move |cmd: &str, stdin: &Option<Stdin>| cmd == expected && stdin.is_none())
            .times(1)
            .returning(|_, _| ok(KUBECONFIG));

        let file = fetch_kubeconfig(&bootstrapper(transport), "10.0.0.100")
            .await
            .unwrap();
        let written = std::fs::read_to_string(file.path()).unwrap();
        assert!(written.contains("https://10.0.0.100:6443"));
        assert!(!written.contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn control_plane_without_initializer_fails_on_use() {
        let control = LazyControlPlane::new(None, Arc::new(Settings::default()));
        let err = control.manifests().await.err().unwrap();
        assert!(matches!(err, Error::Validation { .. }));
        let err = control.charts().await.err().unwrap();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn control_plane_is_not_built_before_first_use() {
        let orchestrator = ClusterOrchestrator::with_connector(config(), Arc::new(silent_connector()));
        // Building touches no node: the mock transports have no expectations
        let rollout = orchestrator.build().await.unwrap();
        assert_eq!(rollout.pipeline.len(), 3);
    }
}
