//! Ordered install/uninstall steps
//!
//! A [`Pipeline`] runs its [`Step`]s in declared order on install and in
//! reverse on uninstall, stopping at the first step that fails. The runtime
//! step fans out to every node in parallel and waits for all of them before
//! reporting; chart and manifest steps run one item at a time against the
//! control plane.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::chart::{rollout, Chart, ChartManager};
use crate::error::NodeFailure;
use crate::node::NodeBootstrapper;
use crate::reconcile::ManifestApplier;
use crate::{Error, Result};

/// Work done on one node by the runtime step
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeTask: Send + Sync {
    /// Node name for failure reports
    fn name(&self) -> String;

    /// Prepare the node and bring its runtime up
    async fn install(&self) -> Result<()>;

    /// Tear the runtime down, optionally removing installed packages
    async fn uninstall(&self, purge_packages: bool) -> Result<()>;
}

#[async_trait]
impl NodeTask for NodeBootstrapper {
    fn name(&self) -> String {
        self.node().name.clone()
    }

    async fn install(&self) -> Result<()> {
        self.prepare().await?;
        self.install_runtime().await
    }

    async fn uninstall(&self, purge_packages: bool) -> Result<()> {
        self.uninstall_runtime().await?;
        if purge_packages {
            self.remove_packages().await?;
        }
        self.cleanup().await
    }
}

/// Access to the cluster's control plane, connected on first use
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Manifest reconciler
    async fn manifests(&self) -> Result<Arc<dyn ManifestApplier>>;

    /// Chart release manager
    async fn charts(&self) -> Result<Arc<dyn ChartManager>>;
}

/// Runtime bootstrap on every node
pub struct RuntimeBootstrapStep {
    nodes: Vec<Arc<dyn NodeTask>>,
    purge_packages: bool,
}

impl RuntimeBootstrapStep {
    /// Step over `nodes`; `purge_packages` also removes packages on uninstall
    pub fn new(nodes: Vec<Arc<dyn NodeTask>>, purge_packages: bool) -> Self {
        Self {
            nodes,
            purge_packages,
        }
    }

    /// Install on every node concurrently
    pub async fn install(&self) -> Result<()> {
        fan_out("runtime install", &self.nodes, |node| async move {
            node.install().await
        })
        .await
    }

    /// Uninstall on every node concurrently
    pub async fn uninstall(&self) -> Result<()> {
        let purge = self.purge_packages;
        fan_out("runtime uninstall", &self.nodes, move |node| async move {
            node.uninstall(purge).await
        })
        .await
    }
}

/// Run `task` on every node in its own task and wait for all of them.
///
/// Every node is attempted; failures are collected into
/// [`Error::NodeFailures`], sorted by node name.
async fn fan_out<F, Fut>(step: &str, nodes: &[Arc<dyn NodeTask>], task: F) -> Result<()>
where
    F: Fn(Arc<dyn NodeTask>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for node in nodes {
        let name = node.name();
        let fut = task(node.clone());
        set.spawn(async move { (name, fut.await) });
    }

    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((node, Err(e))) => {
                error!(node = %node, error = %e, step = %step, "node failed");
                failures.push(NodeFailure {
                    node,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                error!(error = %e, step = %step, "node task aborted");
                failures.push(NodeFailure {
                    node: "unknown".to_string(),
                    error: format!("task aborted: {}", e),
                });
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    failures.sort_by(|a, b| a.node.cmp(&b.node));
    Err(Error::NodeFailures {
        step: step.to_string(),
        failures,
    })
}

/// Chart rollout, one chart at a time
pub struct ChartRolloutStep {
    charts: Vec<Chart>,
    control: Arc<dyn ControlPlane>,
}

impl ChartRolloutStep {
    /// Step over `charts` in install order
    pub fn new(charts: Vec<Chart>, control: Arc<dyn ControlPlane>) -> Self {
        Self { charts, control }
    }

    /// Roll out each chart in order
    pub async fn install(&self) -> Result<()> {
        let manager = self.control.charts().await?;
        let manifests = self.control.manifests().await?;
        for chart in &self.charts {
            rollout(manager.as_ref(), manifests.as_ref(), chart).await?;
        }
        Ok(())
    }

    /// Uninstall each chart in reverse order, skipping ones with no release
    pub async fn uninstall(&self) -> Result<()> {
        let manager = self.control.charts().await?;
        for chart in self.charts.iter().rev() {
            match manager.get_release(&chart.release, &chart.namespace).await {
                Err(e) if e.is_release_not_found() => {
                    warn!(chart = %chart, "release not found, skipping uninstall");
                }
                Err(e) => return Err(e),
                Ok(_) => manager.uninstall(chart).await?,
            }
        }
        Ok(())
    }
}

/// Raw manifest rollout
pub struct ManifestRolloutStep {
    paths: Vec<PathBuf>,
    control: Arc<dyn ControlPlane>,
}

impl ManifestRolloutStep {
    /// Step over manifest files or directories
    pub fn new(paths: Vec<PathBuf>, control: Arc<dyn ControlPlane>) -> Self {
        Self { paths, control }
    }

    /// Apply each path in declared order
    pub async fn install(&self) -> Result<()> {
        let manifests = self.control.manifests().await?;
        for path in &self.paths {
            manifests.apply(path).await?;
        }
        Ok(())
    }

    /// Delete each path, also in declared order
    pub async fn uninstall(&self) -> Result<()> {
        let manifests = self.control.manifests().await?;
        for path in &self.paths {
            manifests.delete(path).await?;
        }
        Ok(())
    }
}

/// One pipeline step
pub enum Step {
    /// Runtime bootstrap on every node
    RuntimeBootstrap(RuntimeBootstrapStep),
    /// Chart releases
    ChartRollout(ChartRolloutStep),
    /// Raw manifests
    ManifestRollout(ManifestRolloutStep),
}

impl Step {
    /// Run the step forward
    pub async fn install(&self) -> Result<()> {
        match self {
            Step::RuntimeBootstrap(s) => s.install().await,
            Step::ChartRollout(s) => s.install().await,
            Step::ManifestRollout(s) => s.install().await,
        }
    }

    /// Undo the step
    pub async fn uninstall(&self) -> Result<()> {
        match self {
            Step::RuntimeBootstrap(s) => s.uninstall().await,
            Step::ChartRollout(s) => s.uninstall().await,
            Step::ManifestRollout(s) => s.uninstall().await,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::RuntimeBootstrap(s) => write!(f, "runtime ({} nodes)", s.nodes.len()),
            Step::ChartRollout(s) => {
                let names: Vec<&str> = s.charts.iter().map(|c| c.name.as_str()).collect();
                write!(f, "charts [{}]", names.join(", "))
            }
            Step::ManifestRollout(s) => write!(f, "manifests ({} paths)", s.paths.len()),
        }
    }
}

/// Ordered list of steps
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    /// Pipeline over `steps` in install order
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// No steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in install order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step in order, stopping at the first failure
    pub async fn install(&self) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            info!(step = i + 1, name = %step, "installing step");
            step.install().await?;
        }
        Ok(())
    }

    /// Undo every step in reverse order, stopping at the first failure
    pub async fn uninstall(&self) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate().rev() {
            info!(step = i + 1, name = %step, "uninstalling step");
            step.uninstall().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::{MockChartManager, Release};
    use crate::reconcile::MockManifestApplier;
    use mockall::predicate::*;
    use mockall::Sequence;
    use std::path::Path;
    use std::time::Duration;

    /// Control plane handing out fixed clients
    struct Fixed {
        manifests: Arc<dyn ManifestApplier>,
        charts: Arc<dyn ChartManager>,
    }

    #[async_trait]
    impl ControlPlane for Fixed {
        async fn manifests(&self) -> Result<Arc<dyn ManifestApplier>> {
            Ok(self.manifests.clone())
        }

        async fn charts(&self) -> Result<Arc<dyn ChartManager>> {
            Ok(self.charts.clone())
        }
    }

    fn control(manifests: MockManifestApplier, charts: MockChartManager) -> Arc<dyn ControlPlane> {
        Arc::new(Fixed {
            manifests: Arc::new(manifests),
            charts: Arc::new(charts),
        })
    }

    fn chart(name: &str) -> Chart {
        Chart {
            name: name.to_string(),
            release: name.to_string(),
            namespace: "default".to_string(),
            package: PathBuf::from(format!("/charts/{0}/{0}-1.0.0.tgz", name)),
            values_file: None,
            set_values: vec![],
            timeout: Duration::from_secs(60),
            before: None,
            after: None,
        }
    }

    fn deployed(name: &str) -> Release {
        Release {
            name: name.to_string(),
            namespace: "default".to_string(),
            status: "deployed".to_string(),
        }
    }

    fn node(name: &'static str, fails: bool) -> Arc<dyn NodeTask> {
        let mut task = MockNodeTask::new();
        task.expect_name().return_const(name.to_string());
        task.expect_install().times(1).returning(move || {
            if fails {
                Err(Error::internal(format!("{} exploded", name)))
            } else {
                Ok(())
            }
        });
        Arc::new(task)
    }

    fn manifest_step(path: &str, control: Arc<dyn ControlPlane>) -> Step {
        Step::ManifestRollout(ManifestRolloutStep::new(vec![PathBuf::from(path)], control))
    }

    #[tokio::test]
    async fn pipeline_uninstall_runs_steps_in_reverse() {
        let mut seq = Sequence::new();
        let mut manifests = MockManifestApplier::new();
        for path in ["/m/c", "/m/b", "/m/a"] {
            manifests
                .expect_delete()
                .withf(move |p: &Path| p == Path::new(path))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        let control = control(manifests, MockChartManager::new());
        let pipeline = Pipeline::new(vec![
            manifest_step("/m/a", control.clone()),
            manifest_step("/m/b", control.clone()),
            manifest_step("/m/c", control),
        ]);

        pipeline.uninstall().await.unwrap();
    }

    #[tokio::test]
    async fn pipeline_install_stops_at_first_failure() {
        let mut manifests = MockManifestApplier::new();
        manifests
            .expect_apply()
            .withf(|p: &Path| p == Path::new("/m/a"))
            .times(1)
            .returning(|_| Err(Error::manifest("/m/a", "document has no kind")));
        manifests
            .expect_apply()
            .withf(|p: &Path| p == Path::new("/m/b"))
            .never();
        let control = control(manifests, MockChartManager::new());
        let pipeline = Pipeline::new(vec![
            manifest_step("/m/a", control.clone()),
            manifest_step("/m/b", control),
        ]);

        let err = pipeline.install().await.unwrap_err();
        assert!(matches!(err, Error::Manifest { .. }));
    }

    #[tokio::test]
    async fn manifest_step_uninstall_keeps_declared_order() {
        let mut seq = Sequence::new();
        let mut manifests = MockManifestApplier::new();
        for path in ["/m/1", "/m/2", "/m/3"] {
            manifests
                .expect_delete()
                .withf(move |p: &Path| p == Path::new(path))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        let step = ManifestRolloutStep::new(
            vec!["/m/1".into(), "/m/2".into(), "/m/3".into()],
            control(manifests, MockChartManager::new()),
        );

        step.uninstall().await.unwrap();
    }

    #[tokio::test]
    async fn chart_step_uninstall_reverses_chart_order() {
        let mut seq = Sequence::new();
        let mut charts = MockChartManager::new();
        charts
            .expect_get_release()
            .returning(|name, _| Ok(deployed(name)));
        for name in ["z", "y", "x"] {
            charts
                .expect_uninstall()
                .withf(move |c: &Chart| c.name == name)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        let step = ChartRolloutStep::new(
            vec![chart("x"), chart("y"), chart("z")],
            control(MockManifestApplier::new(), charts),
        );

        step.uninstall().await.unwrap();
    }

    #[tokio::test]
    async fn chart_step_uninstall_skips_missing_release() {
        let mut charts = MockChartManager::new();
        charts
            .expect_get_release()
            .with(eq("gone"), eq("default"))
            .returning(|name, ns| {
                Err(Error::ReleaseNotFound {
                    release: name.to_string(),
                    namespace: ns.to_string(),
                })
            });
        charts
            .expect_get_release()
            .with(eq("kept"), eq("default"))
            .returning(|name, _| Ok(deployed(name)));
        charts
            .expect_uninstall()
            .withf(|c: &Chart| c.name == "kept")
            .times(1)
            .returning(|_| Ok(()));
        let step = ChartRolloutStep::new(
            vec![chart("kept"), chart("gone")],
            control(MockManifestApplier::new(), charts),
        );

        step.uninstall().await.unwrap();
    }

    #[tokio::test]
    async fn chart_step_install_rolls_out_in_order() {
        let mut seq = Sequence::new();
        let mut charts = MockChartManager::new();
        charts.expect_get_release().returning(|name, ns| {
            Err(Error::ReleaseNotFound {
                release: name.to_string(),
                namespace: ns.to_string(),
            })
        });
        for name in ["x", "y"] {
            charts
                .expect_install()
                .withf(move |c: &Chart| c.name == name)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        let step = ChartRolloutStep::new(
            vec![chart("x"), chart("y")],
            control(MockManifestApplier::new(), charts),
        );

        step.install().await.unwrap();
    }

    /// Story: two of three nodes fail to bootstrap. The healthy node still
    /// gets its attempt, and the step reports both failures by name.
    #[tokio::test]
    async fn runtime_step_attempts_every_node_and_aggregates_failures() {
        let step = RuntimeBootstrapStep::new(
            vec![node("n1", true), node("n2", false), node("n3", true)],
            false,
        );

        let err = step.install().await.unwrap_err();
        match err {
            Error::NodeFailures { step, failures } => {
                assert_eq!(step, "runtime install");
                let names: Vec<&str> = failures.iter().map(|f| f.node.as_str()).collect();
                assert_eq!(names, vec!["n1", "n3"]);
                assert!(failures[0].error.contains("n1 exploded"));
            }
            other => panic!("expected node failures, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn runtime_step_succeeds_when_every_node_does() {
        let step = RuntimeBootstrapStep::new(vec![node("n1", false), node("n2", false)], false);
        step.install().await.unwrap();
    }

    #[tokio::test]
    async fn runtime_step_uninstall_passes_purge_flag() {
        let mut task = MockNodeTask::new();
        task.expect_name().return_const("n1".to_string());
        task.expect_uninstall()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));
        let step = RuntimeBootstrapStep::new(vec![Arc::new(task)], true);

        step.uninstall().await.unwrap();
    }
}
