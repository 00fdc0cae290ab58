//! Provisioning step pipeline
//!
//! A run is an ordered list of [`Step`]s. Each step carries its own
//! [`FailurePolicy`]: a fatal step stops the run and the error propagates,
//! a best-effort step records a warning and the run continues.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

use kg_core::config::ConfigFile;
use kg_core::error::{PreconditionError, ProvisionError};
use kg_core::exec::{require_tools, run_checked, CommandRunner, Invocation};
use kg_core::hosts::HostsFile;
use kg_core::{ClusterSpec, Mode};

use crate::cluster::ClusterLifecycle;
use crate::gitops::GitOps;

const DOCKER_HINT: &str = "Install Docker: https://docs.docker.com/get-docker/";
const KIND_HINT: &str = "Install kind: https://kind.sigs.k8s.io/docs/user/quick-start/#installation";
const KUBECTL_HINT: &str = "Install kubectl: https://kubernetes.io/docs/tasks/tools/";
const FLUX_HINT: &str = "Install flux: https://fluxcd.io/flux/installation/";
const SUDO_HINT: &str = "Install sudo or set `hosts.sudo = false` and run with write access to the hosts file";

/// Credential required by `flux bootstrap github`
pub const GITHUB_TOKEN_VAR: &str = "GITHUB_TOKEN";

/// What happens to the run when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the run
    Fatal,
    /// Record a warning and continue
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Fatal => write!(f, "fatal"),
            FailurePolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    CheckPrerequisites,
    CheckTeardownPrerequisites,
    DeleteExistingCluster,
    RewriteHostsBlock,
    CreateCluster,
    WaitForNodes,
    BootstrapController,
    InstallController,
    ApplySource,
    ApplySync,
    WaitForSource,
    WaitForSync,
    ReportStatus,
    RemoveHostsBlock,
}

impl StepKind {
    pub fn description(&self) -> &'static str {
        match self {
            StepKind::CheckPrerequisites | StepKind::CheckTeardownPrerequisites => {
                "Check prerequisites"
            }
            StepKind::DeleteExistingCluster => "Delete existing cluster",
            StepKind::RewriteHostsBlock => "Rewrite hosts entries",
            StepKind::CreateCluster => "Create cluster",
            StepKind::WaitForNodes => "Wait for nodes",
            StepKind::BootstrapController => "Bootstrap GitOps controller",
            StepKind::InstallController => "Install GitOps controller",
            StepKind::ApplySource => "Apply GitOps source",
            StepKind::ApplySync => "Apply GitOps sync",
            StepKind::WaitForSource => "Wait for GitOps source",
            StepKind::WaitForSync => "Wait for GitOps sync",
            StepKind::ReportStatus => "Report status",
            StepKind::RemoveHostsBlock => "Remove hosts entries",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A named step and its failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub kind: StepKind,
    pub policy: FailurePolicy,
}

impl Step {
    pub fn fatal(kind: StepKind) -> Self {
        Self {
            kind,
            policy: FailurePolicy::Fatal,
        }
    }

    pub fn best_effort(kind: StepKind) -> Self {
        Self {
            kind,
            policy: FailurePolicy::BestEffort,
        }
    }
}

/// Delete, rewrite hosts, create, wait for nodes
pub fn cluster_steps() -> Vec<Step> {
    vec![
        Step::fatal(StepKind::DeleteExistingCluster),
        Step::fatal(StepKind::RewriteHostsBlock),
        Step::fatal(StepKind::CreateCluster),
        Step::fatal(StepKind::WaitForNodes),
    ]
}

/// Controller setup for `mode`; convergence waits never abort the run
pub fn gitops_steps(mode: &Mode) -> Vec<Step> {
    match mode {
        Mode::None => Vec::new(),
        Mode::Admin(_) => vec![
            Step::fatal(StepKind::BootstrapController),
            Step::best_effort(StepKind::WaitForSource),
            Step::best_effort(StepKind::WaitForSync),
        ],
        Mode::ReadOnly(_) => vec![
            Step::fatal(StepKind::InstallController),
            Step::fatal(StepKind::ApplySource),
            Step::fatal(StepKind::ApplySync),
            Step::best_effort(StepKind::WaitForSource),
            Step::best_effort(StepKind::WaitForSync),
        ],
    }
}

/// The full provisioning run for `mode`
pub fn plan(mode: &Mode) -> Vec<Step> {
    let mut steps = vec![Step::fatal(StepKind::CheckPrerequisites)];
    steps.extend(cluster_steps());
    steps.extend(gitops_steps(mode));
    steps.push(Step::best_effort(StepKind::ReportStatus));
    steps
}

/// Cluster and hosts block removal
pub fn teardown_steps() -> Vec<Step> {
    vec![
        Step::fatal(StepKind::CheckTeardownPrerequisites),
        Step::fatal(StepKind::DeleteExistingCluster),
        Step::fatal(StepKind::RemoveHostsBlock),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    /// A best-effort step failed; the message is the error text
    Warned(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

/// What happened during a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: Mode,
    pub records: Vec<StepRecord>,
    /// Cluster and GitOps status captured at the end of the run
    pub status: Option<String>,
}

impl RunReport {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            records: Vec::new(),
            status: None,
        }
    }

    /// Steps that failed without aborting the run
    pub fn warnings(&self) -> Vec<(StepKind, &str)> {
        self.records
            .iter()
            .filter_map(|record| match &record.outcome {
                StepOutcome::Warned(message) => Some((record.step.kind, message.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// A fatal step failed; `report` holds everything up to and including it
#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct ProvisionFailure {
    pub step: StepKind,
    pub source: ProvisionError,
    pub report: RunReport,
}

/// Runs the pipeline against one cluster spec and mode
pub struct Provisioner<R> {
    runner: R,
    spec: ClusterSpec,
    mode: Mode,
    config: ConfigFile,
}

impl<R: CommandRunner> Provisioner<R> {
    pub fn new(runner: R, config: ConfigFile, mode: Mode) -> Self {
        Self {
            runner,
            spec: config.cluster_spec(),
            mode,
            config,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Full provisioning run
    pub async fn run(&self) -> Result<RunReport, ProvisionFailure> {
        self.execute(&plan(&self.mode)).await
    }

    /// Bring the cluster itself to a fresh, ready state
    pub async fn ensure_cluster(&self) -> Result<RunReport, ProvisionFailure> {
        self.execute(&cluster_steps()).await
    }

    /// Delete the cluster and its hosts block
    pub async fn teardown(&self) -> Result<RunReport, ProvisionFailure> {
        self.execute(&teardown_steps()).await
    }

    /// Run `steps` in order, honouring each step's policy
    pub async fn execute(&self, steps: &[Step]) -> Result<RunReport, ProvisionFailure> {
        let mut report = RunReport::new(self.mode.clone());
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            tracing::info!("[{}/{}] {}", index + 1, total, step.kind);
            let started = Instant::now();
            let result = self.perform(step.kind, &mut report).await;
            let elapsed = started.elapsed();

            match result {
                Ok(()) => report.records.push(StepRecord {
                    step: *step,
                    outcome: StepOutcome::Succeeded,
                    elapsed,
                }),
                Err(e) if step.policy == FailurePolicy::BestEffort => {
                    tracing::warn!("{}: {}", step.kind, e);
                    report.records.push(StepRecord {
                        step: *step,
                        outcome: StepOutcome::Warned(e.to_string()),
                        elapsed,
                    });
                }
                Err(e) => {
                    tracing::error!("{} failed: {}", step.kind, e);
                    report.records.push(StepRecord {
                        step: *step,
                        outcome: StepOutcome::Failed(e.to_string()),
                        elapsed,
                    });
                    return Err(ProvisionFailure {
                        step: step.kind,
                        source: e,
                        report,
                    });
                }
            }
        }

        Ok(report)
    }

    fn cluster(&self) -> ClusterLifecycle<'_, R> {
        ClusterLifecycle::new(
            &self.runner,
            &self.spec,
            &self.config.hosts,
            self.config.timeouts.nodes_ready,
        )
    }

    fn gitops(&self) -> GitOps<'_, R> {
        GitOps::new(
            &self.runner,
            self.spec.context(),
            &self.config.gitops,
            &self.config.timeouts,
        )
    }

    async fn perform(&self, kind: StepKind, report: &mut RunReport) -> Result<(), ProvisionError> {
        match (kind, &self.mode) {
            (StepKind::CheckPrerequisites, _) => self.check_prerequisites().await,
            (StepKind::CheckTeardownPrerequisites, _) => self.check_teardown_prerequisites().await,
            (StepKind::DeleteExistingCluster, _) => self.cluster().delete_if_exists().await.map(|_| ()),
            (StepKind::RewriteHostsBlock, _) => self.cluster().rewrite_hosts().await,
            (StepKind::CreateCluster, _) => self.cluster().create().await,
            (StepKind::WaitForNodes, _) => self.cluster().wait_for_nodes().await,
            (StepKind::RemoveHostsBlock, _) => {
                let removed = self.cluster().remove_hosts().await?;
                tracing::info!("Removed {} hosts entr{}", removed, if removed == 1 { "y" } else { "ies" });
                Ok(())
            }
            (StepKind::BootstrapController, Mode::Admin(repo)) => self.gitops().bootstrap(repo).await,
            (StepKind::InstallController, Mode::ReadOnly(_)) => self.gitops().install().await,
            (StepKind::ApplySource, Mode::ReadOnly(repo)) => self.gitops().apply_source(repo).await,
            (StepKind::ApplySync, Mode::ReadOnly(repo)) => self.gitops().apply_sync(repo).await,
            (StepKind::WaitForSource, Mode::Admin(_) | Mode::ReadOnly(_)) => {
                self.gitops().wait_for_source().await
            }
            (StepKind::WaitForSync, Mode::Admin(_) | Mode::ReadOnly(_)) => {
                self.gitops().wait_for_sync().await
            }
            (StepKind::ReportStatus, _) => {
                report.status = Some(self.collect_status().await?);
                Ok(())
            }
            (kind, mode) => {
                tracing::debug!("Skipping '{}' in {} mode", kind, mode);
                Ok(())
            }
        }
    }

    async fn check_prerequisites(&self) -> Result<(), ProvisionError> {
        let mut tools = vec![
            ("docker", DOCKER_HINT),
            ("kind", KIND_HINT),
            ("kubectl", KUBECTL_HINT),
        ];
        if self.mode != Mode::None {
            tools.push(("flux", FLUX_HINT));
        }
        require_tools(&self.runner, &tools).await?;
        self.check_runtime().await?;
        self.check_hosts_access().await?;

        if !self.spec.config_path.exists() {
            return Err(PreconditionError::MissingFile(self.spec.config_path.clone()).into());
        }

        if matches!(self.mode, Mode::Admin(_)) && std::env::var_os(GITHUB_TOKEN_VAR).is_none() {
            return Err(PreconditionError::MissingEnv(GITHUB_TOKEN_VAR.to_string()).into());
        }

        Ok(())
    }

    async fn check_teardown_prerequisites(&self) -> Result<(), ProvisionError> {
        require_tools(&self.runner, &[("docker", DOCKER_HINT), ("kind", KIND_HINT)]).await?;
        self.check_runtime().await?;
        self.check_hosts_access().await
    }

    /// The hosts block is rewritten after the old cluster is deleted, so
    /// access is settled before anything is touched
    async fn check_hosts_access(&self) -> Result<(), ProvisionError> {
        let hosts = &self.config.hosts;
        if hosts.sudo {
            require_tools(&self.runner, &[("sudo", SUDO_HINT)]).await?;
            return Ok(());
        }
        HostsFile::new(&hosts.path).check_writable().map_err(|e| {
            PreconditionError::HostsNotWritable {
                path: hosts.path.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    async fn check_runtime(&self) -> Result<(), ProvisionError> {
        run_checked(&self.runner, &Invocation::new("docker", ["info"]))
            .await
            .map_err(|e| PreconditionError::RuntimeUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn collect_status(&self) -> Result<String, ProvisionError> {
        let cluster = self.cluster();
        let mut sections = vec![cluster.node_status().await?];
        if self.mode != Mode::None {
            sections.push(self.gitops().status().await?);
        }

        let block = cluster.hosts_block()?;
        if !block.is_empty() {
            sections.push(format!("Hosts entries:\n{}", block.join("\n")));
        }

        Ok(sections
            .iter()
            .map(|s| s.trim_end())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_core::exec::testing::ScriptedRunner;
    use kg_core::{CommandOutput, RepoParams};
    use tempfile::TempDir;

    fn repo() -> RepoParams {
        RepoParams {
            owner: "acme".to_string(),
            repository: "fleet".to_string(),
            branch: "main".to_string(),
            path: "./clusters/dev".to_string(),
            url: None,
        }
    }

    fn kinds(steps: &[Step]) -> Vec<StepKind> {
        steps.iter().map(|s| s.kind).collect()
    }

    fn config(dir: &TempDir) -> ConfigFile {
        let kind_config = dir.path().join("kind-config.yaml");
        std::fs::write(&kind_config, "kind: Cluster\n").unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, "127.0.0.1\tlocalhost\n").unwrap();

        let mut config = ConfigFile::default();
        config.cluster.name = "dev".to_string();
        config.cluster.config_path = kind_config;
        config.hosts.path = hosts;
        config
    }

    #[test]
    fn test_plan_without_gitops() {
        assert_eq!(
            kinds(&plan(&Mode::None)),
            vec![
                StepKind::CheckPrerequisites,
                StepKind::DeleteExistingCluster,
                StepKind::RewriteHostsBlock,
                StepKind::CreateCluster,
                StepKind::WaitForNodes,
                StepKind::ReportStatus,
            ]
        );
    }

    #[test]
    fn test_convergence_waits_are_best_effort() {
        for mode in [Mode::Admin(repo()), Mode::ReadOnly(repo())] {
            for step in plan(&mode) {
                let expected = match step.kind {
                    StepKind::WaitForSource | StepKind::WaitForSync | StepKind::ReportStatus => {
                        FailurePolicy::BestEffort
                    }
                    _ => FailurePolicy::Fatal,
                };
                assert_eq!(step.policy, expected, "{} in {} mode", step.kind, mode);
            }
        }
    }

    #[test]
    fn test_read_only_plan_has_no_bootstrap() {
        let steps = kinds(&plan(&Mode::ReadOnly(repo())));
        assert!(!steps.contains(&StepKind::BootstrapController));
        assert!(steps.contains(&StepKind::ApplySource));

        let admin = kinds(&plan(&Mode::Admin(repo())));
        assert!(admin.contains(&StepKind::BootstrapController));
        assert!(!admin.contains(&StepKind::InstallController));
    }

    #[tokio::test]
    async fn test_missing_tool_stops_before_mutation() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().without_tool("kind");
        let provisioner = Provisioner::new(runner, config(&dir), Mode::None);

        let failure = provisioner.run().await.unwrap_err();
        assert_eq!(failure.step, StepKind::CheckPrerequisites);
        assert!(matches!(
            failure.source,
            ProvisionError::Precondition(PreconditionError::MissingTool { ref tool, .. }) if tool == "kind"
        ));
        assert!(provisioner.runner().calls().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_down_is_precondition() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on(
            &["docker", "info"],
            CommandOutput::failed("Cannot connect to the Docker daemon"),
        );
        let provisioner = Provisioner::new(runner, config(&dir), Mode::None);

        let failure = provisioner.run().await.unwrap_err();
        assert!(matches!(
            failure.source,
            ProvisionError::Precondition(PreconditionError::RuntimeUnavailable(_))
        ));
        assert_eq!(provisioner.runner().count(&["kind"]), 0);
    }

    #[tokio::test]
    async fn test_unwritable_hosts_stops_before_delete() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        // A directory is unwritable as a file even for root
        let hosts_dir = dir.path().join("hosts.d");
        std::fs::create_dir(&hosts_dir).unwrap();
        config.hosts.path = hosts_dir;
        let runner = ScriptedRunner::new().on(&["get", "clusters"], CommandOutput::ok("dev\n"));
        let provisioner = Provisioner::new(runner, config.clone(), Mode::None);

        let failure = provisioner.run().await.unwrap_err();
        assert_eq!(failure.step, StepKind::CheckPrerequisites);
        assert!(matches!(
            failure.source,
            ProvisionError::Precondition(PreconditionError::HostsNotWritable { .. })
        ));
        assert_eq!(provisioner.runner().count(&["kind"]), 0);

        let failure = Provisioner::new(ScriptedRunner::new(), config, Mode::None)
            .teardown()
            .await
            .unwrap_err();
        assert_eq!(failure.step, StepKind::CheckTeardownPrerequisites);
    }

    #[tokio::test]
    async fn test_sudo_hosts_requires_sudo() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.hosts.sudo = true;
        let provisioner = Provisioner::new(ScriptedRunner::new().without_tool("sudo"), config, Mode::None);

        let failure = provisioner.run().await.unwrap_err();
        assert!(matches!(
            failure.source,
            ProvisionError::Precondition(PreconditionError::MissingTool { ref tool, .. }) if tool == "sudo"
        ));
        assert_eq!(provisioner.runner().count(&["kind"]), 0);
    }

    #[tokio::test]
    async fn test_missing_kind_config() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.cluster.config_path = dir.path().join("absent.yaml");
        let provisioner = Provisioner::new(ScriptedRunner::new(), config, Mode::None);

        let failure = provisioner.run().await.unwrap_err();
        assert!(matches!(
            failure.source,
            ProvisionError::Precondition(PreconditionError::MissingFile(_))
        ));
    }

    #[tokio::test]
    async fn test_status_collected_into_report() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on(
            &["get", "nodes"],
            CommandOutput::ok("NAME                STATUS\ndev-control-plane   Ready\n"),
        );
        let provisioner = Provisioner::new(runner, config(&dir), Mode::None);

        let report = provisioner.run().await.unwrap();
        assert!(report.warnings().is_empty());
        let status = report.status.unwrap();
        assert!(status.contains("dev-control-plane"));
        assert!(status.contains("dev.local #kind-gitops:dev"));
        assert_eq!(provisioner.runner().count(&["flux"]), 0);
    }

    #[tokio::test]
    async fn test_teardown_removes_cluster_and_hosts() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let hosts_path = config.hosts.path.clone();
        std::fs::write(&hosts_path, "127.0.0.1\tlocalhost\n127.0.0.1\tdev.local #kind-gitops:dev\n").unwrap();
        let runner = ScriptedRunner::new().on(&["kind", "get", "clusters"], CommandOutput::ok("dev\n"));
        let provisioner = Provisioner::new(runner, config, Mode::None);

        let report = provisioner.teardown().await.unwrap();
        assert_eq!(report.records.len(), 3);
        assert_eq!(provisioner.runner().count(&["kind", "delete", "cluster"]), 1);
        assert_eq!(std::fs::read_to_string(&hosts_path).unwrap(), "127.0.0.1\tlocalhost\n");
    }
}
