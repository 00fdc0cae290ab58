//! Provisioning command implementations

use std::path::Path;

use anyhow::{Context, Result};

use kg_core::config::{self, ConfigFile};
use kg_core::error::ConfigError;
use kg_core::{ClusterSpec, Mode, RepoParams, SystemRunner};
use kg_provisioner::{ProvisionFailure, Provisioner, RunReport, StepKind};

use crate::output::{format_run_report, print_error, print_info, print_success, print_warning};

/// Mode as chosen on the command line, before repository parameters are
/// resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelection {
    None,
    Admin,
    ReadOnly,
}

/// Command-line and environment values layered over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub kind_config: Option<std::path::PathBuf>,
    pub owner: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub path: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut ConfigFile) {
        if let Some(name) = &self.name {
            config.cluster.name = name.clone();
        }
        if let Some(kind_config) = &self.kind_config {
            config.cluster.config_path = kind_config.clone();
        }
        if let Some(owner) = &self.owner {
            config.gitops.owner = Some(owner.clone());
        }
        if let Some(repository) = &self.repository {
            config.gitops.repository = Some(repository.clone());
        }
        if let Some(branch) = &self.branch {
            config.gitops.branch = branch.clone();
        }
        if let Some(path) = &self.path {
            config.gitops.path = Some(path.clone());
        }
    }
}

/// Build the run mode, failing before any mutation when repository
/// parameters are missing
pub fn resolve_mode(selection: ModeSelection, config: &ConfigFile) -> Result<Mode, ConfigError> {
    if selection == ModeSelection::None {
        return Ok(Mode::None);
    }

    let gitops = &config.gitops;
    let owner = gitops
        .owner
        .clone()
        .ok_or_else(|| ConfigError::MissingField("gitops.owner (--owner or KG_REPO_OWNER)".to_string()))?;
    let repository = gitops
        .repository
        .clone()
        .ok_or_else(|| ConfigError::MissingField("gitops.repository (--repository or KG_REPO_NAME)".to_string()))?;

    let repo = RepoParams {
        owner,
        repository,
        branch: gitops.branch.clone(),
        path: gitops
            .path
            .clone()
            .unwrap_or_else(|| format!("./clusters/{}", config.cluster.name)),
        url: gitops.url.clone(),
    };

    Ok(match selection {
        ModeSelection::Admin => Mode::Admin(repo),
        _ => Mode::ReadOnly(repo),
    })
}

/// Provision the cluster and, for admin/read-only, the GitOps controller
pub async fn provision_command(config: ConfigFile, mode: Mode) -> Result<()> {
    let spec = config.cluster_spec();
    print_info(&format!(
        "Provisioning cluster '{}' (GitOps mode: {})",
        spec.name, mode
    ));

    let namespace = config.gitops.namespace.clone();
    let provisioner = Provisioner::new(SystemRunner, config, mode);
    let report = provisioner
        .run()
        .await
        .map_err(|failure| report_failure(failure, &spec, &namespace))?;

    println!("{}", format_run_report(&report));
    print_warnings(&report, &spec, &namespace);
    if let Some(status) = &report.status {
        println!("\n{}", status.trim_end());
    }

    print_success(&format!(
        "Cluster '{}' is ready (context {})",
        spec.name,
        spec.context()
    ));
    Ok(())
}

/// Delete the cluster and its hosts entries
pub async fn destroy_command(config: ConfigFile) -> Result<()> {
    let spec = config.cluster_spec();
    print_info(&format!("Destroying cluster '{}'", spec.name));

    let namespace = config.gitops.namespace.clone();
    let provisioner = Provisioner::new(SystemRunner, config, Mode::None);
    let report = provisioner
        .teardown()
        .await
        .map_err(|failure| report_failure(failure, &spec, &namespace))?;

    println!("{}", format_run_report(&report));
    print_success(&format!("Cluster '{}' removed", spec.name));
    Ok(())
}

fn report_failure(failure: ProvisionFailure, spec: &ClusterSpec, namespace: &str) -> anyhow::Error {
    println!("{}", format_run_report(&failure.report));
    print_warnings(&failure.report, spec, namespace);
    print_error(&format!("Step '{}' failed", failure.step));
    anyhow::Error::new(failure)
}

fn print_warnings(report: &RunReport, spec: &ClusterSpec, namespace: &str) {
    for (step, message) in report.warnings() {
        match next_action(step, spec, namespace) {
            Some(hint) => print_warning(&format!("{}: {}; {}", step, message, hint)),
            None => print_warning(&format!("{}: {}", step, message)),
        }
    }
}

/// What to run next after a best-effort step warned
pub fn next_action(step: StepKind, spec: &ClusterSpec, namespace: &str) -> Option<String> {
    match step {
        StepKind::WaitForSource | StepKind::WaitForSync => Some(format!(
            "check with `kubectl --context {} -n {} get gitrepositories,kustomizations`",
            spec.context(),
            namespace
        )),
        StepKind::ReportStatus => Some(format!(
            "check with `kubectl --context {} get nodes`",
            spec.context()
        )),
        _ => None,
    }
}

/// Write the default configuration file
pub fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        print_warning(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    config::save_config(path, &ConfigFile::default())
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    print_success(&format!("Wrote default config to {:?}", path));
    Ok(())
}

/// Print the effective configuration as TOML
pub fn config_show(config: &ConfigFile) -> Result<()> {
    let content = config::render_config(config).context("Failed to render config")?;
    println!("{}", content.trim_end());
    Ok(())
}
