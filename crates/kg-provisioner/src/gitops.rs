//! GitOps controller setup
//!
//! Admin mode hands everything to a single `flux bootstrap github` call,
//! which installs the controllers, creates a deploy key with write access
//! and commits the controller manifests back to the repository.
//!
//! Read-only mode installs the controllers without any credentials and
//! applies a `GitRepository` pointing at the public clone URL plus a
//! `Kustomization` syncing one path from it. Nothing in this mode can write
//! to the repository.

use serde::Serialize;

use kg_core::config::{GitOpsConfig, TimeoutConfig};
use kg_core::error::ProvisionError;
use kg_core::exec::{run_checked, CommandRunner, Invocation};
use kg_core::kubectl::Kubectl;
use kg_core::RepoParams;

/// Controllers added in admin mode so the cluster can push image updates
/// back to the repository
const WRITE_BACK_COMPONENTS: &str = "image-reflector-controller,image-automation-controller";

const SOURCE_API_VERSION: &str = "source.toolkit.fluxcd.io/v1";
const SYNC_API_VERSION: &str = "kustomize.toolkit.fluxcd.io/v1";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
}

/// Where the controller fetches desired state from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: GitRepositorySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    pub interval: String,
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: GitReference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GitReference {
    pub branch: String,
}

/// How fetched state is applied to the cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: KustomizationSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    pub interval: String,
    pub path: String,
    /// Resources missing from the fetched state are deleted from the cluster
    pub prune: bool,
    pub source_ref: SourceReference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReference {
    pub kind: String,
    pub name: String,
}

/// Source resource for `repo`
pub fn source_manifest(settings: &GitOpsConfig, repo: &RepoParams) -> GitRepository {
    GitRepository {
        api_version: SOURCE_API_VERSION,
        kind: "GitRepository",
        metadata: ObjectMeta {
            name: settings.resource_name.clone(),
            namespace: settings.namespace.clone(),
        },
        spec: GitRepositorySpec {
            interval: settings.source_interval.clone(),
            url: repo.source_url(),
            reference: GitReference {
                branch: repo.branch.clone(),
            },
        },
    }
}

/// Sync resource applying `repo.path` from the source, always pruning
pub fn sync_manifest(settings: &GitOpsConfig, repo: &RepoParams) -> Kustomization {
    Kustomization {
        api_version: SYNC_API_VERSION,
        kind: "Kustomization",
        metadata: ObjectMeta {
            name: settings.resource_name.clone(),
            namespace: settings.namespace.clone(),
        },
        spec: KustomizationSpec {
            interval: settings.sync_interval.clone(),
            path: repo.path.clone(),
            prune: true,
            source_ref: SourceReference {
                kind: "GitRepository".to_string(),
                name: settings.resource_name.clone(),
            },
        },
    }
}

/// Flux operations against one cluster context
pub struct GitOps<'a, R: ?Sized> {
    runner: &'a R,
    context: String,
    settings: &'a GitOpsConfig,
    timeouts: &'a TimeoutConfig,
}

impl<'a, R: CommandRunner + ?Sized> GitOps<'a, R> {
    pub fn new(
        runner: &'a R,
        context: String,
        settings: &'a GitOpsConfig,
        timeouts: &'a TimeoutConfig,
    ) -> Self {
        Self {
            runner,
            context,
            settings,
            timeouts,
        }
    }

    fn kubectl(&self) -> Kubectl<'a, R> {
        Kubectl::new(self.runner, Some(self.context.clone()))
    }

    /// Admin mode: install, create write credentials and enable write-back
    /// in one call
    pub async fn bootstrap(&self, repo: &RepoParams) -> Result<(), ProvisionError> {
        tracing::info!(
            "Bootstrapping Flux from {}/{} (branch {}, path {})",
            repo.owner,
            repo.repository,
            repo.branch,
            repo.path
        );

        let mut args = vec![
            "bootstrap".to_string(),
            "github".to_string(),
            format!("--context={}", self.context),
            format!("--namespace={}", self.settings.namespace),
            format!("--owner={}", repo.owner),
            format!("--repository={}", repo.repository),
            format!("--branch={}", repo.branch),
            format!("--path={}", repo.path),
            "--read-write-key".to_string(),
            format!("--components-extra={}", WRITE_BACK_COMPONENTS),
        ];
        if self.settings.personal {
            args.push("--personal".to_string());
        }

        run_checked(self.runner, &Invocation::new("flux", args)).await?;
        Ok(())
    }

    /// Read-only mode step (a): controllers only, no credentials
    pub async fn install(&self) -> Result<(), ProvisionError> {
        tracing::info!("Installing Flux controllers");
        run_checked(
            self.runner,
            &Invocation::new(
                "flux",
                [
                    "install".to_string(),
                    format!("--context={}", self.context),
                    format!("--namespace={}", self.settings.namespace),
                ],
            ),
        )
        .await?;
        Ok(())
    }

    /// Read-only mode step (b): create or replace the source
    pub async fn apply_source(&self, repo: &RepoParams) -> Result<(), ProvisionError> {
        let manifest = source_manifest(self.settings, repo);
        tracing::info!("Applying GitRepository {} -> {}", manifest.metadata.name, manifest.spec.url);
        self.kubectl().apply(&serde_json::to_string(&manifest)?).await?;
        Ok(())
    }

    /// Read-only mode step (c): create or replace the pruning sync
    pub async fn apply_sync(&self, repo: &RepoParams) -> Result<(), ProvisionError> {
        let manifest = sync_manifest(self.settings, repo);
        tracing::info!("Applying Kustomization {} for path {}", manifest.metadata.name, manifest.spec.path);
        self.kubectl().apply(&serde_json::to_string(&manifest)?).await?;
        Ok(())
    }

    pub async fn wait_for_source(&self) -> Result<(), ProvisionError> {
        let target = format!("gitrepository/{}", self.settings.resource_name);
        self.kubectl()
            .wait(
                "GitOps source to be ready",
                Some(&self.settings.namespace),
                &[&target],
                "ready",
                self.timeouts.source_ready,
            )
            .await
    }

    pub async fn wait_for_sync(&self) -> Result<(), ProvisionError> {
        let target = format!("kustomization/{}", self.settings.resource_name);
        self.kubectl()
            .wait(
                "GitOps sync to be ready",
                Some(&self.settings.namespace),
                &[&target],
                "ready",
                self.timeouts.sync_ready,
            )
            .await
    }

    /// Source and sync listing for the status report
    pub async fn status(&self) -> Result<String, ProvisionError> {
        let output = self
            .kubectl()
            .run(&[
                "-n",
                &self.settings.namespace,
                "get",
                "gitrepositories,kustomizations",
            ])
            .await?;
        Ok(output.stdout)
    }
}
