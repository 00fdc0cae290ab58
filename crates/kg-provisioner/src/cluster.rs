//! Cluster lifecycle
//!
//! A cluster is never reconfigured in place. If one with the same name
//! exists it is deleted in full and created again from the kind config, so
//! every run starts from the same state.

use std::io;
use std::time::Duration;

use kg_core::config::HostsConfig;
use kg_core::error::ProvisionError;
use kg_core::exec::{run_checked, CommandRunner, Invocation};
use kg_core::hosts::{self, HostsFile};
use kg_core::kubectl::Kubectl;
use kg_core::ClusterSpec;

/// Drives `kind` and the hosts file for one cluster
pub struct ClusterLifecycle<'a, R: ?Sized> {
    runner: &'a R,
    spec: &'a ClusterSpec,
    hosts: HostsFile,
    elevate_hosts: bool,
    nodes_timeout: Duration,
}

impl<'a, R: CommandRunner + ?Sized> ClusterLifecycle<'a, R> {
    pub fn new(
        runner: &'a R,
        spec: &'a ClusterSpec,
        hosts: &HostsConfig,
        nodes_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            spec,
            hosts: HostsFile::new(&hosts.path),
            elevate_hosts: hosts.sudo,
            nodes_timeout,
        }
    }

    /// Whether kind lists a cluster with this spec's name
    pub async fn exists(&self) -> Result<bool, ProvisionError> {
        let output = run_checked(self.runner, &Invocation::new("kind", ["get", "clusters"])).await?;
        Ok(output.stdout.lines().any(|line| line.trim() == self.spec.name))
    }

    /// Delete the cluster if present; returns whether one was deleted
    pub async fn delete_if_exists(&self) -> Result<bool, ProvisionError> {
        if !self.exists().await? {
            tracing::info!("No existing cluster named '{}'", self.spec.name);
            return Ok(false);
        }

        tracing::info!("Deleting existing cluster '{}'", self.spec.name);
        run_checked(
            self.runner,
            &Invocation::new("kind", ["delete", "cluster", "--name", self.spec.name.as_str()]),
        )
        .await?;
        Ok(true)
    }

    /// Flush the marker-tagged block and write the spec's entries
    pub async fn rewrite_hosts(&self) -> Result<(), ProvisionError> {
        let marker = self.spec.hosts_marker();
        let entries = &self.spec.host_entries;

        match self.hosts.rewrite(&marker, entries) {
            Ok(()) => {
                tracing::info!(
                    "Wrote {} hosts entr{} tagged {}",
                    entries.len(),
                    if entries.len() == 1 { "y" } else { "ies" },
                    marker
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && self.elevate_hosts => {
                let content = self.hosts.read().map_err(|source| self.hosts_error(source))?;
                self.write_hosts_elevated(hosts::rewrite_content(&content, &marker, entries))
                    .await
            }
            Err(source) => Err(self.hosts_error(source)),
        }
    }

    /// Remove the marker-tagged block; absence is success
    pub async fn remove_hosts(&self) -> Result<usize, ProvisionError> {
        let marker = self.spec.hosts_marker();

        match self.hosts.remove(&marker) {
            Ok(removed) => Ok(removed),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && self.elevate_hosts => {
                let content = self.hosts.read().map_err(|source| self.hosts_error(source))?;
                let (stripped, removed) = hosts::strip_marked(&content, &marker);
                self.write_hosts_elevated(stripped).await?;
                Ok(removed)
            }
            Err(source) => Err(self.hosts_error(source)),
        }
    }

    /// Hosts lines currently owned by this cluster
    pub fn hosts_block(&self) -> Result<Vec<String>, ProvisionError> {
        self.hosts
            .block(&self.spec.hosts_marker())
            .map_err(|source| self.hosts_error(source))
    }

    async fn write_hosts_elevated(&self, content: String) -> Result<(), ProvisionError> {
        tracing::info!("Writing {:?} through sudo", self.hosts.path());
        let path = self.hosts.path().to_string_lossy().to_string();
        let invocation = Invocation::new("sudo", ["tee", path.as_str()]).with_stdin(content);
        run_checked(self.runner, &invocation).await?;
        Ok(())
    }

    fn hosts_error(&self, source: io::Error) -> ProvisionError {
        ProvisionError::Hosts {
            path: self.hosts.path().to_path_buf(),
            source,
        }
    }

    /// `kind create cluster`; no retry and no cleanup on failure
    pub async fn create(&self) -> Result<(), ProvisionError> {
        tracing::info!(
            "Creating cluster '{}' from {:?}",
            self.spec.name,
            self.spec.config_path
        );
        let config = self.spec.config_path.to_string_lossy().to_string();
        run_checked(
            self.runner,
            &Invocation::new(
                "kind",
                [
                    "create",
                    "cluster",
                    "--name",
                    self.spec.name.as_str(),
                    "--config",
                    config.as_str(),
                ],
            ),
        )
        .await?;
        Ok(())
    }

    /// Wait until every node reports Ready
    pub async fn wait_for_nodes(&self) -> Result<(), ProvisionError> {
        tracing::info!("Waiting up to {:?} for nodes to be Ready", self.nodes_timeout);
        Kubectl::new(self.runner, Some(self.spec.context()))
            .wait(
                "nodes to be Ready",
                None,
                &["nodes", "--all"],
                "Ready",
                self.nodes_timeout,
            )
            .await
    }

    /// `kubectl get nodes` output for the status report
    pub async fn node_status(&self) -> Result<String, ProvisionError> {
        let output = Kubectl::new(self.runner, Some(self.spec.context()))
            .run(&["get", "nodes", "-o", "wide"])
            .await?;
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_core::exec::testing::ScriptedRunner;
    use kg_core::CommandOutput;
    use tempfile::TempDir;

    fn hosts_config(dir: &TempDir) -> HostsConfig {
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1\tlocalhost\n").unwrap();
        HostsConfig {
            path,
            ..HostsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_exists_matches_whole_name() {
        let dir = TempDir::new().unwrap();
        let spec = ClusterSpec::new("dev", "kind.yaml");
        let runner = ScriptedRunner::new().on(&["kind", "get", "clusters"], CommandOutput::ok("dev2\nstaging\n"));
        let cluster = ClusterLifecycle::new(&runner, &spec, &hosts_config(&dir), Duration::from_secs(1));

        assert!(!cluster.exists().await.unwrap());
        assert!(!cluster.delete_if_exists().await.unwrap());
        assert_eq!(runner.count(&["kind", "delete"]), 0);
    }

    #[tokio::test]
    async fn test_delete_existing_cluster() {
        let dir = TempDir::new().unwrap();
        let spec = ClusterSpec::new("dev", "kind.yaml");
        let runner = ScriptedRunner::new().on(&["kind", "get", "clusters"], CommandOutput::ok("dev\n"));
        let cluster = ClusterLifecycle::new(&runner, &spec, &hosts_config(&dir), Duration::from_secs(1));

        assert!(cluster.delete_if_exists().await.unwrap());
        assert_eq!(runner.count(&["kind", "delete", "cluster", "--name", "dev"]), 1);
    }

    #[tokio::test]
    async fn test_create_failure_surfaces_kind_stderr() {
        let dir = TempDir::new().unwrap();
        let spec = ClusterSpec::new("dev", "kind.yaml");
        let runner = ScriptedRunner::new().on(
            &["kind", "create"],
            CommandOutput::failed("ERROR: failed to create cluster: docker not running"),
        );
        let cluster = ClusterLifecycle::new(&runner, &spec, &hosts_config(&dir), Duration::from_secs(1));

        let err = cluster.create().await.unwrap_err();
        assert!(err
            .to_string()
            .ends_with("ERROR: failed to create cluster: docker not running"));
        assert_eq!(runner.count(&["kind", "create"]), 1);
    }

    #[tokio::test]
    async fn test_wait_for_nodes_uses_context_and_bound() {
        let dir = TempDir::new().unwrap();
        let spec = ClusterSpec::new("dev", "kind.yaml");
        let runner = ScriptedRunner::new();
        let cluster = ClusterLifecycle::new(&runner, &spec, &hosts_config(&dir), Duration::from_secs(120));

        cluster.wait_for_nodes().await.unwrap();
        assert_eq!(
            runner.calls()[0].to_string(),
            "kubectl --context kind-dev wait nodes --all --for=condition=Ready --timeout=120s"
        );
    }

    #[tokio::test]
    async fn test_rewrite_and_remove_hosts() {
        let dir = TempDir::new().unwrap();
        let config = hosts_config(&dir);
        let spec = ClusterSpec::new("dev", "kind.yaml");
        let runner = ScriptedRunner::new();
        let cluster = ClusterLifecycle::new(&runner, &spec, &config, Duration::from_secs(1));

        cluster.rewrite_hosts().await.unwrap();
        let content = std::fs::read_to_string(&config.path).unwrap();
        assert_eq!(content, "127.0.0.1\tlocalhost\n127.0.0.1\tdev.local #kind-gitops:dev\n");
        assert_eq!(cluster.hosts_block().unwrap(), vec!["127.0.0.1\tdev.local #kind-gitops:dev"]);

        assert_eq!(cluster.remove_hosts().await.unwrap(), 1);
        assert_eq!(cluster.remove_hosts().await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&config.path).unwrap(), "127.0.0.1\tlocalhost\n");
        assert!(runner.calls().is_empty());
    }
}
