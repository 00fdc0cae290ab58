//! Provisioning configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::{ClusterSpec, HostEntry};

/// Top-level config file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub cluster: ClusterConfig,
    pub hosts: HostsConfig,
    pub gitops: GitOpsConfig,
    pub timeouts: TimeoutConfig,
}

impl ConfigFile {
    /// Build the cluster spec, falling back to `127.0.0.1 <name>.local`
    /// when no hosts entries are configured
    pub fn cluster_spec(&self) -> ClusterSpec {
        let spec = ClusterSpec::new(&self.cluster.name, &self.cluster.config_path);
        if self.hosts.entries.is_empty() {
            spec
        } else {
            spec.with_host_entries(self.hosts.entries.clone())
        }
    }
}

/// Which cluster to create
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// kind cluster name
    pub name: String,

    /// kind configuration file
    pub config_path: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "gitops-sandbox".to_string(),
            config_path: PathBuf::from("kind-config.yaml"),
        }
    }
}

/// Hosts file handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    /// Path of the system hosts file
    pub path: PathBuf,

    /// Bindings to write; empty means the cluster default
    pub entries: Vec<HostEntry>,

    /// Retry a denied write through `sudo tee`
    pub sudo: bool,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            path: default_hosts_path(),
            entries: Vec::new(),
            sudo: false,
        }
    }
}

#[cfg(windows)]
fn default_hosts_path() -> PathBuf {
    PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
}

#[cfg(not(windows))]
fn default_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

/// GitOps controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitOpsConfig {
    /// Repository owner (user or organization)
    pub owner: Option<String>,

    /// Repository name
    pub repository: Option<String>,

    /// Branch to sync
    pub branch: String,

    /// Sync path; defaults to `./clusters/<cluster name>`
    pub path: Option<String>,

    /// Explicit clone URL for read-only mode
    pub url: Option<String>,

    /// Owner is a personal account rather than an organization
    pub personal: bool,

    /// Namespace the controller runs in
    pub namespace: String,

    /// Name of the source and sync resources
    pub resource_name: String,

    /// Source poll interval, in the controller's duration syntax
    pub source_interval: String,

    /// Sync poll interval, in the controller's duration syntax
    pub sync_interval: String,
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        Self {
            owner: None,
            repository: None,
            branch: "main".to_string(),
            path: None,
            url: None,
            personal: true,
            namespace: "flux-system".to_string(),
            resource_name: "flux-system".to_string(),
            source_interval: "1m".to_string(),
            sync_interval: "10m".to_string(),
        }
    }
}

/// Bounds for the long waits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// All nodes Ready after creation (fatal on expiry)
    #[serde(with = "duration_secs")]
    pub nodes_ready: Duration,

    /// GitOps source Ready (warning on expiry)
    #[serde(with = "duration_secs")]
    pub source_ready: Duration,

    /// GitOps sync Ready (warning on expiry)
    #[serde(with = "duration_secs")]
    pub sync_ready: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            nodes_ready: Duration::from_secs(120),
            source_ready: Duration::from_secs(120),
            sync_ready: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigFile::default();
        assert_eq!(config.cluster.name, "gitops-sandbox");
        assert_eq!(config.gitops.branch, "main");
        assert_eq!(config.timeouts.nodes_ready, Duration::from_secs(120));
        assert_eq!(config.timeouts.source_ready, Duration::from_secs(120));
        assert_eq!(config.timeouts.sync_ready, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
[cluster]
name = "dev"

[timeouts]
sync_ready = 60
"#,
        )
        .unwrap();
        assert_eq!(config.cluster.name, "dev");
        assert_eq!(config.cluster.config_path, PathBuf::from("kind-config.yaml"));
        assert_eq!(config.timeouts.sync_ready, Duration::from_secs(60));
        assert_eq!(config.timeouts.nodes_ready, Duration::from_secs(120));
    }

    #[test]
    fn test_cluster_spec_uses_configured_entries() {
        let config: ConfigFile = toml::from_str(
            r#"
[cluster]
name = "dev"

[[hosts.entries]]
address = "127.0.0.1"
hostname = "api.dev.test"

[[hosts.entries]]
address = "127.0.0.1"
hostname = "app.dev.test"
"#,
        )
        .unwrap();
        let spec = config.cluster_spec();
        assert_eq!(spec.host_entries.len(), 2);
        assert_eq!(spec.host_entries[1].hostname, "app.dev.test");

        let default_spec = ConfigFile::default().cluster_spec();
        assert_eq!(default_spec.host_entries[0].hostname, "gitops-sandbox.local");
    }
}
