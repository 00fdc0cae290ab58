//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Prefix of the marker tagging hosts-file lines owned by this tool
pub const HOSTS_MARKER_PREFIX: &str = "#kind-gitops:";

/// One `address hostname` binding in the hosts file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub address: String,
    pub hostname: String,
}

impl HostEntry {
    pub fn new(address: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            hostname: hostname.into(),
        }
    }
}

/// The ephemeral cluster to realize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Cluster name, unique among local kind clusters
    pub name: String,
    /// kind configuration file carrying the node topology
    pub config_path: PathBuf,
    /// Hostname bindings written to the hosts file for this cluster
    pub host_entries: Vec<HostEntry>,
}

impl ClusterSpec {
    /// Create a spec with the default `127.0.0.1 <name>.local` binding
    pub fn new(name: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let host_entries = vec![HostEntry::new("127.0.0.1", format!("{}.local", name))];
        Self {
            name,
            config_path: config_path.into(),
            host_entries,
        }
    }

    /// Replace the hosts bindings
    pub fn with_host_entries(mut self, entries: Vec<HostEntry>) -> Self {
        self.host_entries = entries;
        self
    }

    /// kubeconfig context kind creates for this cluster
    pub fn context(&self) -> String {
        format!("kind-{}", self.name)
    }

    /// Marker tagging this cluster's hosts block
    pub fn hosts_marker(&self) -> String {
        format!("{}{}", HOSTS_MARKER_PREFIX, self.name)
    }
}

/// Git repository the GitOps controller syncs from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoParams {
    pub owner: String,
    pub repository: String,
    pub branch: String,
    /// Path inside the repository holding the manifests to sync
    pub path: String,
    /// Explicit clone URL; GitHub HTTPS URL is derived when unset
    pub url: Option<String>,
}

impl RepoParams {
    /// Public, unauthenticated clone URL
    pub fn source_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}/{}", self.owner, self.repository))
    }
}

/// GitOps authorization mode, fixed for the whole run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Cluster stands alone
    None,
    /// Controller bootstrapped with write-capable credentials
    Admin(RepoParams),
    /// Controller installed without credentials, syncing a public URL
    ReadOnly(RepoParams),
}

impl Mode {
    /// Repository parameters, if the mode syncs from one
    pub fn repo(&self) -> Option<&RepoParams> {
        match self {
            Mode::None => None,
            Mode::Admin(repo) | Mode::ReadOnly(repo) => Some(repo),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::None => write!(f, "none"),
            Mode::Admin(_) => write!(f, "admin"),
            Mode::ReadOnly(_) => write!(f, "read-only"),
        }
    }
}
