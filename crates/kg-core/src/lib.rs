//! kg-core: Core abstractions and configuration for kind-gitops
//!
//! This crate provides the shared types, error taxonomy, configuration,
//! external command seam, hosts-file manager and process table access used
//! by the provisioner, the tunnel manager and the CLI.

pub mod config;
pub mod error;
pub mod exec;
pub mod hosts;
pub mod kubectl;
pub mod process;
pub mod types;

pub use exec::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use types::{ClusterSpec, HostEntry, Mode, RepoParams};
