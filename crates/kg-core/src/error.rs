//! Error taxonomy shared by the provisioner, the tunnel manager and the CLI

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Unmet preconditions. Always fatal, always raised before any mutation.
#[derive(Error, Debug)]
pub enum PreconditionError {
    /// Required command-line tool is not on PATH
    #[error("Required tool '{tool}' not found. {hint}")]
    MissingTool { tool: String, hint: String },

    /// Required environment variable is not set
    #[error("Environment variable {0} must be set")]
    MissingEnv(String),

    /// A file the run depends on does not exist
    #[error("Required file not found: {0:?}")]
    MissingFile(PathBuf),

    /// The hosts file cannot be written and elevation is off
    #[error("Hosts file {path:?} is not writable ({reason}). Run with write access or set `hosts.sudo = true`")]
    HostsNotWritable { path: PathBuf, reason: String },

    /// The container runtime backing the cluster is not running
    #[error("Container runtime is not available: {0}")]
    RuntimeUnavailable(String),

    /// The cluster API server did not answer
    #[error("Cluster is not reachable: {0}")]
    ClusterUnreachable(String),

    /// Target namespace does not exist
    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    /// Target service does not exist in the namespace
    #[error("Service '{service}' not found in namespace '{namespace}'")]
    ServiceNotFound { namespace: String, service: String },

    /// Local port is occupied and the operator did not approve freeing it
    #[error("Port {0} is already in use")]
    PortInUse(u16),
}

/// Failure of an external command
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program could not be started at all
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully; stderr is kept verbatim
    #[error("`{command}` failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// Provisioning failures
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// An external tool call failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A bounded wait expired
    #[error("Timed out after {timeout:?} waiting for {what}: {detail}")]
    Timeout {
        what: String,
        timeout: Duration,
        detail: String,
    },

    /// Reading or rewriting the hosts file failed
    #[error("Hosts file {path:?}: {source}")]
    Hosts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A precondition checked inside the run failed
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// Rendering a manifest failed
    #[error("Failed to render manifest: {0}")]
    Render(#[from] serde_json::Error),
}

/// Tunnel session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// A precondition for starting the tunnel is not met
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// Preparing the log file or spawning the tunnel process failed
    #[error("Failed to spawn tunnel on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The tunnel process exited during the startup grace period
    #[error("Tunnel on port {port} exited during startup:\n{log_tail}")]
    Crashed { port: u16, log_tail: String },

    /// An external command used by the session manager failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Raw TCP connection to the local port failed
    #[error("Cannot connect to localhost:{0}")]
    CannotConnect(u16),

    /// Connected, but the application answered nothing
    #[error("No response from gateway on localhost:{0}")]
    NoResponse(u16),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failure_keeps_stderr_verbatim() {
        let err = CommandError::Failed {
            command: "kind create cluster".to_string(),
            stderr: "ERROR: failed to create cluster: node(s) already exist".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "`kind create cluster` failed: ERROR: failed to create cluster: node(s) already exist"
        );
    }

    #[test]
    fn test_precondition_converts_into_session_error() {
        let err: SessionError = PreconditionError::PortInUse(8080).into();
        assert!(matches!(
            err,
            SessionError::Precondition(PreconditionError::PortInUse(8080))
        ));
        assert_eq!(err.to_string(), "Port 8080 is already in use");
    }
}
