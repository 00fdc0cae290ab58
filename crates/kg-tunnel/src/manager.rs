//! Tunnel session manager
//!
//! Sessions are detached `kubectl port-forward` processes. Nothing about
//! them is written down: the process table is queried on every call and
//! acted on straight away.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Child;
use std::time::Duration;

use kg_core::error::{PreconditionError, SessionError};
use kg_core::exec::{require_tools, run_checked, CommandRunner, Invocation};
use kg_core::kubectl::Kubectl;
use kg_core::process::ProcessTable;

use crate::logs;
use crate::target::{infer_port, TunnelTarget};

const KUBECTL_HINT: &str = "Install kubectl: https://kubernetes.io/docs/tasks/tools/";

/// Bound on the API server round trip of the reachability check
const REACHABILITY_TIMEOUT: &str = "--request-timeout=5s";

/// Time a new tunnel gets before it is checked for liveness
pub const STARTUP_GRACE: Duration = Duration::from_secs(2);

/// Pause between stop and start on restart
pub const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// Time for a terminated port owner to release the port
const RELEASE_WAIT: Duration = Duration::from_millis(500);

/// Log lines shown when a tunnel dies during startup
const CRASH_TAIL_LINES: usize = 10;

/// What to do when the requested local port is taken
#[derive(Debug, Clone, Copy)]
pub enum ConflictPolicy {
    /// Fail with [`PreconditionError::PortInUse`]
    Abort,
    /// Terminate the owning processes without asking
    Terminate,
    /// Ask; the callback receives the port and owning pids
    Confirm(fn(u16, &[u32]) -> bool),
}

/// A running tunnel found in the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSession {
    pub pid: u32,
    /// Local port, when the argv carries a `<local>:<remote>` pair
    pub port: Option<u16>,
}

/// A tunnel that survived its startup grace period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedTunnel {
    pub pid: u32,
    pub port: u16,
    pub url: String,
    pub log_path: PathBuf,
}

/// Outcome of starting several tunnels
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub started: Vec<StartedTunnel>,
    /// Ports left alone, with the reason
    pub skipped: Vec<(u16, String)>,
}

pub struct SessionManager<R, P> {
    runner: R,
    table: P,
    target: TunnelTarget,
    grace: Duration,
    restart_pause: Duration,
}

impl<R: CommandRunner, P: ProcessTable> SessionManager<R, P> {
    pub fn new(runner: R, table: P, target: TunnelTarget) -> Self {
        Self {
            runner,
            table,
            target,
            grace: STARTUP_GRACE,
            restart_pause: RESTART_PAUSE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.restart_pause = pause;
        self
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn table(&self) -> &P {
        &self.table
    }

    fn kubectl(&self) -> Kubectl<'_, R> {
        Kubectl::new(&self.runner, self.target.context.clone())
    }

    /// kubectl present, cluster reachable, namespace and service exist
    pub async fn check_prerequisites(&self) -> Result<(), PreconditionError> {
        require_tools(&self.runner, &[("kubectl", KUBECTL_HINT)]).await?;

        let kubectl = self.kubectl();
        if let Err(e) = kubectl.run(&["cluster-info", REACHABILITY_TIMEOUT]).await {
            return Err(PreconditionError::ClusterUnreachable(e.to_string()));
        }
        if !kubectl.succeeds(&["get", "namespace", &self.target.namespace]).await {
            return Err(PreconditionError::NamespaceNotFound(self.target.namespace.clone()));
        }
        if !kubectl
            .succeeds(&["get", "service", &self.target.service, "-n", &self.target.namespace])
            .await
        {
            return Err(PreconditionError::ServiceNotFound {
                namespace: self.target.namespace.clone(),
                service: self.target.service.clone(),
            });
        }
        Ok(())
    }

    /// Whether the local port can be bound right now
    pub fn port_available(&self, port: u16) -> bool {
        TcpListener::bind((self.target.address.as_str(), port)).is_ok()
    }

    /// Pids listening on `port`, as reported by `lsof`
    pub async fn port_owners(&self, port: u16) -> Vec<u32> {
        let port_arg = format!("tcp:{}", port);
        let invocation = Invocation::new("lsof", ["-ti", port_arg.as_str(), "-sTCP:LISTEN"]);
        match run_checked(&self.runner, &invocation).await {
            Ok(output) => output
                .stdout
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect(),
            Err(e) => {
                tracing::debug!("Could not list owners of port {}: {}", port, e);
                Vec::new()
            }
        }
    }

    /// Start a tunnel on `port`
    ///
    /// Every precondition is checked before the log file or the process is
    /// created.
    pub async fn start(&self, port: u16, conflict: ConflictPolicy) -> Result<StartedTunnel, SessionError> {
        self.check_prerequisites().await?;
        if !self.port_available(port) {
            self.free_port(port, conflict).await?;
        }
        self.launch(port).await
    }

    async fn free_port(&self, port: u16, conflict: ConflictPolicy) -> Result<(), SessionError> {
        let owners = self.port_owners(port).await;
        tracing::warn!("Port {} is already in use (pids: {:?})", port, owners);

        let approved = match conflict {
            ConflictPolicy::Abort => false,
            ConflictPolicy::Terminate => true,
            ConflictPolicy::Confirm(ask) => !owners.is_empty() && ask(port, &owners),
        };
        if !approved || owners.is_empty() {
            return Err(PreconditionError::PortInUse(port).into());
        }

        for pid in &owners {
            match self.table.terminate(*pid) {
                Ok(true) => tracing::info!("Terminated process {} holding port {}", pid, port),
                Ok(false) => tracing::debug!("Process {} already exited", pid),
                Err(e) => tracing::warn!("Failed to terminate process {}: {}", pid, e),
            }
        }

        tokio::time::sleep(RELEASE_WAIT).await;
        if self.port_available(port) {
            Ok(())
        } else {
            Err(PreconditionError::PortInUse(port).into())
        }
    }

    /// Spawn the forwarder and check it is still alive after the grace period
    async fn launch(&self, port: u16) -> Result<StartedTunnel, SessionError> {
        let invocation = self.target.forward_invocation(port);
        let log_path = self.target.log_path(port);
        tracing::info!("Starting: {}", invocation);

        let child = self
            .runner
            .spawn_detached(&invocation, &log_path)
            .map_err(|source| SessionError::Spawn { port, source })?;
        let pid = child.id();

        tokio::time::sleep(self.grace).await;
        self.ensure_alive(child, port)?;

        tracing::info!("Tunnel on port {} running as pid {}", port, pid);
        Ok(StartedTunnel {
            pid,
            port,
            url: self.target.url(port),
            log_path,
        })
    }

    fn ensure_alive(&self, mut child: Child, port: u16) -> Result<(), SessionError> {
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                tracing::error!("Tunnel on port {} exited with {}", port, status);
                let log_tail = logs::tail(&self.target.log_path(port), CRASH_TAIL_LINES)
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                Err(SessionError::Crashed { port, log_tail })
            }
            Err(source) => Err(SessionError::Spawn { port, source }),
        }
    }

    /// Running tunnels to this target
    pub fn sessions(&self) -> Vec<TunnelSession> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|entry| self.target.matches(entry))
            .map(|entry| TunnelSession {
                pid: entry.pid,
                port: infer_port(&entry.args),
            })
            .collect()
    }

    /// Terminate every tunnel to this target; returns how many were signalled
    pub fn stop(&self) -> usize {
        let mut stopped = 0;
        for session in self.sessions() {
            match self.table.terminate(session.pid) {
                Ok(true) => {
                    tracing::info!("Stopped tunnel pid {}", session.pid);
                    stopped += 1;
                }
                Ok(false) => tracing::debug!("Tunnel pid {} already exited", session.pid),
                Err(e) => tracing::warn!("Failed to stop tunnel pid {}: {}", session.pid, e),
            }
        }
        stopped
    }

    pub async fn restart(&self, port: u16, conflict: ConflictPolicy) -> Result<StartedTunnel, SessionError> {
        let stopped = self.stop();
        tracing::debug!("Stopped {} tunnel(s) before restart", stopped);
        tokio::time::sleep(self.restart_pause).await;
        self.start(port, conflict).await
    }

    /// Start one tunnel per port; occupied or failing ports are skipped
    pub async fn multiple(&self, ports: &[u16]) -> Result<BatchReport, SessionError> {
        self.check_prerequisites().await?;

        let mut report = BatchReport::default();
        for &port in ports {
            if !self.port_available(port) {
                tracing::warn!("Port {} is already in use, skipping", port);
                report.skipped.push((port, "port in use".to_string()));
                continue;
            }
            match self.launch(port).await {
                Ok(started) => report.started.push(started),
                Err(e) => {
                    tracing::warn!("Port {}: {}", port, e);
                    report.skipped.push((port, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Open the tunnel URL, starting the tunnel first if none is on `port`
    pub async fn browser(&self, port: u16, conflict: ConflictPolicy) -> Result<String, SessionError> {
        let running = self.sessions().iter().any(|s| s.port == Some(port));
        if !running {
            self.start(port, conflict).await?;
        }

        let url = self.target.url(port);
        run_checked(&self.runner, &opener(&url)).await?;
        Ok(url)
    }
}

/// Platform command that opens `url` in the default browser
pub fn opener(url: &str) -> Invocation {
    if cfg!(target_os = "macos") {
        Invocation::new("open", [url])
    } else if cfg!(windows) {
        Invocation::new("cmd", ["/C", "start", url])
    } else {
        Invocation::new("xdg-open", [url])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_core::exec::testing::ScriptedRunner;
    use kg_core::process::ProcessEntry;
    use kg_core::CommandOutput;
    use std::io;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeTable {
        entries: Vec<ProcessEntry>,
        terminated: Mutex<Vec<u32>>,
    }

    impl ProcessTable for FakeTable {
        fn snapshot(&self) -> Vec<ProcessEntry> {
            self.entries.clone()
        }

        fn terminate(&self, pid: u32) -> io::Result<bool> {
            self.terminated.lock().unwrap().push(pid);
            // 99 plays a process that exited between snapshot and signal
            Ok(pid != 99)
        }
    }

    fn target(dir: &TempDir) -> TunnelTarget {
        TunnelTarget {
            log_dir: dir.path().to_path_buf(),
            ..TunnelTarget::default()
        }
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_missing_service_fails_before_spawn() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on(
            &["get", "service"],
            CommandOutput::failed("Error from server (NotFound): services \"gateway\" not found"),
        );
        let manager = SessionManager::new(runner, FakeTable::default(), target(&dir));

        let port = free_port();
        let err = manager.start(port, ConflictPolicy::Abort).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::Precondition(PreconditionError::ServiceNotFound { .. })
        ));
        assert!(!manager.target().log_path(port).exists());
        assert_eq!(manager.runner().count(&["port-forward"]), 0);
    }

    #[tokio::test]
    async fn test_prerequisites_checked_in_order() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(
            ScriptedRunner::new().without_tool("kubectl"),
            FakeTable::default(),
            target(&dir),
        );
        assert!(matches!(
            manager.check_prerequisites().await.unwrap_err(),
            PreconditionError::MissingTool { .. }
        ));

        let runner = ScriptedRunner::new()
            .on(&["cluster-info"], CommandOutput::failed("The connection to the server was refused"))
            .on(&["get", "namespace"], CommandOutput::failed("not found"));
        let manager = SessionManager::new(runner, FakeTable::default(), target(&dir));
        assert!(matches!(
            manager.check_prerequisites().await.unwrap_err(),
            PreconditionError::ClusterUnreachable(_)
        ));

        let runner = ScriptedRunner::new().on(&["get", "namespace"], CommandOutput::failed("not found"));
        let manager = SessionManager::new(runner, FakeTable::default(), target(&dir));
        assert!(matches!(
            manager.check_prerequisites().await.unwrap_err(),
            PreconditionError::NamespaceNotFound(ns) if ns == "gateway-system"
        ));
        assert_eq!(
            manager.runner().calls()[0].to_string(),
            "kubectl cluster-info --request-timeout=5s"
        );
    }

    #[tokio::test]
    async fn test_occupied_port_abort() {
        let dir = TempDir::new().unwrap();
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let manager = SessionManager::new(ScriptedRunner::new(), FakeTable::default(), target(&dir));

        let err = manager.start(port, ConflictPolicy::Abort).await.unwrap_err();
        assert!(matches!(err, SessionError::Precondition(PreconditionError::PortInUse(p)) if p == port));
        assert!(manager.table().terminated.lock().unwrap().is_empty());
        assert_eq!(manager.runner().count(&["port-forward"]), 0);
    }

    #[tokio::test]
    async fn test_occupied_port_terminates_owners() {
        let dir = TempDir::new().unwrap();
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let runner = ScriptedRunner::new().on(&["lsof"], CommandOutput::ok("4242\n4243\n"));
        let manager = SessionManager::new(runner, FakeTable::default(), target(&dir));

        // The fake table cannot actually free the port
        let err = manager.start(port, ConflictPolicy::Terminate).await.unwrap_err();
        assert!(matches!(err, SessionError::Precondition(PreconditionError::PortInUse(_))));
        assert_eq!(*manager.table().terminated.lock().unwrap(), vec![4242, 4243]);
    }

    #[tokio::test]
    async fn test_declined_confirmation_leaves_owners() {
        let dir = TempDir::new().unwrap();
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let runner = ScriptedRunner::new().on(&["lsof"], CommandOutput::ok("4242\n"));
        let manager = SessionManager::new(runner, FakeTable::default(), target(&dir));

        let err = manager
            .start(port, ConflictPolicy::Confirm(|_, _| false))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Precondition(PreconditionError::PortInUse(_))));
        assert!(manager.table().terminated.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_reports_pid_and_url() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().spawning("sleep", &["30"]);
        let manager = SessionManager::new(runner, FakeTable::default(), target(&dir))
            .with_grace(Duration::from_millis(100));

        let port = free_port();
        let started = manager.start(port, ConflictPolicy::Abort).await.unwrap();

        assert_eq!(started.port, port);
        assert_eq!(started.url, format!("http://localhost:{}", port));
        assert!(started.log_path.exists());
        assert_eq!(
            manager.runner().calls().last().unwrap().to_string(),
            format!(
                "kubectl port-forward -n gateway-system svc/gateway {}:80 --address 127.0.0.1",
                port
            )
        );
        assert!(kg_core::process::terminate_process(started.pid).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_during_grace_surfaces_log() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().spawning(
            "sh",
            &["-c", "echo 'error: unable to forward port because pod is not running' >&2; exit 1"],
        );
        let manager = SessionManager::new(runner, FakeTable::default(), target(&dir))
            .with_grace(Duration::from_millis(500));

        let err = manager.start(free_port(), ConflictPolicy::Abort).await.unwrap_err();
        match err {
            SessionError::Crashed { log_tail, .. } => {
                assert!(log_tail.contains("pod is not running"));
            }
            other => panic!("expected crash, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_multiple_skips_occupied_port() {
        let dir = TempDir::new().unwrap();
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let occupied = holder.local_addr().unwrap().port();
        let free = free_port();

        let runner = ScriptedRunner::new().spawning("sleep", &["30"]);
        let manager = SessionManager::new(runner, FakeTable::default(), target(&dir))
            .with_grace(Duration::from_millis(100));

        let report = manager.multiple(&[occupied, free]).await.unwrap();

        assert_eq!(report.started.len(), 1);
        assert_eq!(report.started[0].port, free);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, occupied);
        assert_eq!(manager.runner().count(&["port-forward"]), 1);

        for started in &report.started {
            kg_core::process::terminate_process(started.pid).unwrap();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_stops_then_starts() {
        let dir = TempDir::new().unwrap();
        let table = FakeTable {
            entries: vec![ProcessEntry::new(
                10,
                ["kubectl", "port-forward", "-n", "gateway-system", "svc/gateway", "8080:80"],
            )],
            ..FakeTable::default()
        };
        let runner = ScriptedRunner::new().spawning("sleep", &["30"]);
        let manager = SessionManager::new(runner, table, target(&dir))
            .with_grace(Duration::from_millis(100))
            .with_restart_pause(Duration::from_millis(10));

        let started = manager.restart(free_port(), ConflictPolicy::Abort).await.unwrap();

        assert_eq!(*manager.table().terminated.lock().unwrap(), vec![10]);
        assert_eq!(manager.runner().count(&["port-forward"]), 1);
        kg_core::process::terminate_process(started.pid).unwrap();
    }

    #[test]
    fn test_stop_with_no_sessions() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(ScriptedRunner::new(), FakeTable::default(), target(&dir));
        assert_eq!(manager.stop(), 0);
        assert!(manager.sessions().is_empty());
    }

    #[test]
    fn test_stop_and_status_only_touch_matching_tunnels() {
        let dir = TempDir::new().unwrap();
        let table = FakeTable {
            entries: vec![
                ProcessEntry::new(10, ["kubectl", "port-forward", "-n", "gateway-system", "svc/gateway", "8080:80"]),
                ProcessEntry::new(99, ["kubectl", "port-forward", "svc/gateway", "9090:80"]),
                ProcessEntry::new(11, ["kubectl", "port-forward", "svc/postgres", "5432:5432"]),
                ProcessEntry::new(12, ["vim", "svc/gateway"]),
            ],
            ..FakeTable::default()
        };
        let manager = SessionManager::new(ScriptedRunner::new(), table, target(&dir));

        assert_eq!(
            manager.sessions(),
            vec![
                TunnelSession { pid: 10, port: Some(8080) },
                TunnelSession { pid: 99, port: Some(9090) },
            ]
        );

        // pid 99 vanished before the signal and is not counted
        assert_eq!(manager.stop(), 1);
        assert_eq!(*manager.table().terminated.lock().unwrap(), vec![10, 99]);
    }

    #[test]
    fn test_opener_per_platform() {
        let invocation = opener("http://localhost:8080");
        assert_eq!(invocation.args.last().map(String::as_str), Some("http://localhost:8080"));
    }
}
