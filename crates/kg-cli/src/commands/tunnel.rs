//! Tunnel command implementations

use std::io::Write;

use anyhow::Result;

use kg_core::process::ProcessTable;
use kg_core::CommandRunner;
use kg_tunnel::{logs, probe, ConflictPolicy, SessionManager, StartedTunnel, TunnelTarget};

use crate::output::{format_sessions, print_error, print_info, print_success, print_warning};

/// Ask on the terminal before terminating whatever holds `port`
pub fn prompt_terminate(port: u16, pids: &[u32]) -> bool {
    print_warning(&format!(
        "Port {} is held by process(es) {}",
        port,
        pids.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
    ));
    print!("Terminate them? [y/N] ");
    if std::io::stdout().flush().is_err() {
        return false;
    }

    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case("y")
}

/// `--force` terminates port owners without asking
pub fn conflict_policy(force: bool) -> ConflictPolicy {
    if force {
        ConflictPolicy::Terminate
    } else {
        ConflictPolicy::Confirm(prompt_terminate)
    }
}

fn report_started(started: &StartedTunnel) {
    print_success(&format!(
        "Tunnel running on {} (pid {})",
        started.url, started.pid
    ));
    print_info(&format!("Logs: {}", started.log_path.display()));
}

pub async fn start_command<R: CommandRunner, P: ProcessTable>(
    manager: &SessionManager<R, P>,
    port: u16,
    force: bool,
) -> Result<()> {
    let target = manager.target();
    print_info(&format!(
        "Forwarding localhost:{} to {}/{}:{}",
        port, target.namespace, target.service, target.target_port
    ));

    match manager.start(port, conflict_policy(force)).await {
        Ok(started) => {
            report_started(&started);
            Ok(())
        }
        Err(e) => {
            print_error(&format!("Failed to start tunnel: {}", e));
            Err(e.into())
        }
    }
}

/// Suggested next step when there is no tunnel to act on
pub fn start_hint(port: Option<u16>) -> String {
    match port {
        Some(port) => format!("start one with `kg-tunnel start {}`", port),
        None => "start one with `kg-tunnel start <port>`".to_string(),
    }
}

fn no_tunnels(target: &TunnelTarget) -> String {
    format!(
        "No tunnels to svc/{} running; {}",
        target.service,
        start_hint(None)
    )
}

pub fn stop_command<R: CommandRunner, P: ProcessTable>(manager: &SessionManager<R, P>) -> Result<()> {
    match manager.stop() {
        0 => print_warning(&no_tunnels(manager.target())),
        n => print_success(&format!("Stopped {} tunnel(s)", n)),
    }
    Ok(())
}

pub fn status_command<R: CommandRunner, P: ProcessTable>(manager: &SessionManager<R, P>) -> Result<()> {
    let sessions = manager.sessions();
    let target = manager.target();
    if sessions.is_empty() {
        print_warning(&no_tunnels(target));
        return Ok(());
    }
    println!("{}", format_sessions(&sessions, |port| target.url(port)));
    Ok(())
}

pub async fn restart_command<R: CommandRunner, P: ProcessTable>(
    manager: &SessionManager<R, P>,
    port: u16,
    force: bool,
) -> Result<()> {
    print_info(&format!("Restarting tunnel on port {}", port));
    match manager.restart(port, conflict_policy(force)).await {
        Ok(started) => {
            report_started(&started);
            Ok(())
        }
        Err(e) => {
            print_error(&format!("Failed to restart tunnel: {}", e));
            Err(e.into())
        }
    }
}

/// Start one tunnel per port; occupied ports are reported, not fatal
pub async fn multiple_command<R: CommandRunner, P: ProcessTable>(
    manager: &SessionManager<R, P>,
    ports: &[u16],
) -> Result<()> {
    let report = manager.multiple(ports).await?;

    for started in &report.started {
        report_started(started);
    }
    for (port, reason) in &report.skipped {
        print_warning(&format!("Skipped port {}: {}", port, reason));
    }
    print_info(&format!(
        "{} started, {} skipped",
        report.started.len(),
        report.skipped.len()
    ));
    Ok(())
}

/// Exits non-zero unless the application answered
pub async fn test_command(port: u16) -> Result<()> {
    print_info(&format!("Testing http://localhost:{}/", port));
    match probe(port).await.into_result(port) {
        Ok(body) => {
            print_success(&format!("Gateway on localhost:{} responded", port));
            println!("{}", first_lines(&body, 20));
            Ok(())
        }
        Err(e) => {
            print_error(&e.to_string());
            Err(e.into())
        }
    }
}

pub fn logs_command(target: &TunnelTarget, port: u16, lines: usize) -> Result<()> {
    let path = target.log_path(port);
    match logs::tail(&path, lines)? {
        Some(content) => println!("{}", content),
        None => print_warning(&format!("No logs for port {}; {}", port, start_hint(Some(port)))),
    }
    Ok(())
}

pub async fn browser_command<R: CommandRunner, P: ProcessTable>(
    manager: &SessionManager<R, P>,
    port: u16,
    force: bool,
) -> Result<()> {
    let url = manager.browser(port, conflict_policy(force)).await?;
    print_success(&format!("Opened {}", url));
    Ok(())
}

fn first_lines(body: &str, max: usize) -> String {
    let mut lines: Vec<&str> = body.lines().take(max + 1).collect();
    if lines.len() > max {
        lines.truncate(max);
        lines.push("...");
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_skips_prompt() {
        assert!(matches!(conflict_policy(true), ConflictPolicy::Terminate));
        assert!(matches!(conflict_policy(false), ConflictPolicy::Confirm(_)));
    }

    #[test]
    fn test_start_hint() {
        assert_eq!(start_hint(Some(8081)), "start one with `kg-tunnel start 8081`");
        assert_eq!(start_hint(None), "start one with `kg-tunnel start <port>`");

        let message = no_tunnels(&TunnelTarget::default());
        assert!(message.starts_with("No tunnels to svc/gateway running"));
        assert!(message.ends_with("`kg-tunnel start <port>`"));
    }

    #[test]
    fn test_first_lines() {
        assert_eq!(first_lines("a\nb", 5), "a\nb");
        assert_eq!(first_lines("a\nb\nc\nd", 2), "a\nb\n...");
    }
}
