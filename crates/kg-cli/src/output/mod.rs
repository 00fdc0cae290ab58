//! Output formatting utilities for the CLI
//!
//! Tables for the provisioning run report and the tunnel list, and coloured
//! one-line status messages.

use std::time::Duration;

use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use kg_provisioner::{RunReport, StepOutcome};
use kg_tunnel::TunnelSession;

/// Format the per-step outcome of a provisioning run
///
/// Warnings are truncated in the table; the full text is printed
/// separately by the caller.
pub fn format_run_report(report: &RunReport) -> String {
    if report.records.is_empty() {
        return "No steps were run".to_string();
    }

    #[derive(Tabled)]
    struct StepRow {
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "STEP")]
        step: String,
        #[tabled(rename = "POLICY")]
        policy: String,
        #[tabled(rename = "RESULT")]
        result: String,
        #[tabled(rename = "TIME")]
        elapsed: String,
    }

    let rows: Vec<StepRow> = report
        .records
        .iter()
        .enumerate()
        .map(|(i, record)| StepRow {
            index: i + 1,
            step: record.step.kind.to_string(),
            policy: record.step.policy.to_string(),
            result: match &record.outcome {
                StepOutcome::Succeeded => "ok".to_string(),
                StepOutcome::Warned(message) => format!("warning: {}", truncate(message, 60)),
                StepOutcome::Failed(message) => format!("failed: {}", truncate(message, 60)),
            },
            elapsed: format_duration(record.elapsed),
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(110))
        .to_string()
}

/// Format running tunnels as a table
pub fn format_sessions(sessions: &[TunnelSession], url: impl Fn(u16) -> String) -> String {
    if sessions.is_empty() {
        return "No tunnels running".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "PID")]
        pid: u32,
        #[tabled(rename = "PORT")]
        port: String,
        #[tabled(rename = "URL")]
        url: String,
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|s| SessionRow {
            pid: s.pid,
            port: s.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            url: s.port.map(&url).unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format duration in human-readable form
fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs == 0 {
        format!("{}ms", elapsed.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max_len && first_line.len() == s.len() {
        return s.to_string();
    }
    let kept: String = first_line.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Goes to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
