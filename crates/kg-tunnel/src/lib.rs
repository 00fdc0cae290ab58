//! kg-tunnel: port-forward session manager
//!
//! Starts detached `kubectl port-forward` processes into a cluster service,
//! finds them again by scanning the process table, and tests connectivity
//! through them. No session state is kept on disk apart from one log file
//! per local port.

pub mod logs;
pub mod manager;
pub mod probe;
pub mod target;

pub use manager::{BatchReport, ConflictPolicy, SessionManager, StartedTunnel, TunnelSession};
pub use probe::{probe, ProbeOutcome};
pub use target::TunnelTarget;
