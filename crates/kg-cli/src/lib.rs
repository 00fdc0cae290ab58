//! kind-gitops CLI
//!
//! Shared command implementations and output helpers for the
//! `kg-provision` and `kg-tunnel` binaries.

pub mod commands;
pub mod output;

/// Initialise tracing from `-v`/`-q`, with `RUST_LOG` taking precedence
pub fn init_logging(quiet: bool, verbose: u8, default_level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => default_level,
        (false, 1) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
