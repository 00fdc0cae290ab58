//! kg-tunnel
//!
//! Manages detached `kubectl port-forward` tunnels into a cluster service.
//! Tunnels are found by scanning the process table; the only files written
//! are the per-port logs.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use kg_core::process::SystemProcessTable;
use kg_core::SystemRunner;
use kg_tunnel::logs::DEFAULT_TAIL_LINES;
use kg_tunnel::{SessionManager, TunnelTarget};
use kind_gitops::commands;

#[derive(Parser)]
#[command(name = "kg-tunnel")]
#[command(author, version, about = "Port-forward session manager for the cluster gateway")]
#[command(propagate_version = true)]
struct Cli {
    /// Namespace of the target service
    #[arg(long, global = true, env = "KG_NAMESPACE", default_value = "gateway-system")]
    namespace: String,

    /// Target service name
    #[arg(long, global = true, env = "KG_SERVICE", default_value = "gateway")]
    service: String,

    /// Port on the service side
    #[arg(long, global = true, env = "KG_TARGET_PORT", default_value_t = 80)]
    target_port: u16,

    /// kubeconfig context (current context if unset)
    #[arg(long, global = true, env = "KG_CONTEXT")]
    context: Option<String>,

    /// Local address to bind
    #[arg(long, global = true, env = "KG_ADDRESS", default_value = "127.0.0.1")]
    address: String,

    /// Directory for per-port log files (default: system temp dir)
    #[arg(long, global = true, env = "KG_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a tunnel
    Start {
        /// Local port
        #[arg(env = "KG_PORT", default_value_t = 8080)]
        port: u16,

        /// Terminate whatever holds the port without asking
        #[arg(short, long)]
        force: bool,
    },

    /// Stop every tunnel to the service
    Stop,

    /// List running tunnels to the service
    Status,

    /// Stop, then start again
    Restart {
        #[arg(env = "KG_PORT", default_value_t = 8080)]
        port: u16,

        #[arg(short, long)]
        force: bool,
    },

    /// Check that the gateway answers through the tunnel
    Test {
        #[arg(env = "KG_PORT", default_value_t = 8080)]
        port: u16,
    },

    /// Show the tunnel log for a port
    Logs {
        #[arg(env = "KG_PORT", default_value_t = 8080)]
        port: u16,

        /// Number of lines
        #[arg(long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
    },

    /// Start one tunnel per port, skipping ports already in use
    Multiple {
        #[arg(required = true)]
        ports: Vec<u16>,
    },

    /// Open the tunnel URL in a browser, starting the tunnel if needed
    Browser {
        #[arg(env = "KG_PORT", default_value_t = 8080)]
        port: u16,

        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    fn target(&self) -> TunnelTarget {
        TunnelTarget {
            namespace: self.namespace.clone(),
            service: self.service.clone(),
            target_port: self.target_port,
            address: self.address.clone(),
            context: self.context.clone(),
            log_dir: self.log_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    kind_gitops::init_logging(cli.quiet, cli.verbose, "warn");

    let target = cli.target();
    let manager = SessionManager::new(SystemRunner, SystemProcessTable, target.clone());

    match cli.command {
        Commands::Start { port, force } => commands::start_command(&manager, port, force).await,
        Commands::Stop => commands::stop_command(&manager),
        Commands::Status => commands::status_command(&manager),
        Commands::Restart { port, force } => commands::restart_command(&manager, port, force).await,
        Commands::Test { port } => commands::test_command(port).await,
        Commands::Logs { port, lines } => commands::logs_command(&target, port, lines),
        Commands::Multiple { ports } => commands::multiple_command(&manager, &ports).await,
        Commands::Browser { port, force } => commands::browser_command(&manager, port, force).await,
    }
}
