//! kg-provision
//!
//! Creates a fresh kind cluster and optionally bootstraps Flux against it:
//! - no mode flag: cluster only
//! - `--admin`: `flux bootstrap github` with a write-capable deploy key
//! - `--read-only`: controllers plus a public GitRepository/Kustomization
//! - `--destroy`: delete the cluster and its hosts entries

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgGroup, Parser};

use kg_core::config;
use kind_gitops::commands::{self, ModeSelection, Overrides};

#[derive(Parser)]
#[command(name = "kg-provision")]
#[command(author, version, about = "Provision an ephemeral kind cluster with Flux GitOps")]
#[command(group(ArgGroup::new("mode").args(["admin", "read_only", "destroy"])))]
struct Cli {
    /// Bootstrap Flux with write access to the repository (needs GITHUB_TOKEN)
    #[arg(long)]
    admin: bool,

    /// Install Flux and sync from the public repository URL, no credentials
    #[arg(long)]
    read_only: bool,

    /// Delete the cluster and its hosts entries
    #[arg(long)]
    destroy: bool,

    /// Path to configuration file
    #[arg(short, long, env = "KG_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster name
    #[arg(long, env = "KG_CLUSTER_NAME")]
    name: Option<String>,

    /// kind configuration file
    #[arg(long, env = "KG_KIND_CONFIG")]
    kind_config: Option<PathBuf>,

    /// Repository owner
    #[arg(long, env = "KG_REPO_OWNER")]
    owner: Option<String>,

    /// Repository name
    #[arg(long, env = "KG_REPO_NAME")]
    repository: Option<String>,

    /// Branch to sync
    #[arg(long, env = "KG_BRANCH")]
    branch: Option<String>,

    /// Path inside the repository to sync (default ./clusters/<name>)
    #[arg(long, env = "KG_SYNC_PATH")]
    path: Option<String>,

    /// Write the default config file and exit
    #[arg(long, conflicts_with_all = ["mode", "show_config"])]
    init_config: bool,

    /// Overwrite an existing file with --init-config
    #[arg(long, requires = "init_config")]
    force: bool,

    /// Print the effective configuration and exit
    #[arg(long, conflicts_with = "mode")]
    show_config: bool,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            name: self.name.clone(),
            kind_config: self.kind_config.clone(),
            owner: self.owner.clone(),
            repository: self.repository.clone(),
            branch: self.branch.clone(),
            path: self.path.clone(),
        }
    }

    fn mode_selection(&self) -> ModeSelection {
        if self.admin {
            ModeSelection::Admin
        } else if self.read_only {
            ModeSelection::ReadOnly
        } else {
            ModeSelection::None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    kind_gitops::init_logging(cli.quiet, cli.verbose, "info");

    if cli.init_config {
        let path = cli.config.clone().unwrap_or_else(config::default_config_path);
        return commands::config_init(&path, cli.force);
    }

    let mut config = config::load_or_default(cli.config.as_deref())?;
    cli.overrides().apply(&mut config);
    tracing::debug!("Effective config: {:?}", config);

    if cli.show_config {
        return commands::config_show(&config);
    }

    if cli.destroy {
        return commands::destroy_command(config).await;
    }

    // Repository parameters are validated before anything is touched
    let mode = commands::resolve_mode(cli.mode_selection(), &config)?;
    commands::provision_command(config, mode).await
}
