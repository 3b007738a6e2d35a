//! cloudsync — cloud account resource synchronization CLI.
//!
//! # Usage
//!
//! ```text
//! cloudsync account add <id> --vendor tcloud|aws|huawei|gcp|azure [--name <name>]
//! cloudsync account list
//! cloudsync account remove <id>
//! cloudsync sync <account> [--public auto|always|never]
//! cloudsync sync --all
//! cloudsync sync-resource <account> --type <resource> [--region r]... [--cloud-id id]... [--tag k=v]...
//! cloudsync status <account> [--json]
//! cloudsync daemon start|stop|status [--json]|logs [--lines n]
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use cloudsync_core::config::PublicResourcePolicy;
use commands::{
    account::AccountCommand,
    daemon::DaemonCommand,
    status::StatusArgs,
    sync::{SyncArgs, SyncResourceArgs},
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "cloudsync",
    version,
    about = "Synchronize cloud account resources into a local inventory",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage registered cloud accounts.
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },

    /// Run a full sync of every resource type for an account.
    Sync(SyncArgs),

    /// Start a scoped sync of one resource type through the daemon.
    SyncResource(SyncResourceArgs),

    /// Show the latest sync outcome per resource type.
    Status(StatusArgs),

    /// Manage the background sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared policy argument
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `PublicResourcePolicy` from CLI args.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyArg(pub PublicResourcePolicy);

impl FromStr for PolicyArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self(PublicResourcePolicy::Auto)),
            "always" => Ok(Self(PublicResourcePolicy::Always)),
            "never" => Ok(Self(PublicResourcePolicy::Never)),
            other => Err(format!(
                "unknown public resource policy '{other}'; expected: auto, always, never"
            )),
        }
    }
}

impl fmt::Display for PolicyArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            PublicResourcePolicy::Auto => "auto",
            PublicResourcePolicy::Always => "always",
            PublicResourcePolicy::Never => "never",
        };
        f.write_str(name)
    }
}

impl From<PolicyArg> for PublicResourcePolicy {
    fn from(p: PolicyArg) -> Self {
        p.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    if !matches!(cli.command, Commands::Daemon { .. }) {
        init_tracing();
    }
    match cli.command {
        Commands::Account { command } => commands::account::run(command),
        Commands::Sync(args) => args.run(),
        Commands::SyncResource(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}

/// Warnings from in-process syncs go to stderr; `RUST_LOG` overrides.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
