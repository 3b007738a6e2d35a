//! `cloudsync account list|add|remove`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use cloudsync_core::{
    registry,
    types::{AccountId, Vendor},
};

/// Manage registered cloud accounts.
#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    /// List registered accounts.
    List,

    /// Register an account, or rename an existing one.
    Add(AddArgs),

    /// Forget an account registration. Synced records are left in place.
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Account id as known to the provider.
    pub id: String,

    /// Cloud vendor: tcloud | aws | huawei | gcp | azure.
    #[arg(long, short = 'v')]
    pub vendor: Vendor,

    /// Display name. Defaults to the id.
    #[arg(long, short = 'n')]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    pub id: String,
}

pub fn run(cmd: AccountCommand) -> Result<()> {
    match cmd {
        AccountCommand::List => list(),
        AccountCommand::Add(args) => add(args),
        AccountCommand::Remove(args) => remove(args),
    }
}

fn list() -> Result<()> {
    let accounts = registry::list_accounts().context("failed to load account registry")?;

    if accounts.is_empty() {
        println!("No accounts registered.");
        println!("Run: cloudsync account add <id> --vendor <vendor>");
        return Ok(());
    }

    for account in &accounts {
        println!("{} [{}] {}", account.id, account.vendor, account.name);
    }
    Ok(())
}

fn add(args: AddArgs) -> Result<()> {
    let account = registry::register(AccountId::from(args.id.clone()), args.vendor, args.name)
        .with_context(|| format!("failed to register account '{}'", args.id))?;

    println!("✓ Registered '{}' ({})", account.id, account.vendor);
    Ok(())
}

fn remove(args: RemoveArgs) -> Result<()> {
    registry::remove(&AccountId::from(args.id.clone()))
        .with_context(|| format!("failed to remove account '{}'", args.id))?;

    println!("✓ Removed '{}'", args.id);
    Ok(())
}
