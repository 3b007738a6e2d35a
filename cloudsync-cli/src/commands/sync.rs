//! `cloudsync sync` and `cloudsync sync-resource`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use cloudsync_core::{
    config, registry,
    types::{Account, AccountId, CloudId, ResourceType, Vendor},
};
use cloudsync_sync::{ConditionalSyncRequest, FullSyncReport, SyncEngine};

use crate::PolicyArg;

/// Arguments for `cloudsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Account to sync (omit when using `--all`).
    pub account: Option<String>,

    /// Sync every registered account.
    #[arg(long, conflicts_with = "account")]
    pub all: bool,

    /// Public reference data policy: auto | always | never.
    #[arg(long = "public", value_name = "POLICY")]
    pub public: Option<PolicyArg>,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home).context("failed to load engine config")?;
        let engine = SyncEngine::open_at(&home, config);
        let policy = self.public.map(Into::into);

        let accounts: Vec<Account> = if self.all {
            registry::list_accounts_at(&home).context("failed to load account registry")?
        } else {
            let id = self
                .account
                .clone()
                .context("provide an account id or use --all")?;
            vec![registry::load_account_at(&home, &AccountId::from(id.clone()))
                .with_context(|| format!("account '{id}' is not registered"))?]
        };

        if accounts.is_empty() {
            println!("No accounts registered. Run `cloudsync account add` first.");
            return Ok(());
        }

        let mut failed = 0usize;
        for account in &accounts {
            match engine.sync_account(account, policy) {
                Ok(report) => print_report(&report),
                Err(err) => {
                    failed += 1;
                    eprintln!("✗ '{}' sync failed: {err}", account.id);
                }
            }
        }

        if failed > 0 {
            bail!("{failed} of {} account sync(s) failed", accounts.len());
        }
        Ok(())
    }
}

fn print_report(report: &FullSyncReport) {
    let totals = report.totals();
    println!(
        "✓ '{}' synced in {}ms ({} created, {} updated, {} deleted)",
        report.account_id, report.elapsed_ms, totals.created, totals.updated, totals.deleted
    );
    for step in &report.steps {
        match step.stats {
            Some(stats) if stats.created + stats.updated + stats.deleted > 0 => println!(
                "  {:<22} +{} ~{} -{}",
                step.resource_type, stats.created, stats.updated, stats.deleted
            ),
            _ => println!("  {:<22} ·", step.resource_type),
        }
    }
}

/// Arguments for `cloudsync sync-resource`.
#[derive(Args, Debug)]
pub struct SyncResourceArgs {
    pub account: String,

    /// Resource type to sync, e.g. `vpc`, `subnet`, `security_group`.
    #[arg(long = "type", short = 't', value_name = "TYPE")]
    pub resource_type: ResourceType,

    /// Vendor of the account. Defaults to the registered vendor.
    #[arg(long)]
    pub vendor: Option<Vendor>,

    /// Region scope (repeatable).
    #[arg(long = "region", value_name = "REGION")]
    pub regions: Vec<String>,

    /// Resource group scope (repeatable, Azure accounts).
    #[arg(long = "resource-group", value_name = "GROUP")]
    pub resource_groups: Vec<String>,

    /// Restrict to these provider ids (repeatable, single scope value only).
    #[arg(long = "cloud-id", value_name = "ID")]
    pub cloud_ids: Vec<String>,

    /// Tag filter `key=value` (repeatable; values for one key are OR-ed).
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    pub tags: Vec<String>,
}

impl SyncResourceArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let vendor = match self.vendor {
            Some(vendor) => vendor,
            None => {
                registry::load_account_at(&home, &AccountId::from(self.account.clone()))
                    .with_context(|| format!("account '{}' is not registered", self.account))?
                    .vendor
            }
        };
        let request = ConditionalSyncRequest {
            regions: self.regions,
            resource_group_names: self.resource_groups,
            cloud_ids: self.cloud_ids.into_iter().map(CloudId::from).collect(),
            tag_filters: parse_tags(&self.tags)?,
        };

        let ack = cloudsync_daemon::request_sync_resource(
            &home,
            &self.account,
            vendor,
            self.resource_type,
            request,
        )
        .with_context(|| {
            format!(
                "failed to start {} sync for '{}'",
                self.resource_type, self.account
            )
        })?;

        let rid = ack.get("rid").and_then(|v| v.as_str()).unwrap_or("-");
        println!(
            "✓ {} sync started for '{}' (rid {rid})",
            self.resource_type, self.account
        );
        println!("Run 'cloudsync status {}' to follow it.", self.account);
        Ok(())
    }
}

fn parse_tags(raw: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
    let mut tags = BTreeMap::<String, Vec<String>>::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid tag filter '{entry}'; expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid tag filter '{entry}'; key is empty");
        }
        tags.entry(key.to_string())
            .or_default()
            .push(value.trim().to_string());
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_group_values_by_key() {
        let tags = parse_tags(&[
            "env=prod".to_string(),
            "env=staging".to_string(),
            "team = infra".to_string(),
        ])
        .unwrap();
        assert_eq!(tags["env"], vec!["prod", "staging"]);
        assert_eq!(tags["team"], vec!["infra"]);
    }

    #[test]
    fn tag_without_separator_is_rejected() {
        assert!(parse_tags(&["env".to_string()]).is_err());
        assert!(parse_tags(&["=prod".to_string()]).is_err());
    }
}
