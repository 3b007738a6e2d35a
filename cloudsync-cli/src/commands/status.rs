//! `cloudsync status <account>` — latest sync outcome per resource type.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use cloudsync_core::{
    config, registry,
    types::{AccountId, OutcomeReport, SyncStatus, Vendor},
};
use cloudsync_sync::SyncEngine;

/// Arguments for `cloudsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    pub account: String,

    /// Vendor to report on. Defaults to the registered vendor.
    #[arg(long)]
    pub vendor: Option<Vendor>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let account_id = AccountId::from(self.account.clone());
        let vendor = match self.vendor {
            Some(vendor) => vendor,
            None => {
                registry::load_account_at(&home, &account_id)
                    .with_context(|| format!("account '{}' is not registered", self.account))?
                    .vendor
            }
        };

        let config = config::load_at(&home).context("failed to load engine config")?;
        let rows = SyncEngine::open_at(&home, config)
            .query_status(&account_id, vendor)
            .with_context(|| format!("failed to read sync status for '{}'", self.account))?;

        if self.json {
            print_json(&account_id, vendor, rows)?;
            return Ok(());
        }

        print_table(&account_id, vendor, rows);
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusReportJson {
    account: AccountId,
    vendor: Vendor,
    summary: StatusSummaryJson,
    resources: Vec<OutcomeReport>,
}

#[derive(Serialize)]
struct StatusSummaryJson {
    resources: usize,
    running: usize,
    failed: usize,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "resource")]
    resource: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "finished")]
    finished: String,
    #[tabled(rename = "reason")]
    reason: String,
}

fn count(rows: &[OutcomeReport], status: SyncStatus) -> usize {
    rows.iter().filter(|r| r.res_status == status).count()
}

fn print_json(account: &AccountId, vendor: Vendor, rows: Vec<OutcomeReport>) -> Result<()> {
    let payload = StatusReportJson {
        account: account.clone(),
        vendor,
        summary: StatusSummaryJson {
            resources: rows.len(),
            running: count(&rows, SyncStatus::Running),
            failed: count(&rows, SyncStatus::Failed),
        },
        resources: rows,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(account: &AccountId, vendor: Vendor, rows: Vec<OutcomeReport>) {
    println!(
        "cloudsync v{} | {} ({}) | {} resource types | {} running | {} failed",
        env!("CARGO_PKG_VERSION"),
        account,
        vendor,
        rows.len(),
        count(&rows, SyncStatus::Running),
        count(&rows, SyncStatus::Failed),
    );

    if rows.is_empty() {
        println!("No sync recorded yet.");
        return;
    }

    let now = Utc::now();
    let failed = count(&rows, SyncStatus::Failed);
    let table_rows: Vec<StatusTableRow> = rows
        .into_iter()
        .map(|row| StatusTableRow {
            resource: row.res_name.to_string(),
            status: status_label(row.res_status),
            finished: row
                .res_end_time
                .map(|end| format_age(now, end))
                .unwrap_or_else(|| "-".to_string()),
            reason: row.res_failed_reason,
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");

    if failed > 0 {
        println!("Run 'cloudsync sync {account}' to retry failed resource types.");
    }
}

fn status_label(status: SyncStatus) -> String {
    match status {
        SyncStatus::Pending => "PENDING".bright_black().bold().to_string(),
        SyncStatus::Running => "RUNNING".yellow().bold().to_string(),
        SyncStatus::Succeeded => "SUCCEEDED".green().bold().to_string(),
        SyncStatus::Failed => "FAILED".red().bold().to_string(),
    }
}

pub(crate) fn format_age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
