//! `cloudsync daemon` — run the sync daemon and inspect it.

use std::collections::VecDeque;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use cloudsync_core::types::{AccountId, Vendor};
use cloudsync_daemon::paths::{log_path, socket_path};
use cloudsync_daemon::{request_status, request_stop, start_blocking, DaemonError};

use super::status::format_age;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground: socket server plus periodic full syncs.
    Start,
    /// Ask a running daemon to shut down.
    Stop,
    /// Show daemon uptime and when each account last synced.
    Status(DaemonStatusArgs),
    /// Print the tail of the daemon log.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStatusArgs {
    /// Emit the raw status payload as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        DaemonCommand::Start => start_blocking(&home).context("daemon exited with error"),
        DaemonCommand::Stop => stop(&home),
        DaemonCommand::Status(args) => status(&home, args.json),
        DaemonCommand::Logs(args) => logs(&log_path(&home), args.lines),
    }
}

fn stop(home: &Path) -> Result<()> {
    match request_stop(home) {
        Ok(()) => println!("{} shutdown requested", "daemon".bold()),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

/// Status payload as served by the daemon's `status` command.
#[derive(Debug, Deserialize)]
struct DaemonStatus {
    running: bool,
    #[serde(default)]
    started_at_unix: i64,
    #[serde(default)]
    last_sync_at_unix: i64,
    #[serde(default)]
    full_sync_interval_secs: u64,
    #[serde(default)]
    accounts: Vec<AccountSyncRow>,
    socket: String,
}

#[derive(Debug, Deserialize)]
struct AccountSyncRow {
    id: AccountId,
    vendor: Vendor,
    #[serde(default)]
    last_sync_at_unix: i64,
}

#[derive(Tabled)]
struct AccountTableRow {
    #[tabled(rename = "account")]
    account: String,
    #[tabled(rename = "vendor")]
    vendor: String,
    #[tabled(rename = "last full sync")]
    last_sync: String,
    #[tabled(rename = "next due")]
    next_due: String,
}

fn status(home: &Path, json: bool) -> Result<()> {
    let payload = match request_status(home) {
        Ok(payload) => payload,
        Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
            "running": false,
            "socket": socket_path(home).display().to_string(),
        }),
        Err(err) => return Err(err).context("failed to query daemon status"),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to render daemon status JSON")?
        );
        return Ok(());
    }
    print!("{}", render_status(&payload, Utc::now())?);
    Ok(())
}

fn render_status(payload: &Value, now: DateTime<Utc>) -> Result<String> {
    let status: DaemonStatus =
        serde_json::from_value(payload.clone()).context("unexpected daemon status payload")?;

    if !status.running {
        return Ok(format!(
            "{} daemon is not running (socket {})\n",
            "STOPPED".red().bold(),
            status.socket
        ));
    }

    let mut out = format!(
        "{} up {} | full sync every {} | last full sync {} | {} accounts\n",
        "RUNNING".green().bold(),
        since(now, status.started_at_unix).trim_end_matches(" ago"),
        format_interval(status.full_sync_interval_secs),
        since(now, status.last_sync_at_unix),
        status.accounts.len(),
    );

    if status.accounts.is_empty() {
        out.push_str("No accounts registered.\n");
        return Ok(out);
    }

    let rows: Vec<AccountTableRow> = status
        .accounts
        .iter()
        .map(|row| AccountTableRow {
            account: row.id.to_string(),
            vendor: row.vendor.to_string(),
            last_sync: since(now, row.last_sync_at_unix),
            next_due: next_due(now, row.last_sync_at_unix, status.full_sync_interval_secs),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    out.push_str(&format!("{table}\n"));
    Ok(out)
}

/// Age of a unix timestamp, or `never` for the zero the daemon reports
/// before the first sync.
fn since(now: DateTime<Utc>, unix: i64) -> String {
    match Utc.timestamp_opt(unix, 0).single() {
        Some(then) if unix > 0 => format_age(now, then),
        _ => "never".to_string(),
    }
}

fn next_due(now: DateTime<Utc>, last_unix: i64, interval_secs: u64) -> String {
    if last_unix <= 0 {
        return "next tick".yellow().to_string();
    }
    let interval = i64::try_from(interval_secs).unwrap_or(i64::MAX);
    let remaining = last_unix.saturating_add(interval) - now.timestamp();
    if remaining <= 0 {
        "overdue".red().to_string()
    } else {
        format!("in {}", format_interval(remaining.unsigned_abs()))
    }
}

fn format_interval(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        _ if secs % 3600 == 0 || secs >= 86_400 => format!("{}h", secs / 3600),
        _ => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
    }
}

fn logs(path: &Path, lines: usize) -> Result<()> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("no daemon log yet at {}", path.display());
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let tail = tail_lines(std::io::BufReader::new(file), lines)
        .with_context(|| format!("read {}", path.display()))?;

    println!("{}", format!("==> {} <==", path.display()).bright_black());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}

fn tail_lines(reader: impl BufRead, keep: usize) -> std::io::Result<VecDeque<String>> {
    let mut tail = VecDeque::with_capacity(keep);
    for line in reader.lines() {
        let line = line?;
        if keep == 0 {
            continue;
        }
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn running_status_lists_each_account_with_its_last_sync() {
        plain();
        let now = Utc::now();
        let t = now.timestamp();
        let payload = json!({
            "running": true,
            "label": "cloudsync",
            "started_at_unix": t - 7200,
            "last_sync_at_unix": t - 120,
            "full_sync_interval_secs": 3600,
            "accounts": [
                {"id": "acct-1", "vendor": "tcloud", "last_sync_at_unix": t - 120},
                {"id": "acct-2", "vendor": "azure", "last_sync_at_unix": 0},
            ],
            "socket": "/tmp/daemon.sock",
        });

        let out = render_status(&payload, now).expect("render");
        let header = out.lines().next().expect("header");
        assert_eq!(
            header,
            "RUNNING up 2h | full sync every 1h | last full sync 2m ago | 2 accounts"
        );
        let acct1 = out.lines().find(|l| l.contains("acct-1")).expect("acct-1 row");
        assert!(acct1.contains("2m ago") && acct1.contains("in 58m"), "{acct1}");
        let acct2 = out.lines().find(|l| l.contains("acct-2")).expect("acct-2 row");
        assert!(acct2.contains("never") && acct2.contains("next tick"), "{acct2}");
    }

    #[test]
    fn stopped_status_names_the_socket() {
        plain();
        let payload = json!({"running": false, "socket": "/home/u/.cloudsync/run/daemon.sock"});
        let out = render_status(&payload, Utc::now()).expect("render");
        assert_eq!(
            out,
            "STOPPED daemon is not running (socket /home/u/.cloudsync/run/daemon.sock)\n"
        );
    }

    #[test]
    fn overdue_account_is_flagged() {
        plain();
        let now = Utc::now();
        assert_eq!(next_due(now, now.timestamp() - 4000, 3600), "overdue");
    }

    #[test]
    fn interval_formatting() {
        assert_eq!(format_interval(45), "45s");
        assert_eq!(format_interval(600), "10m");
        assert_eq!(format_interval(7200), "2h");
        assert_eq!(format_interval(5400), "1h30m");
    }

    #[test]
    fn tail_keeps_the_last_lines() {
        let input = "a\nb\nc\nd\n".as_bytes();
        let tail = tail_lines(input, 2).expect("tail");
        assert_eq!(tail, ["c", "d"]);
        assert!(tail_lines("a\n".as_bytes(), 0).expect("tail").is_empty());
    }
}
