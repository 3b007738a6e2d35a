use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use cloudsync_core::types::{CloudResource, ResourceType};
use cloudsync_sync::cloud::{cloud_dir_at, CloudSnapshot};

fn cloudsync(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cloudsync").expect("cloudsync binary");
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

fn write_inventory(home: &Path, account: &str) {
    let snapshot = CloudSnapshot {
        resources: vec![
            CloudResource::new(ResourceType::Region, "ap-guangzhou"),
            CloudResource::new(ResourceType::Zone, "ap-guangzhou-3").in_region("ap-guangzhou"),
            CloudResource::new(ResourceType::Vpc, "vpc-1").in_region("ap-guangzhou"),
            CloudResource::new(ResourceType::Subnet, "subnet-1")
                .in_region("ap-guangzhou")
                .with_parent("vpc-1"),
        ],
        ..CloudSnapshot::default()
    };
    let dir = cloud_dir_at(home);
    std::fs::create_dir_all(&dir).expect("cloud dir");
    std::fs::write(
        dir.join(format!("{account}.yaml")),
        serde_yaml::to_string(&snapshot).expect("encode inventory"),
    )
    .expect("write inventory");
}

#[test]
fn account_add_list_remove() {
    let home = TempDir::new().unwrap();

    cloudsync(home.path())
        .args(["account", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No accounts registered."));

    cloudsync(home.path())
        .args(["account", "add", "acct-1", "--vendor", "tcloud", "--name", "prod"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered 'acct-1' (tcloud)"));

    cloudsync(home.path())
        .args(["account", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("acct-1 [tcloud] prod"));

    cloudsync(home.path())
        .args(["account", "add", "acct-1", "--vendor", "aws"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot re-register as aws"));

    cloudsync(home.path())
        .args(["account", "remove", "acct-1"])
        .assert()
        .success();

    cloudsync(home.path())
        .args(["account", "remove", "acct-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("account not found"));
}

#[test]
fn sync_then_status_reports_every_step() {
    let home = TempDir::new().unwrap();
    cloudsync(home.path())
        .args(["account", "add", "acct-1", "--vendor", "tcloud"])
        .assert()
        .success();
    write_inventory(home.path(), "acct-1");

    cloudsync(home.path())
        .args(["sync", "acct-1", "--public", "always"])
        .assert()
        .success()
        .stdout(predicate::str::contains("'acct-1' synced"))
        .stdout(predicate::str::contains("4 created"));

    let output = cloudsync(home.path())
        .args(["status", "acct-1", "--json"])
        .output()
        .expect("run status");
    assert!(output.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status JSON");
    assert_eq!(payload["account"], "acct-1");
    assert_eq!(payload["summary"]["failed"], 0);
    let resources = payload["resources"].as_array().expect("resources");
    assert!(!resources.is_empty());
    assert!(resources.iter().all(|r| r["res_status"] == "succeeded"));
    assert!(resources.iter().any(|r| r["res_name"] == "subnet"));
}

#[test]
fn sync_without_inventory_fails_and_records_nothing() {
    let home = TempDir::new().unwrap();
    cloudsync(home.path())
        .args(["account", "add", "acct-1", "--vendor", "aws"])
        .assert()
        .success();

    cloudsync(home.path())
        .args(["sync", "acct-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no cloud inventory configured"));

    cloudsync(home.path())
        .args(["status", "acct-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No sync recorded yet."));
}

#[test]
fn sync_unknown_account_fails() {
    let home = TempDir::new().unwrap();
    cloudsync(home.path())
        .args(["sync", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("account 'ghost' is not registered"));
}

#[test]
fn sync_resource_needs_running_daemon() {
    let home = TempDir::new().unwrap();
    cloudsync(home.path())
        .args([
            "sync-resource", "acct-1", "--vendor", "tcloud", "--type", "vpc", "--region", "r1",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("daemon is not running"));
}

#[test]
fn sync_resource_rejects_malformed_tag() {
    let home = TempDir::new().unwrap();
    cloudsync(home.path())
        .args([
            "sync-resource", "acct-1", "--vendor", "tcloud", "--type", "vpc", "--region", "r1",
            "--tag", "env",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn daemon_status_without_daemon_reports_stopped() {
    let home = TempDir::new().expect("home");
    cloudsync(home.path())
        .env("NO_COLOR", "1")
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon is not running"))
        .stdout(predicate::str::contains("daemon.sock"));
}
