//! Account registry error-message, atomic-write-safety, and register integration tests.
//! Storage: ~/.cloudsync/accounts/<account_id>.yaml

use assert_fs::prelude::*;
use chrono::Utc;
use cloudsync_core::{
    registry,
    types::{Account, AccountId, Vendor},
    RegistryError,
};
use predicates::prelude::predicate;
use rstest::rstest;
use std::fs;

fn acct() -> AccountId { AccountId::from("acct-1") }

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_account_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = registry::load_account_at(home.path(), &acct()).unwrap_err();
    assert!(matches!(err, RegistryError::AccountNotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("account not found"));
    assert!(err.to_string().contains("acct-1.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.path().join(".cloudsync").join("accounts");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("acct-1.yaml"), b": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = registry::load_account_at(home.path(), &acct()).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("acct-1.yaml"), "must contain file path, got: {err}");
}

#[test]
fn load_unknown_vendor_returns_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.path().join(".cloudsync").join("accounts");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(
        dir.join("acct-1.yaml"),
        "id: acct-1\nvendor: openstack\ncreated_at: 2024-01-01T00:00:00Z\nupdated_at: 2024-01-01T00:00:00Z\n",
    )
    .expect("write");

    let err = registry::load_account_at(home.path(), &acct()).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn mid_write_crash_leaves_original_intact() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let now = Utc::now();
    let account = Account {
        id: acct(),
        vendor: Vendor::Aws,
        name: "prod".to_string(),
        created_at: now,
        updated_at: now,
    };
    registry::save_account_at(home.path(), &account).expect("save");

    let yaml_path = registry::account_path_at(home.path(), &acct());
    let original_bytes = fs::read(&yaml_path).expect("read original");

    // Simulate crash: .tmp written but process died before rename
    let tmp = yaml_path.with_file_name("acct-1.yaml.tmp");
    fs::write(&tmp, b"CRASH - INCOMPLETE WRITE").expect("write crash tmp");

    let current_bytes = fs::read(&yaml_path).expect("read after crash");
    assert_eq!(original_bytes, current_bytes, "original must be unchanged after crash");

    // The orphaned .tmp is not mistaken for an account.
    let list = registry::list_accounts_at(home.path()).expect("list");
    assert_eq!(list.len(), 1);
}

// ---------------------------------------------------------------------------
// 3. Register integration
// ---------------------------------------------------------------------------

#[rstest]
#[case::tcloud(Vendor::TCloud, "vendor: tcloud")]
#[case::aws(Vendor::Aws, "vendor: aws")]
#[case::huawei(Vendor::HuaWei, "vendor: huawei")]
#[case::gcp(Vendor::Gcp, "vendor: gcp")]
#[case::azure(Vendor::Azure, "vendor: azure")]
fn register_writes_vendor_in_lowercase(#[case] vendor: Vendor, #[case] expected: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    registry::register_at(home.path(), acct(), vendor, None).expect("register");

    home.child(".cloudsync/accounts/acct-1.yaml")
        .assert(predicate::path::exists())
        .assert(predicate::str::contains(expected));
}

#[test]
fn register_file_has_owner_only_mode() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    registry::register_at(home.path(), acct(), Vendor::Aws, None).expect("register");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = registry::account_path_at(home.path(), &acct());
        let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "expected 0600, got {mode:o}");
    }
}

#[test]
fn register_updates_name_but_keeps_vendor() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    registry::register_at(home.path(), acct(), Vendor::Azure, Some("old".into())).expect("first");
    let updated = registry::register_at(home.path(), acct(), Vendor::Azure, Some("new".into()))
        .expect("second");
    assert_eq!(updated.name, "new");
    assert_eq!(updated.vendor, Vendor::Azure);
}

#[test]
fn list_is_sorted_and_deterministic() {
    let home = assert_fs::TempDir::new().expect("tempdir");

    // Register beta before alpha intentionally
    registry::register_at(home.path(), AccountId::from("beta"), Vendor::Gcp, None).expect("beta");
    registry::register_at(home.path(), AccountId::from("alpha"), Vendor::Aws, None).expect("alpha");

    let list = registry::list_accounts_at(home.path()).expect("list");
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, AccountId::from("alpha"));
    assert_eq!(list[1].id, AccountId::from("beta"));
}
