//! Per-account YAML registry.
//!
//! # Storage layout
//!
//! ```text
//! ~/.cloudsync/
//!   accounts/
//!     <account_id>.yaml   (one file per account — mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::RegistryError;
use crate::types::{Account, AccountId, Vendor};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.cloudsync/`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".cloudsync")
}

/// `<home>/.cloudsync/accounts/`
///
/// Creates the directory (mode `0700`) if it does not yet exist.
pub fn accounts_dir_at(home: &Path) -> Result<PathBuf, RegistryError> {
    let dir = root_at(home).join("accounts");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

/// `<home>/.cloudsync/accounts/<account>.yaml` — pure, no I/O.
pub fn account_path_at(home: &Path, account: &AccountId) -> PathBuf {
    root_at(home)
        .join("accounts")
        .join(format!("{}.yaml", account.0))
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load a single account from `<home>/.cloudsync/accounts/<account>.yaml`.
///
/// Returns `RegistryError::AccountNotFound` if absent,
/// `RegistryError::Parse` (with path + line context) if malformed YAML.
pub fn load_account_at(home: &Path, account: &AccountId) -> Result<Account, RegistryError> {
    let path = account_path_at(home, account);
    if !path.exists() {
        return Err(RegistryError::AccountNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })
}

/// `load_account_at` convenience wrapper.
pub fn load_account(account: &AccountId) -> Result<Account, RegistryError> {
    load_account_at(&home()?, account)
}

/// Walk `<home>/.cloudsync/accounts/*.yaml` and return every account, sorted by id.
pub fn list_accounts_at(home: &Path) -> Result<Vec<Account>, RegistryError> {
    let dir = root_at(home).join("accounts");
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut result = Vec::new();
    for entry in entries {
        let fname = entry.file_name();
        if !fname.to_string_lossy().ends_with(".yaml") {
            continue;
        }
        let contents = std::fs::read_to_string(entry.path())?;
        let account: Account = serde_yaml::from_str(&contents).map_err(|e| {
            RegistryError::Parse { path: entry.path(), source: e }
        })?;
        result.push(account);
    }
    result.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(result)
}

/// `list_accounts_at` convenience wrapper.
pub fn list_accounts() -> Result<Vec<Account>, RegistryError> {
    list_accounts_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save an account to `<home>/.cloudsync/accounts/<account>.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_account_at(home: &Path, account: &Account) -> Result<(), RegistryError> {
    accounts_dir_at(home)?;
    let path = account_path_at(home, &account.id);
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", account.id.0));

    let yaml = serde_yaml::to_string(account)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_account_at` convenience wrapper.
pub fn save_account(account: &Account) -> Result<(), RegistryError> {
    save_account_at(&home()?, account)
}

// ---------------------------------------------------------------------------
// 4. Register / remove
// ---------------------------------------------------------------------------

/// Register `account` with `vendor`.
///
/// Idempotent: an existing registration with the same vendor is returned
/// unchanged (the display name is updated when a new non-empty one is given).
/// Re-registering under a different vendor is rejected.
pub fn register_at(
    home: &Path,
    account: AccountId,
    vendor: Vendor,
    name: Option<String>,
) -> Result<Account, RegistryError> {
    let path = account_path_at(home, &account);
    if path.exists() {
        let mut existing = load_account_at(home, &account)?;
        if existing.vendor != vendor {
            return Err(RegistryError::VendorChange {
                account,
                existing: existing.vendor,
                requested: vendor,
            });
        }
        if let Some(name) = name.filter(|n| !n.is_empty() && *n != existing.name) {
            existing.name = name;
            existing.updated_at = Utc::now();
            save_account_at(home, &existing)?;
        }
        return Ok(existing);
    }

    let now = Utc::now();
    let record = Account {
        name: name.unwrap_or_else(|| account.0.clone()),
        id: account,
        vendor,
        created_at: now,
        updated_at: now,
    };
    save_account_at(home, &record)?;
    Ok(record)
}

/// `register_at` convenience wrapper.
pub fn register(
    account: AccountId,
    vendor: Vendor,
    name: Option<String>,
) -> Result<Account, RegistryError> {
    register_at(&home()?, account, vendor, name)
}

/// Remove an account registration. Returns `AccountNotFound` if absent.
pub fn remove_at(home: &Path, account: &AccountId) -> Result<(), RegistryError> {
    let path = account_path_at(home, account);
    if !path.exists() {
        return Err(RegistryError::AccountNotFound { path });
    }
    std::fs::remove_file(&path)?;
    Ok(())
}

/// `remove_at` convenience wrapper.
pub fn remove(account: &AccountId) -> Result<(), RegistryError> {
    remove_at(&home()?, account)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

pub(crate) fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
pub(crate) fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
