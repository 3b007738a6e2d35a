//! Sync status recording.
//!
//! One outcome is kept per `(account, vendor, resource type)`: the latest
//! attempt overwrites the previous one. [`FileStatusStore`] persists them at
//! `<home>/.cloudsync/status/<account>.json` with an atomic `.tmp` + rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cloudsync_core::types::{AccountId, ResourceType, SyncOutcome, Vendor};

use crate::error::{io_err, StoreError, SyncError};
use crate::reconcile::SyncStats;

pub trait StatusStore: Send + Sync {
    fn record(&self, outcome: &SyncOutcome) -> Result<(), StoreError>;

    /// Every outcome recorded for `account` under `vendor`, in resource
    /// type order.
    fn query(&self, account: &AccountId, vendor: Vendor) -> Result<Vec<SyncOutcome>, StoreError>;
}

fn sorted(mut outcomes: Vec<SyncOutcome>) -> Vec<SyncOutcome> {
    outcomes.sort_by_key(|o| o.resource_type);
    outcomes
}

// ---------------------------------------------------------------------------
// MemoryStatusStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStatusStore {
    outcomes: RwLock<HashMap<(AccountId, Vendor, ResourceType), SyncOutcome>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("status table poisoned".to_string())
}

impl StatusStore for MemoryStatusStore {
    fn record(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        self.outcomes.write().map_err(|_| poisoned())?.insert(
            (outcome.account_id.clone(), outcome.vendor, outcome.resource_type),
            outcome.clone(),
        );
        Ok(())
    }

    fn query(&self, account: &AccountId, vendor: Vendor) -> Result<Vec<SyncOutcome>, StoreError> {
        let outcomes = self.outcomes.read().map_err(|_| poisoned())?;
        Ok(sorted(
            outcomes
                .values()
                .filter(|o| &o.account_id == account && o.vendor == vendor)
                .cloned()
                .collect(),
        ))
    }
}

// ---------------------------------------------------------------------------
// FileStatusStore
// ---------------------------------------------------------------------------

/// On-disk status payload for one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusFile {
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub outcomes: Vec<SyncOutcome>,
}

/// `<home>/.cloudsync/status/<account>.json`
pub fn status_path_at(home: &Path, account: &AccountId) -> PathBuf {
    home.join(".cloudsync")
        .join("status")
        .join(format!("{account}.json"))
}

/// Load the status file for `account`; empty if it does not yet exist.
pub fn load_at(home: &Path, account: &AccountId) -> Result<StatusFile, StoreError> {
    let path = status_path_at(home, account);
    if !path.exists() {
        return Ok(StatusFile {
            updated_at: Utc::now(),
            outcomes: Vec::new(),
        });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Save the status file for `account` atomically.
pub fn save_at(home: &Path, account: &AccountId, file: &StatusFile) -> Result<(), StoreError> {
    let path = status_path_at(home, account);
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid status path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

pub struct FileStatusStore {
    home: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStatusStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl StatusStore for FileStatusStore {
    fn record(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;
        let mut file = load_at(&self.home, &outcome.account_id)?;
        file.outcomes
            .retain(|o| !(o.vendor == outcome.vendor && o.resource_type == outcome.resource_type));
        file.outcomes.push(outcome.clone());
        file.updated_at = Utc::now();
        save_at(&self.home, &outcome.account_id, &file)
    }

    fn query(&self, account: &AccountId, vendor: Vendor) -> Result<Vec<SyncOutcome>, StoreError> {
        let file = load_at(&self.home, account)?;
        Ok(sorted(
            file.outcomes.into_iter().filter(|o| o.vendor == vendor).collect(),
        ))
    }
}

// ---------------------------------------------------------------------------
// StatusRecorder
// ---------------------------------------------------------------------------

/// Writes the `Running` and terminal outcomes around a sync step.
///
/// Recording is best effort: a status write failure is logged and never
/// fails the sync it describes.
#[derive(Clone)]
pub struct StatusRecorder {
    store: Arc<dyn StatusStore>,
}

impl StatusRecorder {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub fn start(&self, account: &AccountId, vendor: Vendor, resource_type: ResourceType) -> SyncOutcome {
        let outcome = SyncOutcome::running(account.clone(), vendor, resource_type);
        self.write(&outcome);
        outcome
    }

    pub fn finish(&self, running: SyncOutcome, result: &Result<SyncStats, SyncError>) -> SyncOutcome {
        let outcome = match result {
            Ok(_) => running.succeeded(),
            Err(err) => running.failed(err.to_string()),
        };
        self.write(&outcome);
        outcome
    }

    pub fn query(&self, account: &AccountId, vendor: Vendor) -> Result<Vec<SyncOutcome>, SyncError> {
        Ok(self.store.query(account, vendor)?)
    }

    fn write(&self, outcome: &SyncOutcome) {
        if let Err(err) = self.store.record(outcome) {
            tracing::warn!(
                account = %outcome.account_id,
                vendor = %outcome.vendor,
                resource_type = %outcome.resource_type,
                status = %outcome.status,
                error = %err,
                "failed to record sync status"
            );
        }
    }
}
