//! File-backed lease backend shared by every process on one host.
//!
//! # Storage layout
//!
//! ```text
//! ~/.cloudsync/locks/
//!   leases/<lease_id>.json          {"expires_at_ms": …}
//!   keys/<hex(key)>/<revision>.json {"lease": …}
//! ```
//!
//! A key is held by its highest revision while that revision's lease is live.
//! Binding publishes revision `top + 1` with an exclusive hard link, so of all
//! contenders that saw the same `top` exactly one wins. A contender working
//! from an older listing can only land below the real top; it notices on the
//! re-read and backs out. The revision doubles as the fencing token, so tokens
//! come from the directory and not from the clock.
//!
//! Files are written to a private temp name and linked into place, so readers
//! never see a partial record.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::LockError;
use crate::lock::{LeaseBackend, LeaseId};

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    expires_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    lease: LeaseId,
}

/// `<home>/.cloudsync/locks/`
pub fn locks_dir_at(home: &Path) -> PathBuf {
    home.join(".cloudsync").join("locks")
}

pub struct FileLeaseBackend {
    root: PathBuf,
}

impl FileLeaseBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn at_home(home: &Path) -> Self {
        Self::new(locks_dir_at(home))
    }

    fn leases_dir(&self) -> PathBuf {
        self.root.join("leases")
    }

    fn lease_path(&self, lease: LeaseId) -> PathBuf {
        self.leases_dir().join(format!("{lease}.json"))
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        self.root.join("keys").join(hex::encode(key.as_bytes()))
    }

    fn ensure_dir(dir: &Path) -> Result<(), LockError> {
        fs::create_dir_all(dir).map_err(|e| backend_err(dir, e))
    }

    fn read_lease(path: &Path) -> Result<Option<LeaseRecord>, LockError> {
        match fs::read_to_string(path) {
            Ok(c) => Ok(serde_json::from_str(&c).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend_err(path, e)),
        }
    }

    /// `Some(true)` live, `Some(false)` expired or unreadable, `None` missing.
    fn lease_alive(&self, lease: LeaseId) -> Result<Option<bool>, LockError> {
        let path = self.lease_path(lease);
        if !path.exists() {
            return Ok(None);
        }
        let now = Utc::now().timestamp_millis();
        Ok(Some(
            Self::read_lease(&path)?.map_or(false, |r| r.expires_at_ms > now),
        ))
    }

    /// Highest revision under a key directory.
    fn top_revision(dir: &Path) -> Result<Option<u64>, LockError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(backend_err(dir, e)),
        };
        Ok(entries
            .filter_map(|e| e.ok())
            .filter_map(|e| revision_of(&e.path()))
            .max())
    }

    /// Whether `revision` still belongs to a live lease.
    fn revision_live(&self, dir: &Path, revision: u64) -> Result<bool, LockError> {
        let path = revision_path(dir, revision);
        let record: Option<KeyRecord> = match fs::read_to_string(&path) {
            Ok(c) => serde_json::from_str(&c).ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(backend_err(&path, e)),
        };
        match record {
            Some(r) => Ok(self.lease_alive(r.lease)? == Some(true)),
            None => Ok(false),
        }
    }

    /// Drop revisions below the one just won.
    fn prune_revisions(dir: &Path, keep: u64) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            if revision_of(&path).is_some_and(|r| r < keep) {
                if let Err(err) = fs::remove_file(&path) {
                    tracing::debug!(path = %path.display(), error = %err, "old lock revision not removed");
                }
            }
        }
    }

    /// Remove lease files that expired, from any holder.
    fn prune_leases(&self) {
        let dir = self.leases_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return;
        };
        let now = Utc::now().timestamp_millis();
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = matches!(Self::read_lease(&path), Ok(Some(r)) if r.expires_at_ms <= now);
            if expired {
                if let Err(err) = fs::remove_file(&path) {
                    tracing::debug!(path = %path.display(), error = %err, "expired lease not removed");
                }
            }
        }
    }
}

impl LeaseBackend for FileLeaseBackend {
    fn grant(&self, ttl: Duration) -> Result<LeaseId, LockError> {
        let dir = self.leases_dir();
        Self::ensure_dir(&dir)?;
        self.prune_leases();

        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let record = LeaseRecord {
            expires_at_ms: Utc::now().timestamp_millis().saturating_add(ttl_ms),
        };
        let json = serde_json::to_vec(&record).map_err(|e| LockError::Backend(e.to_string()))?;
        loop {
            let id = next_id();
            let tmp = dir.join(format!(".{id}.tmp"));
            if publish(&tmp, &self.lease_path(id), &json)? {
                return Ok(id);
            }
        }
    }

    fn put_if_absent(&self, key: &str, lease: LeaseId) -> Result<Option<u64>, LockError> {
        if self.lease_alive(lease)? != Some(true) {
            return Err(LockError::LeaseNotFound);
        }
        let dir = self.key_dir(key);
        Self::ensure_dir(&dir)?;

        let top = Self::top_revision(&dir)?;
        if let Some(held) = top {
            if self.revision_live(&dir, held)? {
                return Ok(None);
            }
            tracing::debug!(key, revision = held, "reclaiming lock key held by an expired lease");
        }

        let revision = top.map_or(1, |r| r + 1);
        let json = serde_json::to_vec(&KeyRecord { lease })
            .map_err(|e| LockError::Backend(e.to_string()))?;
        let ours = revision_path(&dir, revision);
        let tmp = dir.join(format!(".{lease}.tmp"));
        if !publish(&tmp, &ours, &json)? {
            return Ok(None);
        }

        // Published from a stale listing: a newer revision is the holder.
        if Self::top_revision(&dir)? != Some(revision) {
            if let Err(err) = fs::remove_file(&ours) {
                tracing::debug!(key, revision, error = %err, "stale lock revision not removed");
            }
            return Ok(None);
        }

        Self::prune_revisions(&dir, revision);
        Ok(Some(revision))
    }

    fn revoke(&self, lease: LeaseId) -> Result<(), LockError> {
        let alive = self.lease_alive(lease)?;
        if alive.is_some() {
            let path = self.lease_path(lease);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(backend_err(&path, e)),
            }
        }

        match alive {
            Some(true) => Ok(()),
            _ => Err(LockError::LeaseNotFound),
        }
    }
}

fn revision_path(dir: &Path, revision: u64) -> PathBuf {
    dir.join(format!("{revision}.json"))
}

fn revision_of(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Write `contents` to `tmp`, then link it to `target` only if `target` does
/// not exist. Returns `false` when someone else owns `target`.
fn publish(tmp: &Path, target: &Path, contents: &[u8]) -> Result<bool, LockError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)
        .map_err(|e| backend_err(tmp, e))?;
    file.write_all(contents).map_err(|e| backend_err(tmp, e))?;
    drop(file);

    let linked = fs::hard_link(tmp, target);
    if let Err(err) = fs::remove_file(tmp) {
        tracing::debug!(path = %tmp.display(), error = %err, "temp lock file not removed");
    }
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(backend_err(target, e)),
    }
}

/// Lease ids only need to be unique; clashes are retried by `grant`.
fn next_id() -> LeaseId {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros())
}

fn backend_err(path: &Path, source: std::io::Error) -> LockError {
    LockError::Backend(format!("{}: {source}", path.display()))
}
