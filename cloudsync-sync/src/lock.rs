//! Per-account mutual exclusion over a leased key-value backend.
//!
//! A lock is a key bound to a lease. Acquiring grants a fresh lease and binds
//! the key to it only if no live lease already holds the key. Releasing
//! revokes the lease. An expired lease frees its key on its own, so a holder
//! that dies never blocks the account for longer than the TTL.
//!
//! Every successful acquisition carries a fencing token: the backend revision
//! at which the key was bound. Tokens only grow per key, which lets the datastore
//! refuse writes from a holder whose lease has already expired and been
//! re-acquired by someone else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cloudsync_core::types::AccountId;

use crate::error::{LockError, SyncError};

pub type LeaseId = i64;

/// What a successful [`LockManager::try_lock`] hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHandle {
    pub id: LeaseId,
    pub fence: u64,
}

/// The coordination primitives the lock manager needs.
pub trait LeaseBackend: Send + Sync {
    /// Grant a lease that expires after `ttl` unless revoked first.
    fn grant(&self, ttl: Duration) -> Result<LeaseId, LockError>;

    /// Bind `key` to `lease` if no live lease holds it.
    ///
    /// Returns the bind revision on success and `None` on contention.
    fn put_if_absent(&self, key: &str, lease: LeaseId) -> Result<Option<u64>, LockError>;

    /// Revoke `lease`, freeing every key bound to it.
    ///
    /// Returns [`LockError::LeaseNotFound`] when the lease has already expired
    /// or was never granted.
    fn revoke(&self, lease: LeaseId) -> Result<(), LockError>;
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

pub struct LockManager {
    backend: Arc<dyn LeaseBackend>,
    namespace: String,
    ttl: Duration,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LeaseBackend>, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            ttl,
        }
    }

    /// The lock key for an account: namespace prefix followed by the id.
    pub fn key(&self, account: &AccountId) -> String {
        format!("{}{}", self.namespace, account)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Non-blocking acquire. Fails with [`LockError::LockFailed`] when a live
    /// lease already holds `key`.
    pub fn try_lock(&self, key: &str) -> Result<LeaseHandle, LockError> {
        let lease = self.backend.grant(self.ttl)?;
        match self.backend.put_if_absent(key, lease) {
            Ok(Some(fence)) => {
                tracing::debug!(key, lease, fence, "lock acquired");
                Ok(LeaseHandle { id: lease, fence })
            }
            Ok(None) => {
                self.discard(lease);
                Err(LockError::LockFailed)
            }
            Err(err) => {
                self.discard(lease);
                Err(err)
            }
        }
    }

    /// Release a lock. A lease that already expired counts as released.
    pub fn unlock(&self, handle: LeaseHandle) -> Result<(), LockError> {
        match self.backend.revoke(handle.id) {
            Ok(()) => Ok(()),
            Err(LockError::LeaseNotFound) => {
                tracing::info!(lease = handle.id, "lease already expired, nothing to release");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Acquire the lock for `account` and wrap it in a guard that releases
    /// on drop.
    pub fn lock_account(self: &Arc<Self>, account: &AccountId) -> Result<LockGuard, LockError> {
        let key = self.key(account);
        let handle = self.try_lock(&key)?;
        Ok(LockGuard {
            manager: Arc::clone(self),
            key,
            handle: Some(handle),
        })
    }

    fn discard(&self, lease: LeaseId) {
        if let Err(err) = self.backend.revoke(lease) {
            tracing::debug!(lease, error = %err, "unused lease not revoked; it will expire");
        }
    }
}

/// Lock `account` for a sync run. Contention surfaces as
/// [`SyncError::InProgress`].
pub fn acquire_for_sync(locks: &Arc<LockManager>, account: &AccountId) -> Result<LockGuard, SyncError> {
    locks.lock_account(account).map_err(|err| match err {
        LockError::LockFailed => SyncError::InProgress,
        other => SyncError::Lock(other),
    })
}

/// Holds an account lock until dropped or explicitly released.
pub struct LockGuard {
    manager: Arc<LockManager>,
    key: String,
    handle: Option<LeaseHandle>,
}

impl LockGuard {
    pub fn fence(&self) -> u64 {
        self.handle.map(|h| h.fence).unwrap_or_default()
    }

    /// Release now and surface any backend error.
    pub fn release(mut self) -> Result<(), LockError> {
        match self.handle.take() {
            Some(handle) => self.manager.unlock(handle),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.manager.unlock(handle) {
                tracing::warn!(key = %self.key, error = %err, "failed to release lock; it will expire after its TTL");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LeaseTable {
    next_lease: LeaseId,
    revision: u64,
    leases: HashMap<LeaseId, Instant>,
    keys: HashMap<String, LeaseId>,
}

impl LeaseTable {
    fn purge_expired(&mut self, now: Instant) {
        self.leases.retain(|_, expires| *expires > now);
        let leases = &self.leases;
        self.keys.retain(|_, lease| leases.contains_key(lease));
    }
}

/// Process-local backend with the same lease semantics as a remote one.
#[derive(Default)]
pub struct MemoryLeaseBackend {
    table: Mutex<LeaseTable>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, LeaseTable>, LockError> {
        self.table
            .lock()
            .map_err(|_| LockError::Backend("lease table poisoned".to_string()))
    }
}

impl LeaseBackend for MemoryLeaseBackend {
    fn grant(&self, ttl: Duration) -> Result<LeaseId, LockError> {
        let mut table = self.table()?;
        table.next_lease += 1;
        let id = table.next_lease;
        table.leases.insert(id, Instant::now() + ttl);
        Ok(id)
    }

    fn put_if_absent(&self, key: &str, lease: LeaseId) -> Result<Option<u64>, LockError> {
        let mut table = self.table()?;
        table.purge_expired(Instant::now());
        if !table.leases.contains_key(&lease) {
            return Err(LockError::LeaseNotFound);
        }
        if table.keys.contains_key(key) {
            return Ok(None);
        }
        table.keys.insert(key.to_string(), lease);
        table.revision += 1;
        Ok(Some(table.revision))
    }

    fn revoke(&self, lease: LeaseId) -> Result<(), LockError> {
        let mut table = self.table()?;
        table.purge_expired(Instant::now());
        if table.leases.remove(&lease).is_none() {
            return Err(LockError::LeaseNotFound);
        }
        table.keys.retain(|_, held| *held != lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl: Duration) -> Arc<LockManager> {
        Arc::new(LockManager::new(
            Arc::new(MemoryLeaseBackend::new()),
            "/cloudsync/sync/account/",
            ttl,
        ))
    }

    #[test]
    fn key_is_namespace_plus_account() {
        let locks = manager(Duration::from_secs(60));
        assert_eq!(
            locks.key(&AccountId::from("acct-1")),
            "/cloudsync/sync/account/acct-1"
        );
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let locks = manager(Duration::from_secs(60));
        let first = locks.try_lock("k").expect("first");
        assert!(matches!(locks.try_lock("k"), Err(LockError::LockFailed)));
        locks.unlock(first).expect("unlock");
        locks.try_lock("k").expect("reacquire after unlock");
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let locks = manager(Duration::from_secs(60));
        locks.try_lock("a").expect("a");
        locks.try_lock("b").expect("b");
    }

    #[test]
    fn expired_lease_frees_key_and_unlock_tolerates_it() {
        let locks = manager(Duration::from_millis(20));
        let stale = locks.try_lock("k").expect("first");
        std::thread::sleep(Duration::from_millis(60));

        let fresh = locks.try_lock("k").expect("key freed by expiry");
        assert!(fresh.fence > stale.fence, "fencing tokens must grow");
        locks.unlock(stale).expect("expired lease is treated as released");
    }

    #[test]
    fn guard_releases_on_drop() {
        let locks = manager(Duration::from_secs(60));
        let account = AccountId::from("acct-1");
        {
            let guard = locks.lock_account(&account).expect("lock");
            assert!(guard.fence() > 0);
            assert!(locks.lock_account(&account).is_err());
        }
        locks.lock_account(&account).expect("released by drop");
    }

    #[test]
    fn concurrent_acquires_never_both_succeed() {
        let locks = manager(Duration::from_secs(60));
        let winners: usize = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                std::thread::spawn(move || locks.try_lock("contended").is_ok())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("thread") as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
