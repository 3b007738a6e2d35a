//! Error types for cloudsync-sync.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cloudsync_core::error::RegistryError;
use cloudsync_core::types::{AccountId, CloudId, ResourceType, ScopeKind, Vendor};

/// Errors from the lease-backed lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    /// The key is already bound to a live lease.
    #[error("lock is held by another live lease")]
    LockFailed,

    /// The lease was never granted, already revoked, or expired.
    #[error("requested lease not found")]
    LeaseNotFound,

    /// The coordination backend itself failed.
    #[error("lease backend error: {0}")]
    Backend(String),
}

/// Errors from the local inventory and status datastores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("datastore JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A write carried a fencing token older than one already accepted.
    #[error("stale fencing token {token} for account {account} (latest accepted {latest})")]
    StaleFence {
        account: AccountId,
        token: u64,
        latest: u64,
    },

    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

/// Errors from vendor cloud clients.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("[{vendor}] list {resource_type} failed: {message}")]
    Api {
        vendor: Vendor,
        resource_type: ResourceType,
        message: String,
    },

    #[error("no cloud inventory configured for account {0}")]
    NotConfigured(AccountId),

    #[error("cloud inventory at {path} is invalid: {message}")]
    Fixture { path: PathBuf, message: String },

    #[error("invalid page token '{0}'")]
    InvalidPageToken(String),
}

/// One resource type that failed during a full-account sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub resource_type: ResourceType,
    pub cause: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource_type, self.cause)
    }
}

fn join_failures(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_missing(missing: &[String]) -> String {
    missing.join(", ")
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("datastore error: {0}")]
    Store(#[from] StoreError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A conditional request that breaks a structural rule.
    #[error("invalid sync request: {0}")]
    Validation(String),

    #[error("{resource_type} sync is not supported for vendor {vendor}")]
    UnsupportedResource {
        vendor: Vendor,
        resource_type: ResourceType,
    },

    #[error("account {account} belongs to vendor {expected}, not {requested}")]
    VendorMismatch {
        account: AccountId,
        expected: Vendor,
        requested: Vendor,
    },

    /// Some requested scope values are not known for the account.
    #[error(
        "{kind} mismatch: requested {requested}, found {found}; not found: {}",
        join_missing(.missing)
    )]
    ScopeMismatch {
        kind: ScopeKind,
        requested: usize,
        found: usize,
        missing: Vec<String>,
    },

    /// Another sync already holds the account lock.
    #[error("synchronization is in progress")]
    InProgress,

    #[error("{resource_type} {cloud_id} references {parent} {parent_cloud_id}, which is not synced")]
    ParentMissing {
        resource_type: ResourceType,
        cloud_id: CloudId,
        parent: ResourceType,
        parent_cloud_id: String,
    },

    /// The cloud still lists records the diff wanted to delete.
    #[error("delete {resource_type} aborted: {} record(s) still exist in the cloud", .still_present.len())]
    DeleteVerification {
        resource_type: ResourceType,
        still_present: Vec<CloudId>,
    },

    /// Umbrella error for a full-account sync with one or more failed steps.
    #[error(
        "[{vendor}] sync account {account} failed for {} resource type(s): {}",
        .failures.len(),
        join_failures(.failures)
    )]
    AccountSync {
        vendor: Vendor,
        account: AccountId,
        failures: Vec<StepFailure>,
    },

    #[error("no async runtime available for background sync: {0}")]
    Runtime(String),

    #[error("background sync task failed: {0}")]
    TaskJoin(String),
}

/// Coarse classification reported to callers alongside error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// The request itself is wrong; retrying unchanged will not help.
    Invalid,
    /// Another sync holds the account; retry later.
    Conflict,
    Internal,
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Validation(_)
            | SyncError::UnsupportedResource { .. }
            | SyncError::VendorMismatch { .. }
            | SyncError::ScopeMismatch { .. } => ErrorClass::Invalid,
            SyncError::Registry(RegistryError::AccountNotFound { .. }) => ErrorClass::Invalid,
            SyncError::InProgress | SyncError::Lock(LockError::LockFailed) => ErrorClass::Conflict,
            _ => ErrorClass::Internal,
        }
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_is_a_conflict() {
        let err = SyncError::InProgress;
        assert_eq!(err.to_string(), "synchronization is in progress");
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[test]
    fn account_sync_lists_every_failed_type() {
        let err = SyncError::AccountSync {
            vendor: Vendor::Aws,
            account: AccountId::from("acct-1"),
            failures: vec![
                StepFailure {
                    resource_type: ResourceType::Subnet,
                    cause: "throttled".into(),
                },
                StepFailure {
                    resource_type: ResourceType::Disk,
                    cause: "timeout".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("[aws] sync account acct-1 failed for 2"));
        assert!(msg.contains("subnet: throttled"));
        assert!(msg.contains("disk: timeout"));
        assert_eq!(err.class(), ErrorClass::Internal);
    }

    #[test]
    fn scope_mismatch_names_missing_values() {
        let err = SyncError::ScopeMismatch {
            kind: ScopeKind::Region,
            requested: 3,
            found: 2,
            missing: vec!["r3".into()],
        };
        assert!(err.to_string().contains("not found: r3"));
        assert_eq!(err.class(), ErrorClass::Invalid);
    }
}
