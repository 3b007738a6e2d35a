//! Conditional sync execution: take the account lock, then run the sync
//! function on the blocking pool and return straight away.
//!
//! The lock guard moves into the background task and is released when the
//! task ends. A panicking sync function is recorded as a failure.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use cloudsync_core::types::{Account, ResourceType, SyncOutcome};

use crate::cloud::CloudClient;
use crate::error::SyncError;
use crate::funcs::{SyncContext, SyncFn};
use crate::lock::{acquire_for_sync, LockManager};
use crate::orchestrator::elapsed_ms;
use crate::status::StatusRecorder;
use crate::store::ResourceStore;
use crate::validator::{ConditionalScope, SyncScope};

/// Everything one background conditional sync needs.
pub struct ConditionalJob {
    pub account: Account,
    pub resource_type: ResourceType,
    pub scope: ConditionalScope,
    pub func: SyncFn,
    pub cloud: Arc<dyn CloudClient>,
}

/// Acknowledgement of a started conditional sync.
pub struct SyncTicket {
    pub rid: String,
    handle: JoinHandle<SyncOutcome>,
}

impl SyncTicket {
    /// Wait for the background task and return its recorded outcome.
    pub async fn wait(self) -> Result<SyncOutcome, SyncError> {
        self.handle
            .await
            .map_err(|e| SyncError::TaskJoin(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub struct ConditionalExecutor {
    locks: Arc<LockManager>,
    store: Arc<dyn ResourceStore>,
    recorder: StatusRecorder,
    page_limit: usize,
}

impl ConditionalExecutor {
    pub fn new(
        locks: Arc<LockManager>,
        store: Arc<dyn ResourceStore>,
        recorder: StatusRecorder,
        page_limit: usize,
    ) -> Self {
        Self {
            locks,
            store,
            recorder,
            page_limit,
        }
    }

    /// Start `job` in the background. Fails with [`SyncError::InProgress`]
    /// when another sync holds the account.
    pub fn start(&self, job: ConditionalJob) -> Result<SyncTicket, SyncError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Runtime(e.to_string()))?;
        let guard = acquire_for_sync(&self.locks, &job.account.id)?;

        let rid = uuid::Uuid::new_v4().simple().to_string();
        let running = self
            .recorder
            .start(&job.account.id, job.account.vendor, job.resource_type);
        tracing::info!(
            rid = %rid,
            vendor = %job.account.vendor,
            account = %job.account.id,
            resource_type = %job.resource_type,
            scope = ?job.scope.values,
            "conditional sync started"
        );

        let store = Arc::clone(&self.store);
        let recorder = self.recorder.clone();
        let page_limit = self.page_limit;
        let task_rid = rid.clone();
        let handle = runtime.spawn_blocking(move || {
            let started = Instant::now();
            let ctx = SyncContext {
                rid: &task_rid,
                account: &job.account,
                store: store.as_ref(),
                fence: guard.fence(),
                page_limit,
            };
            let scope = SyncScope::Conditional(job.scope);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                (job.func)(&ctx, job.cloud.as_ref(), &scope)
            }))
            .unwrap_or_else(|_| Err(SyncError::TaskJoin("sync function panicked".to_string())));
            let outcome = recorder.finish(running, &result);
            drop(guard);

            let elapsed = elapsed_ms(started);
            match &result {
                Ok(stats) => tracing::info!(
                    rid = %task_rid,
                    vendor = %job.account.vendor,
                    account = %job.account.id,
                    resource_type = %job.resource_type,
                    elapsed_ms = elapsed,
                    created = stats.created,
                    updated = stats.updated,
                    deleted = stats.deleted,
                    "conditional sync finished"
                ),
                Err(err) => tracing::error!(
                    rid = %task_rid,
                    vendor = %job.account.vendor,
                    account = %job.account.id,
                    resource_type = %job.resource_type,
                    elapsed_ms = elapsed,
                    error = %err,
                    "conditional sync failed"
                ),
            }
            outcome
        });

        Ok(SyncTicket { rid, handle })
    }
}
