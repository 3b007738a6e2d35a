//! Full-account sync: every supported resource type of a vendor, in
//! dependency order, under one account lock.
//!
//! A failing step is recorded and logged, and the run moves on to the next
//! type. The failures are reported together once the schedule is exhausted.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use cloudsync_core::config::PublicResourcePolicy;
use cloudsync_core::types::{Account, AccountId, ResourceType, SyncStatus, Vendor};

use crate::cloud::CloudClient;
use crate::error::{StepFailure, SyncError};
use crate::funcs::{SyncContext, SyncFuncRegistry};
use crate::lock::{acquire_for_sync, LockManager};
use crate::reconcile::SyncStats;
use crate::status::StatusRecorder;
use crate::store::{ResourceStore, StoreFilter};
use crate::validator::SyncScope;

/// Reference data first, then network topology, then what attaches to it,
/// then account-level types.
const SCHEDULE: &[ResourceType] = &[
    ResourceType::Region,
    ResourceType::Zone,
    ResourceType::ResourceGroup,
    ResourceType::Image,
    ResourceType::Vpc,
    ResourceType::Subnet,
    ResourceType::RouteTable,
    ResourceType::Route,
    ResourceType::SecurityGroup,
    ResourceType::SecurityGroupRule,
    ResourceType::Firewall,
    ResourceType::Disk,
    ResourceType::Cvm,
    ResourceType::NetworkInterface,
    ResourceType::Eip,
    ResourceType::SubAccount,
    ResourceType::Cert,
    ResourceType::LoadBalancer,
    ResourceType::ArgumentTemplate,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub resource_type: ResourceType,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SyncStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullSyncReport {
    pub rid: String,
    pub account_id: AccountId,
    pub vendor: Vendor,
    pub include_public: bool,
    pub steps: Vec<StepReport>,
    pub elapsed_ms: u64,
}

impl FullSyncReport {
    pub fn failures(&self) -> Vec<StepFailure> {
        self.steps
            .iter()
            .filter_map(|s| {
                s.error.as_ref().map(|cause| StepFailure {
                    resource_type: s.resource_type,
                    cause: cause.clone(),
                })
            })
            .collect()
    }

    pub fn totals(&self) -> SyncStats {
        let mut total = SyncStats::default();
        for stats in self.steps.iter().filter_map(|s| s.stats) {
            total += stats;
        }
        total
    }
}

pub struct FullSyncOrchestrator {
    locks: Arc<LockManager>,
    funcs: Arc<SyncFuncRegistry>,
    store: Arc<dyn ResourceStore>,
    recorder: StatusRecorder,
    page_limit: usize,
}

impl FullSyncOrchestrator {
    pub fn new(
        locks: Arc<LockManager>,
        funcs: Arc<SyncFuncRegistry>,
        store: Arc<dyn ResourceStore>,
        recorder: StatusRecorder,
        page_limit: usize,
    ) -> Self {
        Self {
            locks,
            funcs,
            store,
            recorder,
            page_limit,
        }
    }

    /// The ordered resource types a full sync of `vendor` runs.
    pub fn schedule(&self, vendor: Vendor, include_public: bool) -> Vec<ResourceType> {
        SCHEDULE
            .iter()
            .copied()
            .filter(|rt| self.funcs.supports(vendor, *rt))
            .filter(|rt| include_public || !rt.is_public())
            .collect()
    }

    /// Decide whether this run refreshes vendor-shared reference data.
    ///
    /// Under `Auto`, it does when the account has no records yet of any
    /// public type the vendor supports.
    pub fn include_public(&self, policy: PublicResourcePolicy, account: &Account) -> Result<bool, SyncError> {
        match policy {
            PublicResourcePolicy::Always => return Ok(true),
            PublicResourcePolicy::Never => return Ok(false),
            PublicResourcePolicy::Auto => {}
        }
        for rt in ResourceType::all().iter().copied().filter(ResourceType::is_public) {
            if !self.funcs.supports(account.vendor, rt) {
                continue;
            }
            let count = self.store.count(&StoreFilter::new(account.id.clone(), rt))?;
            if count == 0 {
                tracing::debug!(account = %account.id, resource_type = %rt, "no public records yet");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run a full sync of `account` while holding its lock.
    pub fn run(
        &self,
        account: &Account,
        cloud: &dyn CloudClient,
        policy: PublicResourcePolicy,
    ) -> Result<FullSyncReport, SyncError> {
        if cloud.vendor() != account.vendor {
            return Err(SyncError::VendorMismatch {
                account: account.id.clone(),
                expected: account.vendor,
                requested: cloud.vendor(),
            });
        }

        let guard = acquire_for_sync(&self.locks, &account.id)?;
        let rid = uuid::Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        let include_public = self.include_public(policy, account)?;
        let schedule = self.schedule(account.vendor, include_public);
        tracing::info!(
            rid = %rid,
            vendor = %account.vendor,
            account = %account.id,
            include_public,
            steps = schedule.len(),
            "full account sync started"
        );

        let ctx = SyncContext {
            rid: &rid,
            account,
            store: self.store.as_ref(),
            fence: guard.fence(),
            page_limit: self.page_limit,
        };
        let mut steps = Vec::with_capacity(schedule.len());
        for resource_type in schedule {
            steps.push(self.run_step(&ctx, cloud, resource_type));
        }

        if let Err(err) = guard.release() {
            tracing::warn!(rid = %rid, account = %account.id, error = %err, "failed to release account lock");
        }

        let report = FullSyncReport {
            rid,
            account_id: account.id.clone(),
            vendor: account.vendor,
            include_public,
            steps,
            elapsed_ms: elapsed_ms(started),
        };
        let failures = report.failures();
        if !failures.is_empty() {
            tracing::error!(
                rid = %report.rid,
                vendor = %account.vendor,
                account = %account.id,
                failed = failures.len(),
                elapsed_ms = report.elapsed_ms,
                "full account sync finished with failures"
            );
            return Err(SyncError::AccountSync {
                vendor: account.vendor,
                account: account.id.clone(),
                failures,
            });
        }
        tracing::info!(
            rid = %report.rid,
            vendor = %account.vendor,
            account = %account.id,
            elapsed_ms = report.elapsed_ms,
            "full account sync finished"
        );
        Ok(report)
    }

    fn run_step(&self, ctx: &SyncContext<'_>, cloud: &dyn CloudClient, resource_type: ResourceType) -> StepReport {
        let started = Instant::now();
        let running = self.recorder.start(&ctx.account.id, ctx.account.vendor, resource_type);
        let result = self
            .funcs
            .require(ctx.account.vendor, resource_type)
            .and_then(|func| func(ctx, cloud, &SyncScope::Full));
        let outcome = self.recorder.finish(running, &result);
        let elapsed = elapsed_ms(started);

        match result {
            Ok(stats) => StepReport {
                resource_type,
                status: outcome.status,
                stats: Some(stats),
                error: None,
                elapsed_ms: elapsed,
            },
            Err(err) => {
                tracing::error!(
                    rid = ctx.rid,
                    vendor = %ctx.account.vendor,
                    account = %ctx.account.id,
                    resource_type = %resource_type,
                    elapsed_ms = elapsed,
                    error = %err,
                    "sync step failed"
                );
                StepReport {
                    resource_type,
                    status: outcome.status,
                    stats: None,
                    error: Some(err.to_string()),
                    elapsed_ms: elapsed,
                }
            }
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
