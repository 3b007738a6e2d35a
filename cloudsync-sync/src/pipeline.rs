//! Shared sync entrypoint used by CLI and daemon.

use std::path::Path;
use std::sync::Arc;

use cloudsync_core::config::{EngineConfig, PublicResourcePolicy};
use cloudsync_core::types::{Account, AccountId, OutcomeReport, ResourceType, Vendor};

use crate::cloud::{CloudConnector, FixtureConnector, StaticConnector};
use crate::error::SyncError;
use crate::executor::{ConditionalExecutor, ConditionalJob, SyncTicket};
use crate::funcs::SyncFuncRegistry;
use crate::lease_file::FileLeaseBackend;
use crate::lock::{LeaseBackend, LockManager, MemoryLeaseBackend};
use crate::orchestrator::{FullSyncOrchestrator, FullSyncReport};
use crate::status::{FileStatusStore, MemoryStatusStore, StatusRecorder, StatusStore};
use crate::store::{FileStore, MemoryStore, ResourceStore};
use crate::validator::{self, ConditionalScope, ConditionalSyncRequest, ScopeLimits};

/// The wired-up engine: lock manager, registry, datastore, status recorder
/// and cloud connector behind the three public operations.
pub struct SyncEngine {
    config: EngineConfig,
    funcs: Arc<SyncFuncRegistry>,
    store: Arc<dyn ResourceStore>,
    connector: Arc<dyn CloudConnector>,
    recorder: StatusRecorder,
    locks: Arc<LockManager>,
    orchestrator: FullSyncOrchestrator,
    executor: ConditionalExecutor,
}

#[derive(Default)]
pub struct SyncEngineBuilder {
    config: EngineConfig,
    funcs: Option<SyncFuncRegistry>,
    store: Option<Arc<dyn ResourceStore>>,
    status: Option<Arc<dyn StatusStore>>,
    leases: Option<Arc<dyn LeaseBackend>>,
    connector: Option<Arc<dyn CloudConnector>>,
}

impl SyncEngineBuilder {
    pub fn funcs(mut self, funcs: SyncFuncRegistry) -> Self {
        self.funcs = Some(funcs);
        self
    }

    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn status_store(mut self, status: Arc<dyn StatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn lease_backend(mut self, leases: Arc<dyn LeaseBackend>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn CloudConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Anything not supplied falls back to its in-memory implementation.
    pub fn build(self) -> SyncEngine {
        let config = self.config;
        let funcs = Arc::new(self.funcs.unwrap_or_else(SyncFuncRegistry::builtin));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn ResourceStore>);
        let status = self
            .status
            .unwrap_or_else(|| Arc::new(MemoryStatusStore::new()) as Arc<dyn StatusStore>);
        let leases = self
            .leases
            .unwrap_or_else(|| Arc::new(MemoryLeaseBackend::new()) as Arc<dyn LeaseBackend>);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(StaticConnector::new()) as Arc<dyn CloudConnector>);

        let locks = Arc::new(LockManager::new(
            leases,
            config.lock_namespace.clone(),
            config.lock_ttl(),
        ));
        let recorder = StatusRecorder::new(status);
        let orchestrator = FullSyncOrchestrator::new(
            Arc::clone(&locks),
            Arc::clone(&funcs),
            Arc::clone(&store),
            recorder.clone(),
            config.page_limit,
        );
        let executor = ConditionalExecutor::new(
            Arc::clone(&locks),
            Arc::clone(&store),
            recorder.clone(),
            config.page_limit,
        );
        SyncEngine {
            config,
            funcs,
            store,
            connector,
            recorder,
            locks,
            orchestrator,
            executor,
        }
    }
}

impl SyncEngine {
    pub fn builder(config: EngineConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            ..SyncEngineBuilder::default()
        }
    }

    /// File-backed engine rooted at `<home>/.cloudsync/`.
    pub fn open_at(home: &Path, config: EngineConfig) -> Self {
        Self::builder(config)
            .store(Arc::new(FileStore::at_home(home)))
            .status_store(Arc::new(FileStatusStore::new(home)))
            .lease_backend(Arc::new(FileLeaseBackend::at_home(home)))
            .connector(Arc::new(FixtureConnector::at_home(home)))
            .build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn funcs(&self) -> &SyncFuncRegistry {
        &self.funcs
    }

    /// Reconcile every supported resource type of `account`, holding its
    /// lock for the whole run. `policy` overrides the configured public
    /// resource policy.
    pub fn sync_account(
        &self,
        account: &Account,
        policy: Option<PublicResourcePolicy>,
    ) -> Result<FullSyncReport, SyncError> {
        let cloud = self.connector.connect(account)?;
        let policy = policy.unwrap_or(self.config.sync_public_resource);
        self.orchestrator.run(account, cloud.as_ref(), policy)
    }

    /// Every check a conditional request goes through before a lock is
    /// taken: vendor, resource type support, structure and existence.
    pub fn validate_conditional(
        &self,
        account: &Account,
        vendor: Vendor,
        resource_type: ResourceType,
        request: &ConditionalSyncRequest,
    ) -> Result<ConditionalScope, SyncError> {
        if account.vendor != vendor {
            return Err(SyncError::VendorMismatch {
                account: account.id.clone(),
                expected: account.vendor,
                requested: vendor,
            });
        }
        if resource_type.is_scope_key() || resource_type.is_public() {
            return Err(SyncError::Validation(format!(
                "{resource_type} can only be refreshed by a full account sync"
            )));
        }
        self.funcs.require(vendor, resource_type)?;
        validator::validate(
            self.store.as_ref(),
            &account.id,
            vendor.scope_kind(),
            request,
            &ScopeLimits::from(&self.config),
            self.config.page_limit,
        )
    }

    /// Validate, lock and start a conditional sync in the background.
    /// Must be called from within a tokio runtime.
    pub fn start_conditional(
        &self,
        account: &Account,
        vendor: Vendor,
        resource_type: ResourceType,
        request: &ConditionalSyncRequest,
    ) -> Result<SyncTicket, SyncError> {
        let scope = self.validate_conditional(account, vendor, resource_type, request)?;
        let func = self.funcs.require(vendor, resource_type)?;
        let cloud = self.connector.connect(account)?;
        self.executor.start(ConditionalJob {
            account: account.clone(),
            resource_type,
            scope,
            func,
            cloud,
        })
    }

    /// Latest recorded outcome per resource type.
    pub fn query_status(&self, account: &AccountId, vendor: Vendor) -> Result<Vec<OutcomeReport>, SyncError> {
        Ok(self
            .recorder
            .query(account, vendor)?
            .iter()
            .map(|o| o.report())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn account(vendor: Vendor) -> Account {
        Account {
            id: AccountId::from("acct-1"),
            vendor,
            name: "acct-1".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn vendor_mismatch_is_rejected_before_anything_else() {
        let engine = SyncEngine::builder(EngineConfig::default()).build();
        let err = engine
            .validate_conditional(
                &account(Vendor::Aws),
                Vendor::Gcp,
                ResourceType::Vpc,
                &ConditionalSyncRequest::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::VendorMismatch { .. }));
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let engine = SyncEngine::builder(EngineConfig::default()).build();
        let err = engine
            .validate_conditional(
                &account(Vendor::Gcp),
                Vendor::Gcp,
                ResourceType::SecurityGroup,
                &ConditionalSyncRequest::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedResource { .. }));
    }

    #[test]
    fn regions_cannot_be_synced_conditionally() {
        let engine = SyncEngine::builder(EngineConfig::default()).build();
        let err = engine
            .validate_conditional(
                &account(Vendor::Aws),
                Vendor::Aws,
                ResourceType::Region,
                &ConditionalSyncRequest::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn file_backed_engine_without_inventory_reports_not_configured() {
        let home = TempDir::new().unwrap();
        let engine = SyncEngine::open_at(home.path(), EngineConfig::default());
        let err = engine.sync_account(&account(Vendor::TCloud), None).unwrap_err();
        assert!(err.to_string().contains("no cloud inventory configured"), "{err}");
        assert!(engine
            .query_status(&AccountId::from("acct-1"), Vendor::TCloud)
            .unwrap()
            .is_empty());
    }
}
