//! Local inventory datastore.
//!
//! Records are keyed by account, resource type and cloud id, and every write
//! carries the fencing token of the account lock it was made under. A store
//! refuses a token lower than one it has already accepted for that account.
//!
//! [`FileStore`] persists one JSON document per account at
//! `<home>/.cloudsync/inventory/<account>.json`, written with the same
//! atomic `.tmp` + rename pattern as the registry.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cloudsync_core::types::{AccountId, CloudId, CloudResource, ResourceType, ScopeKind, Vendor};

use crate::error::{io_err, StoreError};

/// A synced record as the datastore holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResource {
    /// Opaque local id, stable across updates.
    pub id: String,
    pub account_id: AccountId,
    pub vendor: Vendor,
    #[serde(flatten)]
    pub resource: CloudResource,
    pub synced_at: DateTime<Utc>,
}

/// Which records a listing returns. Empty lists mean "no narrowing".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFilter {
    pub account_id: AccountId,
    pub resource_type: ResourceType,
    pub scope: Option<(ScopeKind, String)>,
    pub cloud_ids: Vec<CloudId>,
    pub names: Vec<String>,
}

impl StoreFilter {
    pub fn new(account_id: AccountId, resource_type: ResourceType) -> Self {
        Self {
            account_id,
            resource_type,
            scope: None,
            cloud_ids: Vec::new(),
            names: Vec::new(),
        }
    }

    pub fn in_scope(mut self, kind: ScopeKind, value: impl Into<String>) -> Self {
        self.scope = Some((kind, value.into()));
        self
    }

    pub fn with_cloud_ids(mut self, ids: impl IntoIterator<Item = CloudId>) -> Self {
        self.cloud_ids = ids.into_iter().collect();
        self
    }

    pub fn with_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.names = names.into_iter().collect();
        self
    }

    fn matches(&self, record: &StoredResource) -> bool {
        let r = &record.resource;
        record.account_id == self.account_id
            && r.resource_type == self.resource_type
            && self
                .scope
                .as_ref()
                .map_or(true, |(kind, value)| r.scope_value(*kind) == Some(value.as_str()))
            && (self.cloud_ids.is_empty() || self.cloud_ids.contains(&r.cloud_id))
            && (self.names.is_empty() || self.names.contains(&r.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// Identity and fencing token a write is made under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub account_id: AccountId,
    pub vendor: Vendor,
    pub fence: u64,
}

pub trait ResourceStore: Send + Sync {
    /// One page of matching records, ordered by cloud id.
    fn list(&self, filter: &StoreFilter, page: Page) -> Result<Vec<StoredResource>, StoreError>;

    fn count(&self, filter: &StoreFilter) -> Result<usize, StoreError>;

    /// Insert or replace records by cloud id. Returns how many were written.
    fn upsert(&self, write: &WriteContext, resources: &[CloudResource]) -> Result<usize, StoreError>;

    /// Delete records of `resource_type` by cloud id. Returns how many existed.
    fn delete(
        &self,
        write: &WriteContext,
        resource_type: ResourceType,
        cloud_ids: &[CloudId],
    ) -> Result<usize, StoreError>;
}

/// Walk every page of a listing.
pub fn list_all(store: &dyn ResourceStore, filter: &StoreFilter, page_limit: usize) -> Result<Vec<StoredResource>, StoreError> {
    let mut page = Page::first(page_limit.max(1));
    let mut out = Vec::new();
    loop {
        let batch = store.list(filter, page)?;
        let done = batch.len() < page.limit;
        out.extend(batch);
        if done {
            return Ok(out);
        }
        page = page.next();
    }
}

// ---------------------------------------------------------------------------
// Shared record table
// ---------------------------------------------------------------------------

type RecordKey = (ResourceType, CloudId);

/// The records and latest accepted fence of one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountInventory {
    #[serde(default)]
    fence: u64,
    #[serde(default)]
    resources: Vec<StoredResource>,
}

impl AccountInventory {
    fn accept(&mut self, write: &WriteContext) -> Result<(), StoreError> {
        if write.fence < self.fence {
            return Err(StoreError::StaleFence {
                account: write.account_id.clone(),
                token: write.fence,
                latest: self.fence,
            });
        }
        self.fence = write.fence;
        Ok(())
    }

    fn index(&self) -> HashMap<RecordKey, usize> {
        self.resources
            .iter()
            .enumerate()
            .map(|(i, r)| ((r.resource.resource_type, r.resource.cloud_id.clone()), i))
            .collect()
    }

    fn upsert(&mut self, write: &WriteContext, resources: &[CloudResource]) -> Result<usize, StoreError> {
        self.accept(write)?;
        let mut index = self.index();
        let now = Utc::now();
        for resource in resources {
            let key = (resource.resource_type, resource.cloud_id.clone());
            match index.get(&key) {
                Some(&i) => {
                    let existing = &mut self.resources[i];
                    existing.resource = resource.clone();
                    existing.vendor = write.vendor;
                    existing.synced_at = now;
                }
                None => {
                    index.insert(key, self.resources.len());
                    self.resources.push(StoredResource {
                        id: uuid::Uuid::new_v4().simple().to_string(),
                        account_id: write.account_id.clone(),
                        vendor: write.vendor,
                        resource: resource.clone(),
                        synced_at: now,
                    });
                }
            }
        }
        Ok(resources.len())
    }

    fn delete(
        &mut self,
        write: &WriteContext,
        resource_type: ResourceType,
        cloud_ids: &[CloudId],
    ) -> Result<usize, StoreError> {
        self.accept(write)?;
        let before = self.resources.len();
        self.resources.retain(|r| {
            !(r.resource.resource_type == resource_type && cloud_ids.contains(&r.resource.cloud_id))
        });
        Ok(before - self.resources.len())
    }

    fn list(&self, filter: &StoreFilter, page: Page) -> Vec<StoredResource> {
        let mut matched: Vec<&StoredResource> =
            self.resources.iter().filter(|r| filter.matches(r)).collect();
        matched.sort_by(|a, b| a.resource.cloud_id.cmp(&b.resource.cloud_id));
        matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect()
    }

    fn count(&self, filter: &StoreFilter) -> usize {
        self.resources.iter().filter(|r| filter.matches(r)).count()
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<BTreeMap<AccountId, AccountInventory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("inventory lock poisoned".to_string())
}

impl ResourceStore for MemoryStore {
    fn list(&self, filter: &StoreFilter, page: Page) -> Result<Vec<StoredResource>, StoreError> {
        let accounts = self.accounts.read().map_err(|_| poisoned())?;
        Ok(accounts
            .get(&filter.account_id)
            .map(|inv| inv.list(filter, page))
            .unwrap_or_default())
    }

    fn count(&self, filter: &StoreFilter) -> Result<usize, StoreError> {
        let accounts = self.accounts.read().map_err(|_| poisoned())?;
        Ok(accounts
            .get(&filter.account_id)
            .map(|inv| inv.count(filter))
            .unwrap_or_default())
    }

    fn upsert(&self, write: &WriteContext, resources: &[CloudResource]) -> Result<usize, StoreError> {
        let mut accounts = self.accounts.write().map_err(|_| poisoned())?;
        accounts
            .entry(write.account_id.clone())
            .or_default()
            .upsert(write, resources)
    }

    fn delete(
        &self,
        write: &WriteContext,
        resource_type: ResourceType,
        cloud_ids: &[CloudId],
    ) -> Result<usize, StoreError> {
        let mut accounts = self.accounts.write().map_err(|_| poisoned())?;
        accounts
            .entry(write.account_id.clone())
            .or_default()
            .delete(write, resource_type, cloud_ids)
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// `<home>/.cloudsync/inventory/`
pub fn inventory_dir_at(home: &Path) -> PathBuf {
    home.join(".cloudsync").join("inventory")
}

pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn at_home(home: &Path) -> Self {
        Self::new(inventory_dir_at(home))
    }

    pub fn path_for(&self, account: &AccountId) -> PathBuf {
        self.root.join(format!("{account}.json"))
    }

    fn load(&self, account: &AccountId) -> Result<AccountInventory, StoreError> {
        let path = self.path_for(account);
        if !path.exists() {
            return Ok(AccountInventory::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, account: &AccountId, inventory: &AccountInventory) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
        let path = self.path_for(account);
        let json = serde_json::to_string_pretty(inventory)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| poisoned())
    }

    fn modify<T>(
        &self,
        account: &AccountId,
        f: impl FnOnce(&mut AccountInventory) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.guard()?;
        let mut inventory = self.load(account)?;
        let out = f(&mut inventory)?;
        self.save(account, &inventory)?;
        Ok(out)
    }
}

impl ResourceStore for FileStore {
    fn list(&self, filter: &StoreFilter, page: Page) -> Result<Vec<StoredResource>, StoreError> {
        Ok(self.load(&filter.account_id)?.list(filter, page))
    }

    fn count(&self, filter: &StoreFilter) -> Result<usize, StoreError> {
        Ok(self.load(&filter.account_id)?.count(filter))
    }

    fn upsert(&self, write: &WriteContext, resources: &[CloudResource]) -> Result<usize, StoreError> {
        self.modify(&write.account_id, |inv| inv.upsert(write, resources))
    }

    fn delete(
        &self,
        write: &WriteContext,
        resource_type: ResourceType,
        cloud_ids: &[CloudId],
    ) -> Result<usize, StoreError> {
        self.modify(&write.account_id, |inv| inv.delete(write, resource_type, cloud_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn write(fence: u64) -> WriteContext {
        WriteContext {
            account_id: AccountId::from("acct-1"),
            vendor: Vendor::TCloud,
            fence,
        }
    }

    fn region(id: &str) -> CloudResource {
        CloudResource::new(ResourceType::Region, id).with_name(id)
    }

    fn exercise(store: &dyn ResourceStore) {
        store
            .upsert(&write(1), &[region("r1"), region("r2"), region("r3")])
            .expect("upsert");
        let filter = StoreFilter::new(AccountId::from("acct-1"), ResourceType::Region);
        assert_eq!(store.count(&filter).unwrap(), 3);

        let first = store.list(&filter, Page::first(2)).unwrap();
        assert_eq!(first.len(), 2);
        let second = store.list(&filter, Page::first(2).next()).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].resource.cloud_id, CloudId::from("r3"));

        let id_before = first[0].id.clone();
        store
            .upsert(&write(2), &[region("r1").with_attribute("state", "ok")])
            .unwrap();
        let r1 = store
            .list(&filter.clone().with_cloud_ids([CloudId::from("r1")]), Page::first(10))
            .unwrap();
        assert_eq!(r1[0].id, id_before, "local id survives updates");
        assert_eq!(r1[0].resource.attributes.get("state").map(String::as_str), Some("ok"));

        let removed = store
            .delete(&write(2), ResourceType::Region, &[CloudId::from("r2")])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(&filter).unwrap(), 2);

        let other = StoreFilter::new(AccountId::from("acct-2"), ResourceType::Region);
        assert_eq!(store.count(&other).unwrap(), 0);
    }

    #[rstest]
    #[case::memory(false)]
    #[case::file(true)]
    fn store_contract(#[case] on_disk: bool) {
        let home = TempDir::new().unwrap();
        if on_disk {
            exercise(&FileStore::at_home(home.path()));
        } else {
            exercise(&MemoryStore::new());
        }
    }

    #[test]
    fn stale_fence_is_rejected() {
        let store = MemoryStore::new();
        store.upsert(&write(5), &[region("r1")]).unwrap();
        let err = store.upsert(&write(4), &[region("r2")]).unwrap_err();
        assert!(matches!(err, StoreError::StaleFence { token: 4, latest: 5, .. }));
        let err = store
            .delete(&write(3), ResourceType::Region, &[CloudId::from("r1")])
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleFence { .. }));
    }

    #[test]
    fn file_store_survives_reopen() {
        let home = TempDir::new().unwrap();
        FileStore::at_home(home.path())
            .upsert(&write(1), &[region("r1")])
            .unwrap();
        let reopened = FileStore::at_home(home.path());
        let filter = StoreFilter::new(AccountId::from("acct-1"), ResourceType::Region);
        assert_eq!(reopened.count(&filter).unwrap(), 1);
        let err = reopened.upsert(&write(0), &[region("r2")]).unwrap_err();
        assert!(matches!(err, StoreError::StaleFence { .. }), "fence persists");
        assert!(!reopened
            .path_for(&AccountId::from("acct-1"))
            .with_extension("json.tmp")
            .exists());
    }

    #[test]
    fn scope_filter_matches_region_or_group() {
        let store = MemoryStore::new();
        store
            .upsert(
                &write(1),
                &[
                    CloudResource::new(ResourceType::Vpc, "vpc-1").in_region("r1"),
                    CloudResource::new(ResourceType::Vpc, "vpc-2").in_region("r2"),
                ],
            )
            .unwrap();
        let filter = StoreFilter::new(AccountId::from("acct-1"), ResourceType::Vpc)
            .in_scope(ScopeKind::Region, "r2");
        let rows = list_all(&store, &filter, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].resource.cloud_id, CloudId::from("vpc-2"));
    }
}
