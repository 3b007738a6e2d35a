//! Vendor cloud clients.
//!
//! The engine only needs one capability from a provider: paginated listing
//! of a resource type, optionally narrowed to a region or resource group,
//! a set of cloud ids, or tag filters. [`StaticCloud`] implements it over an
//! in-memory inventory, loaded from `~/.cloudsync/cloud/<account>.yaml` by
//! [`FixtureConnector`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cloudsync_core::types::{Account, AccountId, CloudId, CloudResource, ResourceType, Vendor};

use crate::error::CloudError;

/// Narrowing options for one cloud listing call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOption {
    pub region: Option<String>,
    pub resource_group: Option<String>,
    pub cloud_ids: Vec<CloudId>,
    pub tag_filters: BTreeMap<String, Vec<String>>,
    pub page_token: Option<String>,
    /// Page size; `0` lets the client choose.
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub items: Vec<CloudResource>,
    pub next_token: Option<String>,
}

pub trait CloudClient: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn list(&self, resource_type: ResourceType, opt: &ListOption) -> Result<ListPage, CloudError>;
}

/// Builds a client bound to one account's credentials.
pub trait CloudConnector: Send + Sync {
    fn connect(&self, account: &Account) -> Result<Arc<dyn CloudClient>, CloudError>;
}

/// Follow page tokens until the listing is exhausted.
pub fn list_all(
    client: &dyn CloudClient,
    resource_type: ResourceType,
    opt: &ListOption,
) -> Result<Vec<CloudResource>, CloudError> {
    let mut opt = opt.clone();
    opt.page_token = None;
    let mut items = Vec::new();
    loop {
        let page = client.list(resource_type, &opt)?;
        items.extend(page.items);
        match page.next_token {
            Some(token) => opt.page_token = Some(token),
            None => return Ok(items),
        }
    }
}

// ---------------------------------------------------------------------------
// StaticCloud
// ---------------------------------------------------------------------------

/// On-disk shape of a cloud inventory file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudSnapshot {
    #[serde(default)]
    pub resources: Vec<CloudResource>,
    /// Resource types whose listing fails with the given message.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<ResourceType, String>,
}

/// A provider whose inventory is held in memory.
pub struct StaticCloud {
    vendor: Vendor,
    resources: RwLock<Vec<CloudResource>>,
    failures: RwLock<HashMap<ResourceType, String>>,
    latency: RwLock<Duration>,
}

impl StaticCloud {
    pub fn new(vendor: Vendor) -> Self {
        Self {
            vendor,
            resources: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
            latency: RwLock::new(Duration::ZERO),
        }
    }

    pub fn from_snapshot(vendor: Vendor, snapshot: CloudSnapshot) -> Self {
        let cloud = Self::new(vendor);
        cloud.replace(snapshot.resources);
        for (resource_type, message) in snapshot.failures {
            cloud.fail(resource_type, message);
        }
        cloud
    }

    pub fn with_resources(self, resources: impl IntoIterator<Item = CloudResource>) -> Self {
        for resource in resources {
            self.insert(resource);
        }
        self
    }

    /// Insert or replace (by type and cloud id).
    pub fn insert(&self, resource: CloudResource) {
        let mut all = write_lock(&self.resources);
        all.retain(|r| !(r.resource_type == resource.resource_type && r.cloud_id == resource.cloud_id));
        all.push(resource);
    }

    pub fn remove(&self, resource_type: ResourceType, cloud_id: &CloudId) {
        write_lock(&self.resources)
            .retain(|r| !(r.resource_type == resource_type && &r.cloud_id == cloud_id));
    }

    pub fn replace(&self, resources: Vec<CloudResource>) {
        *write_lock(&self.resources) = resources;
    }

    /// Make every listing of `resource_type` fail until [`Self::recover`].
    pub fn fail(&self, resource_type: ResourceType, message: impl Into<String>) {
        write_lock(&self.failures).insert(resource_type, message.into());
    }

    pub fn recover(&self, resource_type: ResourceType) {
        write_lock(&self.failures).remove(&resource_type);
    }

    /// Delay applied to every listing call.
    pub fn set_latency(&self, latency: Duration) {
        *write_lock(&self.latency) = latency;
    }

    fn matches(resource: &CloudResource, resource_type: ResourceType, opt: &ListOption) -> bool {
        resource.resource_type == resource_type
            && opt
                .region
                .as_deref()
                .map_or(true, |r| resource.region.as_deref() == Some(r))
            && opt
                .resource_group
                .as_deref()
                .map_or(true, |g| resource.resource_group.as_deref() == Some(g))
            && (opt.cloud_ids.is_empty() || opt.cloud_ids.contains(&resource.cloud_id))
            && resource.matches_tags(&opt.tag_filters)
    }
}

impl CloudClient for StaticCloud {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn list(&self, resource_type: ResourceType, opt: &ListOption) -> Result<ListPage, CloudError> {
        let latency = *read_lock(&self.latency);
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if let Some(message) = read_lock(&self.failures).get(&resource_type) {
            return Err(CloudError::Api {
                vendor: self.vendor,
                resource_type,
                message: message.clone(),
            });
        }

        let offset = match opt.page_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| CloudError::InvalidPageToken(token.to_string()))?,
            None => 0,
        };
        let mut matched: Vec<CloudResource> = read_lock(&self.resources)
            .iter()
            .filter(|r| Self::matches(r, resource_type, opt))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.cloud_id.cmp(&b.cloud_id));

        let limit = if opt.limit == 0 { matched.len().max(1) } else { opt.limit };
        let end = (offset + limit).min(matched.len());
        let items = matched.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_token = (end < matched.len()).then(|| end.to_string());
        Ok(ListPage { items, next_token })
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// `<home>/.cloudsync/cloud/`
pub fn cloud_dir_at(home: &Path) -> PathBuf {
    home.join(".cloudsync").join("cloud")
}

/// Reads each account's inventory from `<root>/<account>.yaml` on every
/// connect, so edits show up on the next sync.
pub struct FixtureConnector {
    root: PathBuf,
}

impl FixtureConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn at_home(home: &Path) -> Self {
        Self::new(cloud_dir_at(home))
    }

    pub fn snapshot_path(&self, account: &AccountId) -> PathBuf {
        self.root.join(format!("{account}.yaml"))
    }
}

impl CloudConnector for FixtureConnector {
    fn connect(&self, account: &Account) -> Result<Arc<dyn CloudClient>, CloudError> {
        let path = self.snapshot_path(&account.id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CloudError::NotConfigured(account.id.clone()))
            }
            Err(e) => {
                return Err(CloudError::Fixture {
                    path,
                    message: e.to_string(),
                })
            }
        };
        let snapshot: CloudSnapshot = serde_yaml::from_str(&contents).map_err(|e| CloudError::Fixture {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(Arc::new(StaticCloud::from_snapshot(account.vendor, snapshot)))
    }
}

/// Hands out pre-built clients by account id.
#[derive(Default)]
pub struct StaticConnector {
    clouds: RwLock<HashMap<AccountId, Arc<StaticCloud>>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: AccountId, cloud: Arc<StaticCloud>) {
        write_lock(&self.clouds).insert(account, cloud);
    }
}

impl CloudConnector for StaticConnector {
    fn connect(&self, account: &Account) -> Result<Arc<dyn CloudClient>, CloudError> {
        read_lock(&self.clouds)
            .get(&account.id)
            .map(|cloud| Arc::clone(cloud) as Arc<dyn CloudClient>)
            .ok_or_else(|| CloudError::NotConfigured(account.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vpc(id: &str, region: &str) -> CloudResource {
        CloudResource::new(ResourceType::Vpc, id).in_region(region)
    }

    #[test]
    fn list_all_follows_page_tokens() {
        let cloud = StaticCloud::new(Vendor::Aws)
            .with_resources((0..7).map(|i| vpc(&format!("vpc-{i}"), "r1")));
        let opt = ListOption {
            limit: 3,
            ..ListOption::default()
        };
        let first = cloud.list(ResourceType::Vpc, &opt).unwrap();
        assert_eq!(first.items.len(), 3);
        assert_eq!(first.next_token.as_deref(), Some("3"));

        let all = list_all(&cloud, ResourceType::Vpc, &opt).unwrap();
        assert_eq!(all.len(), 7);
    }

    #[test]
    fn list_narrows_by_region_ids_and_tags() {
        let cloud = StaticCloud::new(Vendor::Aws).with_resources([
            vpc("vpc-1", "r1").with_tag("env", "prod"),
            vpc("vpc-2", "r1"),
            vpc("vpc-3", "r2").with_tag("env", "prod"),
        ]);
        let mut opt = ListOption {
            region: Some("r1".into()),
            ..ListOption::default()
        };
        assert_eq!(list_all(&cloud, ResourceType::Vpc, &opt).unwrap().len(), 2);

        opt.tag_filters.insert("env".into(), vec!["prod".into()]);
        let tagged = list_all(&cloud, ResourceType::Vpc, &opt).unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].cloud_id, CloudId::from("vpc-1"));

        let by_id = ListOption {
            cloud_ids: vec![CloudId::from("vpc-3")],
            ..ListOption::default()
        };
        assert_eq!(list_all(&cloud, ResourceType::Vpc, &by_id).unwrap().len(), 1);
    }

    #[test]
    fn injected_failure_surfaces_as_api_error() {
        let cloud = StaticCloud::new(Vendor::Gcp);
        cloud.fail(ResourceType::Disk, "quota exceeded");
        let err = cloud.list(ResourceType::Disk, &ListOption::default()).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        cloud.recover(ResourceType::Disk);
        assert!(cloud.list(ResourceType::Disk, &ListOption::default()).is_ok());
    }

    #[test]
    fn fixture_connector_reads_account_inventory() {
        let home = TempDir::new().unwrap();
        let connector = FixtureConnector::at_home(home.path());
        let account = Account {
            id: AccountId::from("acct-1"),
            vendor: Vendor::TCloud,
            name: "acct-1".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(matches!(
            connector.connect(&account),
            Err(CloudError::NotConfigured(_))
        ));

        std::fs::create_dir_all(cloud_dir_at(home.path())).unwrap();
        std::fs::write(
            connector.snapshot_path(&account.id),
            "resources:\n  - cloud_id: ap-guangzhou\n    resource_type: region\n",
        )
        .unwrap();
        let client = connector.connect(&account).expect("connect");
        assert_eq!(client.vendor(), Vendor::TCloud);
        let regions = list_all(client.as_ref(), ResourceType::Region, &ListOption::default()).unwrap();
        assert_eq!(regions.len(), 1);
    }
}
