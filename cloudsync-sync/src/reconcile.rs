//! Generic cloud-to-datastore reconciliation for one resource type.
//!
//! Each pass lists the cloud and the datastore over the same scope, diffs
//! the two by cloud id and applies deletes, creates and updates in that
//! order. Deletions are confirmed against the cloud before they are applied.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::AddAssign;

use serde::Serialize;

use cloudsync_core::types::{CloudId, CloudResource, ResourceType, ScopeKind};

use crate::cloud::{self, CloudClient, ListOption};
use crate::error::SyncError;
use crate::funcs::SyncContext;
use crate::store::{self, StoreFilter, StoredResource};
use crate::validator::SyncScope;

/// Per-type change counts from one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl AddAssign for SyncStats {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
        self.deleted += rhs.deleted;
    }
}

/// What the datastore must do to match the cloud.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub add: Vec<CloudResource>,
    pub update: Vec<CloudResource>,
    pub delete: Vec<CloudId>,
}

/// Compare a cloud listing with the local records of the same scope.
pub fn diff(cloud: Vec<CloudResource>, local: Vec<StoredResource>) -> Diff {
    let mut local_by_id: HashMap<CloudId, CloudResource> = local
        .into_iter()
        .map(|r| (r.resource.cloud_id.clone(), r.resource))
        .collect();
    let mut seen = HashSet::new();
    let mut out = Diff::default();

    for item in cloud {
        if !seen.insert(item.cloud_id.clone()) {
            continue;
        }
        match local_by_id.remove(&item.cloud_id) {
            Some(existing) if existing == item => {}
            Some(_) => out.update.push(item),
            None => out.add.push(item),
        }
    }
    out.delete = local_by_id.into_keys().collect();
    out.delete.sort();
    out
}

/// One listing unit: a single scope value (or the whole account).
struct Partition<'a> {
    scope: Option<(ScopeKind, &'a str)>,
    cloud_ids: &'a [CloudId],
    tag_filters: &'a BTreeMap<String, Vec<String>>,
}

impl Partition<'_> {
    fn list_option(&self, limit: usize) -> ListOption {
        let mut opt = ListOption {
            limit,
            ..ListOption::default()
        };
        match self.scope {
            Some((ScopeKind::Region, value)) => opt.region = Some(value.to_string()),
            Some((ScopeKind::ResourceGroup, value)) => opt.resource_group = Some(value.to_string()),
            None => {}
        }
        opt
    }
}

/// Reconcile `resource_type` across every partition of `scope`.
pub fn reconcile(
    ctx: &SyncContext<'_>,
    cloud: &dyn CloudClient,
    scope: &SyncScope,
    resource_type: ResourceType,
) -> Result<SyncStats, SyncError> {
    static NO_TAGS: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let partitions: Vec<Partition<'_>> = match scope {
        SyncScope::Full => vec![Partition {
            scope: None,
            cloud_ids: &[],
            tag_filters: &NO_TAGS,
        }],
        SyncScope::Conditional(cond) => cond
            .values
            .iter()
            .map(|value| Partition {
                scope: Some((cond.kind, value.as_str())),
                cloud_ids: &cond.cloud_ids,
                tag_filters: &cond.tag_filters,
            })
            .collect(),
    };

    let mut stats = SyncStats::default();
    for partition in &partitions {
        stats += reconcile_partition(ctx, cloud, resource_type, partition)?;
    }
    Ok(stats)
}

fn reconcile_partition(
    ctx: &SyncContext<'_>,
    cloud: &dyn CloudClient,
    resource_type: ResourceType,
    part: &Partition<'_>,
) -> Result<SyncStats, SyncError> {
    let mut opt = part.list_option(ctx.page_limit);
    opt.cloud_ids = part.cloud_ids.to_vec();
    opt.tag_filters = part.tag_filters.clone();
    let cloud_items = cloud::list_all(cloud, resource_type, &opt)?;

    let mut filter = StoreFilter::new(ctx.account.id.clone(), resource_type)
        .with_cloud_ids(part.cloud_ids.iter().cloned());
    if let Some((kind, value)) = part.scope {
        filter = filter.in_scope(kind, value);
    }
    let mut local = store::list_all(ctx.store, &filter, ctx.page_limit)?;
    if !part.tag_filters.is_empty() {
        local.retain(|r| r.resource.matches_tags(part.tag_filters));
    }

    let mut plan = diff(cloud_items, local);
    if !plan.delete.is_empty() {
        verify_deletes(ctx, cloud, resource_type, part, &mut plan)?;
    }

    let write = ctx.write_context();
    let mut stats = SyncStats::default();
    if !plan.delete.is_empty() {
        stats.deleted = ctx.store.delete(&write, resource_type, &plan.delete)?;
    }
    if !plan.add.is_empty() {
        check_parents(ctx, resource_type, &plan.add)?;
        ctx.store.upsert(&write, &plan.add)?;
        stats.created = plan.add.len();
    }
    if !plan.update.is_empty() {
        ctx.store.upsert(&write, &plan.update)?;
        stats.updated = plan.update.len();
    }

    tracing::info!(
        rid = ctx.rid,
        vendor = %ctx.account.vendor,
        account = %ctx.account.id,
        resource_type = %resource_type,
        scope = part.scope.map(|(_, v)| v).unwrap_or("*"),
        created = stats.created,
        updated = stats.updated,
        deleted = stats.deleted,
        "reconciled"
    );
    Ok(stats)
}

/// Re-list the delete candidates by id. Anything the cloud still returns
/// either left a tag selection (and is refreshed instead) or signals an
/// inconsistent listing (and aborts the pass).
fn verify_deletes(
    ctx: &SyncContext<'_>,
    cloud: &dyn CloudClient,
    resource_type: ResourceType,
    part: &Partition<'_>,
    plan: &mut Diff,
) -> Result<(), SyncError> {
    let mut opt = part.list_option(ctx.page_limit);
    opt.cloud_ids = plan.delete.clone();
    let still_present = cloud::list_all(cloud, resource_type, &opt)?;
    if still_present.is_empty() {
        return Ok(());
    }

    if part.tag_filters.is_empty() {
        let mut ids: Vec<CloudId> = still_present.into_iter().map(|r| r.cloud_id).collect();
        ids.sort();
        return Err(SyncError::DeleteVerification {
            resource_type,
            still_present: ids,
        });
    }

    let present: HashSet<&CloudId> = still_present.iter().map(|r| &r.cloud_id).collect();
    plan.delete.retain(|id| !present.contains(id));
    plan.update.extend(still_present.iter().cloned());
    Ok(())
}

/// Creates of a child type need their parent record already synced.
fn check_parents(
    ctx: &SyncContext<'_>,
    resource_type: ResourceType,
    adds: &[CloudResource],
) -> Result<(), SyncError> {
    let Some(parent) = resource_type.parent() else {
        return Ok(());
    };
    let wanted: HashSet<CloudId> = adds.iter().filter_map(|r| r.parent_cloud_id.clone()).collect();
    let filter = StoreFilter::new(ctx.account.id.clone(), parent).with_cloud_ids(wanted);
    let found: HashSet<CloudId> = if filter.cloud_ids.is_empty() {
        HashSet::new()
    } else {
        store::list_all(ctx.store, &filter, ctx.page_limit)?
            .into_iter()
            .map(|r| r.resource.cloud_id)
            .collect()
    };

    let orphan = adds
        .iter()
        .find(|r| r.parent_cloud_id.as_ref().map_or(true, |p| !found.contains(p)));
    match orphan {
        Some(r) => Err(SyncError::ParentMissing {
            resource_type,
            cloud_id: r.cloud_id.clone(),
            parent,
            parent_cloud_id: r
                .parent_cloud_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "<none>".to_string()),
        }),
        None => Ok(()),
    }
}
