//! Conditional sync requests: structural rules, then an existence check of
//! the requested regions or resource groups against the datastore.
//!
//! Neither step touches the account lock, so a malformed or unknown scope
//! is rejected before anything is started.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use cloudsync_core::config::EngineConfig;
use cloudsync_core::types::{AccountId, CloudId, ScopeKind};

use crate::error::SyncError;
use crate::store::{Page, ResourceStore, StoreFilter};

/// A caller's request to reconcile part of one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionalSyncRequest {
    pub regions: Vec<String>,
    pub resource_group_names: Vec<String>,
    pub cloud_ids: Vec<CloudId>,
    pub tag_filters: BTreeMap<String, Vec<String>>,
}

/// A request after validation: deduplicated and confirmed to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionalScope {
    pub kind: ScopeKind,
    pub values: Vec<String>,
    pub cloud_ids: Vec<CloudId>,
    pub tag_filters: BTreeMap<String, Vec<String>>,
}

/// What a sync function reconciles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// Everything the account owns of the type.
    Full,
    Conditional(ConditionalScope),
}

/// Upper bounds on a conditional request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeLimits {
    pub max_scope_values: usize,
    pub max_cloud_ids: usize,
    pub max_tag_filters: usize,
}

impl From<&EngineConfig> for ScopeLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_scope_values: config.max_regions,
            max_cloud_ids: config.max_cloud_ids,
            max_tag_filters: config.max_tag_filters,
        }
    }
}

impl Default for ScopeLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::Validation(message.into())
}

/// Trim, drop duplicates, keep first-seen order. Blank entries are an error.
fn dedup_values(field: &str, values: &[String]) -> Result<Vec<String>, SyncError> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for value in values {
        let value = value.trim();
        if value.is_empty() {
            return Err(invalid(format!("{field} must not contain empty values")));
        }
        if seen.insert(value.to_string()) {
            out.push(value.to_string());
        }
    }
    Ok(out)
}

impl ConditionalSyncRequest {
    /// Apply the structural rules for a vendor keyed by `kind`.
    pub fn check_structure(
        &self,
        kind: ScopeKind,
        limits: &ScopeLimits,
    ) -> Result<ConditionalScope, SyncError> {
        let (field, values, other_field, other) = match kind {
            ScopeKind::Region => (
                "regions",
                &self.regions,
                "resource_group_names",
                &self.resource_group_names,
            ),
            ScopeKind::ResourceGroup => (
                "resource_group_names",
                &self.resource_group_names,
                "regions",
                &self.regions,
            ),
        };
        if !other.is_empty() {
            return Err(invalid(format!(
                "{other_field} is not accepted here; this vendor is scoped by {kind}"
            )));
        }

        let values = dedup_values(field, values)?;
        if values.is_empty() {
            return Err(invalid(format!("{field} is required")));
        }
        if values.len() > limits.max_scope_values {
            return Err(invalid(format!(
                "{field} count {} exceeds the maximum of {}",
                values.len(),
                limits.max_scope_values
            )));
        }

        let id_strings: Vec<String> = self.cloud_ids.iter().map(|id| id.0.clone()).collect();
        let cloud_ids: Vec<CloudId> = dedup_values("cloud_ids", &id_strings)?
            .into_iter()
            .map(CloudId::from)
            .collect();
        if !cloud_ids.is_empty() && values.len() != 1 {
            return Err(invalid(format!(
                "cloud_ids can only be used with exactly one {kind}"
            )));
        }
        if cloud_ids.len() > limits.max_cloud_ids {
            return Err(invalid(format!(
                "cloud_ids count {} exceeds the maximum of {}",
                cloud_ids.len(),
                limits.max_cloud_ids
            )));
        }

        if self.tag_filters.len() > limits.max_tag_filters {
            return Err(invalid(format!(
                "tag_filters count {} exceeds the maximum of {}",
                self.tag_filters.len(),
                limits.max_tag_filters
            )));
        }
        if self.tag_filters.keys().any(|k| k.trim().is_empty()) {
            return Err(invalid("tag_filters keys must not be empty"));
        }

        Ok(ConditionalScope {
            kind,
            values,
            cloud_ids,
            tag_filters: self.tag_filters.clone(),
        })
    }
}

/// Confirm every scope value exists for `account`, paging through the
/// datastore. Regions match by cloud id, resource groups by name.
pub fn check_existence(
    store: &dyn ResourceStore,
    account: &AccountId,
    scope: &ConditionalScope,
    page_limit: usize,
) -> Result<(), SyncError> {
    let base = StoreFilter::new(account.clone(), scope.kind.resource_type());
    let filter = match scope.kind {
        ScopeKind::Region => base.with_cloud_ids(scope.values.iter().cloned().map(CloudId::from)),
        ScopeKind::ResourceGroup => base.with_names(scope.values.iter().cloned()),
    };

    let mut found = BTreeSet::new();
    let mut page = Page::first(page_limit.max(1));
    loop {
        let batch = store.list(&filter, page)?;
        let done = batch.len() < page.limit;
        for record in batch {
            let key = match scope.kind {
                ScopeKind::Region => record.resource.cloud_id.0,
                ScopeKind::ResourceGroup => record.resource.name,
            };
            found.insert(key);
        }
        if done {
            break;
        }
        page = page.next();
    }

    if found.len() != scope.values.len() {
        let missing: Vec<String> = scope
            .values
            .iter()
            .filter(|v| !found.contains(*v))
            .cloned()
            .collect();
        return Err(SyncError::ScopeMismatch {
            kind: scope.kind,
            requested: scope.values.len(),
            found: found.len(),
            missing,
        });
    }
    Ok(())
}

/// Structural rules followed by the existence check.
pub fn validate(
    store: &dyn ResourceStore,
    account: &AccountId,
    kind: ScopeKind,
    request: &ConditionalSyncRequest,
    limits: &ScopeLimits,
    page_limit: usize,
) -> Result<ConditionalScope, SyncError> {
    let scope = request.check_structure(kind, limits)?;
    check_existence(store, account, &scope, page_limit)?;
    Ok(scope)
}
