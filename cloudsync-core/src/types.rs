//! Domain types for cloud account synchronization.
//!
//! All types are serializable/deserializable via serde + serde_yaml so they can
//! live in the account registry, the inventory files and the daemon protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed identifier for a cloud account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The provider-side identifier of a resource (`vpc-1a2b`, `/subscriptions/...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudId(pub String);

impl fmt::Display for CloudId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CloudId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CloudId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Error returned when parsing a [`Vendor`] or [`ResourceType`] from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown {} '{}'; expected one of: {}",
            self.kind, self.value, self.expected
        )
    }
}

impl std::error::Error for ParseEnumError {}

/// Cloud provider an account belongs to. Fixed for the lifetime of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    TCloud,
    Aws,
    HuaWei,
    Gcp,
    Azure,
}

impl Vendor {
    pub fn all() -> &'static [Vendor] {
        &[
            Vendor::TCloud,
            Vendor::Aws,
            Vendor::HuaWei,
            Vendor::Gcp,
            Vendor::Azure,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::TCloud => "tcloud",
            Vendor::Aws => "aws",
            Vendor::HuaWei => "huawei",
            Vendor::Gcp => "gcp",
            Vendor::Azure => "azure",
        }
    }

    /// What a conditional scope is keyed by for this vendor.
    pub fn scope_kind(&self) -> ScopeKind {
        match self {
            Vendor::Azure => ScopeKind::ResourceGroup,
            _ => ScopeKind::Region,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcloud" => Ok(Vendor::TCloud),
            "aws" => Ok(Vendor::Aws),
            "huawei" => Ok(Vendor::HuaWei),
            "gcp" => Ok(Vendor::Gcp),
            "azure" => Ok(Vendor::Azure),
            other => Err(ParseEnumError {
                kind: "vendor",
                value: other.to_string(),
                expected: "tcloud, aws, huawei, gcp, azure",
            }),
        }
    }
}

/// The key a conditional sync scope is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Region,
    ResourceGroup,
}

impl ScopeKind {
    /// The resource type whose local records back this scope kind.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ScopeKind::Region => ResourceType::Region,
            ScopeKind::ResourceGroup => ResourceType::ResourceGroup,
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKind::Region => f.write_str("region"),
            ScopeKind::ResourceGroup => f.write_str("resource group"),
        }
    }
}

/// A class of cloud resource. Each one has its own reconciliation function
/// per vendor (where the vendor offers it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Region,
    Zone,
    ResourceGroup,
    Image,
    Vpc,
    Subnet,
    RouteTable,
    Route,
    SecurityGroup,
    SecurityGroupRule,
    Firewall,
    Disk,
    Cvm,
    NetworkInterface,
    Eip,
    SubAccount,
    Cert,
    LoadBalancer,
    ArgumentTemplate,
}

const RESOURCE_TYPE_NAMES: &str = "region, zone, resource_group, image, vpc, subnet, \
route_table, route, security_group, security_group_rule, firewall, disk, cvm, \
network_interface, eip, sub_account, cert, load_balancer, argument_template";

impl ResourceType {
    pub fn all() -> &'static [ResourceType] {
        &[
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
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Region => "region",
            ResourceType::Zone => "zone",
            ResourceType::ResourceGroup => "resource_group",
            ResourceType::Image => "image",
            ResourceType::Vpc => "vpc",
            ResourceType::Subnet => "subnet",
            ResourceType::RouteTable => "route_table",
            ResourceType::Route => "route",
            ResourceType::SecurityGroup => "security_group",
            ResourceType::SecurityGroupRule => "security_group_rule",
            ResourceType::Firewall => "firewall",
            ResourceType::Disk => "disk",
            ResourceType::Cvm => "cvm",
            ResourceType::NetworkInterface => "network_interface",
            ResourceType::Eip => "eip",
            ResourceType::SubAccount => "sub_account",
            ResourceType::Cert => "cert",
            ResourceType::LoadBalancer => "load_balancer",
            ResourceType::ArgumentTemplate => "argument_template",
        }
    }

    /// Vendor-shared reference data that no single account owns.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            ResourceType::Region | ResourceType::Zone | ResourceType::Image
        )
    }

    /// Types that conditional scopes are resolved against.
    pub fn is_scope_key(&self) -> bool {
        matches!(self, ResourceType::Region | ResourceType::ResourceGroup)
    }

    /// The type a record of this type must reference, if any.
    pub fn parent(&self) -> Option<ResourceType> {
        match self {
            ResourceType::Subnet | ResourceType::RouteTable => Some(ResourceType::Vpc),
            ResourceType::Route => Some(ResourceType::RouteTable),
            ResourceType::SecurityGroupRule => Some(ResourceType::SecurityGroup),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase().replace('-', "_");
        ResourceType::all()
            .iter()
            .copied()
            .find(|rt| rt.as_str() == wanted)
            .ok_or_else(|| ParseEnumError {
                kind: "resource type",
                value: s.to_string(),
                expected: RESOURCE_TYPE_NAMES,
            })
    }
}

/// State of a single reconciliation attempt.
///
/// `Pending → Running → {Succeeded | Failed}`. Nothing moves a `Failed`
/// outcome forward except a new, separately triggered sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Running => write!(f, "running"),
            SyncStatus::Succeeded => write!(f, "succeeded"),
            SyncStatus::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A cloud account under management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub vendor: Vendor,
    #[serde(default)]
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One provider-side resource, in the shape both the cloud clients and the
/// datastore exchange.
///
/// `attributes` are opaque; the per-type field mapping lives with the
/// datastore, so reconciliation only compares them for change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudResource {
    pub cloud_id: CloudId,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_cloud_id: Option<CloudId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl CloudResource {
    pub fn new(resource_type: ResourceType, cloud_id: impl Into<CloudId>) -> Self {
        Self {
            cloud_id: cloud_id.into(),
            resource_type,
            name: String::new(),
            region: None,
            resource_group: None,
            parent_cloud_id: None,
            tags: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn in_resource_group(mut self, group: impl Into<String>) -> Self {
        self.resource_group = Some(group.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<CloudId>) -> Self {
        self.parent_cloud_id = Some(parent.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The value this resource carries for a scope kind (its region or group).
    pub fn scope_value(&self, kind: ScopeKind) -> Option<&str> {
        match kind {
            ScopeKind::Region => self.region.as_deref(),
            ScopeKind::ResourceGroup => self.resource_group.as_deref(),
        }
    }

    /// True when every `(key, value)` in `filters` is present on this resource.
    /// An empty value list for a key matches any value of that key.
    pub fn matches_tags(&self, filters: &BTreeMap<String, Vec<String>>) -> bool {
        filters.iter().all(|(key, values)| match self.tags.get(key) {
            Some(actual) => values.is_empty() || values.iter().any(|v| v == actual),
            None => false,
        })
    }
}

/// The last recorded reconciliation attempt for one account, vendor and
/// resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub account_id: AccountId,
    pub vendor: Vendor,
    pub resource_type: ResourceType,
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl SyncOutcome {
    pub fn running(account_id: AccountId, vendor: Vendor, resource_type: ResourceType) -> Self {
        Self {
            account_id,
            vendor,
            resource_type,
            status: SyncStatus::Running,
            failed_reason: None,
            started_at: Some(Utc::now()),
            end_time: None,
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.status = SyncStatus::Succeeded;
        self.failed_reason = None;
        self.end_time = Some(Utc::now());
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.status = SyncStatus::Failed;
        self.failed_reason = Some(if reason.is_empty() {
            "unknown error".to_string()
        } else {
            reason
        });
        self.end_time = Some(Utc::now());
        self
    }

    /// The wire shape reported by the status query.
    pub fn report(&self) -> OutcomeReport {
        OutcomeReport {
            res_name: self.resource_type,
            res_status: self.status,
            res_failed_reason: self.failed_reason.clone().unwrap_or_default(),
            res_end_time: self.end_time,
        }
    }
}

/// Status-query row: `{res_name, res_status, res_failed_reason, res_end_time}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub res_name: ResourceType,
    pub res_status: SyncStatus,
    pub res_failed_reason: String,
    pub res_end_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(AccountId::from("acct-1").to_string(), "acct-1");
        assert_eq!(CloudId::from("vpc-1").to_string(), "vpc-1");
    }

    #[test]
    fn vendor_parse_and_display_agree() {
        for vendor in Vendor::all() {
            let parsed: Vendor = vendor.to_string().parse().expect("parse");
            assert_eq!(parsed, *vendor);
        }
        assert_eq!("HuaWei".parse::<Vendor>().unwrap(), Vendor::HuaWei);
        assert!("openstack".parse::<Vendor>().is_err());
    }

    #[test]
    fn resource_type_accepts_dashes() {
        assert_eq!(
            "security-group-rule".parse::<ResourceType>().unwrap(),
            ResourceType::SecurityGroupRule
        );
        let err = "bucket".parse::<ResourceType>().unwrap_err();
        assert!(err.to_string().contains("unknown resource type 'bucket'"));
    }

    #[test]
    fn azure_is_keyed_by_resource_group() {
        assert_eq!(Vendor::Azure.scope_kind(), ScopeKind::ResourceGroup);
        assert_eq!(Vendor::Aws.scope_kind(), ScopeKind::Region);
    }

    #[test]
    fn tag_filter_matching() {
        let res = CloudResource::new(ResourceType::Cvm, "ins-1")
            .with_tag("env", "prod")
            .with_tag("team", "infra");

        let mut filters = BTreeMap::new();
        filters.insert("env".to_string(), vec!["prod".to_string(), "staging".to_string()]);
        assert!(res.matches_tags(&filters));

        filters.insert("team".to_string(), vec![]);
        assert!(res.matches_tags(&filters));

        filters.insert("owner".to_string(), vec![]);
        assert!(!res.matches_tags(&filters));
    }

    #[test]
    fn failed_outcome_always_has_reason() {
        let outcome = SyncOutcome::running(AccountId::from("a"), Vendor::Aws, ResourceType::Vpc)
            .failed("");
        assert_eq!(outcome.status, SyncStatus::Failed);
        assert_eq!(outcome.failed_reason.as_deref(), Some("unknown error"));
        assert!(outcome.end_time.is_some());
    }

    #[test]
    fn outcome_report_serializes_wire_names() {
        let outcome =
            SyncOutcome::running(AccountId::from("a"), Vendor::Gcp, ResourceType::Subnet).succeeded();
        let yaml = serde_yaml::to_string(&outcome.report()).expect("serialize");
        assert!(yaml.contains("res_name: subnet"));
        assert!(yaml.contains("res_status: succeeded"));
    }
}
