//! Sync function registry: which reconciliation runs for each
//! `(vendor, resource type)` pair.
//!
//! The built-in table is assembled once from per-vendor support lists.
//! Every entry is a plain function pointer, so lookups are cheap and the
//! registry can be shared read-only across threads.

use std::collections::HashMap;

use cloudsync_core::types::{Account, ResourceType, Vendor};

use crate::cloud::CloudClient;
use crate::error::SyncError;
use crate::reconcile::{reconcile, SyncStats};
use crate::store::{ResourceStore, WriteContext};
use crate::validator::SyncScope;

/// Everything a sync function needs besides the cloud client and scope.
pub struct SyncContext<'a> {
    /// Request id threaded through every log line of one run.
    pub rid: &'a str,
    pub account: &'a Account,
    pub store: &'a dyn ResourceStore,
    /// Fencing token of the account lock this run holds.
    pub fence: u64,
    pub page_limit: usize,
}

impl SyncContext<'_> {
    pub fn write_context(&self) -> WriteContext {
        WriteContext {
            account_id: self.account.id.clone(),
            vendor: self.account.vendor,
            fence: self.fence,
        }
    }
}

pub type SyncFn =
    fn(&SyncContext<'_>, &dyn CloudClient, &SyncScope) -> Result<SyncStats, SyncError>;

macro_rules! sync_fns {
    ($($name:ident => $resource_type:ident),+ $(,)?) => {
        $(
            fn $name(
                ctx: &SyncContext<'_>,
                cloud: &dyn CloudClient,
                scope: &SyncScope,
            ) -> Result<SyncStats, SyncError> {
                reconcile(ctx, cloud, scope, ResourceType::$resource_type)
            }
        )+

        fn builtin_fn(resource_type: ResourceType) -> SyncFn {
            match resource_type {
                $(ResourceType::$resource_type => $name,)+
            }
        }
    };
}

sync_fns! {
    sync_region => Region,
    sync_zone => Zone,
    sync_resource_group => ResourceGroup,
    sync_image => Image,
    sync_vpc => Vpc,
    sync_subnet => Subnet,
    sync_route_table => RouteTable,
    sync_route => Route,
    sync_security_group => SecurityGroup,
    sync_security_group_rule => SecurityGroupRule,
    sync_firewall => Firewall,
    sync_disk => Disk,
    sync_cvm => Cvm,
    sync_network_interface => NetworkInterface,
    sync_eip => Eip,
    sync_sub_account => SubAccount,
    sync_cert => Cert,
    sync_load_balancer => LoadBalancer,
    sync_argument_template => ArgumentTemplate,
}

/// Resource types each vendor can reconcile.
fn vendor_support(vendor: Vendor) -> &'static [ResourceType] {
    use ResourceType::*;
    match vendor {
        Vendor::TCloud => &[
            Region, Zone, Image, Vpc, Subnet, RouteTable, Route, SecurityGroup,
            SecurityGroupRule, Disk, Cvm, Eip, SubAccount, Cert, LoadBalancer,
            ArgumentTemplate,
        ],
        Vendor::Aws => &[
            Region, Zone, Image, Vpc, Subnet, RouteTable, Route, SecurityGroup,
            SecurityGroupRule, Disk, Cvm, Eip,
        ],
        Vendor::HuaWei => &[
            Region, Zone, Image, Vpc, Subnet, RouteTable, Route, SecurityGroup,
            SecurityGroupRule, Disk, Cvm, NetworkInterface, Eip, SubAccount,
        ],
        Vendor::Gcp => &[
            Region, Zone, Image, Vpc, Subnet, Firewall, Disk, Cvm, NetworkInterface, Eip,
        ],
        Vendor::Azure => &[
            Region, ResourceGroup, Image, Vpc, Subnet, RouteTable, Route, SecurityGroup,
            SecurityGroupRule, Disk, Cvm, NetworkInterface, Eip, SubAccount,
        ],
    }
}

#[derive(Clone, Default)]
pub struct SyncFuncRegistry {
    funcs: HashMap<(Vendor, ResourceType), SyncFn>,
}

impl SyncFuncRegistry {
    /// A registry with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The full built-in table for every vendor.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for &vendor in Vendor::all() {
            for &resource_type in vendor_support(vendor) {
                registry.register(vendor, resource_type, builtin_fn(resource_type));
            }
        }
        registry
    }

    /// Add or replace an entry.
    pub fn register(&mut self, vendor: Vendor, resource_type: ResourceType, func: SyncFn) -> &mut Self {
        self.funcs.insert((vendor, resource_type), func);
        self
    }

    pub fn get(&self, vendor: Vendor, resource_type: ResourceType) -> Option<SyncFn> {
        self.funcs.get(&(vendor, resource_type)).copied()
    }

    /// Like [`Self::get`] but fails with `UnsupportedResource`.
    pub fn require(&self, vendor: Vendor, resource_type: ResourceType) -> Result<SyncFn, SyncError> {
        self.get(vendor, resource_type)
            .ok_or(SyncError::UnsupportedResource {
                vendor,
                resource_type,
            })
    }

    pub fn supports(&self, vendor: Vendor, resource_type: ResourceType) -> bool {
        self.funcs.contains_key(&(vendor, resource_type))
    }

    /// Supported types for `vendor`, in declaration order.
    pub fn supported(&self, vendor: Vendor) -> Vec<ResourceType> {
        ResourceType::all()
            .iter()
            .copied()
            .filter(|rt| self.supports(vendor, *rt))
            .collect()
    }
}
