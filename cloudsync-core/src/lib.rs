//! cloudsync core library — domain types, account registry, engine config, errors.
//!
//! - [`types`] — newtypes, vendor / resource-type enums and records
//! - [`error`] — [`RegistryError`]
//! - [`registry`] — account load / save / register
//! - [`config`] — [`EngineConfig`] with serde defaults

pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use config::{EngineConfig, PublicResourcePolicy};
pub use error::RegistryError;
pub use types::{
    Account, AccountId, CloudId, CloudResource, OutcomeReport, ResourceType, ScopeKind,
    SyncOutcome, SyncStatus, Vendor,
};
