//! # cloudsync-sync
//!
//! Account resource synchronization engine.
//!
//! [`SyncEngine::sync_account`] reconciles every supported resource type of
//! an account under its lock. [`SyncEngine::start_conditional`] validates a
//! scoped request, takes the lock and reconciles one resource type in the
//! background. [`SyncEngine::query_status`] reports the latest outcome per
//! resource type.

pub mod cloud;
pub mod error;
pub mod executor;
pub mod funcs;
pub mod lease_file;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod status;
pub mod store;
pub mod validator;

pub use error::{ErrorClass, LockError, StepFailure, StoreError, SyncError};
pub use executor::SyncTicket;
pub use funcs::{SyncContext, SyncFn, SyncFuncRegistry};
pub use lock::{LockGuard, LockManager};
pub use orchestrator::{FullSyncReport, StepReport};
pub use pipeline::{SyncEngine, SyncEngineBuilder};
pub use reconcile::SyncStats;
pub use validator::{ConditionalScope, ConditionalSyncRequest, SyncScope};
