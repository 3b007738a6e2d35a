//! Sync daemon runtime: socket server, periodic full sync and signal
//! handling around a shared [`cloudsync_sync::SyncEngine`].

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_status, request_stop, request_sync_account, request_sync_resource,
    request_sync_status, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking, AccountCache};
