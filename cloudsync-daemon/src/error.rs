use std::path::PathBuf;

use thiserror::Error;

use cloudsync_sync::ErrorClass;

/// Error surface for daemon runtime and protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry error: {0}")]
    Registry(#[from] cloudsync_core::RegistryError),

    #[error("sync error: {0}")]
    Sync(#[from] cloudsync_sync::SyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon answered but refused the request.
    #[error("{message}")]
    Rejected {
        class: Option<ErrorClass>,
        message: String,
    },

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

impl DaemonError {
    /// The classification the daemon attached to a refused request.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            DaemonError::Rejected { class, .. } => *class,
            DaemonError::Sync(err) => Some(err.class()),
            _ => None,
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
