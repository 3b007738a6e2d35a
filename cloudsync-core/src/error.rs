//! Error types for cloudsync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{AccountId, Vendor};

/// All errors that can arise from registry and configuration operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load — includes file path and line context from serde_yaml.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None` — cannot locate `~/.cloudsync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The account YAML file did not exist at the expected path.
    #[error("account not found at {path}")]
    AccountNotFound { path: PathBuf },

    /// An account's vendor is immutable once registered.
    #[error("account {account} is registered as {existing}; cannot re-register as {requested}")]
    VendorChange {
        account: AccountId,
        existing: Vendor,
        requested: Vendor,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
