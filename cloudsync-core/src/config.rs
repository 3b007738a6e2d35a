//! Engine configuration at `<home>/.cloudsync/config.yaml`.
//!
//! Every field has a serde default, so a missing file or a partial file both
//! load cleanly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::registry::{home, root_at, set_file_permissions};

/// Whether a full-account sync also refreshes vendor-shared reference data
/// (regions, zones, images).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PublicResourcePolicy {
    /// Include them only when the datastore has none of a kind yet.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of per-account lock keys.
    pub lock_namespace: String,
    pub lock_ttl_secs: u64,
    /// Cap on regions (or resource groups) in one conditional sync.
    pub max_regions: usize,
    pub max_cloud_ids: usize,
    pub max_tag_filters: usize,
    /// Page size for datastore and cloud listings.
    pub page_limit: usize,
    /// Daemon-driven periodic full sync; `0` disables it.
    pub full_sync_interval_secs: u64,
    pub sync_public_resource: PublicResourcePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_namespace: "/cloudsync/sync/account/".to_string(),
            lock_ttl_secs: 30 * 60,
            max_regions: 5,
            max_cloud_ids: 20,
            max_tag_filters: 10,
            page_limit: 500,
            full_sync_interval_secs: 0,
            sync_public_resource: PublicResourcePolicy::Auto,
        }
    }
}

impl EngineConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn full_sync_interval(&self) -> Option<Duration> {
        (self.full_sync_interval_secs > 0).then(|| Duration::from_secs(self.full_sync_interval_secs))
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let checks = [
            (self.lock_ttl_secs == 0, "lock_ttl_secs must be greater than zero"),
            (self.max_regions == 0, "max_regions must be greater than zero"),
            (self.max_cloud_ids == 0, "max_cloud_ids must be greater than zero"),
            (self.max_tag_filters == 0, "max_tag_filters must be greater than zero"),
            (self.page_limit == 0, "page_limit must be greater than zero"),
        ];
        if let Some((_, message)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(RegistryError::InvalidConfig((*message).to_string()));
        }
        if self.lock_namespace.trim().is_empty() {
            return Err(RegistryError::InvalidConfig(
                "lock_namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<home>/.cloudsync/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_at(home).join("config.yaml")
}

/// Load and validate the engine configuration; defaults if the file is absent.
pub fn load_at(home: &Path) -> Result<EngineConfig, RegistryError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: EngineConfig = if contents.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })?
    };
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<EngineConfig, RegistryError> {
    load_at(&home()?)
}

/// Atomically save `config` (validated first).
pub fn save_at(home: &Path, config: &EngineConfig) -> Result<(), RegistryError> {
    config.validate()?;
    let path = config_path_at(home);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_file_name("config.yaml.tmp");
    std::fs::write(&tmp, serde_yaml::to_string(config)?)?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("tempdir");
        let config = load_at(home.path()).expect("load");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_regions, 5);
        assert_eq!(config.max_cloud_ids, 20);
        assert!(config.full_sync_interval().is_none());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let home = TempDir::new().expect("tempdir");
        let path = config_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "lock_ttl_secs: 60\nsync_public_resource: never\n").unwrap();

        let config = load_at(home.path()).expect("load");
        assert_eq!(config.lock_ttl(), Duration::from_secs(60));
        assert_eq!(config.sync_public_resource, PublicResourcePolicy::Never);
        assert_eq!(config.page_limit, 500);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let config = EngineConfig {
            lock_ttl_secs: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock_ttl_secs"));
    }

    #[test]
    fn save_then_load_roundtrip() {
        let home = TempDir::new().expect("tempdir");
        let config = EngineConfig {
            full_sync_interval_secs: 3600,
            ..EngineConfig::default()
        };
        save_at(home.path(), &config).expect("save");
        assert_eq!(load_at(home.path()).expect("load"), config);
    }
}
