//! Operator configuration, stored as `portal.json` in the data directory.
//! Relative paths are resolved against that directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::paths::config_path;

pub const DEFAULT_PRODUCT_NAME: &str = "Institute Portal";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PortalConfig {
    pub store_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub operator: String,
    pub product_name: String,
    pub client_id: String,
    pub event_log_max_bytes: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("store"),
            cache_dir: PathBuf::from("cache"),
            log_dir: PathBuf::from("logs"),
            backup_dir: PathBuf::from("backups"),
            operator: "admin".into(),
            product_name: DEFAULT_PRODUCT_NAME.into(),
            client_id: String::new(),
            event_log_max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl PortalConfig {
    /// Load `portal.json` from `data_dir`, creating it with defaults and a
    /// fresh client id on first use.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let path = config_path(data_dir);
        let exists = path.exists();
        let mut config = if exists {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str::<PortalConfig>(&raw)
                .with_context(|| format!("parse {}", path.display()))?
        } else {
            PortalConfig::default()
        };

        let missing_id = config.client_id.trim().is_empty();
        if missing_id {
            config.client_id = Uuid::new_v4().to_string();
        }
        if missing_id || !exists {
            config.save(data_dir)?;
        }
        config.resolve(data_dir);
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(config_path(data_dir), json)?;
        Ok(())
    }

    fn resolve(&mut self, data_dir: &Path) {
        for dir in [
            &mut self.store_dir,
            &mut self.cache_dir,
            &mut self.log_dir,
            &mut self.backup_dir,
        ] {
            if dir.is_relative() {
                *dir = data_dir.join(&*dir);
            }
        }
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.log_dir.join("events.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_load_writes_client_id() {
        let dir = tempdir().unwrap();
        let first = PortalConfig::load_or_create(dir.path()).unwrap();
        assert!(!first.client_id.is_empty());
        assert_eq!(first.store_dir, dir.path().join("store"));

        let second = PortalConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(first.client_id, second.client_id);
    }

    #[test]
    fn absolute_paths_are_kept() {
        let dir = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let config = PortalConfig {
            store_dir: elsewhere.path().to_path_buf(),
            operator: "registrar".into(),
            client_id: "web-01".into(),
            ..PortalConfig::default()
        };
        config.save(dir.path()).unwrap();
        let loaded = PortalConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded.store_dir, elsewhere.path());
        assert_eq!(loaded.operator, "registrar");
        assert_eq!(loaded.client_id, "web-01");
        assert_eq!(loaded.cache_dir, dir.path().join("cache"));
    }
}
