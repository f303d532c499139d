//! beacon.toml configuration.

use std::path::{Path, PathBuf};

use beacon_state::StoreConfig;
use serde::{Deserialize, Serialize};

const DB_FILE: &str = "beacon.redb";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Directory holding the database file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/beacon")
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
        }
    }
}

impl BeaconConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: BeaconConfig = toml::from_str(content)?;
        config.store.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = BeaconConfig::from_toml("").unwrap();
        assert_eq!(config, BeaconConfig::default());
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/beacon/beacon.redb"));
    }

    #[test]
    fn store_section_overrides_defaults() {
        let config = BeaconConfig::from_toml(
            r#"
data_dir = "/tmp/beacon"

[store]
tombstone_ttl = "20m"
session_ttl_multiplier = 3
"#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/beacon"));
        assert_eq!(config.store.tombstone_ttl, "20m");
        assert_eq!(config.store.session_ttl_multiplier, 3);
        assert_eq!(config.store.max_query_time, StoreConfig::default().max_query_time);
    }

    #[test]
    fn unsafe_tombstone_ttl_is_rejected() {
        let err = BeaconConfig::from_toml(
            r#"
[store]
tombstone_ttl = "1m"
max_query_time = "10m"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tombstone_ttl"));
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        let config = BeaconConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(BeaconConfig::from_file(&path).unwrap(), config);
    }
}
