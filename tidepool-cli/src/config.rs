//! Server configuration file loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage_path: PathBuf,
    /// Start a brand-new cluster instead of joining one.
    pub start_cluster: bool,
    pub seed: Option<SeedConfig>,
    pub replication_factor: u64,
    pub partitions: u64,
    pub capacity: u64,
    pub merkle_depth: u8,
    pub sync_period_ms: u64,
    pub sync_max_sessions: usize,
    pub sync_path_limit: u32,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9090,
            storage_path: PathBuf::from("tidepool-data/node.redb"),
            start_cluster: false,
            seed: None,
            replication_factor: 3,
            partitions: 64,
            capacity: 1,
            merkle_depth: 10,
            sync_period_ms: tidepool_sync::MIN_SYNC_PERIOD_MS,
            sync_max_sessions: tidepool_sync::DEFAULT_SYNC_MAX_SESSIONS,
            sync_path_limit: tidepool_sync::DEFAULT_SYNC_PATH_LIMIT,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("unable to read config file {}: {e}", path.display()))?;
        let config: ServerConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config file {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.replication_factor == 0 {
            anyhow::bail!("replication_factor must be at least 1");
        }
        if !self.partitions.is_power_of_two() {
            anyhow::bail!("partitions must be a power of two");
        }
        if self.start_cluster && self.seed.is_some() {
            anyhow::bail!("start_cluster and seed are mutually exclusive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        std::fs::write(&path, r#"{"start_cluster": true, "partitions": 32}"#).unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert!(config.start_cluster);
        assert_eq!(config.partitions, 32);
        assert_eq!(config.replication_factor, 3);
    }

    #[test]
    fn rejects_bad_partition_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        std::fs::write(&path, r#"{"partitions": 40}"#).unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }

    #[test]
    fn rejects_seed_with_start_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        std::fs::write(
            &path,
            r#"{"start_cluster": true, "seed": {"host": "peer", "port": 9090}}"#,
        )
        .unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }
}
