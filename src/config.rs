//! Master configuration, loaded from TOML.
//!
//! ```toml
//! [chunks]
//! chunk_size = "64 MiB"
//! replication_factor = 3
//!
//! [heartbeat]
//! interval_ms = 5000
//! liveness_window_ms = 30000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use crate::error::ConfigError;
use crate::logging::LoggingConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub chunks: ChunkConfig,
    pub heartbeat: HeartbeatConfig,
    pub namespace: NamespaceConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Human readable size, e.g. "64 MiB".
    pub chunk_size: String,
    pub replication_factor: usize,
    pub lease_duration_ms: u64,
    /// Chunkserver address -> failure domain (rack, zone). Unlisted servers have no domain.
    pub failure_domains: BTreeMap<String, String>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            chunk_size: "64 MiB".to_string(),
            replication_factor: 3,
            lease_duration_ms: 60_000,
            failure_domains: BTreeMap::new(),
        }
    }
}

impl ChunkConfig {
    pub fn chunk_size_bytes(&self) -> Result<u64, ConfigError> {
        let size = Byte::parse_str(&self.chunk_size, true)
            .map_err(|e| ConfigError::Invalid(format!("chunk_size {:?}: {e}", self.chunk_size)))?;
        Ok(size.as_u64())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// A chunkserver is dead once its last successful heartbeat is older than this.
    pub liveness_window_ms: u64,
    pub probe_timeout_ms: u64,
    /// Attempts to delete a chunk from its holders before purging it regardless.
    pub deletion_retry_budget: u32,
    pub max_backoff_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_ms: 5_000,
            liveness_window_ms: 30_000,
            probe_timeout_ms: 2_000,
            deletion_retry_budget: 5,
            max_backoff_ms: 60_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// List whole subtrees instead of immediate children.
    pub recursive_listing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub oplog_path: PathBuf,
    pub checkpoint_path: PathBuf,
    /// Oplog entries appended between automatic checkpoints. 0 disables them.
    pub checkpoint_every: u64,
    /// fsync every oplog append.
    pub sync: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            oplog_path: PathBuf::from("master.oplog"),
            checkpoint_path: PathBuf::from("master.checkpoint"),
            checkpoint_every: 1_000,
            sync: true,
        }
    }
}

impl MasterConfig {
    pub fn from_toml_str(s: &str) -> Result<MasterConfig, ConfigError> {
        let config: MasterConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<MasterConfig, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        MasterConfig::from_toml_str(&contents)
    }

    /// Config rooted in `dir`: oplog and checkpoint live inside it.
    pub fn in_dir(dir: impl AsRef<Path>) -> MasterConfig {
        let dir = dir.as_ref();
        let mut config = MasterConfig::default();
        config.persistence.oplog_path = dir.join("master.oplog");
        config.persistence.checkpoint_path = dir.join("master.checkpoint");
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunks.chunk_size_bytes()? == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.chunks.replication_factor == 0 {
            return Err(ConfigError::Invalid("replication_factor must be positive".into()));
        }
        if self.chunks.lease_duration_ms == 0 {
            return Err(ConfigError::Invalid("lease_duration_ms must be positive".into()));
        }
        let hb = &self.heartbeat;
        if hb.interval_ms == 0 || hb.probe_timeout_ms == 0 {
            let reason = "heartbeat interval and probe timeout must be positive";
            return Err(ConfigError::Invalid(reason.into()));
        }
        if hb.liveness_window_ms < hb.interval_ms {
            return Err(ConfigError::Invalid(format!(
                "liveness_window_ms ({}) is shorter than the heartbeat interval ({})",
                hb.liveness_window_ms, hb.interval_ms
            )));
        }
        if self.persistence.oplog_path == self.persistence.checkpoint_path {
            return Err(ConfigError::Invalid("oplog and checkpoint paths must differ".into()));
        }
        Ok(())
    }
}
