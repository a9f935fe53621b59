use crate::common::ChunkHandle;
use thiserror::Error;

/// Errors returned to callers of the master. None of them are process-fatal.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("chunk {index} of {path} is already allocated")]
    DuplicateChunk { path: String, index: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("no live replica available for chunk {0}")]
    NoReplicasAvailable(ChunkHandle),

    /// A report or request referencing state that no longer exists.
    #[error("stale request: {0}")]
    Stale(String),

    #[error(transparent)]
    Oplog(#[from] OplogError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, MasterError>;

/// Durable-write failures. A mutation that hits one of these is never acknowledged.
#[derive(Debug, Error)]
pub enum OplogError {
    #[error("oplog io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("oplog entry encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("oplog corrupt at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("checkpoint corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
