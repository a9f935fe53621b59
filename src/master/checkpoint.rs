//! Full-state checkpoints that bound oplog replay.
//!
//! File layout: a `sha256:<hex>` header line followed by the JSON body. Written to
//! a sibling temp file, fsynced and renamed into place.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use crate::error::CheckpointError;
use crate::master::chunk_manager::ChunkTableSnapshot;
use crate::master::namespace::NamespaceSnapshot;

const DIGEST_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Sequence number of the last oplog entry reflected in this state.
    pub seq: u64,
    pub client_id: u64,
    pub namespace: NamespaceSnapshot,
    pub chunks: ChunkTableSnapshot,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn write(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let body = serde_json::to_vec(checkpoint)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{DIGEST_PREFIX}{}", sha256_hex(&body))?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        // Persist the rename itself. Not every platform lets a directory be opened.
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    info!(path = %path.display(), seq = checkpoint.seq, "wrote checkpoint");
    Ok(())
}

/// Load the checkpoint at `path`, or `None` if there isn't one.
pub fn load(path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| CheckpointError::Corrupt("missing digest header".into()))?;
    let header = std::str::from_utf8(&bytes[..newline])
        .map_err(|_| CheckpointError::Corrupt("digest header is not utf-8".into()))?;
    let expected = header
        .strip_prefix(DIGEST_PREFIX)
        .ok_or_else(|| CheckpointError::Corrupt(format!("unexpected header {header:?}")))?;

    let body = &bytes[newline + 1..];
    let actual = sha256_hex(body);
    if actual != expected {
        let reason = format!("digest mismatch: expected {expected}, got {actual}");
        return Err(CheckpointError::Corrupt(reason));
    }

    let checkpoint: Checkpoint = serde_json::from_slice(body)?;
    info!(path = %path.display(), seq = checkpoint.seq, "loaded checkpoint");
    Ok(Some(checkpoint))
}
