use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use serde::{Serialize, Deserialize};

/// Globally unique identifier of a chunk. Allocated monotonically, never reused.
pub type ChunkHandle = u64;

/// Address of a chunkserver, e.g. `http://10.0.0.1:9000`.
pub type ServerAddr = String;

/// Milliseconds since the UNIX epoch.
pub type Timestamp = u64;

/// Reverse mapping of a chunk handle onto the file that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathIndex {
    pub path: String,
    pub index: u64,
}

/// Result of a chunk allocation: the new handle and the intended replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub handle: ChunkHandle,
    pub locations: Vec<ServerAddr>,
}

/// Primary-writer grant for a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub handle: ChunkHandle,
    pub primary: ServerAddr,
    pub expiration: Timestamp,
}

impl Lease {
    pub fn is_active(&self, now: Timestamp) -> bool {
        now < self.expiration
    }
}

/// A chunk as reported by a chunkserver (inventory or heartbeat).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedChunk {
    pub handle: ChunkHandle,
    /// Number of defined bytes in the chunk.
    pub length: u64,
}

/// Source of wall-clock time. Leases and liveness compare against it.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Used by tests and simulations.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> ManualClock {
        ManualClock { now: AtomicU64::new(start) }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
