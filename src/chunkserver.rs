use std::collections::{BTreeMap, HashMap};
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use crate::common::*;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("chunkserver {0} is unreachable")]
    Unreachable(ServerAddr),
    #[error("chunkserver {addr} rejected request: {reason}")]
    Rejected { addr: ServerAddr, reason: String },
}

/// The master's view of a chunkserver. Transport bindings implement this;
/// every call may block on the network and is made without master locks held.
#[async_trait]
pub trait ChunkserverClient: Send + Sync {
    /// Liveness probe. A live chunkserver answers with its current inventory.
    async fn heartbeat(&self, addr: &str) -> Result<Vec<ReportedChunk>, ProbeError>;

    /// Full inventory, used once at startup to rebuild confirmed locations.
    async fn list_chunks(&self, addr: &str) -> Result<Vec<ReportedChunk>, ProbeError>;

    /// Remove replicas of deleted (or unknown) chunks.
    async fn delete_chunks(&self, addr: &str, handles: &[ChunkHandle]) -> Result<(), ProbeError>;

    /// Ask `source` to copy `handle` to `target`. The target reports the new replica itself.
    async fn replicate_chunk(
        &self,
        source: &str,
        target: &str,
        handle: ChunkHandle,
    ) -> Result<(), ProbeError>;
}

struct SimNode {
    online: bool,
    chunks: BTreeMap<ChunkHandle, u64>,
}

/// In-process stand-in for the chunkserver fleet.
pub struct NetworkShim {
    nodes: Mutex<HashMap<ServerAddr, SimNode>>,
}

impl Default for NetworkShim {
    fn default() -> Self {
        NetworkShim::new()
    }
}

impl NetworkShim {
    pub fn new() -> NetworkShim {
        NetworkShim {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_node(&self, addr: &str) {
        self.nodes.lock().entry(addr.to_string()).or_insert(SimNode {
            online: true,
            chunks: BTreeMap::new(),
        });
    }

    pub fn set_online(&self, addr: &str, online: bool) {
        if let Some(node) = self.nodes.lock().get_mut(addr) {
            node.online = online;
        }
    }

    /// Record that `addr` holds `length` bytes of `handle`, as after a client write.
    pub fn store_chunk(&self, addr: &str, handle: ChunkHandle, length: u64) {
        if let Some(node) = self.nodes.lock().get_mut(addr) {
            node.chunks.insert(handle, length);
        }
    }

    pub fn chunks(&self, addr: &str) -> Vec<ChunkHandle> {
        self.nodes
            .lock()
            .get(addr)
            .map(|node| node.chunks.keys().copied().collect())
            .unwrap_or_default()
    }

    fn inventory(&self, addr: &str) -> Result<Vec<ReportedChunk>, ProbeError> {
        let nodes = self.nodes.lock();
        match nodes.get(addr) {
            Some(node) if node.online => Ok(node
                .chunks
                .iter()
                .map(|(handle, length)| ReportedChunk { handle: *handle, length: *length })
                .collect()),
            _ => Err(ProbeError::Unreachable(addr.to_string())),
        }
    }
}

#[async_trait]
impl ChunkserverClient for NetworkShim {
    async fn heartbeat(&self, addr: &str) -> Result<Vec<ReportedChunk>, ProbeError> {
        self.inventory(addr)
    }

    async fn list_chunks(&self, addr: &str) -> Result<Vec<ReportedChunk>, ProbeError> {
        self.inventory(addr)
    }

    async fn delete_chunks(&self, addr: &str, handles: &[ChunkHandle]) -> Result<(), ProbeError> {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(addr) {
            Some(node) if node.online => {
                for handle in handles {
                    node.chunks.remove(handle);
                }
                Ok(())
            }
            _ => Err(ProbeError::Unreachable(addr.to_string())),
        }
    }

    async fn replicate_chunk(
        &self,
        source: &str,
        target: &str,
        handle: ChunkHandle,
    ) -> Result<(), ProbeError> {
        let mut nodes = self.nodes.lock();
        let length = match nodes.get(source) {
            Some(node) if node.online => {
                node.chunks.get(&handle).copied().ok_or_else(|| ProbeError::Rejected {
                    addr: source.to_string(),
                    reason: format!("no replica of chunk {handle}"),
                })?
            }
            _ => return Err(ProbeError::Unreachable(source.to_string())),
        };
        match nodes.get_mut(target) {
            Some(node) if node.online => {
                node.chunks.insert(handle, length);
                Ok(())
            }
            _ => Err(ProbeError::Unreachable(target.to_string())),
        }
    }
}
