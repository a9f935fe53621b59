//! Chunk identity, placement, leases and chunkserver liveness.
//!
//! All chunk-level state lives in one `ChunkTable` behind a single mutex. It is held
//! only for read-modify-write sections and never across a chunkserver call: network
//! work happens before taking it (probes) or after releasing it (deletes, copies).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use crate::chunkserver::{ChunkserverClient, ProbeError};
use crate::common::*;
use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::master::oplog::{Action, Journal, Oplog};

#[derive(Debug, Clone)]
pub struct ChunkSettings {
    pub replication_factor: usize,
    pub lease_duration_ms: u64,
    pub liveness_window_ms: u64,
    pub heartbeat_interval: Duration,
    pub probe_timeout: Duration,
    pub deletion_retry_budget: u32,
    pub max_backoff_ms: u64,
    pub failure_domains: BTreeMap<ServerAddr, String>,
}

impl ChunkSettings {
    pub fn from_config(config: &MasterConfig) -> ChunkSettings {
        ChunkSettings {
            replication_factor: config.chunks.replication_factor,
            lease_duration_ms: config.chunks.lease_duration_ms,
            liveness_window_ms: config.heartbeat.liveness_window_ms,
            heartbeat_interval: config.heartbeat.interval(),
            probe_timeout: config.heartbeat.probe_timeout(),
            deletion_retry_budget: config.heartbeat.deletion_retry_budget,
            max_backoff_ms: config.heartbeat.max_backoff_ms,
            failure_domains: config.chunks.failure_domains.clone(),
        }
    }

    fn backoff_ms(&self, attempts: u32) -> u64 {
        let base = self.heartbeat_interval.as_millis() as u64;
        base.saturating_mul(1u64 << attempts.min(32)).min(self.max_backoff_ms)
    }
}

impl Default for ChunkSettings {
    fn default() -> Self {
        ChunkSettings::from_config(&MasterConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Handle assigned, no confirmed live replica.
    Allocated,
    PartiallyReplicated,
    FullyReplicated,
    /// Dropped below target after having reached it.
    UnderReplicated,
    PendingDeletion,
}

/// Instruction to copy a chunk onto a new replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replication {
    pub handle: ChunkHandle,
    pub source: ServerAddr,
    pub target: ServerAddr,
}

/// What one heartbeat tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeatReport {
    pub responsive: Vec<ServerAddr>,
    pub dead: Vec<ServerAddr>,
    pub replications: Vec<Replication>,
    pub purged: Vec<ChunkHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub handle: ChunkHandle,
    pub path: String,
    pub index: u64,
    pub intended: Vec<ServerAddr>,
    pub replication: usize,
    pub lease: Option<Lease>,
    pub deleted: bool,
}

/// Durable part of the chunk table. Confirmed locations are deliberately absent:
/// they are rebuilt from chunkserver inventories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTableSnapshot {
    pub next_handle: ChunkHandle,
    pub chunks: Vec<ChunkRecord>,
    pub chunkservers: Vec<ServerAddr>,
}

struct ChunkMeta {
    path_index: PathIndex,
    intended: Vec<ServerAddr>,
    locations: BTreeSet<ServerAddr>,
    replication: usize,
    lease: Option<Lease>,
    deleted: bool,
    reached_target: bool,
    /// When the intended replicas were chosen. Unconfirmed ones are given up
    /// one liveness window later.
    allocated_at: Timestamp,
    /// Replica copies in flight: target -> time scheduled.
    pending_replicas: BTreeMap<ServerAddr, Timestamp>,
}

struct ChunkserverRecord {
    addr: ServerAddr,
    last_heartbeat: Timestamp,
    /// Set once the liveness window lapsed and its locations were dropped.
    dead: bool,
    chunks: BTreeSet<ChunkHandle>,
    intended: BTreeSet<ChunkHandle>,
    domain: Option<String>,
}

impl ChunkserverRecord {
    fn is_live(&self, now: Timestamp, window: u64) -> bool {
        !self.dead && now.saturating_sub(self.last_heartbeat) <= window
    }

    fn load(&self) -> usize {
        self.chunks.len() + self.intended.len()
    }
}

#[derive(Default)]
struct PendingDeletion {
    attempts: u32,
    retry_at: Timestamp,
}

struct ChunkTable {
    next_handle: ChunkHandle,
    files: HashMap<String, BTreeMap<u64, ChunkHandle>>,
    chunks: HashMap<ChunkHandle, ChunkMeta>,
    servers: BTreeMap<ServerAddr, ChunkserverRecord>,
    deletions: BTreeMap<ChunkHandle, PendingDeletion>,
    /// Replicas reported for handles the master does not know.
    orphans: BTreeMap<ServerAddr, BTreeSet<ChunkHandle>>,
}

impl ChunkTable {
    fn new() -> ChunkTable {
        ChunkTable {
            next_handle: 1,
            files: HashMap::new(),
            chunks: HashMap::new(),
            servers: BTreeMap::new(),
            deletions: BTreeMap::new(),
            orphans: BTreeMap::new(),
        }
    }

    fn is_live(&self, addr: &str, now: Timestamp, window: u64) -> bool {
        self.servers.get(addr).is_some_and(|r| r.is_live(now, window))
    }

    fn live_locations(&self, meta: &ChunkMeta, now: Timestamp, window: u64) -> usize {
        meta.locations.iter().filter(|a| self.is_live(a, now, window)).count()
    }

    /// Least-loaded live servers not in `exclude`, at most one per failure domain
    /// until domains run out.
    fn place(
        &self,
        count: usize,
        exclude: &BTreeSet<ServerAddr>,
        now: Timestamp,
        window: u64,
    ) -> Vec<ServerAddr> {
        let mut candidates: Vec<&ChunkserverRecord> = self
            .servers
            .values()
            .filter(|r| r.is_live(now, window) && !exclude.contains(&r.addr))
            .collect();
        candidates.sort_by(|a, b| a.load().cmp(&b.load()).then_with(|| a.addr.cmp(&b.addr)));

        let mut used_domains: HashSet<&str> = exclude
            .iter()
            .filter_map(|addr| self.servers.get(addr).and_then(|r| r.domain.as_deref()))
            .collect();
        let mut chosen: Vec<ServerAddr> = Vec::with_capacity(count);

        for record in &candidates {
            if chosen.len() == count {
                break;
            }
            if let Some(domain) = record.domain.as_deref() {
                if !used_domains.insert(domain) {
                    continue;
                }
            }
            chosen.push(record.addr.clone());
        }
        for record in &candidates {
            if chosen.len() == count {
                break;
            }
            if !chosen.contains(&record.addr) {
                chosen.push(record.addr.clone());
            }
        }
        chosen
    }

    fn insert_chunk(
        &mut self,
        path: &str,
        index: u64,
        handle: ChunkHandle,
        intended: Vec<ServerAddr>,
        replication: usize,
        now: Timestamp,
    ) {
        self.next_handle = self.next_handle.max(handle + 1);
        self.files.entry(path.to_string()).or_default().insert(index, handle);
        for addr in &intended {
            if let Some(record) = self.servers.get_mut(addr) {
                record.intended.insert(handle);
            }
        }
        self.chunks.insert(
            handle,
            ChunkMeta {
                path_index: PathIndex { path: path.to_string(), index },
                intended,
                locations: BTreeSet::new(),
                replication,
                lease: None,
                deleted: false,
                reached_target: false,
                allocated_at: now,
                pending_replicas: BTreeMap::new(),
            },
        );
    }

    /// Add `addr` as a confirmed holder of `handle`. Deleted chunks still track
    /// holders so garbage collection knows whom to ask.
    fn add_holder(&mut self, handle: ChunkHandle, addr: &str) -> bool {
        let Some(meta) = self.chunks.get_mut(&handle) else {
            return false;
        };
        meta.locations.insert(addr.to_string());
        meta.pending_replicas.remove(addr);
        if meta.locations.len() >= meta.replication {
            meta.reached_target = true;
        }
        if let Some(record) = self.servers.get_mut(addr) {
            record.chunks.insert(handle);
            record.intended.remove(&handle);
        }
        true
    }

    /// Make `addr`'s confirmed set match its reported inventory. Returns the
    /// reported lengths of live (non-deleted) chunks.
    fn reconcile_inventory(
        &mut self,
        addr: &str,
        inventory: &[ReportedChunk],
        now: Timestamp,
    ) -> Vec<(PathIndex, u64)> {
        let Some(record) = self.servers.get_mut(addr) else {
            return Vec::new();
        };
        if record.dead {
            info!(chunkserver = addr, "chunkserver is back");
        }
        record.last_heartbeat = now;
        record.dead = false;

        let reported: BTreeSet<ChunkHandle> = inventory.iter().map(|c| c.handle).collect();
        let missing: Vec<ChunkHandle> = record.chunks.difference(&reported).copied().collect();
        for handle in missing {
            record.chunks.remove(&handle);
            if let Some(meta) = self.chunks.get_mut(&handle) {
                meta.locations.remove(addr);
            }
        }

        let mut lengths = Vec::new();
        for chunk in inventory {
            if self.add_holder(chunk.handle, addr) {
                let meta = &self.chunks[&chunk.handle];
                if !meta.deleted {
                    lengths.push((meta.path_index.clone(), chunk.length));
                }
            } else {
                self.orphans.entry(addr.to_string()).or_default().insert(chunk.handle);
            }
        }
        lengths
    }

    /// Mark servers silent for longer than `window` dead and drop their replicas.
    fn expire(&mut self, now: Timestamp, window: u64) -> Vec<ServerAddr> {
        let mut dead = Vec::new();
        for record in self.servers.values_mut() {
            if record.dead || now.saturating_sub(record.last_heartbeat) <= window {
                continue;
            }
            record.dead = true;
            for handle in std::mem::take(&mut record.chunks) {
                if let Some(meta) = self.chunks.get_mut(&handle) {
                    meta.locations.remove(&record.addr);
                }
            }
            for handle in std::mem::take(&mut record.intended) {
                if let Some(meta) = self.chunks.get_mut(&handle) {
                    meta.pending_replicas.remove(&record.addr);
                }
            }
            dead.push(record.addr.clone());
        }
        dead
    }

    fn schedule_replication(&mut self, now: Timestamp, window: u64) -> Vec<Replication> {
        let mut handles: Vec<ChunkHandle> = self.chunks.keys().copied().collect();
        handles.sort_unstable();
        let mut plans = Vec::new();

        for handle in handles {
            let Some(meta) = self.chunks.get_mut(&handle).filter(|meta| !meta.deleted) else {
                continue;
            };
            // Copies that never confirmed within a liveness window are given up.
            let abandoned: Vec<ServerAddr> = meta
                .pending_replicas
                .iter()
                .filter(|(_, at)| now.saturating_sub(**at) > window)
                .map(|(addr, _)| addr.clone())
                .collect();
            for addr in &abandoned {
                meta.pending_replicas.remove(addr);
            }
            // So are initial writes to intended servers that never reported.
            let allocation_lapsed = now.saturating_sub(meta.allocated_at) > window;
            let unconfirmed: Vec<ServerAddr> = if allocation_lapsed {
                meta.intended.iter().filter(|a| !meta.locations.contains(*a)).cloned().collect()
            } else {
                Vec::new()
            };
            for addr in abandoned.iter().chain(&unconfirmed) {
                if let Some(record) = self.servers.get_mut(addr) {
                    record.intended.remove(&handle);
                }
            }

            let meta = &self.chunks[&handle];
            let live: Vec<&ServerAddr> =
                meta.locations.iter().filter(|a| self.is_live(a, now, window)).collect();
            // Intended replicas still inside their initial fill count as present.
            let filling = if meta.reached_target || allocation_lapsed {
                0
            } else {
                meta.intended
                    .iter()
                    .filter(|a| !meta.locations.contains(*a) && self.is_live(a, now, window))
                    .count()
            };
            let present = live.len() + meta.pending_replicas.len() + filling;
            let deficit = meta.replication.saturating_sub(present);
            if deficit == 0 {
                continue;
            }
            let Some(source) = live.first().map(|a| a.to_string()) else {
                if meta.reached_target {
                    error!(chunk = handle, "every replica lost; chunk cannot be re-replicated");
                }
                continue;
            };

            let exclude: BTreeSet<ServerAddr> = meta
                .locations
                .iter()
                .chain(meta.pending_replicas.keys())
                .chain(&meta.intended)
                .cloned()
                .collect();
            let targets = self.place(deficit, &exclude, now, window);
            if targets.is_empty() {
                warn!(chunk = handle, deficit, "under-replicated but no eligible target");
                continue;
            }

            for target in targets {
                if let Some(meta) = self.chunks.get_mut(&handle) {
                    meta.pending_replicas.insert(target.clone(), now);
                }
                if let Some(record) = self.servers.get_mut(&target) {
                    record.intended.insert(handle);
                }
                plans.push(Replication { handle, source: source.clone(), target });
            }
        }
        plans
    }

    fn mark_deleted(&mut self, handle: ChunkHandle) {
        let Some(meta) = self.chunks.get_mut(&handle) else {
            return;
        };
        meta.deleted = true;
        meta.lease = None;
        meta.pending_replicas.clear();
        for record in self.servers.values_mut() {
            record.intended.remove(&handle);
        }
        self.deletions.insert(handle, PendingDeletion::default());
    }

    fn purge(&mut self, handle: ChunkHandle) {
        self.deletions.remove(&handle);
        if let Some(meta) = self.chunks.remove(&handle) {
            let path_index = meta.path_index;
            if let Some(indexes) = self.files.get_mut(&path_index.path) {
                if indexes.get(&path_index.index) == Some(&handle) {
                    indexes.remove(&path_index.index);
                }
            }
        }
        for record in self.servers.values_mut() {
            record.chunks.remove(&handle);
            record.intended.remove(&handle);
        }
    }

    fn register(&mut self, addr: &str, now: Timestamp, domain: Option<String>) {
        let record = self.servers.entry(addr.to_string()).or_insert_with(|| ChunkserverRecord {
            addr: addr.to_string(),
            last_heartbeat: now,
            dead: false,
            chunks: BTreeSet::new(),
            intended: BTreeSet::new(),
            domain: None,
        });
        record.last_heartbeat = now;
        record.dead = false;
        record.domain = domain;
    }
}

pub struct ChunkManager {
    table: Mutex<ChunkTable>,
    settings: ChunkSettings,
    clock: Arc<dyn Clock>,
}

impl ChunkManager {
    pub fn new(settings: ChunkSettings, clock: Arc<dyn Clock>) -> ChunkManager {
        ChunkManager { table: Mutex::new(ChunkTable::new()), settings, clock }
    }

    pub fn from_snapshot(
        snapshot: &ChunkTableSnapshot,
        settings: ChunkSettings,
        clock: Arc<dyn Clock>,
    ) -> ChunkManager {
        let manager = ChunkManager::new(settings, clock);
        {
            let now = manager.clock.now();
            let mut table = manager.table.lock();
            for addr in &snapshot.chunkservers {
                let domain = manager.settings.failure_domains.get(addr).cloned();
                table.register(addr, now, domain);
            }
            for chunk in &snapshot.chunks {
                table.insert_chunk(
                    &chunk.path,
                    chunk.index,
                    chunk.handle,
                    chunk.intended.clone(),
                    chunk.replication,
                    now,
                );
                if let Some(meta) = table.chunks.get_mut(&chunk.handle) {
                    meta.lease = chunk.lease.clone();
                }
                if chunk.deleted {
                    if let Some(indexes) = table.files.get_mut(&chunk.path) {
                        indexes.remove(&chunk.index);
                        if indexes.is_empty() {
                            table.files.remove(&chunk.path);
                        }
                    }
                    table.mark_deleted(chunk.handle);
                }
            }
            table.next_handle = table.next_handle.max(snapshot.next_handle);
        }
        manager
    }

    pub fn settings(&self) -> &ChunkSettings {
        &self.settings
    }

    fn window(&self) -> u64 {
        self.settings.liveness_window_ms
    }

    /// Allocate a handle for chunk `index` of `path` and choose where it should live.
    pub fn add_chunk(&self, path: &str, index: u64, journal: &dyn Journal) -> Result<ChunkInfo> {
        let mut table = self.table.lock();
        if table.files.get(path).is_some_and(|indexes| indexes.contains_key(&index)) {
            return Err(MasterError::DuplicateChunk { path: path.to_string(), index });
        }

        let handle = table.next_handle;
        let now = self.clock.now();
        let replication = self.settings.replication_factor;
        let locations = table.place(replication, &BTreeSet::new(), now, self.window());
        if locations.len() < replication {
            warn!(
                path,
                index,
                wanted = replication,
                got = locations.len(),
                "not enough live chunkservers for full replication"
            );
        }

        journal.record(Action::AddChunk {
            path: path.to_string(),
            index,
            handle,
            locations: locations.clone(),
        })?;
        table.insert_chunk(path, index, handle, locations.clone(), replication, now);
        debug!(path, index, handle, ?locations, "allocated chunk");
        Ok(ChunkInfo { handle, locations })
    }

    pub fn replay_add_chunk(
        &self,
        path: &str,
        index: u64,
        handle: ChunkHandle,
        locations: Vec<ServerAddr>,
    ) -> Result<()> {
        let mut table = self.table.lock();
        let mapped = table.files.get(path).is_some_and(|indexes| indexes.contains_key(&index));
        if mapped || table.chunks.contains_key(&handle) {
            return Err(MasterError::DuplicateChunk { path: path.to_string(), index });
        }
        let replication = self.settings.replication_factor;
        table.insert_chunk(path, index, handle, locations, replication, self.clock.now());
        Ok(())
    }

    /// Confirmed locations (possibly none yet) and the handle of chunk `index` of `path`.
    pub fn find_locations(&self, path: &str, index: u64) -> Result<(Vec<ServerAddr>, ChunkHandle)> {
        let table = self.table.lock();
        let handle = table
            .files
            .get(path)
            .and_then(|indexes| indexes.get(&index))
            .copied()
            .ok_or_else(|| MasterError::NotFound(format!("chunk {index} of {path}")))?;
        let locations = table.chunks[&handle].locations.iter().cloned().collect();
        Ok((locations, handle))
    }

    /// The current lease for `handle`, electing a primary if there is none.
    pub fn find_lease_holder(&self, handle: ChunkHandle, journal: &dyn Journal) -> Result<Lease> {
        let mut table = self.table.lock();
        let now = self.clock.now();
        let meta = table
            .chunks
            .get(&handle)
            .filter(|meta| !meta.deleted)
            .ok_or_else(|| MasterError::NotFound(format!("chunk {handle}")))?;

        if let Some(lease) = meta.lease.as_ref().filter(|lease| lease.is_active(now)) {
            return Ok(lease.clone());
        }

        let primary = meta
            .locations
            .iter()
            .find(|addr| table.is_live(addr, now, self.window()))
            .cloned()
            .ok_or(MasterError::NoReplicasAvailable(handle))?;

        let lease = Lease { handle, primary, expiration: now + self.settings.lease_duration_ms };
        journal.record(Action::GrantLease {
            handle,
            primary: lease.primary.clone(),
            expiration: lease.expiration,
        })?;
        if let Some(meta) = table.chunks.get_mut(&handle) {
            meta.lease = Some(lease.clone());
        }
        info!(
            chunk = handle,
            primary = %lease.primary,
            expiration = lease.expiration,
            "granted lease"
        );
        Ok(lease)
    }

    /// Extend the active lease held by `primary`.
    pub fn renew_lease(
        &self,
        handle: ChunkHandle,
        primary: &str,
        journal: &dyn Journal,
    ) -> Result<Lease> {
        let mut table = self.table.lock();
        let now = self.clock.now();
        let current = table
            .chunks
            .get(&handle)
            .filter(|meta| !meta.deleted)
            .and_then(|meta| meta.lease.clone())
            .filter(|lease| lease.is_active(now) && lease.primary == primary)
            .ok_or_else(|| {
                let what = format!("no active lease on chunk {handle} held by {primary}");
                MasterError::NotFound(what)
            })?;

        let lease = Lease {
            expiration: current.expiration.max(now + self.settings.lease_duration_ms),
            ..current
        };
        journal.record(Action::GrantLease {
            handle,
            primary: lease.primary.clone(),
            expiration: lease.expiration,
        })?;
        if let Some(meta) = table.chunks.get_mut(&handle) {
            meta.lease = Some(lease.clone());
        }
        Ok(lease)
    }

    pub fn replay_grant_lease(&self, lease: Lease) {
        let mut table = self.table.lock();
        if let Some(meta) = table.chunks.get_mut(&lease.handle) {
            meta.lease = Some(lease);
        }
    }

    /// Record that `addr` holds a replica of `handle`. Idempotent; reports for
    /// unknown or deleted chunks are ignored.
    pub fn set_chunk_location(&self, handle: ChunkHandle, addr: &str) {
        let mut table = self.table.lock();
        match table.chunks.get(&handle) {
            None => {
                debug!(chunk = handle, chunkserver = addr, "location report for unknown chunk");
                return;
            }
            Some(meta) if meta.deleted => {
                debug!(chunk = handle, chunkserver = addr, "location report for deleted chunk");
                return;
            }
            Some(_) => {}
        }
        if !table.servers.contains_key(addr) {
            warn!(
                chunk = handle,
                chunkserver = addr,
                "location report from unregistered chunkserver"
            );
        }
        table.add_holder(handle, addr);
    }

    /// Validate a chunkserver's report against the live mapping and record the
    /// replica in one step. `path` must be the file `handle` was allocated to.
    pub fn confirm_report(
        &self,
        handle: ChunkHandle,
        index: u64,
        path: &str,
        addr: &str,
    ) -> Result<()> {
        let mut table = self.table.lock();
        let stale = |reason: String| Err(MasterError::Stale(reason));
        match table.chunks.get(&handle) {
            None => return stale(format!("unknown chunk {handle}")),
            Some(meta) if meta.deleted => return stale(format!("chunk {handle} is being deleted")),
            Some(meta) if meta.path_index.index != index => {
                return stale(format!(
                    "chunk {handle} is index {} of {}, not index {index}",
                    meta.path_index.index, meta.path_index.path
                ))
            }
            Some(_) => {}
        }
        let current = table.files.get(path).and_then(|indexes| indexes.get(&index));
        if current != Some(&handle) {
            return stale(format!("chunk {handle} no longer backs index {index} of {path}"));
        }
        table.add_holder(handle, addr);
        Ok(())
    }

    pub fn get_path_index_from_handle(&self, handle: ChunkHandle) -> Result<PathIndex> {
        self.table
            .lock()
            .chunks
            .get(&handle)
            .map(|meta| meta.path_index.clone())
            .ok_or_else(|| MasterError::NotFound(format!("chunk {handle}")))
    }

    pub fn chunk_state(&self, handle: ChunkHandle) -> Option<ChunkState> {
        let table = self.table.lock();
        let meta = table.chunks.get(&handle)?;
        if meta.deleted {
            return Some(ChunkState::PendingDeletion);
        }
        let live = table.live_locations(meta, self.clock.now(), self.window());
        Some(if live >= meta.replication {
            ChunkState::FullyReplicated
        } else if meta.reached_target {
            ChunkState::UnderReplicated
        } else if live == 0 {
            ChunkState::Allocated
        } else {
            ChunkState::PartiallyReplicated
        })
    }

    /// Queue every chunk of `path` for garbage collection and unmap them from the path.
    pub fn update_delete_chunk_list(&self, path: &str) -> Vec<ChunkHandle> {
        let mut table = self.table.lock();
        let Some(indexes) = table.files.remove(path) else {
            return Vec::new();
        };
        let handles: Vec<ChunkHandle> = indexes.into_values().collect();
        for handle in &handles {
            table.mark_deleted(*handle);
        }
        debug!(path, ?handles, "queued chunks for deletion");
        handles
    }

    /// Register a chunkserver or refresh its heartbeat.
    pub fn update_chunkserver_list(&self, addr: &str, journal: &dyn Journal) -> Result<()> {
        let mut table = self.table.lock();
        journal.record(Action::ChunkserverNotification { addr: addr.to_string() })?;
        let domain = self.settings.failure_domains.get(addr).cloned();
        table.register(addr, self.clock.now(), domain);
        Ok(())
    }

    /// Refresh the heartbeat of a registered chunkserver. Returns false if it is unknown.
    pub fn refresh_chunkserver(&self, addr: &str) -> bool {
        let now = self.clock.now();
        let mut table = self.table.lock();
        match table.servers.get_mut(addr) {
            Some(record) => {
                record.last_heartbeat = now;
                record.dead = false;
                true
            }
            None => false,
        }
    }

    pub fn chunkservers(&self) -> Vec<ServerAddr> {
        self.table.lock().servers.keys().cloned().collect()
    }

    pub fn live_chunkservers(&self) -> Vec<ServerAddr> {
        let now = self.clock.now();
        let window = self.window();
        self.table
            .lock()
            .servers
            .values()
            .filter(|r| r.is_live(now, window))
            .map(|r| r.addr.clone())
            .collect()
    }

    pub fn pending_replications(&self, handle: ChunkHandle) -> Vec<ServerAddr> {
        self.table
            .lock()
            .chunks
            .get(&handle)
            .map(|meta| meta.pending_replicas.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn deletion_queue(&self) -> Vec<ChunkHandle> {
        self.table.lock().deletions.keys().copied().collect()
    }

    pub fn replay_purge(&self, handle: ChunkHandle) {
        self.table.lock().purge(handle);
    }

    pub fn snapshot(&self) -> ChunkTableSnapshot {
        let table = self.table.lock();
        let mut chunks: Vec<ChunkRecord> = table
            .chunks
            .iter()
            .map(|(handle, meta)| ChunkRecord {
                handle: *handle,
                path: meta.path_index.path.clone(),
                index: meta.path_index.index,
                intended: meta.intended.clone(),
                replication: meta.replication,
                lease: meta.lease.clone(),
                deleted: meta.deleted,
            })
            .collect();
        chunks.sort_by_key(|c| c.handle);
        ChunkTableSnapshot {
            next_handle: table.next_handle,
            chunks,
            chunkservers: table.servers.keys().cloned().collect(),
        }
    }

    async fn probe_all<'a, F, Fut>(
        &self,
        addrs: &'a [ServerAddr],
        probe: F,
    ) -> Vec<(&'a ServerAddr, Option<Vec<ReportedChunk>>)>
    where
        F: Fn(&'a ServerAddr) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<ReportedChunk>, ProbeError>>,
    {
        let timeout = self.settings.probe_timeout;
        let probes = addrs.iter().map(|addr| {
            let fut = probe(addr);
            async move {
                let res = match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(inventory)) => Some(inventory),
                    Ok(Err(e)) => {
                        warn!(chunkserver = %addr, error = %e, "chunkserver probe failed");
                        None
                    }
                    Err(_) => {
                        warn!(chunkserver = %addr, ?timeout, "chunkserver probe timed out");
                        None
                    }
                };
                (addr, res)
            }
        });
        join_all(probes).await
    }

    /// One-time startup reconciliation: rebuild confirmed locations from every
    /// registered chunkserver's inventory. Returns reported chunk lengths.
    pub async fn poll_chunkservers(&self, client: &dyn ChunkserverClient) -> Vec<(PathIndex, u64)> {
        let addrs = self.chunkservers();
        let results = self.probe_all(&addrs, |addr| client.list_chunks(addr)).await;

        let now = self.clock.now();
        let mut table = self.table.lock();
        let mut lengths = Vec::new();
        for (addr, inventory) in results {
            if let Some(inventory) = inventory {
                lengths.extend(table.reconcile_inventory(addr, &inventory, now));
            }
        }
        info!(chunkservers = addrs.len(), chunks = lengths.len(), "polled chunkservers");
        lengths
    }

    /// One heartbeat tick: probe, expire, re-replicate, collect garbage.
    pub async fn beat(&self, client: &dyn ChunkserverClient, oplog: &Oplog) -> BeatReport {
        let addrs = self.chunkservers();
        let results = self.probe_all(&addrs, |addr| client.heartbeat(addr)).await;

        let mut report = BeatReport::default();
        {
            let now = self.clock.now();
            let mut table = self.table.lock();
            for (addr, inventory) in results {
                if let Some(inventory) = inventory {
                    table.reconcile_inventory(addr, &inventory, now);
                    report.responsive.push(addr.clone());
                }
            }
            report.dead = table.expire(now, self.window());
            for addr in &report.dead {
                warn!(
                    chunkserver = %addr,
                    "chunkserver missed its liveness window; dropping its replicas"
                );
            }
            report.replications = table.schedule_replication(now, self.window());
        }

        for plan in &report.replications {
            let res = tokio::time::timeout(
                self.settings.probe_timeout,
                client.replicate_chunk(&plan.source, &plan.target, plan.handle),
            )
            .await;
            match res {
                Ok(Ok(())) => debug!(
                    chunk = plan.handle,
                    source = %plan.source,
                    target = %plan.target,
                    "replication scheduled"
                ),
                Ok(Err(e)) => warn!(
                    chunk = plan.handle,
                    target = %plan.target,
                    error = %e,
                    "replication request failed"
                ),
                Err(_) => warn!(
                    chunk = plan.handle,
                    target = %plan.target,
                    "replication request timed out"
                ),
            }
        }

        report.purged = self.collect_garbage(client, oplog).await;
        report
    }

    async fn collect_garbage(
        &self,
        client: &dyn ChunkserverClient,
        oplog: &Oplog,
    ) -> Vec<ChunkHandle> {
        let now = self.clock.now();
        let (due, orphans) = {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            let due: Vec<(ChunkHandle, Vec<ServerAddr>)> = table
                .deletions
                .iter()
                .filter(|(_, pending)| pending.retry_at <= now)
                .map(|(handle, _)| {
                    let holders = table
                        .chunks
                        .get(handle)
                        .map(|meta| meta.locations.iter().cloned().collect())
                        .unwrap_or_default();
                    (*handle, holders)
                })
                .collect();
            (due, std::mem::take(&mut table.orphans))
        };
        if due.is_empty() && orphans.is_empty() {
            return Vec::new();
        }

        let mut requests: BTreeMap<ServerAddr, Vec<ChunkHandle>> = BTreeMap::new();
        for (handle, holders) in &due {
            for addr in holders {
                requests.entry(addr.clone()).or_default().push(*handle);
            }
        }
        for (addr, handles) in orphans {
            debug!(chunkserver = %addr, ?handles, "deleting orphaned replicas");
            requests.entry(addr).or_default().extend(handles);
        }

        let timeout = self.settings.probe_timeout;
        let calls = requests.iter().map(|(addr, handles)| async move {
            let res = tokio::time::timeout(timeout, client.delete_chunks(addr, handles)).await;
            (addr, res)
        });
        let mut failed: HashSet<&ServerAddr> = HashSet::new();
        for (addr, res) in join_all(calls).await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(chunkserver = %addr, error = %e, "chunk deletion failed");
                    failed.insert(addr);
                }
                Err(_) => {
                    warn!(chunkserver = %addr, "chunk deletion timed out");
                    failed.insert(addr);
                }
            }
        }

        let txn = oplog.begin();
        let mut table = self.table.lock();
        let mut purged = Vec::new();
        for (handle, holders) in due {
            let remaining = match table.chunks.get_mut(&handle) {
                Some(meta) => {
                    for addr in holders.iter().filter(|a| !failed.contains(a)) {
                        meta.locations.remove(addr);
                    }
                    meta.locations.clone()
                }
                None => {
                    table.deletions.remove(&handle);
                    continue;
                }
            };
            for addr in holders.iter().filter(|a| !failed.contains(a)) {
                if let Some(record) = table.servers.get_mut(addr) {
                    record.chunks.remove(&handle);
                }
            }

            if !remaining.is_empty() {
                let Some(pending) = table.deletions.get_mut(&handle) else {
                    continue;
                };
                pending.attempts += 1;
                if pending.attempts < self.settings.deletion_retry_budget {
                    pending.retry_at = now + self.settings.backoff_ms(pending.attempts);
                    continue;
                }
                error!(
                    chunk = handle,
                    holders = ?remaining,
                    attempts = pending.attempts,
                    "deletion retry budget exhausted; purging with replicas possibly left behind"
                );
            }

            if let Err(e) = txn.record(Action::PurgeChunk { handle }) {
                error!(chunk = handle, error = %e, "could not log chunk purge; keeping it queued");
                continue;
            }
            table.purge(handle);
            purged.push(handle);
        }
        if !purged.is_empty() {
            info!(?purged, "purged deleted chunks");
        }
        purged
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.settings.heartbeat_interval
    }
}
