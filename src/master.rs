//! The master: one coordinator instance sequencing client and chunkserver
//! requests into the namespace and chunk managers, with every durable mutation
//! passing through the oplog first.

pub mod checkpoint;
pub mod chunk_manager;
pub mod heartbeat;
pub mod namespace;
pub mod oplog;

use std::sync::Arc;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};
use crate::chunk::implied_file_length;
use crate::chunkserver::ChunkserverClient;
use crate::common::*;
use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use self::checkpoint::Checkpoint;
use self::chunk_manager::{BeatReport, ChunkManager, ChunkSettings, ChunkTableSnapshot};
use self::heartbeat::Heartbeat;
use self::namespace::{normalize, DirEntry, NamespaceManager};
use self::oplog::{Action, Journal, Oplog, OplogTxn, Replay};

pub struct Master {
    config: MasterConfig,
    chunk_size: u64,
    client_id: Mutex<u64>,
    namespace: NamespaceManager,
    chunks: Arc<ChunkManager>,
    oplog: Arc<Oplog>,
    client: Arc<dyn ChunkserverClient>,
}

impl Master {
    pub fn open(config: MasterConfig, client: Arc<dyn ChunkserverClient>) -> Result<Master> {
        Master::open_with_clock(config, client, Arc::new(SystemClock))
    }

    /// Load the checkpoint (if any), then replay the oplog entries after it.
    pub fn open_with_clock(
        config: MasterConfig,
        client: Arc<dyn ChunkserverClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Master> {
        config.validate()?;
        let chunk_size = config.chunks.chunk_size_bytes()?;
        let settings = ChunkSettings::from_config(&config);
        let recursive = config.namespace.recursive_listing;
        let persistence = &config.persistence;

        let checkpoint = checkpoint::load(&persistence.checkpoint_path)?;
        let (seq, client_id, namespace, chunks) = match checkpoint {
            Some(cp) => (
                cp.seq,
                cp.client_id,
                NamespaceManager::from_snapshot(&cp.namespace, recursive)?,
                ChunkManager::from_snapshot(&cp.chunks, settings, clock),
            ),
            None => (0, 0, NamespaceManager::new(recursive), ChunkManager::new(settings, clock)),
        };
        let (oplog, entries) = Oplog::open(&persistence.oplog_path, persistence.sync, seq)?;

        let master = Master {
            chunk_size,
            client_id: Mutex::new(client_id),
            namespace,
            chunks: Arc::new(chunks),
            oplog: Arc::new(oplog),
            client,
            config,
        };
        let replayed = entries.len();
        for entry in entries {
            if let Err(e) = master.apply(entry.action) {
                error!(
                    target: "alert",
                    seq = entry.seq,
                    error = %e,
                    "oplog entry does not apply to recovered state"
                );
                return Err(e);
            }
        }
        info!(
            checkpoint_seq = seq,
            replayed,
            last_seq = master.oplog.last_seq(),
            "recovered master state"
        );
        Ok(master)
    }

    /// Re-run a logged action through the live code path without logging it again.
    fn apply(&self, action: Action) -> Result<()> {
        match action {
            Action::GrantClientId { id } => {
                let mut next = self.client_id.lock();
                *next = (*next).max(id);
            }
            Action::CreateFile { path } => self.namespace.create(&path, &Replay)?,
            Action::CreateDir { path } => self.namespace.create_dir(&path, &Replay)?,
            Action::DeleteFile { path } => self.delete_with(&path, &Replay)?,
            Action::AddChunk { path, index, handle, locations } => {
                self.namespace.with_file(&path, || {
                    self.chunks.replay_add_chunk(&path, index, handle, locations)
                })?;
            }
            Action::ChunkserverNotification { addr } => {
                self.chunks.update_chunkserver_list(&addr, &Replay)?
            }
            Action::GrantLease { handle, primary, expiration } => {
                self.chunks.replay_grant_lease(Lease { handle, primary, expiration })
            }
            Action::PurgeChunk { handle } => self.chunks.replay_purge(handle),
        }
        Ok(())
    }

    /// Run a mutation under a commit permit, then checkpoint if one is due.
    fn commit<T>(&self, f: impl FnOnce(&OplogTxn<'_>) -> Result<T>) -> Result<T> {
        let res = {
            let txn = self.oplog.begin();
            f(&txn)
        };
        if res.is_ok() {
            self.maybe_checkpoint();
        }
        res
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn namespace(&self) -> &NamespaceManager {
        &self.namespace
    }

    pub fn chunk_manager(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    #[instrument(skip(self))]
    pub fn get_unique_client_id(&self) -> Result<u64> {
        self.commit(|txn| {
            let mut next = self.client_id.lock();
            let id = *next + 1;
            txn.record(Action::GrantClientId { id })?;
            *next = id;
            info!(id, "granted client id");
            Ok(id)
        })
    }

    #[instrument(skip(self))]
    pub fn create(&self, path: &str) -> Result<()> {
        self.commit(|txn| self.namespace.create(path, txn))?;
        info!("created file");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn create_dir(&self, path: &str) -> Result<()> {
        self.commit(|txn| self.namespace.create_dir(path, txn))?;
        info!("created directory");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn delete(&self, path: &str) -> Result<()> {
        self.commit(|txn| self.delete_with(path, txn))
    }

    fn delete_with(&self, path: &str, journal: &dyn Journal) -> Result<()> {
        let files = self.namespace.delete_then(path, journal, |files| {
            for file in files {
                self.chunks.update_delete_chunk_list(file);
            }
        })?;
        debug!(path, files = files.len(), "deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn list_all_files(&self, path: &str) -> Result<Vec<DirEntry>> {
        let listing = self.namespace.list_all_files(path)?;
        Ok(listing.iter().collect())
    }

    #[instrument(skip(self))]
    pub fn get_file_length(&self, path: &str) -> Result<u64> {
        self.namespace.get_file_length(path)
    }

    /// Allocate chunk `index` of the file at `path`. The file stays pinned for the
    /// duration, so a concurrent delete sees the new chunk.
    #[instrument(skip(self))]
    pub fn add_chunk(&self, path: &str, index: u64) -> Result<ChunkInfo> {
        let path = normalize(path)?;
        let info = self.commit(|txn| {
            self.namespace.with_file(&path, || self.chunks.add_chunk(&path, index, txn))
        })?;
        info!(handle = info.handle, locations = ?info.locations, "added chunk");
        Ok(info)
    }

    #[instrument(skip(self))]
    pub fn find_locations(&self, path: &str, index: u64) -> Result<(Vec<ServerAddr>, ChunkHandle)> {
        self.chunks.find_locations(&normalize(path)?, index)
    }

    #[instrument(skip(self))]
    pub fn find_lease_holder(&self, handle: ChunkHandle) -> Result<Lease> {
        self.commit(|txn| self.chunks.find_lease_holder(handle, txn))
    }

    #[instrument(skip(self))]
    pub fn renew_lease(&self, handle: ChunkHandle, primary: &str) -> Result<Lease> {
        self.commit(|txn| self.chunks.renew_lease(handle, primary, txn))
    }

    /// A chunkserver reports that it holds `length` defined bytes of `handle`.
    #[instrument(skip(self))]
    pub fn report_chunk(
        &self,
        server: &str,
        handle: ChunkHandle,
        index: u64,
        length: u64,
        path: &str,
    ) -> Result<()> {
        let stored = self
            .chunks
            .get_path_index_from_handle(handle)
            .map_err(|_| MasterError::Stale(format!("unknown chunk {handle}")))?;
        if stored.index != index {
            warn!(stored_index = stored.index, "chunk index mismatch; ignoring report");
        }
        if stored.path != path {
            warn!(stored_path = %stored.path, "reported path differs from the chunk's file");
        }

        // The file stays write-locked while the chunk table confirms that
        // `handle` still backs this index, so a delete and recreate of the
        // path cannot slip in between.
        let chunk_size = self.chunk_size;
        self.namespace
            .raise_file_length_with(&stored.path, || {
                self.chunks.confirm_report(handle, index, &stored.path, server)?;
                Ok(implied_file_length(chunk_size, index, length))
            })
            .map_err(|e| match e {
                MasterError::NotFound(p) => MasterError::Stale(format!("file {p} was deleted")),
                e => e,
            })?;
        if !self.chunks.refresh_chunkserver(server) {
            debug!("report from unregistered chunkserver");
        }
        Ok(())
    }

    /// A chunkserver (re-)registers along with the chunks it currently holds.
    #[instrument(skip(self, handles), fields(handles = handles.len()))]
    pub fn notify_master(&self, addr: &str, handles: &[ChunkHandle]) -> Result<()> {
        self.commit(|txn| self.chunks.update_chunkserver_list(addr, txn))?;
        for handle in handles {
            self.chunks.set_chunk_location(*handle, addr);
        }
        info!("chunkserver registered");
        Ok(())
    }

    /// Rebuild confirmed locations and file lengths from every registered chunkserver.
    #[instrument(skip(self))]
    pub async fn poll_chunkservers(&self) {
        let lengths = self.chunks.poll_chunkservers(self.client.as_ref()).await;
        for (path_index, length) in lengths {
            let length = implied_file_length(self.chunk_size, path_index.index, length);
            if let Err(e) = self.namespace.set_file_length(&path_index.path, length) {
                debug!(
                    path = %path_index.path,
                    error = %e,
                    "reported chunk belongs to no live file"
                );
            }
        }
    }

    /// Run one heartbeat tick inline.
    pub async fn beat(&self) -> BeatReport {
        let report = self.chunks.beat(self.client.as_ref(), &self.oplog).await;
        if !report.purged.is_empty() {
            self.maybe_checkpoint();
        }
        report
    }

    /// Run `beat` in the background. Ticks that purge chunks check the
    /// checkpoint cadence the same way `beat` does. The loop holds no strong
    /// reference to the master.
    pub fn start_heartbeat(self: &Arc<Self>) -> Heartbeat {
        let master = Arc::downgrade(self);
        self.chunks.spawn_heartbeat(Arc::clone(&self.client), Arc::clone(&self.oplog), move |_| {
            if let Some(master) = master.upgrade() {
                master.maybe_checkpoint();
            }
        })
    }

    /// Write a checkpoint of the full state and truncate the oplog. Returns its sequence number.
    #[instrument(skip(self))]
    pub fn checkpoint(&self) -> Result<u64> {
        self.write_checkpoint(0)
    }

    fn maybe_checkpoint(&self) {
        let every = self.config.persistence.checkpoint_every;
        if every == 0 || self.oplog.since_checkpoint() < every {
            return;
        }
        if let Err(e) = self.write_checkpoint(every) {
            error!(target: "alert", error = %e, "automatic checkpoint failed");
        }
    }

    /// Checkpoint unless fewer than `min_entries` entries were logged since the last one.
    fn write_checkpoint(&self, min_entries: u64) -> Result<u64> {
        let excl = self.oplog.exclusive();
        let seq = excl.last_seq();
        if min_entries > 0 && self.oplog.since_checkpoint() < min_entries {
            return Ok(seq);
        }
        let cp = Checkpoint {
            seq,
            client_id: *self.client_id.lock(),
            namespace: self.namespace.snapshot(),
            chunks: self.chunks.snapshot(),
        };
        checkpoint::write(&self.config.persistence.checkpoint_path, &cp)?;
        excl.rotate()?;
        Ok(seq)
    }

    pub fn chunk_snapshot(&self) -> ChunkTableSnapshot {
        self.chunks.snapshot()
    }

    pub fn last_client_id(&self) -> u64 {
        *self.client_id.lock()
    }
}
