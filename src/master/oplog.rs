//! Append-only operation log.
//!
//! Each entry is framed as `[len: u32 LE][crc32: u32 LE][json body]`. Appends are
//! written (and optionally fsynced) before the originating call returns, and every
//! live mutation holds a shared commit permit across append and in-memory apply so
//! that a checkpoint, which takes the permit exclusively, never observes a logged
//! but unapplied mutation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use crate::common::{ChunkHandle, ServerAddr, Timestamp};
use crate::error::OplogError;

const FRAME_HEADER: usize = 8;
// Guards against reading a garbage length prefix as a huge allocation.
const MAX_ENTRY_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    GrantClientId { id: u64 },
    CreateFile { path: String },
    CreateDir { path: String },
    DeleteFile { path: String },
    AddChunk {
        path: String,
        index: u64,
        handle: ChunkHandle,
        locations: Vec<ServerAddr>,
    },
    ChunkserverNotification { addr: ServerAddr },
    GrantLease {
        handle: ChunkHandle,
        primary: ServerAddr,
        expiration: Timestamp,
    },
    PurgeChunk { handle: ChunkHandle },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub seq: u64,
    pub action: Action,
}

/// Sink for durable mutations. Managers record through it right before applying a change.
pub trait Journal {
    fn record(&self, action: Action) -> Result<(), OplogError>;
}

/// Journal used while replaying: the entry is already on disk.
pub struct Replay;

impl Journal for Replay {
    fn record(&self, _action: Action) -> Result<(), OplogError> {
        Ok(())
    }
}

struct LogFile {
    file: File,
    len: u64,
    next_seq: u64,
    since_checkpoint: u64,
}

pub struct Oplog {
    path: PathBuf,
    sync: bool,
    gate: RwLock<()>,
    inner: Mutex<LogFile>,
}

impl Oplog {
    /// Open (or create) the log at `path`, returning every entry after `after_seq`.
    ///
    /// A torn final frame is truncated away. Damage anywhere else is `Corrupt`.
    pub fn open(
        path: impl AsRef<Path>,
        sync: bool,
        after_seq: u64,
    ) -> Result<(Oplog, Vec<Entry>), OplogError> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let (entries, good_len) = decode_frames(&buf)?;

        if good_len < buf.len() as u64 {
            warn!(
                path = %path.display(),
                dropped = buf.len() as u64 - good_len,
                "truncating torn oplog tail"
            );
            file.set_len(good_len)?;
            file.sync_all()?;
        }

        let last_seq = entries.last().map(|e| e.seq).unwrap_or(0).max(after_seq);
        let entries: Vec<Entry> = entries.into_iter().filter(|e| e.seq > after_seq).collect();
        info!(path = %path.display(), entries = entries.len(), last_seq, "opened oplog");

        let file = OpenOptions::new().append(true).open(&path)?;
        let oplog = Oplog {
            path,
            sync,
            gate: RwLock::new(()),
            inner: Mutex::new(LogFile {
                file,
                len: good_len,
                next_seq: last_seq + 1,
                since_checkpoint: entries.len() as u64,
            }),
        };
        Ok((oplog, entries))
    }

    /// Take a shared commit permit. Hold it across the append and the in-memory apply.
    pub fn begin(&self) -> OplogTxn<'_> {
        OplogTxn { oplog: self, _permit: self.gate.read() }
    }

    /// Take the commit gate exclusively; no mutation is in flight while the guard lives.
    pub fn exclusive(&self) -> OplogExclusive<'_> {
        OplogExclusive { oplog: self, _gate: self.gate.write() }
    }

    /// Entries appended (or replayed) since the last rotation.
    pub fn since_checkpoint(&self) -> u64 {
        self.inner.lock().since_checkpoint
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    fn append(&self, action: Action) -> Result<u64, OplogError> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let entry = Entry { seq, action };
        let frame = encode_frame(&entry)?;

        if let Err(e) = write_frame(&mut inner.file, &frame, self.sync) {
            error!(
                target: "alert",
                seq,
                error = %e,
                path = %self.path.display(),
                "oplog append failed"
            );
            let len = inner.len;
            // Drop whatever part of the frame made it out so the next append starts clean.
            if let Err(e) = inner.file.set_len(len) {
                error!(target: "alert", error = %e, "failed to roll back partial oplog frame");
            }
            return Err(e.into());
        }

        inner.len += frame.len() as u64;
        inner.next_seq += 1;
        inner.since_checkpoint += 1;
        Ok(seq)
    }
}

pub struct OplogTxn<'a> {
    oplog: &'a Oplog,
    _permit: RwLockReadGuard<'a, ()>,
}

impl Journal for OplogTxn<'_> {
    fn record(&self, action: Action) -> Result<(), OplogError> {
        self.oplog.append(action).map(|_| ())
    }
}

pub struct OplogExclusive<'a> {
    oplog: &'a Oplog,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl OplogExclusive<'_> {
    pub fn last_seq(&self) -> u64 {
        self.oplog.last_seq()
    }

    /// Discard every entry; a checkpoint covering them must already be durable.
    pub fn rotate(&self) -> Result<(), OplogError> {
        let mut inner = self.oplog.inner.lock();
        inner.file.set_len(0)?;
        inner.file.sync_all()?;
        inner.len = 0;
        inner.since_checkpoint = 0;
        Ok(())
    }
}

fn encode_frame(entry: &Entry) -> Result<Vec<u8>, OplogError> {
    let body = serde_json::to_vec(entry)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn write_frame(file: &mut File, frame: &[u8], sync: bool) -> std::io::Result<()> {
    file.write_all(frame)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

/// Decode frames from `buf`. Returns the entries and the byte length of the valid prefix.
fn decode_frames(buf: &[u8]) -> Result<(Vec<Entry>, u64), OplogError> {
    let mut entries: Vec<Entry> = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let rest = &buf[offset..];
        if rest.len() < FRAME_HEADER {
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let end = FRAME_HEADER + len as usize;

        if len > MAX_ENTRY_BYTES || rest.len() < end {
            if len <= MAX_ENTRY_BYTES {
                // Frame runs past end of file: torn write.
                break;
            }
            return Err(corrupt(offset, "frame length out of range"));
        }

        // A bad final frame is a torn write. So is one whose body and
        // everything after it is zero fill from a partially flushed block.
        let torn = offset + end == buf.len() || rest[FRAME_HEADER..].iter().all(|b| *b == 0);
        let body = &rest[FRAME_HEADER..end];
        if crc32fast::hash(body) != crc {
            if torn {
                break;
            }
            return Err(corrupt(offset, "checksum mismatch"));
        }

        let entry = match serde_json::from_slice::<Entry>(body) {
            Ok(entry) => entry,
            Err(_) if torn => break,
            Err(e) => return Err(corrupt(offset, &format!("undecodable entry: {e}"))),
        };
        if let Some(prev) = entries.last() {
            if entry.seq <= prev.seq {
                return Err(corrupt(offset, &format!("sequence {} after {}", entry.seq, prev.seq)));
            }
        }
        entries.push(entry);
        offset += end;
    }

    Ok((entries, offset as u64))
}

fn corrupt(offset: usize, reason: &str) -> OplogError {
    OplogError::Corrupt { offset: offset as u64, reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn create(path: &str) -> Action {
        Action::CreateFile { path: path.to_string() }
    }

    #[test]
    fn appends_are_replayed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");
        {
            let (log, entries) = Oplog::open(&path, true, 0).unwrap();
            assert!(entries.is_empty());
            let txn = log.begin();
            txn.record(Action::CreateDir { path: "/a".into() }).unwrap();
            txn.record(create("/a/f")).unwrap();
            txn.record(Action::AddChunk {
                path: "/a/f".into(),
                index: 0,
                handle: 1,
                locations: vec!["cs-1".into()],
            })
            .unwrap();
        }

        let (log, entries) = Oplog::open(&path, true, 0).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(entries[1].action, create("/a/f"));
        assert_eq!(log.last_seq(), 3);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");
        {
            let (log, _) = Oplog::open(&path, false, 0).unwrap();
            log.begin().record(create("/x")).unwrap();
            log.begin().record(create("/y")).unwrap();
        }
        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() - 3]).unwrap();

        let (log, entries) = Oplog::open(&path, false, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, create("/x"));

        // The next append lands right after the surviving entry.
        log.begin().record(create("/z")).unwrap();
        drop(log);
        let (_, entries) = Oplog::open(&path, false, 0).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(entries[1].action, create("/z"));
    }

    #[test]
    fn zero_filled_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");
        {
            let (log, _) = Oplog::open(&path, false, 0).unwrap();
            log.begin().record(create("/a")).unwrap();
        }
        let written = fs::metadata(&path).unwrap().len();
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0u8; 64]);
        fs::write(&path, &bytes).unwrap();

        let (log, entries) = Oplog::open(&path, false, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, create("/a"));
        assert_eq!(fs::metadata(&path).unwrap().len(), written);

        log.begin().record(create("/b")).unwrap();
        drop(log);
        let (_, entries) = Oplog::open(&path, false, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, create("/b"));
    }

    #[test]
    fn empty_frame_before_real_entries_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");
        {
            let (log, _) = Oplog::open(&path, false, 0).unwrap();
            log.begin().record(create("/a")).unwrap();
        }
        let entry = fs::read(&path).unwrap();
        let mut bytes = vec![0u8; FRAME_HEADER];
        bytes.extend_from_slice(&entry);
        fs::write(&path, &bytes).unwrap();

        let err = Oplog::open(&path, false, 0).err().unwrap();
        assert!(matches!(err, OplogError::Corrupt { offset: 0, .. }));
    }

    #[test]
    fn damage_before_the_tail_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");
        {
            let (log, _) = Oplog::open(&path, false, 0).unwrap();
            log.begin().record(create("/x")).unwrap();
            log.begin().record(create("/y")).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        bytes[FRAME_HEADER + 2] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let err = Oplog::open(&path, false, 0).err().unwrap();
        assert!(matches!(err, OplogError::Corrupt { offset: 0, .. }));
    }

    #[test]
    fn rotation_keeps_sequence_numbers_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");
        let (log, _) = Oplog::open(&path, false, 0).unwrap();
        log.begin().record(create("/x")).unwrap();
        log.begin().record(create("/y")).unwrap();
        assert_eq!(log.since_checkpoint(), 2);

        let checkpoint_seq = {
            let excl = log.exclusive();
            let seq = excl.last_seq();
            excl.rotate().unwrap();
            seq
        };
        assert_eq!(log.since_checkpoint(), 0);
        log.begin().record(create("/z")).unwrap();
        drop(log);

        let (_, entries) = Oplog::open(&path, false, checkpoint_seq).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 3);
    }

    #[test]
    fn entries_at_or_below_checkpoint_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog");
        {
            let (log, _) = Oplog::open(&path, false, 0).unwrap();
            for p in ["/a", "/b", "/c"] {
                log.begin().record(create(p)).unwrap();
            }
        }
        let (log, entries) = Oplog::open(&path, false, 2).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, create("/c"));
        assert_eq!(log.last_seq(), 3);
    }
}
