use std::fs;
use std::path::Path;
use std::sync::Arc;
use gfs::common::ManualClock;
use gfs::master::namespace::NamespaceSnapshot;
use gfs::master::chunk_manager::ChunkTableSnapshot;
use gfs::{Master, MasterConfig, MasterError, NetworkShim};

struct Env {
    dir: tempfile::TempDir,
    shim: Arc<NetworkShim>,
    clock: Arc<ManualClock>,
}

impl Env {
    fn new() -> Env {
        let shim = Arc::new(NetworkShim::new());
        for addr in ["cs-1", "cs-2", "cs-3"] {
            shim.add_node(addr);
        }
        Env {
            dir: tempfile::tempdir().unwrap(),
            shim,
            clock: Arc::new(ManualClock::new(1_000_000)),
        }
    }

    fn config(&self) -> MasterConfig {
        let mut config = MasterConfig::in_dir(self.dir.path());
        config.persistence.sync = false;
        config.persistence.checkpoint_every = 0;
        config.chunks.replication_factor = 2;
        config
    }

    fn open(&self) -> Master {
        Master::open_with_clock(self.config(), self.shim.clone(), self.clock.clone()).unwrap()
    }

    fn oplog(&self) -> std::path::PathBuf {
        self.config().persistence.oplog_path
    }
}

fn state(master: &Master) -> (NamespaceSnapshot, ChunkTableSnapshot) {
    (master.namespace().snapshot(), master.chunk_snapshot())
}

/// A small workload touching every logged action.
fn workload(env: &Env, master: &Master) {
    for addr in ["cs-1", "cs-2", "cs-3"] {
        master.notify_master(addr, &[]).unwrap();
    }
    master.get_unique_client_id().unwrap();
    master.create_dir("/logs").unwrap();
    master.create_dir("/logs/old").unwrap();
    master.create("/logs/a").unwrap();
    master.create("/logs/old/b").unwrap();
    for (path, index) in [("/logs/a", 0), ("/logs/a", 1), ("/logs/old/b", 0)] {
        let info = master.add_chunk(path, index).unwrap();
        let addr = &info.locations[0];
        env.shim.store_chunk(addr, info.handle, 512);
        master.report_chunk(addr, info.handle, index, 512, path).unwrap();
    }
    let (_, handle) = master.find_locations("/logs/a", 0).unwrap();
    master.find_lease_holder(handle).unwrap();
    master.delete("/logs/old").unwrap();
    master.get_unique_client_id().unwrap();
}

#[tokio::test]
async fn reopen_reproduces_live_state() {
    let env = Env::new();
    let master = env.open();
    workload(&env, &master);
    // Purges are logged too.
    assert_eq!(master.beat().await.purged.len(), 1);
    let before = state(&master);
    let client_id = master.last_client_id();
    drop(master);

    let master = env.open();
    assert_eq!(master.last_client_id(), client_id);
    assert_eq!(master.chunk_snapshot(), before.1);
    // Lengths are rebuilt from chunkserver inventories, not the log.
    master.poll_chunkservers().await;
    assert_eq!(state(&master), before);
    assert_eq!(master.get_file_length("/logs/a").unwrap(), master.chunk_size() + 512);
    assert!(!master.namespace().exists("/logs/old/b"));
}

#[tokio::test]
async fn checkpoint_then_more_operations_reopens_identically() {
    let env = Env::new();
    let master = env.open();
    workload(&env, &master);
    let seq = master.checkpoint().unwrap();
    assert!(seq > 0);
    assert_eq!(fs::metadata(env.oplog()).unwrap().len(), 0);

    master.create("/after").unwrap();
    let info = master.add_chunk("/after", 0).unwrap();
    master.delete("/logs/a").unwrap();
    let before = state(&master);
    drop(master);

    let master = env.open();
    assert_eq!(master.chunk_snapshot(), before.1);
    assert!(master.namespace().exists("/after"));
    assert!(!master.namespace().exists("/logs/a"));
    // Handles keep growing past everything the checkpoint and log hold.
    master.create("/next").unwrap();
    assert!(master.add_chunk("/next", 0).unwrap().handle > info.handle);
}

#[test]
fn torn_tail_drops_only_the_last_entry() {
    let env = Env::new();
    {
        let master = env.open();
        master.create("/a").unwrap();
        master.create("/b").unwrap();
    }
    let bytes = fs::read(env.oplog()).unwrap();
    fs::write(env.oplog(), &bytes[..bytes.len() - 2]).unwrap();

    let master = env.open();
    assert!(master.namespace().exists("/a"));
    assert!(!master.namespace().exists("/b"));
    master.create("/b").unwrap();
    drop(master);

    let master = env.open();
    assert!(master.namespace().exists("/b"));
}

#[test]
fn zero_filled_tail_is_dropped_on_open() {
    let env = Env::new();
    {
        let master = env.open();
        master.create("/a").unwrap();
    }
    let mut bytes = fs::read(env.oplog()).unwrap();
    bytes.extend_from_slice(&[0u8; 64]);
    fs::write(env.oplog(), &bytes).unwrap();

    let master = env.open();
    assert!(master.namespace().exists("/a"));
    master.create("/b").unwrap();
    drop(master);
    assert!(env.open().namespace().exists("/b"));
}

#[test]
fn corrupt_log_refuses_to_open() {
    let env = Env::new();
    {
        let master = env.open();
        master.create("/a").unwrap();
        master.create("/b").unwrap();
    }
    let mut bytes = fs::read(env.oplog()).unwrap();
    bytes[10] ^= 0xff;
    fs::write(env.oplog(), &bytes).unwrap();

    let err = Master::open_with_clock(env.config(), env.shim.clone(), env.clock.clone())
        .err()
        .unwrap();
    assert!(matches!(err, MasterError::Oplog(_)));
}

#[test]
fn corrupt_checkpoint_refuses_to_open() {
    let env = Env::new();
    {
        let master = env.open();
        master.create("/a").unwrap();
        master.checkpoint().unwrap();
    }
    let path = env.config().persistence.checkpoint_path;
    let text = fs::read_to_string(&path).unwrap().replace("/a", "/z");
    fs::write(&path, text).unwrap();

    let err = Master::open_with_clock(env.config(), env.shim.clone(), env.clock.clone())
        .err()
        .unwrap();
    assert!(matches!(err, MasterError::Checkpoint(_)));
}

#[tokio::test]
async fn lease_survives_restart() {
    let env = Env::new();
    let lease = {
        let master = env.open();
        master.notify_master("cs-1", &[]).unwrap();
        master.notify_master("cs-2", &[]).unwrap();
        master.create("/f").unwrap();
        let info = master.add_chunk("/f", 0).unwrap();
        for addr in &info.locations {
            env.shim.store_chunk(addr, info.handle, 1);
            master.report_chunk(addr, info.handle, 0, 1, "/f").unwrap();
        }
        master.find_lease_holder(info.handle).unwrap()
    };

    env.clock.advance(5_000);
    let master = env.open();
    master.poll_chunkservers().await;
    assert_eq!(master.find_lease_holder(lease.handle).unwrap(), lease);

    // Once it lapses a new grant is made, and it too survives restart.
    env.clock.set(lease.expiration);
    master.notify_master("cs-1", &[lease.handle]).unwrap();
    master.notify_master("cs-2", &[lease.handle]).unwrap();
    let next = master.find_lease_holder(lease.handle).unwrap();
    assert!(next.expiration > lease.expiration);
    drop(master);
    assert_eq!(env.open().find_lease_holder(lease.handle).unwrap(), next);
}

#[test]
fn config_file_drives_persistence_paths() {
    let env = Env::new();
    let dir = env.dir.path();
    let toml = format!(
        concat!(
            "[chunks]\nchunk_size = \"1 KiB\"\nreplication_factor = 1\n\n",
            "[persistence]\noplog_path = {:?}\ncheckpoint_path = {:?}\nsync = false\n",
        ),
        dir.join("custom.oplog"),
        dir.join("custom.checkpoint"),
    );
    let config_path = dir.join("master.toml");
    fs::write(&config_path, toml).unwrap();

    let config = MasterConfig::load(&config_path).unwrap();
    let master = Master::open(config, env.shim.clone()).unwrap();
    assert_eq!(master.chunk_size(), 1024);
    master.create("/f").unwrap();
    assert!(Path::new(&dir.join("custom.oplog")).exists());
}
