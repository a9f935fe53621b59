//! The directory tree.
//!
//! Every node sits behind its own `RwLock`. Operations lock root-to-leaf: read locks
//! on the ancestors they traverse and a write lock only on the node they mutate, so
//! work in disjoint subtrees only meets at shared read locks.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::{RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use crate::error::{MasterError, Result};
use crate::master::oplog::{Action, Journal, Replay};

type NodeRef = Arc<RwLock<Node>>;
type ReadGuard = lock_api::ArcRwLockReadGuard<RawRwLock, Node>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: String,
    pub kind: NodeKind,
    /// Always 0 for directories.
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    /// Live nodes in pre-order, children sorted by name. The root is implied.
    pub entries: Vec<DirEntry>,
}

enum Contents {
    Directory(HashMap<String, NodeRef>),
    File { length: u64 },
}

struct Node {
    contents: Contents,
    tombstoned: bool,
}

impl Node {
    fn directory() -> NodeRef {
        Arc::new(RwLock::new(Node {
            contents: Contents::Directory(HashMap::new()),
            tombstoned: false,
        }))
    }

    fn file() -> NodeRef {
        Arc::new(RwLock::new(Node { contents: Contents::File { length: 0 }, tombstoned: false }))
    }

    fn kind(&self) -> NodeKind {
        match self.contents {
            Contents::Directory(_) => NodeKind::Directory,
            Contents::File { .. } => NodeKind::File,
        }
    }

    fn length(&self) -> u64 {
        match self.contents {
            Contents::File { length } => length,
            Contents::Directory(_) => 0,
        }
    }

    fn sorted_children(&self) -> Vec<(String, NodeRef)> {
        match &self.contents {
            Contents::Directory(children) => {
                let mut children: Vec<(String, NodeRef)> =
                    children.iter().map(|(name, node)| (name.clone(), Arc::clone(node))).collect();
                children.sort_by(|a, b| a.0.cmp(&b.0));
                children
            }
            Contents::File { .. } => Vec::new(),
        }
    }
}

/// A parsed absolute path.
struct NsPath<'a> {
    normalized: String,
    components: Vec<&'a str>,
}

fn parse(path: &str) -> Result<NsPath<'_>> {
    if !path.starts_with('/') {
        return Err(MasterError::InvalidPath(format!("{path:?} is not absolute")));
    }
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    for c in &components {
        if *c == "." || *c == ".." || c.contains('\0') {
            return Err(MasterError::InvalidPath(format!("{path:?} has illegal component {c:?}")));
        }
    }
    let normalized = format!("/{}", components.join("/"));
    Ok(NsPath { normalized, components })
}

/// Canonical form of `path`: absolute, no empty components.
pub fn normalize(path: &str) -> Result<String> {
    parse(path).map(|p| p.normalized)
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub struct NamespaceManager {
    root: NodeRef,
    recursive_listing: bool,
}

impl NamespaceManager {
    pub fn new(recursive_listing: bool) -> NamespaceManager {
        NamespaceManager { root: Node::directory(), recursive_listing }
    }

    /// Rebuild a tree from a checkpoint snapshot.
    pub fn from_snapshot(
        snapshot: &NamespaceSnapshot,
        recursive_listing: bool,
    ) -> Result<NamespaceManager> {
        let ns = NamespaceManager::new(recursive_listing);
        for entry in &snapshot.entries {
            match entry.kind {
                NodeKind::Directory => ns.create_dir(&entry.path, &Replay)?,
                NodeKind::File => {
                    ns.create(&entry.path, &Replay)?;
                    ns.set_file_length(&entry.path, entry.length)?;
                }
            }
        }
        Ok(ns)
    }

    /// Read-lock every proper ancestor of `components` and return the node it names.
    ///
    /// The returned guards must outlive any use of the node: they keep it attached.
    fn descend(
        &self,
        path: &str,
        components: &[&str],
        missing: fn(String) -> MasterError,
    ) -> Result<(Vec<ReadGuard>, NodeRef)> {
        let mut guards = Vec::with_capacity(components.len());
        let mut current = Arc::clone(&self.root);
        for component in components {
            let guard = current.read_arc();
            let next = match &guard.contents {
                Contents::Directory(children) => children.get(*component).cloned(),
                Contents::File { .. } => None,
            };
            let next = next.ok_or_else(|| missing(path.to_string()))?;
            guards.push(guard);
            current = next;
        }
        Ok((guards, current))
    }

    fn insert(
        &self,
        path: &str,
        node: NodeRef,
        action: impl FnOnce(String) -> Action,
        journal: &dyn Journal,
    ) -> Result<()> {
        let parsed = parse(path)?;
        let Some((name, parent_components)) = parsed.components.split_last() else {
            return Err(MasterError::AlreadyExists("/".to_string()));
        };

        let (_ancestors, parent) =
            self.descend(&parsed.normalized, parent_components, MasterError::InvalidPath)?;
        let mut parent = parent.write_arc();
        let Contents::Directory(children) = &mut parent.contents else {
            let reason = format!("{}: parent is a file", parsed.normalized);
            return Err(MasterError::InvalidPath(reason));
        };
        if children.contains_key(*name) {
            return Err(MasterError::AlreadyExists(parsed.normalized));
        }

        journal.record(action(parsed.normalized))?;
        children.insert(name.to_string(), node);
        Ok(())
    }

    pub fn create(&self, path: &str, journal: &dyn Journal) -> Result<()> {
        self.insert(path, Node::file(), |path| Action::CreateFile { path }, journal)
    }

    pub fn create_dir(&self, path: &str, journal: &dyn Journal) -> Result<()> {
        self.insert(path, Node::directory(), |path| Action::CreateDir { path }, journal)
    }

    /// Tombstone `path` and everything below it. Returns the paths of the files removed.
    pub fn delete(&self, path: &str, journal: &dyn Journal) -> Result<Vec<String>> {
        self.delete_then(path, journal, |_| {})
    }

    /// Like `delete`, running `removed` on the tombstoned file paths before the
    /// parent is unlocked, so nothing can recreate them in between.
    pub fn delete_then(
        &self,
        path: &str,
        journal: &dyn Journal,
        removed: impl FnOnce(&[String]),
    ) -> Result<Vec<String>> {
        let parsed = parse(path)?;
        let Some((name, parent_components)) = parsed.components.split_last() else {
            return Err(MasterError::InvalidPath("cannot delete /".to_string()));
        };

        let (_ancestors, parent) =
            self.descend(&parsed.normalized, parent_components, MasterError::NotFound)?;
        let mut parent = parent.write_arc();
        let Contents::Directory(children) = &mut parent.contents else {
            return Err(MasterError::NotFound(parsed.normalized));
        };
        if !children.contains_key(*name) {
            return Err(MasterError::NotFound(parsed.normalized));
        }

        journal.record(Action::DeleteFile { path: parsed.normalized.clone() })?;
        let mut files = Vec::new();
        if let Some(node) = children.remove(*name) {
            tombstone(&node, parsed.normalized, &mut files);
        }
        removed(&files);
        Ok(files)
    }

    pub fn exists(&self, path: &str) -> bool {
        let Ok(parsed) = parse(path) else { return false };
        self.descend(&parsed.normalized, &parsed.components, MasterError::NotFound).is_ok()
    }

    /// Run `f` while `path` is pinned as a live file: it cannot be deleted until `f` returns.
    pub fn with_file<T>(&self, path: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let parsed = parse(path)?;
        let (_ancestors, node) =
            self.descend(&parsed.normalized, &parsed.components, MasterError::NotFound)?;
        let node = node.read();
        if node.kind() != NodeKind::File {
            return Err(MasterError::NotFound(format!("{} is not a file", parsed.normalized)));
        }
        f()
    }

    pub fn get_file_length(&self, path: &str) -> Result<u64> {
        let parsed = parse(path)?;
        let (_ancestors, node) =
            self.descend(&parsed.normalized, &parsed.components, MasterError::NotFound)?;
        let node = node.read();
        match node.contents {
            Contents::File { length } if !node.tombstoned => Ok(length),
            _ => Err(MasterError::NotFound(parsed.normalized)),
        }
    }

    /// Raise the recorded length to `length`. Smaller values are ignored.
    pub fn set_file_length(&self, path: &str, length: u64) -> Result<()> {
        self.raise_file_length_with(path, || Ok(length)).map(|_| ())
    }

    /// Raise the length of `path` to whatever `f` returns, with the file
    /// write-locked for the duration of `f`. Returns the resulting length.
    /// An error from `f` leaves the file untouched.
    pub fn raise_file_length_with(
        &self,
        path: &str,
        f: impl FnOnce() -> Result<u64>,
    ) -> Result<u64> {
        let parsed = parse(path)?;
        let (_ancestors, node) =
            self.descend(&parsed.normalized, &parsed.components, MasterError::NotFound)?;
        let mut node = node.write();
        if node.tombstoned {
            return Err(MasterError::NotFound(parsed.normalized));
        }
        let Contents::File { length: current } = &mut node.contents else {
            return Err(MasterError::NotFound(format!("{} is not a file", parsed.normalized)));
        };
        let length = f()?;
        *current = (*current).max(length);
        Ok(*current)
    }

    /// Children of the directory at `path`, recursively if configured so.
    pub fn list_all_files(&self, path: &str) -> Result<Listing> {
        self.listing(path, self.recursive_listing)
    }

    pub fn list_recursive(&self, path: &str) -> Result<Listing> {
        self.listing(path, true)
    }

    fn listing(&self, path: &str, recursive: bool) -> Result<Listing> {
        let parsed = parse(path)?;
        let (_ancestors, node) =
            self.descend(&parsed.normalized, &parsed.components, MasterError::NotFound)?;
        if node.read().kind() != NodeKind::Directory {
            return Err(MasterError::NotFound(format!("{} is not a directory", parsed.normalized)));
        }
        Ok(Listing { base: parsed.normalized, node, recursive })
    }

    pub fn snapshot(&self) -> NamespaceSnapshot {
        let mut entries = Vec::new();
        snapshot_into(&self.root, "/", &mut entries);
        NamespaceSnapshot { entries }
    }
}

fn tombstone(node: &NodeRef, path: String, files: &mut Vec<String>) {
    let mut guard = node.write();
    guard.tombstoned = true;
    match &guard.contents {
        Contents::File { .. } => files.push(path),
        Contents::Directory(children) => {
            for (name, child) in children {
                tombstone(child, join(&path, name), files);
            }
        }
    }
}

fn snapshot_into(node: &NodeRef, path: &str, entries: &mut Vec<DirEntry>) {
    let guard = node.read();
    for (name, child) in guard.sorted_children() {
        let child_path = join(path, &name);
        let (kind, length) = {
            let child = child.read();
            (child.kind(), child.length())
        };
        entries.push(DirEntry { path: child_path.clone(), kind, length });
        if kind == NodeKind::Directory {
            snapshot_into(&child, &child_path, entries);
        }
    }
}

/// A directory listing. Iterating resolves entries lazily and skips anything
/// deleted in the meantime; each call to `iter` starts over.
pub struct Listing {
    base: String,
    node: NodeRef,
    recursive: bool,
}

impl Listing {
    pub fn iter(&self) -> ListingIter {
        let guard = self.node.read();
        let frames = if guard.tombstoned {
            Vec::new()
        } else {
            vec![Frame { path: self.base.clone(), children: guard.sorted_children().into_iter() }]
        };
        ListingIter { frames, recursive: self.recursive }
    }
}

impl<'a> IntoIterator for &'a Listing {
    type Item = DirEntry;
    type IntoIter = ListingIter;

    fn into_iter(self) -> ListingIter {
        self.iter()
    }
}

struct Frame {
    path: String,
    children: std::vec::IntoIter<(String, NodeRef)>,
}

pub struct ListingIter {
    frames: Vec<Frame>,
    recursive: bool,
}

impl Iterator for ListingIter {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        loop {
            let frame = self.frames.last_mut()?;
            let Some((name, node)) = frame.children.next() else {
                self.frames.pop();
                continue;
            };
            let path = join(&frame.path, &name);
            let guard = node.read();
            if guard.tombstoned {
                continue;
            }
            let entry = DirEntry { path: path.clone(), kind: guard.kind(), length: guard.length() };
            if self.recursive && entry.kind == NodeKind::Directory {
                let children = guard.sorted_children().into_iter();
                self.frames.push(Frame { path, children });
            }
            return Some(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn paths(listing: &Listing) -> Vec<String> {
        listing.iter().map(|e| e.path).collect()
    }

    #[test]
    fn create_requires_existing_directory_parent() {
        let ns = NamespaceManager::new(false);
        assert!(matches!(ns.create("/a/f", &Replay), Err(MasterError::InvalidPath(_))));
        ns.create_dir("/a", &Replay).unwrap();
        ns.create("/a/f", &Replay).unwrap();
        assert!(matches!(ns.create("/a/f/g", &Replay), Err(MasterError::InvalidPath(_))));
        assert!(matches!(ns.create_dir("/a/f", &Replay), Err(MasterError::AlreadyExists(_))));
        assert!(matches!(ns.create("relative", &Replay), Err(MasterError::InvalidPath(_))));
        assert!(matches!(ns.create("/a/../b", &Replay), Err(MasterError::InvalidPath(_))));
    }

    #[test]
    fn paths_are_normalized() {
        let ns = NamespaceManager::new(false);
        ns.create_dir("/a/", &Replay).unwrap();
        ns.create("//a//f", &Replay).unwrap();
        assert!(ns.exists("/a/f"));
        assert_eq!(normalize("//a//f/").unwrap(), "/a/f");
        assert_eq!(normalize("/").unwrap(), "/");
    }

    #[test]
    fn delete_frees_the_path() {
        let ns = NamespaceManager::new(false);
        ns.create("/f", &Replay).unwrap();
        ns.set_file_length("/f", 10).unwrap();
        assert_eq!(ns.delete("/f", &Replay).unwrap(), vec!["/f".to_string()]);
        assert!(matches!(ns.get_file_length("/f"), Err(MasterError::NotFound(_))));
        assert!(matches!(ns.delete("/f", &Replay), Err(MasterError::NotFound(_))));
        ns.create("/f", &Replay).unwrap();
        assert_eq!(ns.get_file_length("/f").unwrap(), 0);
    }

    #[test]
    fn rejected_length_updates_leave_the_file_alone() {
        let ns = NamespaceManager::new(false);
        ns.create("/f", &Replay).unwrap();
        assert_eq!(ns.raise_file_length_with("/f", || Ok(10)).unwrap(), 10);
        let res = ns.raise_file_length_with("/f", || Err(MasterError::Stale("replaced".into())));
        assert!(matches!(res, Err(MasterError::Stale(_))));
        assert_eq!(ns.raise_file_length_with("/f", || Ok(3)).unwrap(), 10);

        let mut called = false;
        ns.create_dir("/d", &Replay).unwrap();
        let res = ns.raise_file_length_with("/d", || {
            called = true;
            Ok(1)
        });
        assert!(matches!(res, Err(MasterError::NotFound(_))));
        assert!(!called);
    }

    #[test]
    fn deleting_a_directory_tombstones_its_subtree() {
        let ns = NamespaceManager::new(false);
        ns.create_dir("/d", &Replay).unwrap();
        ns.create_dir("/d/e", &Replay).unwrap();
        ns.create("/d/x", &Replay).unwrap();
        ns.create("/d/e/y", &Replay).unwrap();

        let listing = ns.list_recursive("/d").unwrap();
        let mut files = ns.delete("/d", &Replay).unwrap();
        files.sort();
        assert_eq!(files, vec!["/d/e/y".to_string(), "/d/x".to_string()]);
        assert!(!ns.exists("/d/e/y"));
        assert!(ns.delete("/", &Replay).is_err());
        // A listing taken before the delete no longer yields anything.
        assert!(paths(&listing).is_empty());
    }

    #[test]
    fn listing_is_lazy_and_restartable() {
        let ns = NamespaceManager::new(false);
        ns.create_dir("/d", &Replay).unwrap();
        ns.create("/d/a", &Replay).unwrap();
        ns.create("/d/b", &Replay).unwrap();
        ns.create_dir("/d/sub", &Replay).unwrap();
        ns.create("/d/sub/c", &Replay).unwrap();

        let listing = ns.list_all_files("/d").unwrap();
        assert_eq!(paths(&listing), vec!["/d/a", "/d/b", "/d/sub"]);

        ns.delete("/d/b", &Replay).unwrap();
        assert_eq!(paths(&listing), vec!["/d/a", "/d/sub"]);

        let recursive = ns.list_recursive("/d").unwrap();
        assert_eq!(paths(&recursive), vec!["/d/a", "/d/sub", "/d/sub/c"]);

        assert!(matches!(ns.list_all_files("/d/a"), Err(MasterError::NotFound(_))));
        assert!(matches!(ns.list_all_files("/nope"), Err(MasterError::NotFound(_))));
    }

    #[test]
    fn recursive_listing_follows_configuration() {
        let ns = NamespaceManager::new(true);
        ns.create_dir("/d", &Replay).unwrap();
        ns.create("/d/f", &Replay).unwrap();
        assert_eq!(paths(&ns.list_all_files("/").unwrap()), vec!["/d", "/d/f"]);
    }

    #[test]
    fn file_length_only_grows() {
        let ns = NamespaceManager::new(false);
        ns.create("/f", &Replay).unwrap();
        ns.set_file_length("/f", 2048).unwrap();
        ns.set_file_length("/f", 1024).unwrap();
        assert_eq!(ns.get_file_length("/f").unwrap(), 2048);
        ns.create_dir("/d", &Replay).unwrap();
        assert!(ns.set_file_length("/d", 1).is_err());
        assert!(ns.get_file_length("/d").is_err());
    }

    #[test]
    fn snapshot_round_trips_structure_and_lengths() {
        let ns = NamespaceManager::new(false);
        ns.create_dir("/b", &Replay).unwrap();
        ns.create_dir("/a", &Replay).unwrap();
        ns.create("/a/f", &Replay).unwrap();
        ns.set_file_length("/a/f", 99).unwrap();

        let snapshot = ns.snapshot();
        let paths: Vec<&str> = snapshot.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/a/f", "/b"]);

        let restored = NamespaceManager::from_snapshot(&snapshot, false).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.get_file_length("/a/f").unwrap(), 99);
    }

    #[test]
    fn failed_journal_leaves_tree_untouched() {
        struct Broken;
        impl Journal for Broken {
            fn record(&self, _action: Action) -> std::result::Result<(), crate::error::OplogError> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
            }
        }
        let ns = NamespaceManager::new(false);
        assert!(matches!(ns.create("/f", &Broken), Err(MasterError::Oplog(_))));
        assert!(!ns.exists("/f"));
    }

    #[test]
    fn disjoint_directories_proceed_concurrently() {
        let ns = Arc::new(NamespaceManager::new(false));
        for d in 0..4 {
            ns.create_dir(&format!("/d{d}"), &Replay).unwrap();
        }
        let handles: Vec<_> = (0..4)
            .map(|d| {
                let ns = Arc::clone(&ns);
                thread::spawn(move || {
                    for i in 0..200 {
                        ns.create(&format!("/d{d}/f{i}"), &Replay).unwrap();
                        if i % 2 == 0 {
                            ns.delete(&format!("/d{d}/f{i}"), &Replay).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for d in 0..4 {
            assert_eq!(ns.list_all_files(&format!("/d{d}")).unwrap().iter().count(), 100);
        }
    }

    #[test]
    fn racing_creates_of_one_path_admit_exactly_one() {
        let ns = Arc::new(NamespaceManager::new(false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ns = Arc::clone(&ns);
                thread::spawn(move || ns.create("/same", &Replay).is_ok())
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(winners, 1);
    }
}
