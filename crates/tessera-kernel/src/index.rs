//! Metadata index.
//!
//! The single source of truth for which chunks make up which file. Records
//! live in memory in a path-ordered map (so a directory's descendants are one
//! contiguous range) and are written through to a [`KvStore`] before the
//! in-memory map changes. Every mutation happens under one index-wide write
//! lock, which is held only for the metadata step, never across network I/O.
//!
//! Invariants:
//! - `/` always exists and is a directory.
//! - Every non-root record's parent exists, is a directory, and lists the
//!   record's name among its children.
//! - A file's chunk lengths are non-zero and sum to its size.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use tessera_types::{check_tiling, FsPath, InodeRecord, NodeKind, Owner};

use crate::store::{KvOp, KvStore, StoreError};

const RECORD_PREFIX: &str = "inode:";
const FORMAT_KEY: &str = "index:format";
const FORMAT_VERSION: u32 = 1;

/// Metadata index errors.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("not found: {0}")]
    NotFound(FsPath),

    #[error("already exists: {0}")]
    AlreadyExists(FsPath),

    #[error("not a directory: {0}")]
    NotADirectory(FsPath),

    #[error("is a directory: {0}")]
    IsADirectory(FsPath),

    #[error("directory not empty: {0}")]
    NotEmpty(FsPath),

    #[error("parent directory missing for {0}")]
    ParentMissing(FsPath),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("cannot change {path} from {existing} to {requested}")]
    KindMismatch {
        path: FsPath,
        existing: &'static str,
        requested: &'static str,
    },

    /// Optimistic commit lost a race with another mutation.
    #[error("version conflict on {path}: expected {expected}, found {found}")]
    Conflict {
        path: FsPath,
        expected: u64,
        found: u64,
    },

    #[error("index consistency violation: {0}")]
    Consistency(String),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("encoding: {0}")]
    Codec(#[from] postcard::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Serialized form of the whole index.
#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    format: u32,
    generation: u64,
    records: Vec<InodeRecord>,
}

/// Aggregate counters for statfs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct IndexState {
    records: BTreeMap<FsPath, InodeRecord>,
    /// Bumped on every committed mutation; lets the sync manager skip
    /// snapshots when nothing changed.
    generation: u64,
}

/// Durable path → record map.
pub struct MetadataIndex {
    state: RwLock<IndexState>,
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for MetadataIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataIndex")
            .field("records", &self.state.read().records.len())
            .finish()
    }
}

fn record_key(path: &FsPath) -> String {
    format!("{RECORD_PREFIX}{path}")
}

fn encode(record: &InodeRecord) -> IndexResult<KvOp> {
    Ok(KvOp::Put(record_key(&record.path), postcard::to_stdvec(record)?))
}

impl MetadataIndex {
    /// Returns true if `store` already holds an index.
    pub fn has_local_state(store: &dyn KvStore) -> IndexResult<bool> {
        Ok(store.get(FORMAT_KEY)?.is_some())
    }

    /// Erase every index key from `store`, so the next open starts blank.
    pub fn clear_local_state(store: &dyn KvStore) -> IndexResult<()> {
        let mut ops: Vec<KvOp> = store
            .scan_prefix(RECORD_PREFIX)?
            .into_iter()
            .map(|(key, _)| KvOp::Delete(key))
            .collect();
        ops.push(KvOp::Delete(FORMAT_KEY.into()));
        store.write_batch(ops)?;
        Ok(())
    }

    /// Load the index from `store`, creating an empty tree (just `/`) if the
    /// store is blank.
    pub fn open(store: Arc<dyn KvStore>, owner: Owner) -> IndexResult<Self> {
        let mut records = BTreeMap::new();
        for (key, value) in store.scan_prefix(RECORD_PREFIX)? {
            let record: InodeRecord = postcard::from_bytes(&value)?;
            if record_key(&record.path) != key {
                return Err(IndexError::Consistency(format!(
                    "key {key} holds record for {}",
                    record.path
                )));
            }
            records.insert(record.path.clone(), record);
        }

        if records.is_empty() {
            let root = InodeRecord::directory(FsPath::root(), 0o755, owner);
            store.write_batch(vec![
                encode(&root)?,
                KvOp::Put(FORMAT_KEY.into(), FORMAT_VERSION.to_le_bytes().to_vec()),
            ])?;
            records.insert(FsPath::root(), root);
            info!("initialized empty metadata index");
        } else {
            verify_tree(&records)?;
            info!(records = records.len(), "loaded metadata index from local store");
        }

        Ok(Self {
            state: RwLock::new(IndexState {
                records,
                generation: 0,
            }),
            store,
        })
    }

    /// Current mutation counter.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Number of records, including `/`.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch a copy of the record at `path`.
    pub fn lookup(&self, path: &FsPath) -> IndexResult<InodeRecord> {
        self.state
            .read()
            .records
            .get(path)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(path.clone()))
    }

    /// Names of the immediate children of `dir`, sorted.
    pub fn list_children(&self, dir: &FsPath) -> IndexResult<Vec<String>> {
        let state = self.state.read();
        let record = state
            .records
            .get(dir)
            .ok_or_else(|| IndexError::NotFound(dir.clone()))?;
        match &record.kind {
            NodeKind::Directory { children } => Ok(children.iter().cloned().collect()),
            _ => Err(IndexError::NotADirectory(dir.clone())),
        }
    }

    /// Records of the immediate children of `dir`, read under one lock.
    pub fn child_records(&self, dir: &FsPath) -> IndexResult<Vec<InodeRecord>> {
        let state = self.state.read();
        let record = state
            .records
            .get(dir)
            .ok_or_else(|| IndexError::NotFound(dir.clone()))?;
        let NodeKind::Directory { children } = &record.kind else {
            return Err(IndexError::NotADirectory(dir.clone()));
        };
        let mut out = Vec::with_capacity(children.len());
        for name in children {
            let child = dir
                .join(name)
                .map_err(|e| IndexError::InvalidPath(e.to_string()))?;
            match state.records.get(&child) {
                Some(rec) => out.push(rec.clone()),
                None => {
                    return Err(IndexError::Consistency(format!(
                        "{dir} lists missing child {name}"
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Every record, ordered by path.
    pub fn all_records(&self) -> Vec<InodeRecord> {
        self.state.read().records.values().cloned().collect()
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        let mut stats = IndexStats::default();
        for record in state.records.values() {
            match &record.kind {
                NodeKind::File { size, .. } => {
                    stats.files += 1;
                    stats.bytes += size;
                }
                NodeKind::Directory { .. } => stats.directories += 1,
                NodeKind::Symlink { .. } => stats.symlinks += 1,
            }
        }
        stats
    }

    /// Insert a new record. Fails if the path is taken.
    pub fn insert(&self, record: InodeRecord) -> IndexResult<InodeRecord> {
        let mut state = self.state.write();
        if state.records.contains_key(&record.path) {
            return Err(IndexError::AlreadyExists(record.path.clone()));
        }
        self.insert_locked(&mut state, record)
    }

    /// Replace-or-insert keyed by `record.path`.
    ///
    /// A directory's child set is owned by the index: the stored set is kept
    /// regardless of what `record` carries.
    pub fn upsert(&self, record: InodeRecord) -> IndexResult<InodeRecord> {
        let mut state = self.state.write();
        match state.records.get(&record.path) {
            Some(existing) => {
                let version = existing.version;
                self.replace_locked(&mut state, record, version)
            }
            None => self.insert_locked(&mut state, record),
        }
    }

    /// Replace the record at `record.path` only if its stored version is
    /// still `expected_version`.
    pub fn compare_and_upsert(
        &self,
        record: InodeRecord,
        expected_version: u64,
    ) -> IndexResult<InodeRecord> {
        let mut state = self.state.write();
        let found = state
            .records
            .get(&record.path)
            .map(|r| r.version)
            .ok_or_else(|| IndexError::NotFound(record.path.clone()))?;
        if found != expected_version {
            return Err(IndexError::Conflict {
                path: record.path.clone(),
                expected: expected_version,
                found,
            });
        }
        self.replace_locked(&mut state, record, found)
    }

    /// Stamp `atime` on a record.
    ///
    /// Access times are advisory: the version is not bumped (so in-flight
    /// compare-and-upsert commits are unaffected) and the change alone does
    /// not make the index dirty for the next snapshot.
    pub fn touch_accessed(&self, path: &FsPath, at: SystemTime) -> IndexResult<()> {
        let mut state = self.state.write();
        let mut record = state
            .records
            .get(path)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(path.clone()))?;
        record.atime = at;
        self.store.write_batch(vec![encode(&record)?])?;
        state.records.insert(path.clone(), record);
        Ok(())
    }

    /// Delete the record at `path`, returning it.
    pub fn remove(&self, path: &FsPath) -> IndexResult<InodeRecord> {
        let Some(parent_path) = path.parent() else {
            return Err(IndexError::InvalidPath("cannot remove /".into()));
        };
        let name = path
            .name()
            .ok_or_else(|| IndexError::InvalidPath(path.to_string()))?
            .to_string();

        let mut state = self.state.write();
        let record = state
            .records
            .get(path)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(path.clone()))?;
        if let Some(children) = record.children() {
            if !children.is_empty() {
                return Err(IndexError::NotEmpty(path.clone()));
            }
        }

        let mut parent = self.directory_locked(&state, &parent_path)?;
        if let NodeKind::Directory { children } = &mut parent.kind {
            children.remove(&name);
        }
        parent.touch_modified();
        parent.version += 1;

        self.store.write_batch(vec![
            KvOp::Delete(record_key(path)),
            encode(&parent)?,
        ])?;

        state.records.remove(path);
        state.records.insert(parent_path, parent);
        state.generation += 1;
        debug!(%path, kind = record.kind.label(), "index remove");
        Ok(record)
    }

    /// Move `old` (and, for directories, every descendant) to `new`.
    ///
    /// If `new` exists it is replaced, POSIX style: a file may replace a
    /// file or symlink, a directory may replace an empty directory. The
    /// replaced record is returned so its chunks can be reclaimed.
    pub fn rename(&self, old: &FsPath, new: &FsPath) -> IndexResult<Option<InodeRecord>> {
        if old.is_root() || new.is_root() {
            return Err(IndexError::InvalidPath("cannot rename /".into()));
        }
        if old == new {
            if !self.state.read().records.contains_key(old) {
                return Err(IndexError::NotFound(old.clone()));
            }
            return Ok(None);
        }
        if new.is_descendant_of(old) {
            return Err(IndexError::InvalidPath(format!(
                "cannot move {old} beneath itself ({new})"
            )));
        }
        let (Some(old_parent), Some(old_name)) = (old.parent(), old.name()) else {
            return Err(IndexError::InvalidPath(old.to_string()));
        };
        let (Some(new_parent), Some(new_name)) = (new.parent(), new.name()) else {
            return Err(IndexError::InvalidPath(new.to_string()));
        };

        let mut state = self.state.write();
        let source = state
            .records
            .get(old)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(old.clone()))?;

        let replaced = match state.records.get(new) {
            None => None,
            Some(target) => {
                match (source.is_dir(), target.is_dir()) {
                    (true, false) => return Err(IndexError::NotADirectory(new.clone())),
                    (false, true) => return Err(IndexError::IsADirectory(new.clone())),
                    (true, true) => {
                        if target.children().is_some_and(|c| !c.is_empty()) {
                            return Err(IndexError::NotEmpty(new.clone()));
                        }
                    }
                    (false, false) => {}
                }
                Some(target.clone())
            }
        };

        // Validate the destination parent before touching anything.
        self.directory_locked(&state, &new_parent)?;

        // Collect the subtree: the record itself plus every descendant key.
        let mut moved: Vec<InodeRecord> = vec![source.clone()];
        // Keys sharing `old` as a string prefix are contiguous, but siblings
        // like `/a!x` sort between `/a` and `/a/b`, so filter component-wise.
        if source.is_dir() {
            moved.extend(
                state
                    .records
                    .range(old.clone()..)
                    .take_while(|(k, _)| k.as_str().starts_with(old.as_str()))
                    .filter(|(k, _)| k.is_descendant_of(old))
                    .map(|(_, v)| v.clone()),
            );
        }

        let now = SystemTime::now();
        let mut ops = Vec::with_capacity(moved.len() * 2 + 2);
        let mut rebased = Vec::with_capacity(moved.len());
        for mut record in moved.iter().cloned() {
            let Some(target) = record.path.rebase(old, new) else {
                return Err(IndexError::Consistency(format!(
                    "{} is not under {old}",
                    record.path
                )));
            };
            ops.push(KvOp::Delete(record_key(&record.path)));
            record.path = target;
            record.version += 1;
            if record.path == *new {
                record.ctime = now;
            }
            rebased.push(record);
        }
        if let Some(target) = &replaced {
            ops.push(KvOp::Delete(record_key(&target.path)));
        }
        for record in &rebased {
            ops.push(encode(record)?);
        }

        // Parent child sets. When both parents are the same directory the
        // updates must land on one copy.
        let mut parents: BTreeMap<FsPath, InodeRecord> = BTreeMap::new();
        let mut from_dir = self.directory_locked(&state, &old_parent)?;
        if let NodeKind::Directory { children } = &mut from_dir.kind {
            children.remove(old_name);
        }
        parents.insert(old_parent.clone(), from_dir);
        let mut to_dir = match parents.remove(&new_parent) {
            Some(dir) => dir,
            None => self.directory_locked(&state, &new_parent)?,
        };
        if let NodeKind::Directory { children } = &mut to_dir.kind {
            children.insert(new_name.to_string());
        }
        parents.insert(new_parent.clone(), to_dir);
        for parent in parents.values_mut() {
            parent.mtime = now;
            parent.ctime = now;
            parent.version += 1;
            ops.push(encode(parent)?);
        }

        self.store.write_batch(ops)?;

        for record in &moved {
            state.records.remove(&record.path);
        }
        if let Some(target) = &replaced {
            state.records.remove(&target.path);
        }
        for record in rebased {
            state.records.insert(record.path.clone(), record);
        }
        for (path, parent) in parents {
            state.records.insert(path, parent);
        }
        state.generation += 1;
        debug!(%old, %new, moved = moved.len(), "index rename");
        Ok(replaced)
    }

    /// Serialize the whole index.
    pub fn snapshot(&self) -> IndexResult<Vec<u8>> {
        let state = self.state.read();
        let snapshot = IndexSnapshot {
            format: FORMAT_VERSION,
            generation: state.generation,
            records: state.records.values().cloned().collect(),
        };
        Ok(postcard::to_stdvec(&snapshot)?)
    }

    /// Replace the whole index with a snapshot, locally and durably.
    pub fn restore(&self, bytes: &[u8]) -> IndexResult<()> {
        let snapshot: IndexSnapshot = postcard::from_bytes(bytes)?;
        if snapshot.format != FORMAT_VERSION {
            return Err(IndexError::Consistency(format!(
                "unsupported snapshot format {}",
                snapshot.format
            )));
        }
        let mut records = BTreeMap::new();
        for record in snapshot.records {
            if records.insert(record.path.clone(), record).is_some() {
                return Err(IndexError::Consistency("duplicate path in snapshot".into()));
            }
        }
        verify_tree(&records)?;

        let mut state = self.state.write();
        let mut ops: Vec<KvOp> = state
            .records
            .keys()
            .filter(|k| !records.contains_key(*k))
            .map(|k| KvOp::Delete(record_key(k)))
            .collect();
        for record in records.values() {
            ops.push(encode(record)?);
        }
        ops.push(KvOp::Put(
            FORMAT_KEY.into(),
            FORMAT_VERSION.to_le_bytes().to_vec(),
        ));
        self.store.write_batch(ops)?;

        info!(records = records.len(), "restored metadata index from snapshot");
        state.records = records;
        state.generation += 1;
        Ok(())
    }

    fn directory_locked(&self, state: &IndexState, path: &FsPath) -> IndexResult<InodeRecord> {
        match state.records.get(path) {
            Some(record) if record.is_dir() => Ok(record.clone()),
            Some(_) => Err(IndexError::NotADirectory(path.clone())),
            None => Err(IndexError::ParentMissing(path.clone())),
        }
    }

    fn insert_locked(
        &self,
        state: &mut IndexState,
        mut record: InodeRecord,
    ) -> IndexResult<InodeRecord> {
        let path = record.path.clone();
        let (Some(parent_path), Some(name)) = (path.parent(), path.name()) else {
            return Err(IndexError::AlreadyExists(path));
        };
        validate_payload(&record)?;

        let mut parent = self.directory_locked(state, &parent_path)?;
        if let NodeKind::Directory { children } = &mut parent.kind {
            children.insert(name.to_string());
        }
        parent.touch_modified();
        parent.version += 1;

        if let NodeKind::Directory { children } = &mut record.kind {
            children.clear();
        }
        record.version = 1;

        self.store
            .write_batch(vec![encode(&record)?, encode(&parent)?])?;

        state.records.insert(parent_path, parent);
        state.records.insert(path.clone(), record.clone());
        state.generation += 1;
        debug!(%path, kind = record.kind.label(), "index insert");
        Ok(record)
    }

    fn replace_locked(
        &self,
        state: &mut IndexState,
        mut record: InodeRecord,
        current_version: u64,
    ) -> IndexResult<InodeRecord> {
        let Some(existing) = state.records.get(&record.path) else {
            return Err(IndexError::NotFound(record.path.clone()));
        };
        if existing.kind.label() != record.kind.label() {
            return Err(IndexError::KindMismatch {
                path: record.path.clone(),
                existing: existing.kind.label(),
                requested: record.kind.label(),
            });
        }
        validate_payload(&record)?;
        if let (NodeKind::Directory { children: stored }, NodeKind::Directory { children }) =
            (&existing.kind, &mut record.kind)
        {
            *children = stored.clone();
        }
        record.version = current_version + 1;

        self.store.write_batch(vec![encode(&record)?])?;

        state.records.insert(record.path.clone(), record.clone());
        state.generation += 1;
        debug!(path = %record.path, version = record.version, "index replace");
        Ok(record)
    }
}

/// Reject file records whose descriptors do not tile their size.
fn validate_payload(record: &InodeRecord) -> IndexResult<()> {
    if let NodeKind::File { size, chunks } = &record.kind {
        check_tiling(chunks, *size, u32::MAX)
            .map_err(|e| IndexError::Consistency(format!("{}: {e}", record.path)))?;
    }
    Ok(())
}

/// Check the tree invariants over a full record set.
fn verify_tree(records: &BTreeMap<FsPath, InodeRecord>) -> IndexResult<()> {
    match records.get(&FsPath::root()) {
        Some(root) if root.is_dir() => {}
        Some(_) => return Err(IndexError::Consistency("/ is not a directory".into())),
        None => return Err(IndexError::Consistency("missing /".into())),
    }

    for (path, record) in records {
        if *path != record.path {
            return Err(IndexError::Consistency(format!(
                "key {path} holds record for {}",
                record.path
            )));
        }
        validate_payload(record)?;

        if let (Some(parent), Some(name)) = (path.parent(), path.name()) {
            let listed = records
                .get(&parent)
                .and_then(|p| p.children())
                .is_some_and(|c| c.contains(name));
            if !listed {
                return Err(IndexError::Consistency(format!(
                    "{path} is not listed by a parent directory"
                )));
            }
        }

        if let Some(children) = record.children() {
            for name in children {
                let child = path
                    .join(name)
                    .map_err(|e| IndexError::Consistency(e.to_string()))?;
                if !records.contains_key(&child) {
                    return Err(IndexError::Consistency(format!(
                        "{path} lists missing child {name}"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use tessera_types::{Checksum, ChunkDescriptor, RemoteId};

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    fn open() -> (MetadataIndex, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        let index = MetadataIndex::open(store.clone(), Owner::default()).unwrap();
        (index, store)
    }

    fn file_with(path: &str, data: &[u8]) -> InodeRecord {
        let mut rec = InodeRecord::file(p(path), 0o644, Owner::default());
        rec.kind = NodeKind::File {
            size: data.len() as u64,
            chunks: vec![ChunkDescriptor::remote(
                RemoteId::generate(),
                data.len() as u32,
                Checksum::of(data),
            )],
        };
        rec
    }

    #[test]
    fn test_open_creates_root() {
        let (index, store) = open();
        assert!(index.lookup(&FsPath::root()).unwrap().is_dir());
        assert!(MetadataIndex::has_local_state(store.as_ref()).unwrap());
    }

    #[test]
    fn test_clear_local_state() {
        let (index, store) = open();
        index
            .insert(InodeRecord::directory(p("/a"), 0o755, Owner::default()))
            .unwrap();
        drop(index);

        MetadataIndex::clear_local_state(store.as_ref()).unwrap();
        assert!(!MetadataIndex::has_local_state(store.as_ref()).unwrap());
        assert!(store.scan_prefix(RECORD_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn test_insert_requires_parent() {
        let (index, _) = open();
        let err = index
            .insert(InodeRecord::file(p("/a/b"), 0o644, Owner::default()))
            .unwrap_err();
        assert!(matches!(err, IndexError::ParentMissing(_)));

        index
            .insert(InodeRecord::directory(p("/a"), 0o755, Owner::default()))
            .unwrap();
        index
            .insert(InodeRecord::file(p("/a/b"), 0o644, Owner::default()))
            .unwrap();
        assert_eq!(index.list_children(&p("/a")).unwrap(), vec!["b"]);
        assert_eq!(index.list_children(&FsPath::root()).unwrap(), vec!["a"]);
    }

    #[test]
    fn test_insert_under_file_fails() {
        let (index, _) = open();
        index
            .insert(InodeRecord::file(p("/f"), 0o644, Owner::default()))
            .unwrap();
        let err = index
            .insert(InodeRecord::file(p("/f/x"), 0o644, Owner::default()))
            .unwrap_err();
        assert!(matches!(err, IndexError::NotADirectory(_)));
    }

    #[test]
    fn test_insert_duplicate() {
        let (index, _) = open();
        index
            .insert(InodeRecord::file(p("/f"), 0o644, Owner::default()))
            .unwrap();
        let err = index
            .insert(InodeRecord::file(p("/f"), 0o644, Owner::default()))
            .unwrap_err();
        assert!(matches!(err, IndexError::AlreadyExists(_)));
    }

    #[test]
    fn test_upsert_rejects_bad_tiling() {
        let (index, _) = open();
        let mut rec = file_with("/f", b"abc");
        if let NodeKind::File { size, .. } = &mut rec.kind {
            *size = 10;
        }
        let err = index.upsert(rec).unwrap_err();
        assert!(matches!(err, IndexError::Consistency(_)));
        assert!(matches!(
            index.lookup(&p("/f")),
            Err(IndexError::NotFound(_))
        ));
    }

    #[test]
    fn test_compare_and_upsert_detects_conflict() {
        let (index, _) = open();
        let created = index
            .insert(InodeRecord::file(p("/f"), 0o644, Owner::default()))
            .unwrap();

        let first = index
            .compare_and_upsert(file_with("/f", b"one"), created.version)
            .unwrap();
        assert_eq!(first.version, created.version + 1);

        let err = index
            .compare_and_upsert(file_with("/f", b"two"), created.version)
            .unwrap_err();
        assert!(matches!(err, IndexError::Conflict { .. }));
        assert_eq!(index.lookup(&p("/f")).unwrap().size(), 3);
    }

    #[test]
    fn test_upsert_preserves_children() {
        let (index, _) = open();
        index
            .insert(InodeRecord::directory(p("/d"), 0o755, Owner::default()))
            .unwrap();
        let stale = index.lookup(&p("/d")).unwrap();
        index
            .insert(InodeRecord::file(p("/d/x"), 0o644, Owner::default()))
            .unwrap();

        let mut chmod = stale;
        chmod.mode = 0o700;
        index.upsert(chmod).unwrap();
        let dir = index.lookup(&p("/d")).unwrap();
        assert_eq!(dir.mode, 0o700);
        assert_eq!(index.list_children(&p("/d")).unwrap(), vec!["x"]);
    }

    #[test]
    fn test_upsert_kind_change_rejected() {
        let (index, _) = open();
        index
            .insert(InodeRecord::directory(p("/d"), 0o755, Owner::default()))
            .unwrap();
        let err = index
            .upsert(InodeRecord::file(p("/d"), 0o644, Owner::default()))
            .unwrap_err();
        assert!(matches!(err, IndexError::KindMismatch { .. }));
    }

    #[test]
    fn test_remove_non_empty() {
        let (index, _) = open();
        index
            .insert(InodeRecord::directory(p("/d"), 0o755, Owner::default()))
            .unwrap();
        index
            .insert(InodeRecord::file(p("/d/x"), 0o644, Owner::default()))
            .unwrap();
        assert!(matches!(
            index.remove(&p("/d")),
            Err(IndexError::NotEmpty(_))
        ));
        index.remove(&p("/d/x")).unwrap();
        index.remove(&p("/d")).unwrap();
        assert!(index.list_children(&FsPath::root()).unwrap().is_empty());
        assert!(matches!(
            index.remove(&FsPath::root()),
            Err(IndexError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_rename_directory_moves_descendants() {
        let (index, store) = open();
        index
            .insert(InodeRecord::directory(p("/a"), 0o755, Owner::default()))
            .unwrap();
        index
            .insert(InodeRecord::directory(p("/a/b"), 0o755, Owner::default()))
            .unwrap();
        index.upsert(file_with("/a/b/f", b"data")).unwrap();
        index
            .insert(InodeRecord::file(p("/ab"), 0o644, Owner::default()))
            .unwrap();
        index
            .insert(InodeRecord::file(p("/a!x"), 0o644, Owner::default()))
            .unwrap();

        index.rename(&p("/a"), &p("/z")).unwrap();

        assert!(index.lookup(&p("/a")).is_err());
        assert!(index.lookup(&p("/a/b/f")).is_err());
        assert_eq!(index.lookup(&p("/z/b/f")).unwrap().size(), 4);
        assert!(index.lookup(&p("/ab")).is_ok());
        assert!(index.lookup(&p("/a!x")).is_ok());
        assert_eq!(
            index.list_children(&FsPath::root()).unwrap(),
            vec!["a!x", "ab", "z"]
        );

        // The durable copy agrees with memory.
        let reopened = MetadataIndex::open(store, Owner::default()).unwrap();
        assert_eq!(reopened.all_records(), index.all_records());
    }

    #[test]
    fn test_rename_within_same_directory() {
        let (index, _) = open();
        index.upsert(file_with("/x", b"1")).unwrap();
        index.rename(&p("/x"), &p("/y")).unwrap();
        assert_eq!(index.list_children(&FsPath::root()).unwrap(), vec!["y"]);
    }

    #[test]
    fn test_rename_onto_itself() {
        let (index, _) = open();
        index.upsert(file_with("/x", b"1")).unwrap();
        assert!(index.rename(&p("/x"), &p("/x")).unwrap().is_none());
        assert_eq!(index.lookup(&p("/x")).unwrap().size(), 1);
        assert!(matches!(
            index.rename(&p("/ghost"), &p("/ghost")),
            Err(IndexError::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_replaces_file() {
        let (index, _) = open();
        index.upsert(file_with("/src", b"new")).unwrap();
        index.upsert(file_with("/dst", b"old!")).unwrap();
        let replaced = index.rename(&p("/src"), &p("/dst")).unwrap();
        assert_eq!(replaced.map(|r| r.size()), Some(4));
        assert_eq!(index.lookup(&p("/dst")).unwrap().size(), 3);
        assert_eq!(index.list_children(&FsPath::root()).unwrap(), vec!["dst"]);
    }

    #[test]
    fn test_rename_into_self_rejected() {
        let (index, _) = open();
        index
            .insert(InodeRecord::directory(p("/a"), 0o755, Owner::default()))
            .unwrap();
        assert!(matches!(
            index.rename(&p("/a"), &p("/a/b")),
            Err(IndexError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_rename_dir_over_file_rejected() {
        let (index, _) = open();
        index
            .insert(InodeRecord::directory(p("/a"), 0o755, Owner::default()))
            .unwrap();
        index.upsert(file_with("/f", b"1")).unwrap();
        assert!(matches!(
            index.rename(&p("/a"), &p("/f")),
            Err(IndexError::NotADirectory(_))
        ));
        assert!(matches!(
            index.rename(&p("/f"), &p("/a")),
            Err(IndexError::IsADirectory(_))
        ));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let (index, _) = open();
        index
            .insert(InodeRecord::directory(p("/docs"), 0o755, Owner::default()))
            .unwrap();
        index.upsert(file_with("/docs/a.txt", b"hello")).unwrap();
        let bytes = index.snapshot().unwrap();

        let (fresh, store) = open();
        fresh.restore(&bytes).unwrap();
        assert_eq!(fresh.all_records(), index.all_records());

        let reopened = MetadataIndex::open(store, Owner::default()).unwrap();
        assert_eq!(reopened.all_records(), index.all_records());
    }

    #[test]
    fn test_restore_rejects_orphans() {
        let (index, _) = open();
        index.upsert(file_with("/a", b"1")).unwrap();
        let snapshot = IndexSnapshot {
            format: FORMAT_VERSION,
            generation: 1,
            records: vec![
                InodeRecord::directory(FsPath::root(), 0o755, Owner::default()),
                file_with("/orphan", b"x"),
            ],
        };
        let bytes = postcard::to_stdvec(&snapshot).unwrap();
        assert!(matches!(
            index.restore(&bytes),
            Err(IndexError::Consistency(_))
        ));
        // Untouched on failure.
        assert!(index.lookup(&p("/a")).is_ok());
    }

    #[test]
    fn test_generation_and_stats() {
        let (index, _) = open();
        let before = index.generation();
        index.upsert(file_with("/a", b"12345")).unwrap();
        assert!(index.generation() > before);
        let stats = index.stats();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.bytes, 5);
    }
}
