//! Chunked filesystem engine.
//!
//! Implements [`VfsOps`] on top of the metadata index, the chunk codec and a
//! remote [`BlobStore`]. The shape of every mutation is the same:
//!
//! 1. take the per-path lock and read the current record from the index
//! 2. do the network work (download partial chunks, upload new ones) with
//!    at most `fan_out` transfers in flight
//! 3. commit the new descriptor list with a compare-and-upsert
//! 4. only then retire superseded chunks (cache invalidation + reclaimer)
//!
//! A failure before step 3 leaves the record untouched; whatever was already
//! uploaded goes to the reclaimer.

mod blocking;
mod locks;

pub use blocking::BlockingFs;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, error};

use tessera_types::{
    check_tiling, remote_ids, tiled_len, zero_fill_run, Checksum, ChunkDescriptor, ChunkSource,
    FsPath, InodeRecord, NodeKind, Owner, NAME_MAX, PERM_MASK,
};

use crate::blob::{BlobError, BlobStore};
use crate::cache::ChunkCache;
use crate::codec;
use crate::index::{IndexError, MetadataIndex};
use crate::reclaim::{ReclaimReason, Reclaimer};
use crate::vfs::{
    DirEntry, FileAttr, FileHandle, FileType, FsError, FsResult, OpenFlags, SetAttr, StatFs,
    VfsOps,
};

use locks::PathLocks;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest payload ever handed to the blob store.
    pub max_chunk_size: u32,
    /// Largest file, counted in chunks of `max_chunk_size`.
    pub max_file_chunks: u32,
    /// Chunk transfers in flight per operation; 1 means strictly sequential.
    pub fan_out: usize,
    /// Resident-chunk cache budget in bytes.
    pub cache_bytes: usize,
    /// Stamped on every new record.
    pub owner: Owner,
}

impl EngineConfig {
    /// Byte size no file may grow past.
    pub fn max_file_size(&self) -> u64 {
        u64::from(self.max_chunk_size) * u64::from(self.max_file_chunks)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 20 * 1024 * 1024,
            max_file_chunks: 65536,
            fan_out: 4,
            cache_bytes: 256 * 1024 * 1024,
            owner: Owner::default(),
        }
    }
}

/// The filesystem engine.
pub struct Engine {
    index: Arc<MetadataIndex>,
    blob: Arc<dyn BlobStore>,
    cache: ChunkCache,
    reclaimer: Arc<Reclaimer>,
    locks: PathLocks,
    handles: DashMap<FileHandle, FsPath>,
    next_handle: AtomicU64,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("index", &self.index)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

fn fs_path(path: &Path) -> FsResult<FsPath> {
    let raw = path
        .to_str()
        .ok_or_else(|| FsError::invalid_path(path.display().to_string()))?;
    Ok(FsPath::parse(raw)?)
}

/// Size and chunk list of a file record.
fn file_payload(record: &InodeRecord) -> FsResult<(u64, Vec<ChunkDescriptor>)> {
    match &record.kind {
        NodeKind::File { size, chunks } => Ok((*size, chunks.clone())),
        NodeKind::Directory { .. } => Err(FsError::is_a_directory(record.path.to_string())),
        NodeKind::Symlink { .. } => Err(FsError::invalid_path(format!(
            "{} is a symbolic link",
            record.path
        ))),
    }
}

impl Engine {
    pub fn new(
        index: Arc<MetadataIndex>,
        blob: Arc<dyn BlobStore>,
        reclaimer: Arc<Reclaimer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            index,
            blob,
            cache: ChunkCache::new(config.cache_bytes),
            reclaimer,
            locks: PathLocks::new(),
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            config,
        }
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Path a handle currently refers to (follows renames).
    pub fn handle_path(&self, handle: FileHandle) -> Option<FsPath> {
        self.handles.get(&handle).map(|p| p.clone())
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn fan_out(&self) -> usize {
        self.config.fan_out.max(1)
    }

    /// Refuse sizes past the per-file limit before any descriptors are built.
    fn check_file_size(&self, path: &FsPath, size: u64) -> FsResult<()> {
        let limit = self.config.max_file_size();
        if size > limit {
            return Err(FsError::FileTooLarge(format!(
                "{path}: {size} bytes, limit is {limit}"
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Chunk transfer
    // ========================================================================

    /// Payload of one chunk: zeros for zero-fill, else cache or download.
    /// Downloads are verified against length and checksum.
    async fn fetch_chunk(&self, desc: &ChunkDescriptor) -> FsResult<Arc<[u8]>> {
        let (id, checksum) = match &desc.source {
            ChunkSource::ZeroFill => return Ok(vec![0u8; desc.length as usize].into()),
            ChunkSource::Remote { id, checksum } => (id, checksum),
        };
        if let Some(data) = self.cache.get(id) {
            return Ok(data);
        }

        let data = self.blob.get(id).await.map_err(|e| match e {
            BlobError::NotFound(_) => FsError::RemotePermanent(format!(
                "chunk {} vanished from the remote store",
                id.short()
            )),
            other => other.into(),
        })?;
        if data.len() != desc.length as usize || !checksum.verify(&data) {
            error!(
                target: "tessera::consistency",
                id = %id.short(),
                expected_len = desc.length,
                actual_len = data.len(),
                "chunk failed verification"
            );
            return Err(FsError::consistency(format!(
                "chunk {} failed checksum verification",
                id.short()
            )));
        }

        let data: Arc<[u8]> = data.into();
        self.cache.insert(id.clone(), data.clone());
        Ok(data)
    }

    /// Fetch several chunks of `chunks`, in `indices` order.
    async fn fetch_many(
        &self,
        chunks: &[ChunkDescriptor],
        indices: &[usize],
    ) -> FsResult<Vec<Arc<[u8]>>> {
        futures::stream::iter(indices.iter().copied())
            .map(|i| self.fetch_chunk(&chunks[i]))
            .buffered(self.fan_out())
            .try_collect()
            .await
    }

    /// Upload pieces in order. On any failure, pieces already stored are
    /// handed to the reclaimer and the first error is returned.
    async fn upload_all(&self, pieces: Vec<&[u8]>) -> FsResult<Vec<ChunkDescriptor>> {
        let failed = AtomicBool::new(false);
        let failed = &failed;
        // Owned pieces: futures over borrowed closure arguments are not `Send`.
        let pieces: Vec<Arc<[u8]>> = pieces.into_iter().map(Arc::from).collect();
        let results: Vec<Option<Result<ChunkDescriptor, BlobError>>> =
            futures::stream::iter(pieces)
                .map(move |piece| async move {
                    if failed.load(Ordering::Relaxed) {
                        return None;
                    }
                    let checksum = Checksum::of(&piece);
                    let len = piece.len() as u32;
                    match self.blob.put(&piece).await {
                        Ok(id) => {
                            self.cache.insert(id.clone(), piece);
                            Some(Ok(ChunkDescriptor::remote(id, len, checksum)))
                        }
                        Err(e) => {
                            failed.store(true, Ordering::Relaxed);
                            Some(Err(e))
                        }
                    }
                })
                .buffered(self.fan_out())
                .collect()
                .await;

        let mut uploaded = Vec::with_capacity(results.len());
        let mut first_err = None;
        for result in results.into_iter().flatten() {
            match result {
                Ok(desc) => uploaded.push(desc),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            None => Ok(uploaded),
            Some(e) => {
                debug!(orphans = uploaded.len(), error = %e, "upload failed, discarding partial chunks");
                self.discard(&uploaded);
                Err(e.into())
            }
        }
    }

    /// Hand chunks that never made it into the index to the reclaimer.
    fn discard(&self, chunks: &[ChunkDescriptor]) {
        let ids = remote_ids(chunks);
        self.cache.invalidate_all(&ids);
        self.reclaimer.schedule(ids, ReclaimReason::AbortedWrite);
    }

    /// Retire chunks the index no longer references.
    fn retire(&self, chunks: &[ChunkDescriptor]) {
        let ids = remote_ids(chunks);
        self.cache.invalidate_all(&ids);
        self.reclaimer.schedule(ids, ReclaimReason::Superseded);
    }

    /// Commit a record read at version `expected`.
    fn commit(&self, record: InodeRecord, expected: u64) -> FsResult<InodeRecord> {
        let path = record.path.clone();
        self.index
            .compare_and_upsert(record, expected)
            .map_err(|e| match e {
                IndexError::Conflict { .. } => {
                    FsError::not_found(format!("{path} (replaced concurrently)"))
                }
                other => other.into(),
            })
    }

    /// Fail with a logged consistency violation if `chunks` do not tile
    /// `size`, discarding `fresh` uploads.
    ///
    /// New chunks never exceed `max_chunk_size`, but chunks written under an
    /// earlier, larger setting may; those are held to the remote limit.
    fn verify_tiling(
        &self,
        path: &FsPath,
        chunks: &[ChunkDescriptor],
        size: u64,
        fresh: &[ChunkDescriptor],
    ) -> FsResult<()> {
        let bound = self
            .blob
            .max_object_size()
            .map_or(u32::MAX, |limit| limit.max(self.config.max_chunk_size));
        if let Err(e) = check_tiling(chunks, size, bound) {
            self.discard(fresh);
            error!(target: "tessera::consistency", %path, error = %e, "broken chunk sequence");
            return Err(FsError::consistency(format!("{path}: {e}")));
        }
        Ok(())
    }

    // ========================================================================
    // Mutations (caller holds the path's write lock)
    // ========================================================================

    async fn write_locked(&self, path: &FsPath, offset: u64, data: &[u8]) -> FsResult<()> {
        let max = self.config.max_chunk_size;
        let mut record = self.index.lookup(path)?;
        let (size, mut chunks) = file_payload(&record)?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::InvalidRange(format!("offset {offset} length {}", data.len())))?;
        self.check_file_size(path, end)?;

        // Writing past EOF leaves a hole.
        if offset > size {
            chunks.extend(zero_fill_run(offset - size, max));
        }

        let lengths: Vec<u32> = chunks.iter().map(|c| c.length).collect();
        let starts = codec::chunk_starts(&lengths);
        let total = tiled_len(&chunks);
        let start_of = |i: usize| starts.get(i).copied().unwrap_or(total);
        let spans = codec::locate(offset, data.len() as u64, &lengths)?;

        // Chunks [first, last) get rewritten.
        let (mut first, last) = match (spans.first(), spans.last()) {
            (Some(a), Some(b)) => (a.index, b.index + 1),
            _ => (chunks.len(), chunks.len()),
        };
        // Fold an underfull chunk ending exactly at `offset` into the
        // rewrite so sequential appends do not leave a trail of tiny chunks.
        if first > 0 && start_of(first) == offset {
            let prev = &chunks[first - 1];
            if prev.length < max && !prev.is_zero_fill() {
                first -= 1;
            }
        }

        let region_start = start_of(first);
        let region_end = end.max(start_of(last));
        let mut buf = vec![0u8; (region_end - region_start) as usize];

        // Any chunk with bytes outside the write range is merged in.
        let partial: Vec<usize> = (first..last)
            .filter(|&i| {
                let chunk_end = start_of(i) + u64::from(chunks[i].length);
                !chunks[i].is_zero_fill() && (start_of(i) < offset || chunk_end > end)
            })
            .collect();
        let fetched = self.fetch_many(&chunks, &partial).await?;
        for (&i, bytes) in partial.iter().zip(&fetched) {
            let at = (start_of(i) - region_start) as usize;
            buf[at..at + bytes.len()].copy_from_slice(bytes);
        }
        let at = (offset - region_start) as usize;
        buf[at..at + data.len()].copy_from_slice(data);

        let fresh = self.upload_all(codec::split(&buf, max)?).await?;

        let superseded: Vec<ChunkDescriptor> =
            chunks.splice(first..last, fresh.iter().cloned()).collect();
        let new_size = size.max(end);
        self.verify_tiling(path, &chunks, new_size, &fresh)?;

        let expected = record.version;
        record.kind = NodeKind::File {
            size: new_size,
            chunks,
        };
        record.touch_modified();
        if let Err(e) = self.commit(record, expected) {
            self.discard(&fresh);
            return Err(e);
        }
        self.retire(&superseded);

        debug!(
            %path,
            offset,
            len = data.len(),
            rewritten = last - first,
            uploaded = fresh.len(),
            size = new_size,
            "write committed"
        );
        Ok(())
    }

    async fn truncate_locked(&self, path: &FsPath, new_size: u64) -> FsResult<InodeRecord> {
        let max = self.config.max_chunk_size;
        let mut record = self.index.lookup(path)?;
        let (size, mut chunks) = file_payload(&record)?;
        let mut fresh = Vec::new();
        let mut superseded = Vec::new();
        self.check_file_size(path, new_size)?;

        if new_size > size {
            // Grow lazily; zeros are materialized by the next overlapping write.
            chunks.extend(zero_fill_run(new_size - size, max));
        } else if new_size < size {
            let lengths: Vec<u32> = chunks.iter().map(|c| c.length).collect();
            let starts = codec::chunk_starts(&lengths);
            let cut = (0..chunks.len())
                .find(|&i| starts[i] + u64::from(lengths[i]) > new_size)
                .unwrap_or(chunks.len());
            let mut tail = chunks.split_off(cut).into_iter();

            if let Some(boundary) = tail.next() {
                let keep = new_size - starts[cut];
                if keep == 0 {
                    superseded.push(boundary);
                } else if boundary.is_zero_fill() {
                    chunks.extend(zero_fill_run(keep, max));
                } else {
                    let data = self.fetch_chunk(&boundary).await?;
                    fresh = self.upload_all(codec::split(&data[..keep as usize], max)?).await?;
                    chunks.extend(fresh.iter().cloned());
                    superseded.push(boundary);
                }
            }
            superseded.extend(tail);
        }
        self.verify_tiling(path, &chunks, new_size, &fresh)?;

        let expected = record.version;
        record.kind = NodeKind::File {
            size: new_size,
            chunks,
        };
        record.touch_modified();
        let committed = match self.commit(record, expected) {
            Ok(r) => r,
            Err(e) => {
                self.discard(&fresh);
                return Err(e);
            }
        };
        self.retire(&superseded);

        debug!(%path, from = size, to = new_size, dropped = superseded.len(), "truncate committed");
        Ok(committed)
    }

    async fn insert_entry(&self, record: InodeRecord) -> FsResult<FileAttr> {
        let path = record.path.clone();
        let _guard = self.locks.write(&path).await;
        let record = self.index.insert(record)?;
        debug!(%path, kind = record.kind.label(), "created");
        Ok(FileAttr::from(&record))
    }

    /// Point handles at `from` (or below it) to the renamed location.
    fn rebase_handles(&self, from: &FsPath, to: &FsPath) {
        for mut entry in self.handles.iter_mut() {
            if let Some(moved) = entry.value().rebase(from, to) {
                *entry.value_mut() = moved;
            }
        }
    }
}

#[async_trait]
impl VfsOps for Engine {
    async fn getattr(&self, path: &Path) -> FsResult<FileAttr> {
        let path = fs_path(path)?;
        Ok(FileAttr::from(&self.index.lookup(&path)?))
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let path = fs_path(path)?;
        let children = self.index.child_records(&path)?;
        Ok(children
            .iter()
            .filter_map(|rec| {
                rec.path
                    .name()
                    .map(|name| DirEntry::new(name, FileType::from(&rec.kind)))
            })
            .collect())
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let path = fs_path(path)?;
        let _guard = self.locks.read(&path).await;
        let record = self.index.lookup(&path)?;
        let (_, chunks) = file_payload(&record)?;

        let lengths: Vec<u32> = chunks.iter().map(|c| c.length).collect();
        let spans = codec::locate(offset, u64::from(size), &lengths)?;
        if spans.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = &chunks;
        let pieces: Vec<Vec<u8>> = futures::stream::iter(spans)
            .map(|span| async move {
                let desc = &chunks[span.index];
                if desc.is_zero_fill() {
                    return Ok::<_, FsError>(vec![0u8; span.len as usize]);
                }
                let data = self.fetch_chunk(desc).await?;
                let from = span.start as usize;
                Ok(data[from..from + span.len as usize].to_vec())
            })
            .buffered(self.fan_out())
            .try_collect()
            .await?;

        if let Err(e) = self.index.touch_accessed(&path, SystemTime::now()) {
            debug!(%path, error = %e, "atime not recorded");
        }
        Ok(pieces.concat())
    }

    async fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        let path = fs_path(path)?;
        match self.index.lookup(&path)?.kind {
            NodeKind::Symlink { target } => Ok(PathBuf::from(target)),
            _ => Err(FsError::invalid_path(format!("{path} is not a symbolic link"))),
        }
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> FsResult<u32> {
        let written = u32::try_from(data.len())
            .map_err(|_| FsError::InvalidRange(format!("write of {} bytes", data.len())))?;
        let path = fs_path(path)?;
        let _guard = self.locks.write(&path).await;
        if data.is_empty() {
            // Still validates the target.
            file_payload(&self.index.lookup(&path)?)?;
            return Ok(0);
        }
        self.write_locked(&path, offset, data).await?;
        Ok(written)
    }

    async fn create(&self, path: &Path, mode: u32) -> FsResult<FileAttr> {
        let path = fs_path(path)?;
        self.insert_entry(InodeRecord::file(path, mode, self.config.owner))
            .await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<FileAttr> {
        let path = fs_path(path)?;
        self.insert_entry(InodeRecord::directory(path, mode, self.config.owner))
            .await
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        let path = fs_path(path)?;
        let _guard = self.locks.write(&path).await;
        if self.index.lookup(&path)?.is_dir() {
            return Err(FsError::is_a_directory(path.to_string()));
        }
        let removed = self.index.remove(&path)?;

        // The file is gone once the index says so; reclamation failures are
        // logged and re-queued, never surfaced.
        let ids = remote_ids(removed.chunks());
        self.cache.invalidate_all(&ids);
        let owned = ids.len();
        if owned > 0 {
            let report = self.reclaimer.reclaim(ids, ReclaimReason::Unlinked).await;
            debug!(%path, owned, deleted = report.deleted, failed = report.failed, "unlinked");
        } else {
            debug!(%path, "unlinked");
        }
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> FsResult<()> {
        let path = fs_path(path)?;
        if path.is_root() {
            return Err(FsError::permission_denied("cannot remove /"));
        }
        let _guard = self.locks.write(&path).await;
        if !self.index.lookup(&path)?.is_dir() {
            return Err(FsError::not_a_directory(path.to_string()));
        }
        self.index.remove(&path)?;
        debug!(%path, "removed directory");
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let from = fs_path(from)?;
        let to = fs_path(to)?;
        let _guards = self.locks.write_pair(&from, &to).await;

        let replaced = self.index.rename(&from, &to)?;
        self.rebase_handles(&from, &to);
        debug!(%from, %to, replaced = replaced.is_some(), "renamed");

        if let Some(old) = replaced {
            let ids = remote_ids(old.chunks());
            self.cache.invalidate_all(&ids);
            if !ids.is_empty() {
                self.reclaimer.reclaim(ids, ReclaimReason::Unlinked).await;
            }
        }
        Ok(())
    }

    async fn truncate(&self, path: &Path, size: u64) -> FsResult<()> {
        let path = fs_path(path)?;
        let _guard = self.locks.write(&path).await;
        self.truncate_locked(&path, size).await?;
        Ok(())
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> FsResult<FileAttr> {
        let path = fs_path(path)?;
        let _guard = self.locks.write(&path).await;

        let mut current = match attr.size {
            Some(size) => self.truncate_locked(&path, size).await?,
            None => self.index.lookup(&path)?,
        };
        if attr.touches_attributes() {
            let expected = current.version;
            if let Some(perm) = attr.perm {
                current.mode = perm & PERM_MASK;
            }
            if let Some(uid) = attr.uid {
                current.uid = uid;
            }
            if let Some(gid) = attr.gid {
                current.gid = gid;
            }
            if let Some(atime) = attr.atime {
                current.atime = atime;
            }
            if let Some(mtime) = attr.mtime {
                current.mtime = mtime;
            }
            current.touch_changed();
            current = self.commit(current, expected)?;
        }
        Ok(FileAttr::from(&current))
    }

    async fn symlink(&self, path: &Path, target: &Path) -> FsResult<FileAttr> {
        let path = fs_path(path)?;
        let target = target
            .to_str()
            .ok_or_else(|| FsError::invalid_path(target.display().to_string()))?;
        self.insert_entry(InodeRecord::symlink(path, target, self.config.owner))
            .await
    }

    async fn open(&self, path: &Path, flags: OpenFlags) -> FsResult<FileHandle> {
        let path = fs_path(path)?;
        if flags.create {
            match self
                .insert_entry(InodeRecord::file(path.clone(), 0o644, self.config.owner))
                .await
            {
                Ok(_) => {}
                Err(FsError::AlreadyExists(_)) if !flags.exclusive => {}
                Err(e) => return Err(e),
            }
        }

        let record = self.index.lookup(&path)?;
        if record.is_dir() && flags.write {
            return Err(FsError::is_a_directory(path.to_string()));
        }
        if flags.truncate && flags.write && record.is_file() {
            let _guard = self.locks.write(&path).await;
            self.truncate_locked(&path, 0).await?;
        }

        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.handles.insert(handle, path);
        Ok(handle)
    }

    async fn release(&self, handle: FileHandle) -> FsResult<()> {
        self.handles.remove(&handle);
        Ok(())
    }

    async fn statfs(&self) -> FsResult<StatFs> {
        let stats = self.index.stats();
        let bsize = self.config.max_chunk_size;
        let blocks = stats.bytes.div_ceil(u64::from(bsize));
        // The remote store reports no capacity; advertise plenty.
        let free = u64::from(u32::MAX);
        Ok(StatFs {
            blocks: blocks + free,
            bfree: free,
            bavail: free,
            files: self.index.len() as u64,
            ffree: free,
            bsize,
            namelen: NAME_MAX as u32,
            frsize: bsize,
        })
    }
}
