//! Recovery and sync.
//!
//! Periodically serializes the whole metadata index, uploads it through the
//! blob store split exactly like file content, and records the resulting
//! chunk descriptors in a small pointer record in its own key-value store.
//! A mount with no local index rebuilds it from that pointer.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tessera_types::{remote_ids, tiled_len, Checksum, ChunkDescriptor, ChunkSource};

use crate::blob::{BlobError, BlobStore};
use crate::codec::{self, CodecError};
use crate::index::{IndexError, MetadataIndex};
use crate::reclaim::{ReclaimReason, Reclaimer};
use crate::store::{KvStore, StoreError};

/// Key of the pointer record.
pub const POINTER_KEY: &str = "snapshot:pointer";

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("index: {0}")]
    Index(#[from] IndexError),

    #[error("pointer store: {0}")]
    Store(#[from] StoreError),

    #[error("remote: {0}")]
    Blob(#[from] BlobError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("pointer record: {0}")]
    Pointer(#[from] serde_json::Error),

    #[error("snapshot consistency violation: {0}")]
    Consistency(String),

    #[error("no remote snapshot to restore from")]
    NoSnapshot,
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Where the latest index snapshot lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPointer {
    /// Increases by one with every snapshot.
    pub sequence: u64,
    pub chunks: Vec<ChunkDescriptor>,
    /// Serialized index length; equals the sum of chunk lengths.
    pub total_len: u64,
    pub taken_at: SystemTime,
}

/// Snapshot tuning.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    pub max_chunk_size: u32,
    pub fan_out: usize,
}

/// Uploads and restores index snapshots.
pub struct SyncManager {
    index: Arc<MetadataIndex>,
    blob: Arc<dyn BlobStore>,
    pointers: Arc<dyn KvStore>,
    reclaimer: Arc<Reclaimer>,
    config: SyncConfig,
    /// Index generation captured by the last successful snapshot.
    synced_generation: Mutex<Option<u64>>,
    /// One snapshot at a time.
    running: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("config", &self.config)
            .field("synced_generation", &*self.synced_generation.lock())
            .finish()
    }
}

impl SyncManager {
    pub fn new(
        index: Arc<MetadataIndex>,
        blob: Arc<dyn BlobStore>,
        pointers: Arc<dyn KvStore>,
        reclaimer: Arc<Reclaimer>,
        config: SyncConfig,
    ) -> Self {
        Self {
            index,
            blob,
            pointers,
            reclaimer,
            config,
            synced_generation: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// The current pointer, if any snapshot was ever taken.
    pub fn pointer(&self) -> SyncResult<Option<SnapshotPointer>> {
        match self.pointers.get(POINTER_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns true if the index changed since the last snapshot.
    pub fn is_dirty(&self) -> bool {
        *self.synced_generation.lock() != Some(self.index.generation())
    }

    /// Snapshot only if the index changed.
    pub async fn snapshot_if_dirty(&self) -> SyncResult<Option<SnapshotPointer>> {
        if !self.is_dirty() {
            return Ok(None);
        }
        self.snapshot().await.map(Some)
    }

    /// Serialize, upload and repoint. The previous snapshot's chunks are
    /// handed to the reclaimer once the new pointer is durable.
    pub async fn snapshot(&self) -> SyncResult<SnapshotPointer> {
        let _running = self.running.lock().await;
        let generation = self.index.generation();
        let bytes = self.index.snapshot()?;
        let previous = self.pointer()?;

        let pieces: Vec<Vec<u8>> = codec::split(&bytes, self.config.max_chunk_size)?
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        let results: Vec<Result<ChunkDescriptor, BlobError>> = futures::stream::iter(pieces)
            .map(|piece| async move {
                let id = self.blob.put(&piece).await?;
                Ok::<_, BlobError>(ChunkDescriptor::remote(
                    id,
                    piece.len() as u32,
                    Checksum::of(&piece),
                ))
            })
            .buffered(self.config.fan_out.max(1))
            .collect()
            .await;

        let mut chunks = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(desc) => chunks.push(desc),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            self.reclaimer
                .schedule(remote_ids(&chunks), ReclaimReason::AbortedWrite);
            warn!(error = %e, "index snapshot upload failed");
            return Err(e.into());
        }

        let pointer = SnapshotPointer {
            sequence: previous.as_ref().map_or(1, |p| p.sequence + 1),
            chunks,
            total_len: bytes.len() as u64,
            taken_at: SystemTime::now(),
        };
        self.pointers
            .put(POINTER_KEY, &serde_json::to_vec(&pointer)?)?;
        *self.synced_generation.lock() = Some(generation);

        if let Some(old) = previous {
            self.reclaimer
                .schedule(remote_ids(&old.chunks), ReclaimReason::Snapshot);
        }
        info!(
            sequence = pointer.sequence,
            chunks = pointer.chunks.len(),
            bytes = pointer.total_len,
            "index snapshot uploaded"
        );
        Ok(pointer)
    }

    /// Rebuild the index from the remote snapshot.
    pub async fn restore(&self) -> SyncResult<SnapshotPointer> {
        let _running = self.running.lock().await;
        let pointer = self.pointer()?.ok_or(SyncError::NoSnapshot)?;
        if tiled_len(&pointer.chunks) != pointer.total_len {
            return Err(self.violation(format!(
                "pointer chunks cover {} bytes, expected {}",
                tiled_len(&pointer.chunks),
                pointer.total_len
            )));
        }

        let pieces: Vec<Vec<u8>> = futures::stream::iter(pointer.chunks.clone())
            .map(|desc| async move {
                let ChunkSource::Remote { id, checksum } = &desc.source else {
                    return Err(self.violation("snapshot contains a zero-fill chunk".into()));
                };
                let data = self.blob.get(id).await?;
                if data.len() != desc.length as usize || !checksum.verify(&data) {
                    return Err(self.violation(format!(
                        "snapshot chunk {} failed verification",
                        id.short()
                    )));
                }
                Ok::<_, SyncError>(data)
            })
            .buffered(self.config.fan_out.max(1))
            .try_collect()
            .await?;

        self.index.restore(&pieces.concat())?;
        *self.synced_generation.lock() = Some(self.index.generation());
        info!(
            sequence = pointer.sequence,
            records = self.index.len(),
            "index restored from remote snapshot"
        );
        Ok(pointer)
    }

    /// Spawn the snapshot timer. Stops when `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // An in-flight periodic snapshot is abandoned on
                        // cancel; unmount takes the final one itself.
                        let result = tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!("periodic snapshot abandoned at shutdown");
                                break;
                            }
                            result = self.snapshot_if_dirty() => result,
                        };
                        match result {
                            Ok(Some(pointer)) => debug!(sequence = pointer.sequence, "periodic snapshot"),
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "periodic snapshot failed"),
                        }
                    }
                }
            }
            debug!("sync timer stopped");
        })
    }

    fn violation(&self, msg: String) -> SyncError {
        error!(target: "tessera::consistency", %msg, "snapshot consistency violation");
        SyncError::Consistency(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::reclaim::ReclaimConfig;
    use crate::store::MemoryKvStore;
    use tessera_types::{FsPath, InodeRecord, Owner};

    struct Fixture {
        blob: Arc<MemoryBlobStore>,
        pointers: Arc<MemoryKvStore>,
        reclaimer: Arc<Reclaimer>,
    }

    impl Fixture {
        fn new() -> Self {
            let blob = Arc::new(MemoryBlobStore::new(64));
            let reclaimer = Arc::new(Reclaimer::new(blob.clone(), ReclaimConfig::default()));
            Self {
                blob,
                pointers: Arc::new(MemoryKvStore::new()),
                reclaimer,
            }
        }

        fn manager(&self, index: Arc<MetadataIndex>) -> SyncManager {
            SyncManager::new(
                index,
                self.blob.clone(),
                self.pointers.clone(),
                self.reclaimer.clone(),
                SyncConfig {
                    max_chunk_size: 64,
                    fan_out: 2,
                },
            )
        }
    }

    fn index_with(n: usize) -> Arc<MetadataIndex> {
        let index = MetadataIndex::open(Arc::new(MemoryKvStore::new()), Owner::default()).unwrap();
        for i in 0..n {
            let path = FsPath::parse(&format!("/file-{i:03}")).unwrap();
            index.insert(InodeRecord::file(path, 0o644, Owner::default())).unwrap();
        }
        Arc::new(index)
    }

    #[tokio::test]
    async fn test_snapshot_spans_multiple_chunks_and_restores() {
        let fx = Fixture::new();
        let index = index_with(20);
        let sync = fx.manager(index.clone());

        let pointer = sync.snapshot().await.unwrap();
        assert!(pointer.chunks.len() > 1);
        assert!(pointer.chunks.iter().all(|c| c.length <= 64));
        assert!(!sync.is_dirty());

        let fresh = index_with(0);
        let restorer = fx.manager(fresh.clone());
        let restored = restorer.restore().await.unwrap();
        assert_eq!(restored, pointer);
        assert_eq!(fresh.all_records(), index.all_records());
    }

    #[tokio::test]
    async fn test_resnapshot_reclaims_previous() {
        let fx = Fixture::new();
        let index = index_with(3);
        let sync = fx.manager(index.clone());

        let first = sync.snapshot().await.unwrap();
        assert!(sync.snapshot_if_dirty().await.unwrap().is_none());

        index
            .insert(InodeRecord::file(FsPath::parse("/new").unwrap(), 0o644, Owner::default()))
            .unwrap();
        let second = sync.snapshot_if_dirty().await.unwrap().unwrap();
        assert_eq!(second.sequence, first.sequence + 1);
        assert_eq!(
            fx.reclaimer.pending(),
            remote_ids(&first.chunks),
        );
        fx.reclaimer.drain().await;
        assert_eq!(fx.blob.len(), second.chunks.len());
    }

    #[tokio::test]
    async fn test_restore_without_pointer() {
        let fx = Fixture::new();
        let sync = fx.manager(index_with(0));
        assert!(matches!(sync.restore().await, Err(SyncError::NoSnapshot)));
    }

    #[tokio::test]
    async fn test_restore_detects_corruption() {
        let fx = Fixture::new();
        let index = index_with(2);
        let sync = fx.manager(index);
        let pointer = sync.snapshot().await.unwrap();
        let id = pointer.chunks[0].remote_id().unwrap().clone();
        fx.blob.corrupt(&id, vec![0u8; pointer.chunks[0].length as usize]);

        let fresh = index_with(0);
        let err = fx.manager(fresh.clone()).restore().await.unwrap_err();
        assert!(matches!(err, SyncError::Consistency(_)));
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_old_pointer() {
        let fx = Fixture::new();
        let index = index_with(10);
        let sync = fx.manager(index.clone());
        let first = sync.snapshot().await.unwrap();

        index
            .insert(InodeRecord::file(FsPath::parse("/x").unwrap(), 0o644, Owner::default()))
            .unwrap();
        fx.blob.fail_puts_after(1);
        assert!(sync.snapshot().await.is_err());
        assert_eq!(sync.pointer().unwrap(), Some(first));
        assert!(sync.is_dirty());
    }
}
