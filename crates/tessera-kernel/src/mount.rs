//! Mount lifecycle.
//!
//! [`Tessera`] owns everything a live mount needs: the engine, the
//! reclaimer and the sync manager, plus the background tasks driving the
//! latter two. Mounting picks the index source in this order:
//!
//! 1. local index state, if the index store has any
//! 2. the remote snapshot named by the pointer store
//! 3. an empty tree
//!
//! Unmounting stops the tasks, takes a final snapshot and drains the
//! reclaimer within the configured deadline.

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::blob::{BlobStore, RetryingBlobStore};
use crate::config::{ConfigError, TesseraConfig};
use crate::engine::{BlockingFs, Engine};
use crate::index::{IndexError, MetadataIndex};
use crate::reclaim::{ReclaimFailure, Reclaimer};
use crate::store::{KvStore, SqliteKvStore, StoreError};
use crate::sync::{SnapshotPointer, SyncConfig, SyncError, SyncManager};

#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("state store: {0}")]
    Store(#[from] StoreError),

    #[error("index: {0}")]
    Index(#[from] IndexError),

    #[error("recovery: {0}")]
    Sync(#[from] SyncError),

    #[error("state directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("max_chunk_size {max_chunk_size} exceeds the remote object limit {limit}")]
    ChunkTooLarge { max_chunk_size: u32, limit: u32 },
}

pub type MountResult<T> = Result<T, MountError>;

/// Where the index came from at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSource {
    Local,
    RemoteSnapshot,
    Fresh,
}

/// Outcome of [`Tessera::unmount`].
#[derive(Debug)]
pub struct UnmountReport {
    pub snapshot: SnapshotPointer,
    pub reclaimed: usize,
    /// Still queued when the deadline hit; orphaned on the remote.
    pub abandoned: usize,
}

/// A mounted filesystem.
pub struct Tessera {
    config: TesseraConfig,
    engine: Arc<Engine>,
    reclaimer: Arc<Reclaimer>,
    sync: Arc<SyncManager>,
    source: MountSource,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Tessera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tessera")
            .field("mount_point", &self.config.mount_point)
            .field("source", &self.source)
            .finish()
    }
}

impl Tessera {
    /// Mount with the index and pointer stores kept as SQLite files under
    /// `config.state_dir`.
    pub async fn open(config: TesseraConfig, blob: Arc<dyn BlobStore>) -> MountResult<Self> {
        tokio::fs::create_dir_all(&config.state_dir).await?;
        let index_kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(config.index_db_path())?);
        let pointer_kv: Arc<dyn KvStore> =
            Arc::new(SqliteKvStore::open(config.pointer_db_path())?);
        Self::mount(config, blob, index_kv, pointer_kv).await
    }

    /// Mount over explicit stores.
    pub async fn mount(
        config: TesseraConfig,
        blob: Arc<dyn BlobStore>,
        index_kv: Arc<dyn KvStore>,
        pointer_kv: Arc<dyn KvStore>,
    ) -> MountResult<Self> {
        config.validate()?;
        if let Some(limit) = blob.max_object_size() {
            if config.max_chunk_size > limit {
                return Err(MountError::ChunkTooLarge {
                    max_chunk_size: config.max_chunk_size,
                    limit,
                });
            }
        }

        // Deletes skip the retry wrapper; the reclaimer re-queues on its own.
        let retrying: Arc<dyn BlobStore> = Arc::new(RetryingBlobStore::new(blob.clone(), config.retry));
        let reclaimer = Arc::new(Reclaimer::new(blob, config.reclaim_config()));

        let has_local = MetadataIndex::has_local_state(index_kv.as_ref())?;
        let index = Arc::new(MetadataIndex::open(index_kv.clone(), config.owner)?);
        let sync = Arc::new(SyncManager::new(
            index.clone(),
            retrying.clone(),
            pointer_kv,
            reclaimer.clone(),
            SyncConfig {
                max_chunk_size: config.max_chunk_size,
                fan_out: config.fan_out,
            },
        ));

        let source = if has_local {
            MountSource::Local
        } else if sync.pointer()?.is_some() {
            if let Err(e) = sync.restore().await {
                // The blank tree opened above must not pass for local state
                // on the next attempt.
                MetadataIndex::clear_local_state(index_kv.as_ref())?;
                return Err(e.into());
            }
            MountSource::RemoteSnapshot
        } else {
            MountSource::Fresh
        };

        let engine = Arc::new(Engine::new(
            index,
            retrying,
            reclaimer.clone(),
            config.engine_config(),
        ));

        let cancel = CancellationToken::new();
        let tasks = vec![
            reclaimer.clone().spawn(cancel.child_token()),
            sync.clone()
                .spawn(config.sync_interval(), cancel.child_token()),
        ];

        info!(
            mount_point = %config.mount_point.display(),
            ?source,
            records = engine.index().len(),
            "mounted"
        );
        Ok(Self {
            config,
            engine,
            reclaimer,
            sync,
            source,
            cancel,
            tasks,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Synchronous view for callback-style bridges.
    pub fn blocking(&self, runtime: Handle) -> BlockingFs {
        BlockingFs::new(self.engine.clone(), runtime)
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn source(&self) -> MountSource {
        self.source
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    /// Chunk deletes that failed and were re-queued.
    pub fn reclaim_failures(&self) -> Vec<ReclaimFailure> {
        self.reclaimer.failures()
    }

    /// Force a snapshot now, regardless of the timer.
    pub async fn sync_now(&self) -> MountResult<SnapshotPointer> {
        Ok(self.sync.snapshot().await?)
    }

    /// Stop background work, take a final snapshot and drain reclamation.
    ///
    /// Background tasks and reclamation share one shutdown deadline; work
    /// still running when it passes is abandoned. A failed final snapshot
    /// is returned as an error; local state is left in place so the next
    /// mount picks it up.
    pub async fn unmount(self) -> MountResult<UnmountReport> {
        let deadline = self.config.shutdown_deadline();
        let deadline_at = Instant::now() + deadline;

        self.cancel.cancel();
        for mut task in self.tasks {
            match tokio::time::timeout_at(deadline_at, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "background task ended abnormally"),
                Err(_) => {
                    warn!(?deadline, "background task still busy at the shutdown deadline, aborting");
                    task.abort();
                }
            }
        }

        // The final snapshot is not subject to the deadline.
        let snapshot = self.sync.snapshot().await?;

        let reclaimed = match tokio::time::timeout_at(deadline_at, self.reclaimer.drain()).await {
            Ok(report) => report.deleted,
            Err(_) => {
                warn!(
                    pending = self.reclaimer.pending_len(),
                    ?deadline,
                    "reclamation did not finish before the shutdown deadline"
                );
                0
            }
        };
        let abandoned = self.reclaimer.pending_len();
        if abandoned > 0 {
            warn!(abandoned, "unmounting with unreclaimed chunks");
        }

        info!(
            mount_point = %self.config.mount_point.display(),
            sequence = snapshot.sequence,
            reclaimed,
            "unmounted"
        );
        Ok(UnmountReport {
            snapshot,
            reclaimed,
            abandoned,
        })
    }
}
