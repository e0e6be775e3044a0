//! Remote chunk reclamation.
//!
//! Chunks stop being referenced when a write supersedes them, a file is
//! truncated or unlinked, a snapshot is replaced, or a write fails after
//! uploading. Their deletion never blocks or fails a filesystem operation:
//! ids are queued here, deleted in passes, and failures are logged under
//! `tessera::reclaim`, recorded in the reclamation log and re-queued.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tessera_types::RemoteId;

use crate::blob::{BlobError, BlobStore};

/// Failures kept in the reclamation log before the oldest are dropped.
const MAX_LOGGED_FAILURES: usize = 1024;

/// Why a chunk became garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    /// Replaced by a write or dropped by a truncate.
    Superseded,
    /// Owned by an unlinked file.
    Unlinked,
    /// Uploaded by a write that never committed.
    AbortedWrite,
    /// Part of a replaced index snapshot.
    Snapshot,
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReclaimReason::Superseded => "superseded",
            ReclaimReason::Unlinked => "unlinked",
            ReclaimReason::AbortedWrite => "aborted-write",
            ReclaimReason::Snapshot => "snapshot",
        })
    }
}

/// One failed delete, as recorded in the reclamation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimFailure {
    pub id: RemoteId,
    pub reason: ReclaimReason,
    pub error: String,
    /// Attempts made so far, including this one.
    pub attempts: u32,
    pub at: SystemTime,
}

/// Outcome of one reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct Pending {
    id: RemoteId,
    reason: ReclaimReason,
    attempts: u32,
}

/// Reclaimer tuning.
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    /// Period of the background pass.
    pub interval: Duration,
    /// Deletes in flight per pass.
    pub fan_out: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            fan_out: 4,
        }
    }
}

/// Queue of remote ids awaiting deletion.
pub struct Reclaimer {
    blob: Arc<dyn BlobStore>,
    config: ReclaimConfig,
    pending: Mutex<VecDeque<Pending>>,
    failures: Mutex<VecDeque<ReclaimFailure>>,
    deleted: AtomicU64,
}

impl fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reclaimer")
            .field("pending", &self.pending.lock().len())
            .field("deleted", &self.deleted.load(Ordering::Relaxed))
            .finish()
    }
}

impl Reclaimer {
    pub fn new(blob: Arc<dyn BlobStore>, config: ReclaimConfig) -> Self {
        Self {
            blob,
            config,
            pending: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
            deleted: AtomicU64::new(0),
        }
    }

    /// Queue ids for the next pass.
    pub fn schedule(&self, ids: impl IntoIterator<Item = RemoteId>, reason: ReclaimReason) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.extend(ids.into_iter().map(|id| Pending {
            id,
            reason,
            attempts: 0,
        }));
        let added = pending.len() - before;
        if added > 0 {
            debug!(target: "tessera::reclaim", added, %reason, "scheduled chunks for reclamation");
        }
    }

    /// Delete `ids` now, one request each. Failures are logged and
    /// re-queued rather than returned.
    pub async fn reclaim(&self, ids: Vec<RemoteId>, reason: ReclaimReason) -> ReclaimReport {
        let batch = ids
            .into_iter()
            .map(|id| Pending {
                id,
                reason,
                attempts: 0,
            })
            .collect();
        self.run_batch(batch).await
    }

    /// Run one pass over everything queued right now.
    pub async fn drain(&self) -> ReclaimReport {
        let batch: Vec<Pending> = self.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return ReclaimReport::default();
        }
        self.run_batch(batch).await
    }

    /// Ids waiting for a pass.
    pub fn pending(&self) -> Vec<RemoteId> {
        self.pending.lock().iter().map(|p| p.id.clone()).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// The reclamation log: recent failed deletes, oldest first.
    pub fn failures(&self) -> Vec<ReclaimFailure> {
        self.failures.lock().iter().cloned().collect()
    }

    /// Objects deleted since startup.
    pub fn deleted_total(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Spawn the periodic pass. Stops when `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.drain().await;
                        if report.failed > 0 {
                            warn!(
                                target: "tessera::reclaim",
                                deleted = report.deleted,
                                failed = report.failed,
                                "reclamation pass incomplete"
                            );
                        }
                    }
                }
            }
            debug!(target: "tessera::reclaim", "reclaimer stopped");
        })
    }

    async fn run_batch(&self, batch: Vec<Pending>) -> ReclaimReport {
        let blob = &self.blob;
        let results: Vec<(Pending, Result<(), BlobError>)> = futures::stream::iter(batch)
            .map(|item| async move {
                let result = match blob.delete(&item.id).await {
                    Err(BlobError::NotFound(_)) => Ok(()),
                    other => other,
                };
                (item, result)
            })
            .buffer_unordered(self.config.fan_out.max(1))
            .collect()
            .await;

        let mut report = ReclaimReport::default();
        let mut requeue = Vec::new();
        for (mut item, result) in results {
            match result {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    item.attempts += 1;
                    report.failed += 1;
                    warn!(
                        target: "tessera::reclaim",
                        id = %item.id.short(),
                        reason = %item.reason,
                        attempts = item.attempts,
                        error = %e,
                        "failed to delete remote chunk"
                    );
                    self.record_failure(ReclaimFailure {
                        id: item.id.clone(),
                        reason: item.reason,
                        error: e.to_string(),
                        attempts: item.attempts,
                        at: SystemTime::now(),
                    });
                    requeue.push(item);
                }
            }
        }
        self.deleted
            .fetch_add(report.deleted as u64, Ordering::Relaxed);
        if !requeue.is_empty() {
            self.pending.lock().extend(requeue);
        }
        report
    }

    fn record_failure(&self, failure: ReclaimFailure) {
        let mut log = self.failures.lock();
        if log.len() == MAX_LOGGED_FAILURES {
            log.pop_front();
        }
        log.push_back(failure);
    }
}
