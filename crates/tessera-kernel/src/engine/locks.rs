//! Per-path locks.
//!
//! Readers of a path share its lock; anything that mutates the record
//! (write, truncate, unlink, rename, setattr) takes it exclusively. Locks
//! are async so a holder can await uploads without blocking a runtime
//! thread, and they only ever cover one path, so operations on different
//! files never wait on each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use tessera_types::FsPath;

/// Unused entries are pruned once the table grows past this.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
pub(crate) struct PathLocks {
    locks: DashMap<FsPath, Arc<RwLock<()>>>,
}

/// Exclusive guard over one or two paths.
pub(crate) struct WriteGuards {
    _guards: Vec<OwnedRwLockWriteGuard<()>>,
}

impl PathLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &FsPath) -> Arc<RwLock<()>> {
        if self.locks.len() > PRUNE_THRESHOLD {
            // An entry only the table references is not held by anyone.
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        self.locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) async fn read(&self, path: &FsPath) -> OwnedRwLockReadGuard<()> {
        self.lock_for(path).read_owned().await
    }

    pub(crate) async fn write(&self, path: &FsPath) -> WriteGuards {
        WriteGuards {
            _guards: vec![self.lock_for(path).write_owned().await],
        }
    }

    /// Lock two paths exclusively, in path order so concurrent pairs cannot
    /// deadlock.
    pub(crate) async fn write_pair(&self, a: &FsPath, b: &FsPath) -> WriteGuards {
        if a == b {
            return self.write(a).await;
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let g1 = self.lock_for(first).write_owned().await;
        let g2 = self.lock_for(second).write_owned().await;
        WriteGuards {
            _guards: vec![g1, g2],
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_writer_excludes_readers() {
        let locks = Arc::new(PathLocks::new());
        let guard = locks.write(&p("/f")).await;

        let other = locks.clone();
        let reader = tokio::spawn(async move {
            let _r = other.read(&p("/f")).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        drop(guard);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_paths_do_not_block() {
        let locks = PathLocks::new();
        let _a = locks.write(&p("/a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.write(&p("/b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_pair_same_path() {
        let locks = PathLocks::new();
        let _g = locks.write_pair(&p("/x"), &p("/x")).await;
        assert_eq!(locks.len(), 1);
    }
}
