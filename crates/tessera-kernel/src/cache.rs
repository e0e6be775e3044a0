//! Resident-chunk cache.
//!
//! Recently read or written chunk payloads keyed by remote id, bounded by a
//! total byte budget and evicted least-recently-used. Chunk contents never
//! change under an id, so the only invalidation needed is dropping an id
//! once the index stops referencing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use tessera_types::RemoteId;

struct CachedChunk {
    data: Arc<[u8]>,
    /// Logical clock value of the last hit, for LRU eviction.
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<RemoteId, CachedChunk>,
    used: usize,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bytes: usize,
}

/// Byte-budgeted LRU of chunk payloads.
pub struct ChunkCache {
    state: RwLock<CacheState>,
    budget: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ChunkCache")
            .field("entries", &state.entries.len())
            .field("used", &state.used)
            .field("budget", &self.budget)
            .finish()
    }
}

impl ChunkCache {
    /// A budget of zero disables caching.
    pub fn new(budget: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            budget,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: &RemoteId) -> Option<Arc<[u8]>> {
        let mut state = self.state.write();
        let now = state.tick();
        match state.entries.get_mut(id) {
            Some(entry) => {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache a payload. Payloads larger than the whole budget are skipped.
    pub fn insert(&self, id: RemoteId, data: Arc<[u8]>) {
        if data.len() > self.budget {
            return;
        }
        let mut state = self.state.write();
        if let Some(old) = state.entries.remove(&id) {
            state.used -= old.data.len();
        }
        while state.used + data.len() > self.budget {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            let Some(key) = oldest else { break };
            if let Some(evicted) = state.entries.remove(&key) {
                state.used -= evicted.data.len();
                trace!(id = %key.short(), bytes = evicted.data.len(), "evicted chunk");
            }
        }
        let now = state.tick();
        state.used += data.len();
        state.entries.insert(
            id,
            CachedChunk {
                data,
                last_access: now,
            },
        );
    }

    /// Drop a superseded chunk.
    pub fn invalidate(&self, id: &RemoteId) {
        let mut state = self.state.write();
        if let Some(old) = state.entries.remove(id) {
            state.used -= old.data.len();
        }
    }

    pub fn invalidate_all<'a>(&self, ids: impl IntoIterator<Item = &'a RemoteId>) {
        let mut state = self.state.write();
        for id in ids {
            if let Some(old) = state.entries.remove(id) {
                state.used -= old.data.len();
            }
        }
    }

    pub fn contains(&self, id: &RemoteId) -> bool {
        self.state.read().entries.contains_key(id)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: state.entries.len(),
            bytes: state.used,
        }
    }
}
