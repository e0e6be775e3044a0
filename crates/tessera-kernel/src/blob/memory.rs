//! In-memory blob store.
//!
//! Instrumented for tests: every call is counted, deletes are logged, and
//! failures can be injected per operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use tessera_types::RemoteId;

use super::{BlobError, BlobResult, BlobStore};

#[derive(Debug, Default)]
struct Faults {
    /// Puts left before every further put fails with `Transport`.
    put_budget: Option<u64>,
    /// Next N puts fail with `RateLimited`, then succeed.
    rate_limited_puts: u32,
    /// Next N gets fail with `Transport`, then succeed.
    failing_gets: u32,
    /// Every delete fails with `Transport`.
    fail_deletes: bool,
}

/// In-memory object store.
#[derive(Debug)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<RemoteId, Vec<u8>>>,
    max_object_size: u32,
    faults: Mutex<Faults>,
    deletes: Mutex<Vec<RemoteId>>,
    put_calls: AtomicU64,
    get_calls: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new(max_object_size: u32) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            max_object_size,
            faults: Mutex::new(Faults::default()),
            deletes: Mutex::new(Vec::new()),
            put_calls: AtomicU64::new(0),
            get_calls: AtomicU64::new(0),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn contains(&self, id: &RemoteId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Ids of every stored object.
    pub fn ids(&self) -> Vec<RemoteId> {
        self.objects.read().keys().cloned().collect()
    }

    /// Size of every stored object.
    pub fn object_sizes(&self) -> Vec<usize> {
        self.objects.read().values().map(Vec::len).collect()
    }

    /// Put calls seen, including failed ones.
    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    /// Get calls seen, including failed ones.
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    /// Every delete request seen, in order, including failed ones.
    pub fn delete_log(&self) -> Vec<RemoteId> {
        self.deletes.lock().clone()
    }

    /// Allow `n` more puts, then fail every put with a transport error.
    pub fn fail_puts_after(&self, n: u64) {
        self.faults.lock().put_budget = Some(n);
    }

    /// Fail the next `n` puts with `RateLimited`.
    pub fn rate_limit_next_puts(&self, n: u32) {
        self.faults.lock().rate_limited_puts = n;
    }

    /// Fail the next `n` gets with a transport error.
    pub fn fail_next_gets(&self, n: u32) {
        self.faults.lock().failing_gets = n;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.faults.lock().fail_deletes = fail;
    }

    /// Clear every injected fault.
    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Overwrite a stored object in place, bypassing checksums.
    pub fn corrupt(&self, id: &RemoteId, data: Vec<u8>) -> bool {
        match self.objects.write().get_mut(id) {
            Some(slot) => {
                *slot = data;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8]) -> BlobResult<RemoteId> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        {
            let mut faults = self.faults.lock();
            if faults.rate_limited_puts > 0 {
                faults.rate_limited_puts -= 1;
                return Err(BlobError::RateLimited { retry_after: None });
            }
            if let Some(budget) = faults.put_budget.as_mut() {
                if *budget == 0 {
                    return Err(BlobError::transport("injected put failure"));
                }
                *budget -= 1;
            }
        }
        if data.len() > self.max_object_size as usize {
            return Err(BlobError::TooLarge {
                size: data.len(),
                max: self.max_object_size,
            });
        }
        let id = RemoteId::generate();
        self.objects.write().insert(id.clone(), data.to_vec());
        Ok(id)
    }

    async fn get(&self, id: &RemoteId) -> BlobResult<Vec<u8>> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        {
            let mut faults = self.faults.lock();
            if faults.failing_gets > 0 {
                faults.failing_gets -= 1;
                return Err(BlobError::transport("injected get failure"));
            }
        }
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(id.clone()))
    }

    async fn delete(&self, id: &RemoteId) -> BlobResult<()> {
        self.deletes.lock().push(id.clone());
        if self.faults.lock().fail_deletes {
            return Err(BlobError::transport("injected delete failure"));
        }
        match self.objects.write().remove(id) {
            Some(_) => Ok(()),
            None => Err(BlobError::NotFound(id.clone())),
        }
    }

    fn max_object_size(&self) -> Option<u32> {
        Some(self.max_object_size)
    }
}
