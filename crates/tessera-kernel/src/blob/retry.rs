//! Retry decorator.
//!
//! Wraps any [`BlobStore`] and retries transient failures (rate limiting,
//! transport) with bounded exponential backoff plus a little jitter.
//! Permanent failures are returned on the first attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use tessera_types::RemoteId;

use super::{BlobError, BlobResult, BlobStore};

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// A [`BlobStore`] that retries its inner store.
pub struct RetryingBlobStore {
    inner: Arc<dyn BlobStore>,
    policy: RetryPolicy,
}

impl RetryingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> BlobResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = BlobResult<T>> + Send,
        T: Send,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let mut delay = self.policy.delay(attempt);
                    if let BlobError::RateLimited {
                        retry_after: Some(hint),
                    } = &e
                    {
                        delay = delay.max(*hint);
                    }
                    let jitter = Duration::from_millis(rand::random::<u64>() % 20);
                    warn!(op, attempt = attempt + 1, error = %e, ?delay, "transient blob failure, retrying");
                    tokio::time::sleep(delay + jitter).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl BlobStore for RetryingBlobStore {
    async fn put(&self, data: &[u8]) -> BlobResult<RemoteId> {
        self.run("put", || self.inner.put(data)).await
    }

    async fn get(&self, id: &RemoteId) -> BlobResult<Vec<u8>> {
        self.run("get", || self.inner.get(id)).await
    }

    async fn delete(&self, id: &RemoteId) -> BlobResult<()> {
        self.run("delete", || self.inner.delete(id)).await
    }

    fn max_object_size(&self) -> Option<u32> {
        self.inner.max_object_size()
    }
}
