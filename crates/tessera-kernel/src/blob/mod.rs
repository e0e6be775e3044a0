//! Remote blob store adapters.
//!
//! The engine only ever sees [`BlobStore`]: opaque put/get/delete of byte
//! payloads keyed by a store-assigned [`RemoteId`]. Transport details
//! (credentials, the upload API, connection state) live behind it.
//!
//! - [`MemoryBlobStore`] - in-process store with fault injection, for tests
//! - [`DirBlobStore`] - one file per object under a root directory
//! - [`RetryingBlobStore`] - bounded exponential backoff for transient errors

mod dir;
mod memory;
mod retry;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use tessera_types::RemoteId;

pub use dir::DirBlobStore;
pub use memory::MemoryBlobStore;
pub use retry::{RetryPolicy, RetryingBlobStore};

/// Adapter errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobError {
    /// Payload exceeds the store's object ceiling. Permanent.
    #[error("object too large: {size} bytes, limit {max}")]
    TooLarge { size: usize, max: u32 },

    /// The store asked us to slow down. Transient.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// No object under this id. Permanent.
    #[error("remote object not found: {0}")]
    NotFound(RemoteId),

    /// Network or service failure. Transient.
    #[error("transport: {0}")]
    Transport(String),
}

impl BlobError {
    /// Returns true for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::RateLimited { .. } | BlobError::Transport(_))
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        BlobError::Transport(msg.into())
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Opaque object storage with a maximum object size.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data`, returning the id the store assigned to it.
    async fn put(&self, data: &[u8]) -> BlobResult<RemoteId>;

    async fn get(&self, id: &RemoteId) -> BlobResult<Vec<u8>>;

    /// Remove an object. Callers treat `NotFound` as success.
    async fn delete(&self, id: &RemoteId) -> BlobResult<()>;

    /// The store's object ceiling, if it advertises one.
    fn max_object_size(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BlobError::RateLimited { retry_after: None }.is_transient());
        assert!(BlobError::transport("reset").is_transient());
        assert!(!BlobError::NotFound(RemoteId::new("x")).is_transient());
        assert!(!BlobError::TooLarge { size: 5, max: 4 }.is_transient());
    }
}
