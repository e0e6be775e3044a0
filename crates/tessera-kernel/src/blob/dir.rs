//! Directory-backed blob store.
//!
//! Each object is one file named by its remote id directly under `root`.
//! Writes go to a dot-prefixed temporary file first and are renamed into
//! place, so a crash never leaves a truncated object behind a valid id.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use tessera_types::RemoteId;

use super::{BlobError, BlobResult, BlobStore};

/// Blob store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
    max_object_size: u32,
}

impl DirBlobStore {
    /// Open (creating if needed) a store under `root`.
    pub async fn open(root: impl Into<PathBuf>, max_object_size: u32) -> io::Result<Self> {
        let root: PathBuf = root.into();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self {
            root,
            max_object_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an id to its file. Ids that could name anything outside `root`
    /// (separators, dots, empty) resolve to nothing.
    fn resolve(&self, id: &RemoteId) -> Option<PathBuf> {
        let raw = id.as_str();
        let safe = !raw.is_empty()
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        safe.then(|| self.root.join(raw))
    }
}

fn transport(err: io::Error) -> BlobError {
    BlobError::transport(err.to_string())
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn put(&self, data: &[u8]) -> BlobResult<RemoteId> {
        if data.len() > self.max_object_size as usize {
            return Err(BlobError::TooLarge {
                size: data.len(),
                max: self.max_object_size,
            });
        }
        let id = RemoteId::generate();
        let path = self
            .resolve(&id)
            .ok_or_else(|| BlobError::transport("generated id is not a valid file name"))?;
        let tmp = self.root.join(format!(".{}.tmp", id.as_str()));

        let mut f = fs::File::create(&tmp).await.map_err(transport)?;
        f.write_all(data).await.map_err(transport)?;
        f.sync_all().await.map_err(transport)?;
        drop(f);
        fs::rename(&tmp, &path).await.map_err(transport)?;

        debug!(id = %id.short(), bytes = data.len(), "stored object");
        Ok(id)
    }

    async fn get(&self, id: &RemoteId) -> BlobResult<Vec<u8>> {
        let path = self
            .resolve(id)
            .ok_or_else(|| BlobError::NotFound(id.clone()))?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(id.clone())),
            Err(e) => Err(transport(e)),
        }
    }

    async fn delete(&self, id: &RemoteId) -> BlobResult<()> {
        let path = self
            .resolve(id)
            .ok_or_else(|| BlobError::NotFound(id.clone()))?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(id.clone())),
            Err(e) => Err(transport(e)),
        }
    }

    fn max_object_size(&self) -> Option<u32> {
        Some(self.max_object_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (DirBlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DirBlobStore::open(dir.path().join("objects"), 16)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_roundtrip_on_disk() {
        let (store, _dir) = setup().await;
        let id = store.put(b"chunk payload").await.unwrap();
        assert!(store.root().join(id.as_str()).exists());
        assert_eq!(store.get(&id).await.unwrap(), b"chunk payload");

        store.delete(&id).await.unwrap();
        assert_eq!(store.get(&id).await, Err(BlobError::NotFound(id.clone())));
        assert_eq!(store.delete(&id).await, Err(BlobError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_enforces_max_size() {
        let (store, _dir) = setup().await;
        let big = vec![0u8; 17];
        assert!(matches!(
            store.put(&big).await,
            Err(BlobError::TooLarge { size: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_ids() {
        let (store, dir) = setup().await;
        std::fs::write(dir.path().join("secret"), b"x").unwrap();
        let id = RemoteId::new("../secret");
        assert!(matches!(store.get(&id).await, Err(BlobError::NotFound(_))));
        assert!(matches!(store.delete(&id).await, Err(BlobError::NotFound(_))));
        assert!(dir.path().join("secret").exists());
    }
}
