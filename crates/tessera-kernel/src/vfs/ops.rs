//! Filesystem operations trait.
//!
//! The contract a kernel-level user-space filesystem bridge calls into:
//! path-based, explicit offset/size, one method per bridge request.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::types::{DirEntry, FileAttr, FileHandle, OpenFlags, SetAttr, StatFs};
use super::FsResult;

/// Core filesystem operations.
///
/// Paths are absolute within the mounted filesystem. They are normalized on
/// entry, so `a/./b` and `/a/b` name the same entry.
#[async_trait]
pub trait VfsOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Get file attributes.
    async fn getattr(&self, path: &Path) -> FsResult<FileAttr>;

    /// Read directory entries, sorted by name.
    async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>>;

    /// Read up to `size` bytes starting at `offset`.
    ///
    /// Returns fewer bytes (possibly none) when the range runs past EOF.
    async fn read(&self, path: &Path, offset: u64, size: u32) -> FsResult<Vec<u8>>;

    /// Read symbolic link target.
    async fn readlink(&self, path: &Path) -> FsResult<PathBuf>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write `data` at `offset`, returning the number of bytes written.
    ///
    /// Either the whole write lands or the file is left untouched.
    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> FsResult<u32>;

    /// Create a new empty file.
    async fn create(&self, path: &Path, mode: u32) -> FsResult<FileAttr>;

    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<FileAttr>;

    /// Remove a file or symlink.
    async fn unlink(&self, path: &Path) -> FsResult<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &Path) -> FsResult<()>;

    /// Rename a file or directory, replacing `to` if it exists.
    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;

    /// Truncate or extend a file to `size`.
    async fn truncate(&self, path: &Path, size: u64) -> FsResult<()>;

    async fn setattr(&self, path: &Path, attr: SetAttr) -> FsResult<FileAttr>;

    /// Create a symlink at `path` pointing to `target`.
    async fn symlink(&self, path: &Path, target: &Path) -> FsResult<FileAttr>;

    // ========================================================================
    // Handles and metadata
    // ========================================================================

    /// Validate (and per `flags`, create or truncate) `path` and hand out a
    /// handle for it.
    async fn open(&self, path: &Path, flags: OpenFlags) -> FsResult<FileHandle>;

    /// Forget a handle. Unknown handles are ignored.
    async fn release(&self, handle: FileHandle) -> FsResult<()>;

    async fn statfs(&self) -> FsResult<StatFs>;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Attributes of `name` inside `parent`.
    async fn lookup(&self, parent: &Path, name: &str) -> FsResult<FileAttr> {
        self.getattr(&parent.join(name)).await
    }

    async fn exists(&self, path: &Path) -> bool {
        self.getattr(path).await.is_ok()
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &Path) -> FsResult<Vec<u8>> {
        let attr = self.getattr(path).await?;
        let mut out = Vec::with_capacity(attr.size as usize);
        while (out.len() as u64) < attr.size {
            let want = (attr.size - out.len() as u64).min(u64::from(u32::MAX)) as u32;
            let piece = self.read(path, out.len() as u64, want).await?;
            if piece.is_empty() {
                break;
            }
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }

    /// Create or truncate, then write the whole file.
    async fn write_all(&self, path: &Path, data: &[u8]) -> FsResult<()> {
        if self.exists(path).await {
            self.truncate(path, 0).await?;
        } else {
            self.create(path, 0o644).await?;
        }
        if !data.is_empty() {
            self.write(path, 0, data).await?;
        }
        Ok(())
    }
}
