//! Synchronous facade over [`Engine`].
//!
//! Callback-style bridges dispatch requests on their own threads and expect
//! a plain return value. Each call here blocks the calling thread on the
//! engine's runtime, so it must not be used from inside that runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::vfs::{DirEntry, FileAttr, FileHandle, FsResult, OpenFlags, SetAttr, StatFs, VfsOps};

use super::Engine;

/// Blocking wrapper for non-async callers.
#[derive(Clone)]
pub struct BlockingFs {
    engine: Arc<Engine>,
    runtime: Handle,
}

impl BlockingFs {
    pub fn new(engine: Arc<Engine>, runtime: Handle) -> Self {
        Self { engine, runtime }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn getattr(&self, path: impl AsRef<Path>) -> FsResult<FileAttr> {
        self.runtime.block_on(self.engine.getattr(path.as_ref()))
    }

    pub fn lookup(&self, parent: impl AsRef<Path>, name: &str) -> FsResult<FileAttr> {
        self.runtime
            .block_on(self.engine.lookup(parent.as_ref(), name))
    }

    pub fn readdir(&self, path: impl AsRef<Path>) -> FsResult<Vec<DirEntry>> {
        self.runtime.block_on(self.engine.readdir(path.as_ref()))
    }

    pub fn read(&self, path: impl AsRef<Path>, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.runtime
            .block_on(self.engine.read(path.as_ref(), offset, size))
    }

    pub fn readlink(&self, path: impl AsRef<Path>) -> FsResult<PathBuf> {
        self.runtime.block_on(self.engine.readlink(path.as_ref()))
    }

    pub fn write(&self, path: impl AsRef<Path>, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.runtime
            .block_on(self.engine.write(path.as_ref(), offset, data))
    }

    pub fn create(&self, path: impl AsRef<Path>, mode: u32) -> FsResult<FileAttr> {
        self.runtime.block_on(self.engine.create(path.as_ref(), mode))
    }

    pub fn mkdir(&self, path: impl AsRef<Path>, mode: u32) -> FsResult<FileAttr> {
        self.runtime.block_on(self.engine.mkdir(path.as_ref(), mode))
    }

    pub fn unlink(&self, path: impl AsRef<Path>) -> FsResult<()> {
        self.runtime.block_on(self.engine.unlink(path.as_ref()))
    }

    pub fn rmdir(&self, path: impl AsRef<Path>) -> FsResult<()> {
        self.runtime.block_on(self.engine.rmdir(path.as_ref()))
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> FsResult<()> {
        self.runtime
            .block_on(self.engine.rename(from.as_ref(), to.as_ref()))
    }

    pub fn truncate(&self, path: impl AsRef<Path>, size: u64) -> FsResult<()> {
        self.runtime.block_on(self.engine.truncate(path.as_ref(), size))
    }

    pub fn setattr(&self, path: impl AsRef<Path>, attr: SetAttr) -> FsResult<FileAttr> {
        self.runtime.block_on(self.engine.setattr(path.as_ref(), attr))
    }

    pub fn symlink(&self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> FsResult<FileAttr> {
        self.runtime
            .block_on(self.engine.symlink(path.as_ref(), target.as_ref()))
    }

    pub fn open(&self, path: impl AsRef<Path>, flags: OpenFlags) -> FsResult<FileHandle> {
        self.runtime.block_on(self.engine.open(path.as_ref(), flags))
    }

    pub fn release(&self, handle: FileHandle) -> FsResult<()> {
        self.runtime.block_on(self.engine.release(handle))
    }

    pub fn statfs(&self) -> FsResult<StatFs> {
        self.runtime.block_on(self.engine.statfs())
    }
}
