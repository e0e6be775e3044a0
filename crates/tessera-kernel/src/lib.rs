//! # tessera-kernel
//!
//! A chunked virtual filesystem over a remote object store.
//!
//! Files are split into bounded chunks, each stored as one remote object.
//! Paths, attributes and chunk lists live in a local metadata index that is
//! periodically snapshotted to the same remote, so a mount can be rebuilt
//! from nothing but the remote and a small pointer record.
//!
//! | Module        | Role                                                 |
//! |---------------|------------------------------------------------------|
//! | [`codec`]     | Byte-range to chunk-index arithmetic                 |
//! | [`store`]     | Key-value persistence (SQLite or memory)             |
//! | [`index`]     | Path-keyed inode records, atomic rename              |
//! | [`blob`]      | Remote object store contract, adapters, retry        |
//! | [`cache`]     | Bounded LRU of downloaded chunks                     |
//! | [`reclaim`]   | Deferred deletion of unreferenced chunks             |
//! | [`engine`]    | Read/write/truncate/rename over chunks               |
//! | [`sync`]      | Index snapshot upload and restore                    |
//! | [`mount`]     | Mount and unmount lifecycle                          |
//! | [`vfs`]       | Operation contract and errno taxonomy for bridges    |

pub mod blob;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod index;
pub mod mount;
pub mod reclaim;
pub mod store;
pub mod sync;
pub mod vfs;

pub use blob::{BlobError, BlobStore, DirBlobStore, MemoryBlobStore, RetryPolicy, RetryingBlobStore};
pub use cache::{CacheStats, ChunkCache};
pub use config::{ConfigError, RemoteConfig, TesseraConfig};
pub use engine::{BlockingFs, Engine, EngineConfig};
pub use index::{IndexError, IndexStats, MetadataIndex};
pub use mount::{MountError, MountResult, MountSource, Tessera, UnmountReport};
pub use reclaim::{ReclaimConfig, ReclaimFailure, ReclaimReason, ReclaimReport, Reclaimer};
pub use store::{KvStore, MemoryKvStore, SqliteKvStore, StoreError};
pub use sync::{SnapshotPointer, SyncError, SyncManager};
pub use vfs::{
    DirEntry, FileAttr, FileHandle, FileType, FsError, FsResult, OpenFlags, SetAttr, StatFs,
    VfsOps,
};

pub use tessera_types;
