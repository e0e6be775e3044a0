//! Shared data model for tessera.
//!
//! A pure leaf crate: paths, remote ids, chunk descriptors and inode records.
//! No I/O happens here; the kernel crate owns every side effect.
//!
//! |---------------------|---------------------------------------------|
//! | Type                | Purpose                                     |
//! |---------------------|---------------------------------------------|
//! | [`FsPath`]          | Normalized absolute path, the index key     |
//! | [`RemoteId`]        | Opaque blob-store handle                    |
//! | [`Checksum`]        | BLAKE3 digest guarding chunk downloads      |
//! | [`ChunkDescriptor`] | One bounded segment of a file               |
//! | [`InodeRecord`]     | Attributes plus file/dir/symlink payload    |
//! |---------------------|---------------------------------------------|

pub mod chunk;
pub mod ids;
pub mod inode;
pub mod path;

pub use chunk::{
    check_tiling, remote_ids, tiled_len, zero_fill_run, Checksum, ChunkDescriptor, ChunkSource,
    TilingError,
};
pub use ids::RemoteId;
pub use inode::{InodeRecord, NodeKind, Owner, PERM_MASK};
pub use path::{FsPath, PathError, NAME_MAX};
