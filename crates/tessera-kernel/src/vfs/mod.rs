//! Mount-bridge surface.
//!
//! - [`VfsOps`] - the filesystem operation contract
//! - [`FsError`] - the error taxonomy a bridge maps to errno
//! - [`FileAttr`], [`DirEntry`], [`SetAttr`], [`StatFs`] - request/reply types
//!
//! ## Design Decisions
//!
//! - **Path-based, no inodes**: Operations use paths, not inode numbers.
//!   The bridge handles inode ↔ path mapping on its side.
//! - **Explicit offset/size**: Read/write take offset and size, so a handle
//!   is only a validated path and carries no cursor.

mod error;
mod ops;
mod types;

pub use error::{FsError, FsResult};
pub use ops::VfsOps;
pub use types::{DirEntry, FileAttr, FileHandle, FileType, OpenFlags, SetAttr, StatFs};
