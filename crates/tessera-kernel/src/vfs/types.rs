//! Types exchanged with the mount bridge.
//!
//! Everything here is a view of an [`InodeRecord`]; the bridge never sees
//! chunk descriptors or remote ids.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use tessera_types::{InodeRecord, NodeKind};

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

impl From<&NodeKind> for FileType {
    fn from(kind: &NodeKind) -> Self {
        match kind {
            NodeKind::File { .. } => FileType::File,
            NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::Symlink { .. } => FileType::Symlink,
        }
    }
}

/// File attributes as reported by `getattr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    pub kind: FileType,
    /// Permission bits (e.g. 0o644).
    pub perm: u32,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub ctime: SystemTime,
    /// 2 for directories (`.` and `..`), 1 otherwise. Hard links are not
    /// supported.
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Number of remote chunks backing a file (zero-fill runs excluded).
    pub chunks: u32,
}

impl FileAttr {
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

impl From<&InodeRecord> for FileAttr {
    fn from(record: &InodeRecord) -> Self {
        let kind = FileType::from(&record.kind);
        Self {
            size: record.size(),
            kind,
            perm: record.mode,
            mtime: record.mtime,
            atime: record.atime,
            ctime: record.ctime,
            nlink: if kind.is_dir() { 2 } else { 1 },
            uid: record.uid,
            gid: record.gid,
            chunks: record
                .chunks()
                .iter()
                .filter(|c| !c.is_zero_fill())
                .count() as u32,
        }
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    pub kind: FileType,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Attributes to set (for setattr operation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetAttr {
    /// New size (truncate/extend).
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
    /// New permission bits.
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl SetAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn with_atime(mut self, atime: SystemTime) -> Self {
        self.atime = Some(atime);
        self
    }

    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Returns true if anything besides `size` is requested.
    pub fn touches_attributes(&self) -> bool {
        self.mtime.is_some()
            || self.atime.is_some()
            || self.perm.is_some()
            || self.uid.is_some()
            || self.gid.is_some()
    }
}

/// Filesystem statistics.
///
/// The remote store has no meaningful capacity, so free counts are reported
/// as the maximum representable values and `blocks` tracks usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    /// Blocks in use (rounded up per byte total).
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    /// Entries in the index, including `/`.
    pub files: u64,
    pub ffree: u64,
    /// Block size, equal to the maximum chunk size.
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Open file flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open (requires `write`).
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn create_exclusive() -> Self {
        Self {
            write: true,
            create: true,
            exclusive: true,
            ..Default::default()
        }
    }

    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Decode `open(2)` flag bits.
    pub fn from_libc(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        Self {
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            create: flags & libc::O_CREAT != 0,
            truncate: flags & libc::O_TRUNC != 0,
            exclusive: flags & libc::O_EXCL != 0,
        }
    }
}

/// Opaque handle returned by `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHandle(pub u64);

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{Checksum, ChunkDescriptor, FsPath, Owner, RemoteId};

    #[test]
    fn test_attr_from_record() {
        let mut rec = InodeRecord::file(FsPath::parse("/f").unwrap(), 0o640, Owner::new(7, 8));
        rec.kind = NodeKind::File {
            size: 6,
            chunks: vec![
                ChunkDescriptor::remote(RemoteId::new("a"), 4, Checksum::of(b"abcd")),
                ChunkDescriptor::zero_fill(2),
            ],
        };
        let attr = FileAttr::from(&rec);
        assert!(attr.is_file());
        assert_eq!(attr.size, 6);
        assert_eq!(attr.perm, 0o640);
        assert_eq!((attr.uid, attr.gid), (7, 8));
        assert_eq!(attr.chunks, 1);
        assert_eq!(attr.nlink, 1);

        let dir = InodeRecord::directory(FsPath::root(), 0o755, Owner::default());
        assert_eq!(FileAttr::from(&dir).nlink, 2);
    }

    #[test]
    fn test_setattr_builder() {
        let attr = SetAttr::new().with_size(2048).with_perm(0o600);
        assert_eq!(attr.size, Some(2048));
        assert_eq!(attr.perm, Some(0o600));
        assert!(attr.mtime.is_none());
        assert!(attr.touches_attributes());
        assert!(!SetAttr::new().with_size(1).touches_attributes());
    }

    #[test]
    fn test_open_flags_from_libc() {
        let flags = OpenFlags::from_libc(libc::O_RDWR | libc::O_CREAT | libc::O_EXCL);
        assert_eq!(flags, OpenFlags::create_exclusive());
        assert_eq!(OpenFlags::from_libc(libc::O_RDONLY), OpenFlags::read());
        let trunc = OpenFlags::from_libc(libc::O_WRONLY | libc::O_TRUNC);
        assert!(trunc.write && trunc.truncate && !trunc.create);
    }
}
