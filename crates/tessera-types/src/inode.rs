//! Inode records.
//!
//! The index stores one [`InodeRecord`] per path. Attributes are common to
//! every kind; the payload ([`NodeKind`]) is either a chunk list, a child set
//! or a symlink target, never more than one.

use std::collections::BTreeSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkDescriptor;
use crate::path::FsPath;

/// Permission bits kept in `mode`.
pub const PERM_MASK: u32 = 0o7777;

/// The single principal owning every entry of a mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File {
        size: u64,
        chunks: Vec<ChunkDescriptor>,
    },
    Directory {
        /// Names (not paths) of immediate children.
        children: BTreeSet<String>,
    },
    Symlink {
        target: String,
    },
}

impl NodeKind {
    /// Short label for logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::File { .. } => "file",
            NodeKind::Directory { .. } => "directory",
            NodeKind::Symlink { .. } => "symlink",
        }
    }
}

/// One filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub path: FsPath,
    pub kind: NodeKind,
    /// Permission bits only; the file type comes from `kind`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Bumped by the index on every committed change; used for
    /// compare-and-swap commits.
    pub version: u64,
}

impl InodeRecord {
    fn with_kind(path: FsPath, kind: NodeKind, mode: u32, owner: Owner) -> Self {
        let now = SystemTime::now();
        Self {
            path,
            kind,
            mode: mode & PERM_MASK,
            uid: owner.uid,
            gid: owner.gid,
            atime: now,
            mtime: now,
            ctime: now,
            version: 0,
        }
    }

    /// A new zero-length file.
    pub fn file(path: FsPath, mode: u32, owner: Owner) -> Self {
        Self::with_kind(
            path,
            NodeKind::File {
                size: 0,
                chunks: Vec::new(),
            },
            mode,
            owner,
        )
    }

    /// A new empty directory.
    pub fn directory(path: FsPath, mode: u32, owner: Owner) -> Self {
        Self::with_kind(
            path,
            NodeKind::Directory {
                children: BTreeSet::new(),
            },
            mode,
            owner,
        )
    }

    /// A new symbolic link.
    pub fn symlink(path: FsPath, target: impl Into<String>, owner: Owner) -> Self {
        Self::with_kind(
            path,
            NodeKind::Symlink {
                target: target.into(),
            },
            0o777,
            owner,
        )
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink { .. })
    }

    /// Logical size: file length, symlink target length, zero for directories.
    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { size, .. } => *size,
            NodeKind::Directory { .. } => 0,
            NodeKind::Symlink { target } => target.len() as u64,
        }
    }

    /// The chunk list (empty for non-files).
    pub fn chunks(&self) -> &[ChunkDescriptor] {
        match &self.kind {
            NodeKind::File { chunks, .. } => chunks,
            _ => &[],
        }
    }

    /// Child names (`None` for non-directories).
    pub fn children(&self) -> Option<&BTreeSet<String>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }

    /// Stamp a content change.
    pub fn touch_modified(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }

    /// Stamp an attribute-only change.
    pub fn touch_changed(&mut self) {
        self.ctime = SystemTime::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Checksum;
    use crate::ids::RemoteId;

    #[test]
    fn test_constructors() {
        let owner = Owner::new(1000, 1000);
        let file = InodeRecord::file(FsPath::parse("/a").unwrap(), 0o100644, owner);
        assert!(file.is_file());
        assert_eq!(file.mode, 0o644);
        assert_eq!(file.size(), 0);
        assert!(file.chunks().is_empty());
        assert_eq!(file.uid, 1000);

        let dir = InodeRecord::directory(FsPath::root(), 0o755, owner);
        assert!(dir.is_dir());
        assert_eq!(dir.children().map(|c| c.len()), Some(0));

        let link = InodeRecord::symlink(FsPath::parse("/l").unwrap(), "/target", owner);
        assert!(link.is_symlink());
        assert_eq!(link.size(), 7);
        assert_eq!(link.kind.label(), "symlink");
    }

    #[test]
    fn test_record_postcard() {
        let mut rec = InodeRecord::file(FsPath::parse("/f").unwrap(), 0o644, Owner::default());
        rec.kind = NodeKind::File {
            size: 3,
            chunks: vec![ChunkDescriptor::remote(
                RemoteId::new("r"),
                3,
                Checksum::of(b"abc"),
            )],
        };
        let bytes = postcard::to_stdvec(&rec).unwrap();
        let back: InodeRecord = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, rec);
    }
}
