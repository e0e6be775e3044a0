//! Filesystem error types.
//!
//! What the mount bridge sees. Index, codec and adapter errors are folded in
//! here so remote-store error shapes never leak past the engine.

use std::io;
use thiserror::Error;

use tessera_types::PathError;

use crate::blob::BlobError;
use crate::codec::CodecError;
use crate::index::IndexError;

/// Filesystem error type.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Bad offset or length.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// The result would exceed the per-file size limit.
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// Remote failure that survived the retry budget.
    #[error("remote store unavailable: {0}")]
    RemoteTransient(String),

    /// Remote failure that retrying cannot fix.
    #[error("remote store error: {0}")]
    RemotePermanent(String),

    /// Checksum mismatch or broken chunk tiling. Never repaired silently.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Local metadata persistence failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::ConsistencyViolation(msg.into())
    }

    /// The `errno` a kernel bridge should reply with.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidRange(_) | FsError::InvalidPath(_) => libc::EINVAL,
            FsError::FileTooLarge(_) => libc::EFBIG,
            FsError::RemoteTransient(_) => libc::EAGAIN,
            FsError::RemotePermanent(_)
            | FsError::ConsistencyViolation(_)
            | FsError::Storage(_) => libc::EIO,
            FsError::PermissionDenied(_) => libc::EPERM,
        }
    }
}

impl From<IndexError> for FsError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::NotFound(p) | IndexError::ParentMissing(p) => {
                FsError::NotFound(p.to_string())
            }
            IndexError::AlreadyExists(p) => FsError::AlreadyExists(p.to_string()),
            IndexError::NotADirectory(p) => FsError::NotADirectory(p.to_string()),
            IndexError::IsADirectory(p) => FsError::IsADirectory(p.to_string()),
            IndexError::NotEmpty(p) => FsError::NotEmpty(p.to_string()),
            IndexError::InvalidPath(msg) => FsError::InvalidPath(msg),
            e @ IndexError::KindMismatch { .. } => FsError::InvalidPath(e.to_string()),
            IndexError::Consistency(msg) => {
                tracing::error!(target: "tessera::consistency", %msg, "index consistency violation");
                FsError::ConsistencyViolation(msg)
            }
            e @ IndexError::Conflict { .. } => FsError::Storage(e.to_string()),
            IndexError::Storage(e) => FsError::Storage(e.to_string()),
            IndexError::Codec(e) => FsError::Storage(e.to_string()),
        }
    }
}

impl From<CodecError> for FsError {
    fn from(e: CodecError) -> Self {
        FsError::InvalidRange(e.to_string())
    }
}

impl From<BlobError> for FsError {
    fn from(e: BlobError) -> Self {
        if e.is_transient() {
            FsError::RemoteTransient(e.to_string())
        } else {
            FsError::RemotePermanent(e.to_string())
        }
    }
}

impl From<PathError> for FsError {
    fn from(e: PathError) -> Self {
        FsError::InvalidPath(e.to_string())
    }
}

/// Convert FsError to std::io::Error for compatibility.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        let errno = e.errno();
        match e {
            FsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            FsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            FsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            FsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            FsError::NotEmpty(msg) => io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg),
            FsError::InvalidRange(msg) | FsError::InvalidPath(msg) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            FsError::PermissionDenied(msg) => io::Error::new(io::ErrorKind::PermissionDenied, msg),
            FsError::RemoteTransient(msg) => io::Error::new(io::ErrorKind::WouldBlock, msg),
            FsError::FileTooLarge(_)
            | FsError::RemotePermanent(_)
            | FsError::ConsistencyViolation(_)
            | FsError::Storage(_) => io::Error::from_raw_os_error(errno),
        }
    }
}

/// Filesystem result type.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{FsPath, RemoteId};

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::not_found("/x").errno(), libc::ENOENT);
        assert_eq!(FsError::NotEmpty("/d".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::consistency("bad").errno(), libc::EIO);
    }

    #[test]
    fn test_blob_errors_fold_into_remote() {
        let transient: FsError = BlobError::transport("reset").into();
        assert!(matches!(transient, FsError::RemoteTransient(_)));
        let permanent: FsError = BlobError::NotFound(RemoteId::new("x")).into();
        assert!(matches!(permanent, FsError::RemotePermanent(_)));
    }

    #[test]
    fn test_index_errors_map() {
        let e: FsError = IndexError::ParentMissing(FsPath::parse("/a").unwrap()).into();
        assert!(matches!(e, FsError::NotFound(_)));
        let e: FsError = IndexError::NotEmpty(FsPath::root()).into();
        assert_eq!(e.errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn test_into_io_error() {
        let io_err: io::Error = FsError::is_a_directory("/d").into();
        assert_eq!(io_err.kind(), io::ErrorKind::IsADirectory);
        let io_err: io::Error = FsError::consistency("x").into();
        assert_eq!(io_err.raw_os_error(), Some(libc::EIO));
    }
}
