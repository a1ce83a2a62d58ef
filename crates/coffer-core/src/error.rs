//! Error taxonomy and errno mapping.
//!
//! Every failure inside the filesystem core is an [`FsError`]. The
//! dispatcher catches errors at its boundary and hosts translate them
//! with [`FsError::to_errno`] into the negative-errno convention of a
//! FUSE-style host (the host negates the returned value).

use std::io;
use thiserror::Error;

/// Errors raised by the filesystem core.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path or directory entry missing on disk.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// Create or link target already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A path component resolved to something other than a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A directory where a non-directory was required.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A capability was invoked on a node kind that does not support it.
    #[error("node is a {actual}, not a {expected}")]
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Directory removal blocked by remaining entries.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Mutating operation on a read-only mount.
    #[error("read-only filesystem")]
    ReadOnlyFilesystem,

    /// Operation rejected by policy (e.g. hard link of a non-regular file).
    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested extended attribute not present. Common and normal;
    /// never logged as an error.
    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),

    /// Integrity verification of a node artifact failed.
    #[error("integrity verification failed: {0}")]
    Corruption(String),

    /// Underlying storage failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Maps this error to a libc errno value.
    ///
    /// Hosts return the negated value over the wire.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::KindMismatch { .. } => libc::EPERM,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::ReadOnlyFilesystem => libc::EROFS,
            FsError::NotPermitted(_) => libc::EPERM,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NoSuchAttribute(_) => no_attribute_errno(),
            FsError::Corruption(_) => libc::EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether this error is part of normal operation and should not be
    /// logged at error level (missing paths and missing xattrs occur on
    /// nearly every stat-heavy workload).
    pub fn is_quiet(&self) -> bool {
        matches!(self, FsError::NotFound(_) | FsError::NoSuchAttribute(_))
    }
}

#[cfg(target_os = "macos")]
fn no_attribute_errno() -> i32 {
    libc::ENOATTR
}

#[cfg(not(target_os = "macos"))]
fn no_attribute_errno() -> i32 {
    libc::ENODATA
}

/// Result type used throughout the filesystem core.
pub type FsResult<T> = Result<T, FsError>;
