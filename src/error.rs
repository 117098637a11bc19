//! Error types for duofs
//!
//! Every branch-level failure is surfaced to the caller unchanged; nothing
//! is swallowed and replaced by a default. The FUSE layer maps each variant
//! to a conventional errno via [`Error::errno`] so standard tooling behaves
//! correctly against the union.

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout duofs
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Neither branch holds the entry
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// An entry already exists at the logical path
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    /// Caller is not allowed to perform the operation
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// Composed branch path exceeds the platform limit
    #[error("path too long: {0}")]
    NameTooLong(PathBuf),

    /// Directory removal attempted on a non-empty merged view
    #[error("directory not empty: {0}")]
    NotEmpty(PathBuf),

    /// Writable branch is out of space or handles
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Malformed logical path or branch configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Whiteout/override/copy-up state the resolver cannot interpret
    #[error("inconsistent union state at {path}: {detail}")]
    Inconsistent { path: PathBuf, detail: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying branch I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map to the errno expected by FUSE and standard tooling.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::NameTooLong(_) => libc::ENAMETOOLONG,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::ResourceExhausted(_) => libc::ENOSPC,
            Error::InvalidArgument(_) | Error::Config(_) => libc::EINVAL,
            Error::Inconsistent { .. } => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Translate a branch I/O error into the union taxonomy for a logical path.
    pub fn from_branch_io(err: std::io::Error, logical: &std::path::Path) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Error::NotFound(logical.to_path_buf()),
            ErrorKind::AlreadyExists => Error::AlreadyExists(logical.to_path_buf()),
            ErrorKind::PermissionDenied => Error::PermissionDenied(logical.to_path_buf()),
            _ => match err.raw_os_error() {
                Some(code) if code == libc::ENAMETOOLONG => {
                    Error::NameTooLong(logical.to_path_buf())
                }
                Some(code) if code == libc::ENOSPC || code == libc::EDQUOT => {
                    Error::ResourceExhausted(format!("{}: {}", logical.display(), err))
                }
                Some(code) if code == libc::ENOTEMPTY => Error::NotEmpty(logical.to_path_buf()),
                _ => Error::Io(err),
            },
        }
    }
}
