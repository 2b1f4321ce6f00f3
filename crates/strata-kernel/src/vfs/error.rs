//! VFS error types.
//!
//! Two layers: [`BackendError`] is what a storage backend reports,
//! [`FsError`] is what the router hands to the protocol transport. Backend
//! errors never cross the router untranslated.

use std::io;
use thiserror::Error;

use super::types::MountId;

/// Error reported by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Filesystem is read-only.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// The backend does not implement an optional capability.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// Unknown or already released file handle.
    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Path escapes root (security violation).
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a NotEmpty error.
    pub fn not_empty(path: impl Into<String>) -> Self {
        Self::NotEmpty(path.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Backend result type.
pub type BackendResult<T> = Result<T, BackendError>;

/// Error kinds visible to the protocol layer and control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ErrorKind {
    NotFound,
    AlreadyMounted,
    AlreadyExists,
    PermissionDenied,
    NotADirectory,
    IsADirectory,
    NotEmpty,
    NotSupported,
    InvalidArgument,
    IoFailure,
    ProtocolInvariantViolation,
}

/// Protocol-level filesystem error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    /// No mount or no entry at path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Main path already carries a live mount and remount was not requested.
    #[error("already mounted: {path} (ident {ident})")]
    AlreadyMounted { path: String, ident: MountId },

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Mutation against a read-only backend.
    #[error("read-only filesystem: {0}")]
    ReadOnly(String),

    /// Permission denied (synthesized directories, path escapes).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Backend lacks an optional capability.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Operation spans two mounts.
    #[error("cross-device link")]
    CrossDevice,

    /// A mount transition for the same path or ident is in flight.
    #[error("busy: {0}")]
    Busy(String),

    /// Malformed path, parameters or handle.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Backend-reported I/O failure.
    #[error("I/O failure: {0}")]
    Io(String),

    /// Inode/path map inconsistency. Always a bug in the caller or in us.
    #[error("protocol invariant violated: {0}")]
    InvariantViolation(String),
}

impl FsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a ReadOnly error.
    pub fn read_only(path: impl Into<String>) -> Self {
        Self::ReadOnly(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a NotSupported error.
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported(what.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an Io error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create an InvariantViolation error.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound(_) => ErrorKind::NotFound,
            FsError::AlreadyMounted { .. } => ErrorKind::AlreadyMounted,
            FsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FsError::ReadOnly(_) | FsError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            FsError::NotADirectory(_) => ErrorKind::NotADirectory,
            FsError::IsADirectory(_) => ErrorKind::IsADirectory,
            FsError::NotEmpty(_) => ErrorKind::NotEmpty,
            FsError::NotSupported(_) | FsError::CrossDevice => ErrorKind::NotSupported,
            FsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FsError::Busy(_) | FsError::Io(_) => ErrorKind::IoFailure,
            FsError::InvariantViolation(_) => ErrorKind::ProtocolInvariantViolation,
        }
    }

    /// Platform error code for the protocol transport.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyMounted { .. } | FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::ReadOnly(_) => libc::EROFS,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::NotSupported(_) => libc::ENOSYS,
            FsError::CrossDevice => libc::EXDEV,
            FsError::Busy(_) => libc::EBUSY,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Io(_) | FsError::InvariantViolation(_) => libc::EIO,
        }
    }
}

/// Translate a backend error into the protocol error domain.
impl From<BackendError> for FsError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(msg) => FsError::NotFound(msg),
            BackendError::AlreadyExists(msg) => FsError::AlreadyExists(msg),
            BackendError::PermissionDenied(msg) => FsError::PermissionDenied(msg),
            BackendError::ReadOnly => FsError::ReadOnly("backend is read-only".into()),
            BackendError::NotADirectory(msg) => FsError::NotADirectory(msg),
            BackendError::IsADirectory(msg) => FsError::IsADirectory(msg),
            BackendError::NotEmpty(msg) => FsError::NotEmpty(msg),
            BackendError::NotSupported(what) => FsError::NotSupported(what.to_string()),
            BackendError::InvalidHandle(fh) => {
                FsError::InvalidArgument(format!("invalid backend handle {fh}"))
            }
            BackendError::PathEscapesRoot(msg) => FsError::PermissionDenied(msg),
            BackendError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => FsError::NotFound(e.to_string()),
                io::ErrorKind::AlreadyExists => FsError::AlreadyExists(e.to_string()),
                io::ErrorKind::PermissionDenied => FsError::PermissionDenied(e.to_string()),
                io::ErrorKind::NotADirectory => FsError::NotADirectory(e.to_string()),
                io::ErrorKind::IsADirectory => FsError::IsADirectory(e.to_string()),
                io::ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(e.to_string()),
                io::ErrorKind::ReadOnlyFilesystem => FsError::ReadOnly(e.to_string()),
                _ => FsError::Io(e.to_string()),
            },
            BackendError::Other(msg) => FsError::Io(msg),
        }
    }
}

/// Convert FsError to std::io::Error for compatibility.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        io::Error::from_raw_os_error(e.errno())
    }
}

/// VFS result type.
pub type FsResult<T> = Result<T, FsError>;
