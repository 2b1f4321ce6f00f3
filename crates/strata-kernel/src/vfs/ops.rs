//! Storage backend capability trait.
//!
//! Every mounted plugin implements [`StorageBackend`]. Paths handed to a
//! backend are always relative to its mount prefix; the router does the
//! rewriting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::registry::StorageParams;
use super::types::{BackendHandle, DirEntry, FileAttr, OpenFlags};

/// A dynamically derived, separately mountable unit exposed by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubcontainerDescriptor {
    /// Paths relative to the parent backend's main path.
    pub paths: Vec<PathBuf>,
    /// Parameters to build the child backend from.
    pub storage_params: StorageParams,
    /// Inherited from the parent backend.
    #[serde(default)]
    pub read_only: bool,
}

/// Kind of change reported by a backend watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum WatchEventKind {
    Create,
    Modify,
    Delete,
}

/// A change observed by a backend watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Relative to the backend root, or a logical path once the mount table
    /// has rewritten it.
    pub path: PathBuf,
}

/// Callback receiving watcher events.
pub type WatchSink = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Keeps a watcher alive. Dropping it stops delivery.
pub struct WatchGuard {
    _inner: Box<dyn Send>,
}

impl WatchGuard {
    /// Wrap whatever keeps the underlying watcher running.
    pub fn new(inner: impl Send + 'static) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard").finish_non_exhaustive()
    }
}

/// Sub-containers produced by a backend's children enumerator.
pub type Children<'a> = Box<dyn Iterator<Item = (PathBuf, SubcontainerDescriptor)> + Send + 'a>;

/// Core storage backend trait.
///
/// Operations are synchronous; a backend doing network I/O blocks the calling
/// worker according to its own timeout policy. Implementations must tolerate
/// concurrent calls between `mount()` and `unmount()`.
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Identity and lifecycle
    // ========================================================================

    /// Type tag the backend was built from (registry key).
    fn backend_type(&self) -> &str;

    /// Returns true if this backend refuses mutations. Fixed at construction.
    fn read_only(&self) -> bool;

    /// Attach: connect, warm caches. Called once before the mount is routable.
    fn mount(&self) -> BackendResult<()> {
        Ok(())
    }

    /// Detach and release resources. Called once.
    fn unmount(&self) -> BackendResult<()> {
        Ok(())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Get file attributes.
    fn getattr(&self, path: &Path) -> BackendResult<FileAttr>;

    /// Read directory entries (without `.` and `..`).
    fn readdir(&self, path: &Path) -> BackendResult<Vec<DirEntry>>;

    /// Open an existing file.
    fn open(&self, path: &Path, flags: OpenFlags) -> BackendResult<BackendHandle>;

    /// Read up to `size` bytes at `offset`. Short reads mean EOF.
    fn read(&self, handle: BackendHandle, size: u32, offset: u64) -> BackendResult<Vec<u8>>;

    /// Release an open handle.
    fn release(&self, handle: BackendHandle) -> BackendResult<()>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Create a file and open it.
    fn create(&self, path: &Path, flags: OpenFlags, mode: u32) -> BackendResult<BackendHandle>;

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write(&self, handle: BackendHandle, data: &[u8], offset: u64) -> BackendResult<u32>;

    /// Truncate (or extend) a file.
    fn truncate(&self, path: &Path, size: u64) -> BackendResult<()>;

    /// Remove a file.
    fn unlink(&self, path: &Path) -> BackendResult<()>;

    /// Create a directory.
    fn mkdir(&self, path: &Path, mode: u32) -> BackendResult<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &Path) -> BackendResult<()>;

    // ========================================================================
    // Optional capabilities
    // ========================================================================

    /// Rename within this backend.
    fn rename(&self, from: &Path, to: &Path) -> BackendResult<()> {
        let _ = (from, to);
        Err(BackendError::NotSupported("rename"))
    }

    /// Read a whole file in one call.
    fn read_file(&self, path: &Path) -> BackendResult<Vec<u8>> {
        let _ = path;
        Err(BackendError::NotSupported("read_file"))
    }

    /// Replace a whole file in one call.
    fn write_file(&self, path: &Path, data: &[u8]) -> BackendResult<()> {
        let _ = (path, data);
        Err(BackendError::NotSupported("write_file"))
    }

    /// Whether [`children`](Self::children) yields anything.
    fn can_have_children(&self) -> bool {
        false
    }

    /// Enumerate sub-containers derived from this backend's content.
    fn children(&self) -> BackendResult<Children<'_>> {
        Err(BackendError::NotSupported("children"))
    }

    /// Watch for changes. Events carry backend-relative paths.
    fn watch(&self, sink: WatchSink) -> BackendResult<WatchGuard> {
        let _ = sink;
        Err(BackendError::NotSupported("watch"))
    }
}
