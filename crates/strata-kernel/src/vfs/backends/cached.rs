//! Metadata caching wrapper.
//!
//! Wraps any backend and remembers `getattr` and `readdir` answers for a
//! fixed TTL. Every mutation that passes through the wrapper drops the
//! cached state of the touched path and its parent directory.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::vfs::error::BackendResult;
use crate::vfs::ops::{Children, StorageBackend, WatchGuard, WatchSink};
use crate::vfs::types::{BackendHandle, DirEntry, FileAttr, OpenFlags};

struct Cached<T> {
    value: T,
    stored_at: Instant,
}

/// Caching decorator around another backend.
pub struct CachedBackend {
    inner: Arc<dyn StorageBackend>,
    ttl: Duration,
    attrs: DashMap<PathBuf, Cached<FileAttr>>,
    dirs: DashMap<PathBuf, Cached<Vec<DirEntry>>>,
    /// Path each writable handle was opened on, so writes can invalidate.
    handle_paths: DashMap<u64, PathBuf>,
}

impl std::fmt::Debug for CachedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBackend")
            .field("backend_type", &self.inner.backend_type())
            .field("ttl", &self.ttl)
            .field("cached_attrs", &self.attrs.len())
            .field("cached_dirs", &self.dirs.len())
            .finish()
    }
}

impl CachedBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            attrs: DashMap::new(),
            dirs: DashMap::new(),
            handle_paths: DashMap::new(),
        }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.attrs.clear();
        self.dirs.clear();
    }

    fn key(path: &Path) -> PathBuf {
        path.strip_prefix("/").unwrap_or(path).to_path_buf()
    }

    fn fresh<T: Clone>(&self, map: &DashMap<PathBuf, Cached<T>>, key: &Path) -> Option<T> {
        let entry = map.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            drop(entry);
            map.remove(key);
            None
        }
    }

    fn invalidate(&self, path: &Path) {
        let key = Self::key(path);
        let parent = key.parent().map(Path::to_path_buf).unwrap_or_default();
        trace!(path = %key.display(), "cache invalidate");
        self.attrs.remove(&key);
        self.dirs.remove(&key);
        self.attrs.remove(&parent);
        self.dirs.remove(&parent);
    }

    /// A directory rename moves everything below it.
    fn invalidate_tree(&self, path: &Path) {
        let key = Self::key(path);
        self.attrs.retain(|p, _| !p.starts_with(&key));
        self.dirs.retain(|p, _| !p.starts_with(&key));
        self.invalidate(path);
    }

    fn track(&self, handle: BackendHandle, path: &Path, flags: OpenFlags) {
        if flags.is_mutating() {
            self.handle_paths.insert(handle.0, Self::key(path));
        }
    }
}

impl StorageBackend for CachedBackend {
    fn backend_type(&self) -> &str {
        self.inner.backend_type()
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }

    fn mount(&self) -> BackendResult<()> {
        self.inner.mount()
    }

    fn unmount(&self) -> BackendResult<()> {
        self.clear();
        self.handle_paths.clear();
        self.inner.unmount()
    }

    fn getattr(&self, path: &Path) -> BackendResult<FileAttr> {
        let key = Self::key(path);
        if let Some(attr) = self.fresh(&self.attrs, &key) {
            return Ok(attr);
        }
        let attr = self.inner.getattr(path)?;
        self.attrs.insert(
            key,
            Cached {
                value: attr,
                stored_at: Instant::now(),
            },
        );
        Ok(attr)
    }

    fn readdir(&self, path: &Path) -> BackendResult<Vec<DirEntry>> {
        let key = Self::key(path);
        if let Some(entries) = self.fresh(&self.dirs, &key) {
            return Ok(entries);
        }
        let entries = self.inner.readdir(path)?;
        self.dirs.insert(
            key,
            Cached {
                value: entries.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(entries)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> BackendResult<BackendHandle> {
        let handle = self.inner.open(path, flags)?;
        if flags.truncate {
            self.invalidate(path);
        }
        self.track(handle, path, flags);
        Ok(handle)
    }

    fn read(&self, handle: BackendHandle, size: u32, offset: u64) -> BackendResult<Vec<u8>> {
        self.inner.read(handle, size, offset)
    }

    fn release(&self, handle: BackendHandle) -> BackendResult<()> {
        self.handle_paths.remove(&handle.0);
        self.inner.release(handle)
    }

    fn create(&self, path: &Path, flags: OpenFlags, mode: u32) -> BackendResult<BackendHandle> {
        let handle = self.inner.create(path, flags, mode)?;
        self.invalidate(path);
        self.handle_paths.insert(handle.0, Self::key(path));
        Ok(handle)
    }

    fn write(&self, handle: BackendHandle, data: &[u8], offset: u64) -> BackendResult<u32> {
        let written = self.inner.write(handle, data, offset)?;
        if let Some(path) = self.handle_paths.get(&handle.0).map(|p| p.value().clone()) {
            self.invalidate(&path);
        }
        Ok(written)
    }

    fn truncate(&self, path: &Path, size: u64) -> BackendResult<()> {
        self.inner.truncate(path, size)?;
        self.invalidate(path);
        Ok(())
    }

    fn unlink(&self, path: &Path) -> BackendResult<()> {
        self.inner.unlink(path)?;
        self.invalidate(path);
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> BackendResult<()> {
        self.inner.mkdir(path, mode)?;
        self.invalidate(path);
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> BackendResult<()> {
        self.inner.rmdir(path)?;
        self.invalidate(path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> BackendResult<()> {
        self.inner.rename(from, to)?;
        self.invalidate_tree(from);
        self.invalidate_tree(to);
        Ok(())
    }

    fn read_file(&self, path: &Path) -> BackendResult<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> BackendResult<()> {
        self.inner.write_file(path, data)?;
        self.invalidate(path);
        Ok(())
    }

    fn can_have_children(&self) -> bool {
        self.inner.can_have_children()
    }

    fn children(&self) -> BackendResult<Children<'_>> {
        self.inner.children()
    }

    fn watch(&self, sink: WatchSink) -> BackendResult<WatchGuard> {
        self.inner.watch(sink)
    }
}
