//! Local filesystem backend.
//!
//! Provides access to a real directory tree, with path security to prevent
//! escaping the root directory.

use dashmap::DashMap;
use notify::{EventKind, RecursiveMode, Watcher};
use serde_json::Value;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::vfs::error::{BackendError, BackendResult};
use crate::vfs::ops::{
    Children, StorageBackend, SubcontainerDescriptor, WatchEvent, WatchEventKind, WatchGuard,
    WatchSink,
};
use crate::vfs::registry::StorageParams;
use crate::vfs::types::{BackendHandle, DirEntry, FileAttr, FileType, OpenFlags};

struct LocalHandle {
    file: fs::File,
    writable: bool,
}

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/srv/photos`, then `getattr("2024/a.jpg")` stats
/// `/srv/photos/2024/a.jpg`.
///
/// Path security is enforced: attempts to escape via `..` or symlinks are
/// blocked.
pub struct LocalBackend {
    root: PathBuf,
    read_only: bool,
    split_children: bool,
    handles: DashMap<u64, LocalHandle>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("root", &self.root)
            .field("read_only", &self.read_only)
            .field("open_handles", &self.handles.len())
            .finish()
    }
}

impl LocalBackend {
    /// Create a new local filesystem rooted at the given path.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            read_only: false,
            split_children: false,
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Set whether this filesystem is read-only.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Expose every top-level subdirectory as a mountable sub-container.
    pub fn with_split_children(mut self, split: bool) -> Self {
        self.split_children = split;
        self
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute path within the root.
    ///
    /// Returns an error if the path escapes the root (via `..` or a symlink).
    fn resolve(&self, path: &Path) -> BackendResult<PathBuf> {
        let path = path.strip_prefix("/").unwrap_or(path);
        if path.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }

        let full = self.root.join(path);

        // For new files, canonicalize the parent and append the filename
        let canonical = if full.exists() {
            dunce::canonicalize(&full)?
        } else {
            let parent = full
                .parent()
                .ok_or_else(|| BackendError::not_found(path.display().to_string()))?;
            let filename = full
                .file_name()
                .ok_or_else(|| BackendError::not_found(path.display().to_string()))?;
            if parent.exists() {
                dunce::canonicalize(parent)?.join(filename)
            } else {
                // Parent doesn't exist, will fail on actual operation
                full.clone()
            }
        };

        if !canonical.starts_with(&self.root) {
            return Err(BackendError::PathEscapesRoot(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )));
        }
        Ok(canonical)
    }

    /// Like [`resolve`](Self::resolve), but a symlink in the final component
    /// is returned as itself instead of its target.
    fn resolve_entry(&self, path: &Path) -> BackendResult<PathBuf> {
        let path = path.strip_prefix("/").unwrap_or(path);
        if path.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }

        let full = self.root.join(path);
        let (Some(parent), Some(name)) = (full.parent(), full.file_name()) else {
            return Err(BackendError::not_found(path.display().to_string()));
        };
        if !parent.exists() {
            return Err(BackendError::not_found(path.display().to_string()));
        }
        let entry = dunce::canonicalize(parent)?.join(name);

        if !entry.starts_with(&self.root) {
            return Err(BackendError::PathEscapesRoot(format!(
                "{} is not under {}",
                entry.display(),
                self.root.display()
            )));
        }
        Ok(entry)
    }

    /// Check if write operations are allowed.
    fn check_writable(&self) -> BackendResult<()> {
        if self.read_only {
            Err(BackendError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Convert std::fs::Metadata to FileAttr.
    fn metadata_to_attr(meta: &fs::Metadata) -> FileAttr {
        FileAttr {
            size: if meta.is_dir() { 0 } else { meta.len() },
            timestamp: meta.mtime(),
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
        }
    }

    fn file_type_of(file_type: fs::FileType) -> FileType {
        if file_type.is_dir() {
            FileType::Directory
        } else if file_type.is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        }
    }

    fn issue_handle(&self, file: fs::File, writable: bool) -> BackendHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, LocalHandle { file, writable });
        BackendHandle(id)
    }
}

impl StorageBackend for LocalBackend {
    fn backend_type(&self) -> &str {
        "local"
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn mount(&self) -> BackendResult<()> {
        let meta = fs::metadata(&self.root)?;
        if !meta.is_dir() {
            return Err(BackendError::not_a_directory(self.root.display().to_string()));
        }
        Ok(())
    }

    fn unmount(&self) -> BackendResult<()> {
        self.handles.clear();
        Ok(())
    }

    fn getattr(&self, path: &Path) -> BackendResult<FileAttr> {
        let full_path = self.resolve_entry(path)?;
        let meta = fs::symlink_metadata(&full_path)?;
        Ok(Self::metadata_to_attr(&meta))
    }

    fn readdir(&self, path: &Path) -> BackendResult<Vec<DirEntry>> {
        let full_path = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full_path)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: Self::file_type_of(entry.file_type()?),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> BackendResult<BackendHandle> {
        if flags.is_mutating() {
            self.check_writable()?;
        }
        let full_path = self.resolve(path)?;
        if full_path.is_dir() {
            return Err(BackendError::is_a_directory(path.display().to_string()));
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write((flags.write || flags.truncate) && !flags.append)
            .append(flags.append)
            .truncate(flags.truncate && !flags.append)
            .open(&full_path)?;
        Ok(self.issue_handle(file, flags.write || flags.append))
    }

    fn read(&self, handle: BackendHandle, size: u32, offset: u64) -> BackendResult<Vec<u8>> {
        let h = self
            .handles
            .get(&handle.0)
            .ok_or(BackendError::InvalidHandle(handle.0))?;
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        // read_at may return short counts before EOF
        while filled < buffer.len() {
            let n = h.file.read_at(&mut buffer[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn release(&self, handle: BackendHandle) -> BackendResult<()> {
        self.handles
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(BackendError::InvalidHandle(handle.0))
    }

    fn create(&self, path: &Path, flags: OpenFlags, mode: u32) -> BackendResult<BackendHandle> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let mut options = fs::OpenOptions::new();
        options
            .read(true)
            .write(true)
            .truncate(flags.truncate)
            .mode(mode & 0o7777);
        if flags.exclusive {
            options.create_new(true);
        } else {
            options.create(true);
        }
        let file = options.open(&full_path)?;
        Ok(self.issue_handle(file, true))
    }

    fn write(&self, handle: BackendHandle, data: &[u8], offset: u64) -> BackendResult<u32> {
        self.check_writable()?;
        let h = self
            .handles
            .get(&handle.0)
            .ok_or(BackendError::InvalidHandle(handle.0))?;
        if !h.writable {
            return Err(BackendError::permission_denied("handle not opened for writing"));
        }
        h.file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    fn truncate(&self, path: &Path, size: u64) -> BackendResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let file = fs::OpenOptions::new().write(true).open(&full_path)?;
        file.set_len(size)?;
        Ok(())
    }

    fn unlink(&self, path: &Path) -> BackendResult<()> {
        self.check_writable()?;
        let full_path = self.resolve_entry(path)?;
        fs::remove_file(&full_path)?;
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> BackendResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(&full_path)?;
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> BackendResult<()> {
        self.check_writable()?;
        let full_path = self.resolve_entry(path)?;
        if full_path == self.root {
            return Err(BackendError::permission_denied("cannot remove root"));
        }
        fs::remove_dir(&full_path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> BackendResult<()> {
        self.check_writable()?;
        let from_path = self.resolve_entry(from)?;
        let to_path = self.resolve_entry(to)?;
        fs::rename(&from_path, &to_path)?;
        Ok(())
    }

    fn read_file(&self, path: &Path) -> BackendResult<Vec<u8>> {
        let full_path = self.resolve(path)?;
        Ok(fs::read(&full_path)?)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> BackendResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        fs::write(&full_path, data)?;
        Ok(())
    }

    fn can_have_children(&self) -> bool {
        self.split_children
    }

    fn children(&self) -> BackendResult<Children<'_>> {
        if !self.split_children {
            return Err(BackendError::NotSupported("children"));
        }
        let read_only = self.read_only;
        let iter = fs::read_dir(&self.root)?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(move |entry| {
                let name = PathBuf::from(entry.file_name());
                let path = entry.path().to_string_lossy().into_owned();
                let params = StorageParams::new("local").with_param("path", Value::String(path));
                (
                    name.clone(),
                    SubcontainerDescriptor {
                        paths: vec![name],
                        storage_params: params,
                        read_only,
                    },
                )
            });
        Ok(Box::new(iter))
    }

    fn watch(&self, sink: WatchSink) -> BackendResult<WatchGuard> {
        let root = self.root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            let kind = match event.kind {
                EventKind::Create(_) => WatchEventKind::Create,
                EventKind::Modify(_) => WatchEventKind::Modify,
                EventKind::Remove(_) => WatchEventKind::Delete,
                _ => return,
            };
            for path in &event.paths {
                if let Ok(relative) = path.strip_prefix(&root) {
                    sink(WatchEvent {
                        kind,
                        path: relative.to_path_buf(),
                    });
                }
            }
        })
        .map_err(|e| BackendError::other(format!("failed to start watcher: {e}")))?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| {
                BackendError::other(format!("failed to watch {}: {e}", self.root.display()))
            })?;
        Ok(WatchGuard::new(watcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn test_create_write_read() {
        let (_dir, fs) = setup();
        let h = fs.create(Path::new("test.txt"), OpenFlags::create(), 0o644).unwrap();
        assert_eq!(fs.write(h, b"hello world", 0).unwrap(), 11);
        fs.release(h).unwrap();

        let h = fs.open(Path::new("test.txt"), OpenFlags::read()).unwrap();
        assert_eq!(fs.read(h, 5, 6).unwrap(), b"world");
        fs.release(h).unwrap();

        let attr = fs.getattr(Path::new("test.txt")).unwrap();
        assert!(attr.is_file());
        assert_eq!(attr.size, 11);
    }

    #[test]
    fn test_readdir_sorted() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let names: Vec<_> = fs
            .readdir(Path::new(""))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
    }

    #[test]
    fn test_path_escape_blocked() {
        let (_dir, fs) = setup();
        let result = fs.getattr(Path::new("../../etc/passwd"));
        assert!(matches!(result, Err(BackendError::PathEscapesRoot(_))));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let (dir, _) = setup();
        std::fs::write(dir.path().join("f"), "x").unwrap();
        let fs = LocalBackend::new(dir.path()).with_read_only(true);
        assert!(matches!(fs.unlink(Path::new("f")), Err(BackendError::ReadOnly)));
        assert!(matches!(
            fs.open(Path::new("f"), OpenFlags::write()),
            Err(BackendError::ReadOnly)
        ));
        assert_eq!(fs.read_file(Path::new("f")).unwrap(), b"x");
    }

    #[test]
    fn test_mkdir_rmdir() {
        let (_dir, fs) = setup();
        fs.mkdir(Path::new("d"), 0o755).unwrap();
        assert!(fs.getattr(Path::new("d")).unwrap().is_dir());
        fs.rmdir(Path::new("d")).unwrap();
        assert!(fs.getattr(Path::new("d")).is_err());
    }

    #[test]
    fn test_symlink_is_not_followed() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("target.txt"), "kept").unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();

        let kinds: Vec<_> = fs
            .readdir(Path::new(""))
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert!(kinds.contains(&("link".to_string(), FileType::Symlink)));
        assert!(fs.getattr(Path::new("link")).unwrap().is_symlink());
        assert!(fs.getattr(Path::new("target.txt")).unwrap().is_file());

        fs.rename(Path::new("link"), Path::new("moved")).unwrap();
        assert!(std::fs::symlink_metadata(dir.path().join("moved")).unwrap().is_symlink());

        fs.unlink(Path::new("moved")).unwrap();
        assert!(std::fs::symlink_metadata(dir.path().join("moved")).is_err());
        assert_eq!(std::fs::read(dir.path().join("target.txt")).unwrap(), b"kept");
    }

    #[test]
    fn test_mount_requires_directory() {
        let dir = TempDir::new().unwrap();
        let fs = LocalBackend::new(dir.path().join("missing"));
        assert!(fs.mount().is_err());
    }

    #[test]
    fn test_children_per_subdirectory() {
        let (dir, _) = setup();
        std::fs::create_dir(dir.path().join("2023")).unwrap();
        std::fs::create_dir(dir.path().join("2024")).unwrap();
        std::fs::write(dir.path().join("readme"), "x").unwrap();

        let fs = LocalBackend::new(dir.path()).with_split_children(true);
        assert!(fs.can_have_children());
        let mut children: Vec<_> = fs.children().unwrap().map(|(p, _)| p).collect();
        children.sort();
        assert_eq!(children, vec![PathBuf::from("2023"), PathBuf::from("2024")]);
    }

    #[test]
    fn test_children_inherit_read_only() {
        let (dir, _) = setup();
        std::fs::create_dir(dir.path().join("2024")).unwrap();

        let fs = LocalBackend::new(dir.path())
            .with_read_only(true)
            .with_split_children(true);
        let (_, child) = fs.children().unwrap().next().unwrap();
        assert!(child.read_only);
        assert!(!child.storage_params.params.contains_key("read_only"));

        let fs = LocalBackend::new(dir.path()).with_split_children(true);
        let (_, child) = fs.children().unwrap().next().unwrap();
        assert!(!child.read_only);
    }

    #[test]
    fn test_children_disabled_by_default() {
        let (_dir, fs) = setup();
        assert!(!fs.can_have_children());
        assert!(matches!(fs.children(), Err(BackendError::NotSupported(_))));
    }
}
