//! In-memory filesystem backend.
//!
//! Used for scratch mounts and testing. All data is ephemeral.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::vfs::error::{BackendError, BackendResult};
use crate::vfs::ops::StorageBackend;
use crate::vfs::types::{BackendHandle, DirEntry, FileAttr, FileType, OpenFlags, now_timestamp};

/// Largest size a file may grow to.
const MAX_FILE_SIZE: u64 = 1 << 32;

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, attr: FileAttr },
    Directory { attr: FileAttr },
}

impl Entry {
    fn attr(&self) -> FileAttr {
        match self {
            Entry::File { attr, .. } | Entry::Directory { attr } => *attr,
        }
    }

    fn kind(&self) -> FileType {
        match self {
            Entry::File { .. } => FileType::File,
            Entry::Directory { .. } => FileType::Directory,
        }
    }
}

#[derive(Debug)]
struct OpenHandle {
    path: PathBuf,
    writable: bool,
    append: bool,
}

/// In-memory filesystem backend.
///
/// Thread-safe via internal `RwLock`. All data is lost when dropped. After
/// `unmount()` every operation fails with an I/O error.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<PathBuf, Entry>>,
    handles: DashMap<u64, OpenHandle>,
    next_handle: AtomicU64,
    read_only: bool,
    unmounted: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty in-memory filesystem.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert(
            PathBuf::new(),
            Entry::Directory {
                attr: FileAttr::directory(0o755),
            },
        );
        Self {
            entries: RwLock::new(entries),
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            read_only: false,
            unmounted: AtomicBool::new(false),
        }
    }

    /// Create an empty read-only filesystem. Seed it with
    /// [`insert_file`](Self::insert_file).
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::new()
        }
    }

    /// Seed a file, creating parents. Bypasses the read-only flag.
    pub fn insert_file(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        let normalized = Self::normalize(path.as_ref());
        let data = data.into();
        let mut entries = self.entries.write();
        Self::ensure_parents(&mut entries, &normalized);
        let attr = FileAttr::file(data.len() as u64, 0o644);
        entries.insert(normalized, Entry::File { data, attr });
    }

    /// Seed a directory, creating parents. Bypasses the read-only flag.
    pub fn insert_dir(&self, path: impl AsRef<Path>) {
        let normalized = Self::normalize(path.as_ref());
        let mut entries = self.entries.write();
        Self::ensure_parents(&mut entries, &normalized);
        entries.entry(normalized).or_insert(Entry::Directory {
            attr: FileAttr::directory(0o755),
        });
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Normalize a path: remove leading `/`, resolve `.` and `..`.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => result.push(s),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        result
    }

    /// Ensure all parent directories exist.
    fn ensure_parents(entries: &mut HashMap<PathBuf, Entry>, path: &Path) {
        let mut current = PathBuf::new();
        for component in path.parent().into_iter().flat_map(|p| p.components()) {
            if let Component::Normal(s) = component {
                current.push(s);
                entries.entry(current.clone()).or_insert(Entry::Directory {
                    attr: FileAttr::directory(0o755),
                });
            }
        }
    }

    /// Parent must exist and be a directory.
    fn check_parent(entries: &HashMap<PathBuf, Entry>, path: &Path) -> BackendResult<()> {
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        match entries.get(&parent) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(_) => Err(BackendError::not_a_directory(Self::path_str(&parent))),
            None => Err(BackendError::not_found(Self::path_str(&parent))),
        }
    }

    fn check_live(&self) -> BackendResult<()> {
        if self.unmounted.load(Ordering::Acquire) {
            Err(BackendError::Io(std::io::Error::other("memory backend is unmounted")))
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> BackendResult<()> {
        if self.read_only {
            Err(BackendError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn issue_handle(&self, path: PathBuf, flags: OpenFlags) -> BackendHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(
            id,
            OpenHandle {
                path,
                writable: flags.write || flags.append,
                append: flags.append,
            },
        );
        BackendHandle(id)
    }

    /// Get the path string for error messages.
    fn path_str(path: &Path) -> String {
        path.display().to_string()
    }

    /// End offset of `len` bytes at `offset`, bounded by [`MAX_FILE_SIZE`].
    fn file_end(path: &Path, offset: u64, len: usize) -> BackendResult<usize> {
        offset
            .checked_add(len as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .and_then(|end| usize::try_from(end).ok())
            .ok_or_else(|| {
                BackendError::Io(io::Error::new(
                    io::ErrorKind::FileTooLarge,
                    format!("{}: size would exceed {MAX_FILE_SIZE} bytes", path.display()),
                ))
            })
    }
}

impl StorageBackend for MemoryBackend {
    fn backend_type(&self) -> &str {
        "memory"
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn unmount(&self) -> BackendResult<()> {
        self.unmounted.store(true, Ordering::Release);
        self.handles.clear();
        Ok(())
    }

    fn getattr(&self, path: &Path) -> BackendResult<FileAttr> {
        self.check_live()?;
        let normalized = Self::normalize(path);
        self.entries
            .read()
            .get(&normalized)
            .map(Entry::attr)
            .ok_or_else(|| BackendError::not_found(Self::path_str(&normalized)))
    }

    fn readdir(&self, path: &Path) -> BackendResult<Vec<DirEntry>> {
        self.check_live()?;
        let normalized = Self::normalize(path);
        let entries = self.entries.read();

        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(BackendError::not_a_directory(Self::path_str(&normalized))),
            None => return Err(BackendError::not_found(Self::path_str(&normalized))),
        }

        let mut result: Vec<DirEntry> = entries
            .iter()
            .filter(|(entry_path, _)| {
                *entry_path != &normalized && entry_path.parent() == Some(normalized.as_path())
            })
            .filter_map(|(entry_path, entry)| {
                entry_path
                    .file_name()
                    .map(|name| DirEntry::new(name.to_string_lossy(), entry.kind()))
            })
            .collect();

        // Sort for consistent ordering
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> BackendResult<BackendHandle> {
        self.check_live()?;
        if flags.is_mutating() {
            self.check_writable()?;
        }
        let normalized = Self::normalize(path);
        {
            let mut entries = self.entries.write();
            match entries.get_mut(&normalized) {
                Some(Entry::File { data, attr }) => {
                    if flags.truncate {
                        data.clear();
                        attr.size = 0;
                        attr.timestamp = now_timestamp();
                    }
                }
                Some(Entry::Directory { .. }) => {
                    return Err(BackendError::is_a_directory(Self::path_str(&normalized)));
                }
                None => return Err(BackendError::not_found(Self::path_str(&normalized))),
            }
        }
        Ok(self.issue_handle(normalized, flags))
    }

    fn read(&self, handle: BackendHandle, size: u32, offset: u64) -> BackendResult<Vec<u8>> {
        self.check_live()?;
        let path = self
            .handles
            .get(&handle.0)
            .map(|h| h.path.clone())
            .ok_or(BackendError::InvalidHandle(handle.0))?;
        match self.entries.read().get(&path) {
            Some(Entry::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = (start + size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Entry::Directory { .. }) => {
                Err(BackendError::is_a_directory(Self::path_str(&path)))
            }
            None => Err(BackendError::not_found(Self::path_str(&path))),
        }
    }

    fn release(&self, handle: BackendHandle) -> BackendResult<()> {
        self.handles
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(BackendError::InvalidHandle(handle.0))
    }

    fn create(&self, path: &Path, flags: OpenFlags, mode: u32) -> BackendResult<BackendHandle> {
        self.check_live()?;
        self.check_writable()?;
        let normalized = Self::normalize(path);
        {
            let mut entries = self.entries.write();
            Self::check_parent(&entries, &normalized)?;
            match entries.get_mut(&normalized) {
                Some(Entry::File { data, attr }) if !flags.exclusive => {
                    if flags.truncate {
                        data.clear();
                        attr.size = 0;
                    }
                }
                Some(_) => return Err(BackendError::already_exists(Self::path_str(&normalized))),
                None => {
                    entries.insert(
                        normalized.clone(),
                        Entry::File {
                            data: Vec::new(),
                            attr: FileAttr::file(0, mode),
                        },
                    );
                }
            }
        }
        let flags = OpenFlags {
            write: true,
            ..flags
        };
        Ok(self.issue_handle(normalized, flags))
    }

    fn write(&self, handle: BackendHandle, data: &[u8], offset: u64) -> BackendResult<u32> {
        self.check_live()?;
        self.check_writable()?;
        let (path, append) = {
            let h = self
                .handles
                .get(&handle.0)
                .ok_or(BackendError::InvalidHandle(handle.0))?;
            if !h.writable {
                return Err(BackendError::permission_denied("handle not opened for writing"));
            }
            (h.path.clone(), h.append)
        };

        let mut entries = self.entries.write();
        match entries.get_mut(&path) {
            Some(Entry::File {
                data: file_data,
                attr,
            }) => {
                let start = if append { file_data.len() as u64 } else { offset };
                let end = Self::file_end(&path, start, data.len())?;
                if end > file_data.len() {
                    file_data.resize(end, 0);
                }
                file_data[end - data.len()..end].copy_from_slice(data);
                attr.size = file_data.len() as u64;
                attr.timestamp = now_timestamp();
                Ok(data.len() as u32)
            }
            Some(Entry::Directory { .. }) => {
                Err(BackendError::is_a_directory(Self::path_str(&path)))
            }
            None => Err(BackendError::not_found(Self::path_str(&path))),
        }
    }

    fn truncate(&self, path: &Path, size: u64) -> BackendResult<()> {
        self.check_live()?;
        self.check_writable()?;
        let normalized = Self::normalize(path);
        match self.entries.write().get_mut(&normalized) {
            Some(Entry::File { data, attr }) => {
                data.resize(Self::file_end(&normalized, size, 0)?, 0);
                attr.size = size;
                attr.timestamp = now_timestamp();
                Ok(())
            }
            Some(Entry::Directory { .. }) => {
                Err(BackendError::is_a_directory(Self::path_str(&normalized)))
            }
            None => Err(BackendError::not_found(Self::path_str(&normalized))),
        }
    }

    fn unlink(&self, path: &Path) -> BackendResult<()> {
        self.check_live()?;
        self.check_writable()?;
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {
                Err(BackendError::is_a_directory(Self::path_str(&normalized)))
            }
            Some(_) => {
                entries.remove(&normalized);
                Ok(())
            }
            None => Err(BackendError::not_found(Self::path_str(&normalized))),
        }
    }

    fn mkdir(&self, path: &Path, mode: u32) -> BackendResult<()> {
        self.check_live()?;
        self.check_writable()?;
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        Self::check_parent(&entries, &normalized)?;
        if entries.contains_key(&normalized) {
            return Err(BackendError::already_exists(Self::path_str(&normalized)));
        }
        entries.insert(
            normalized,
            Entry::Directory {
                attr: FileAttr::directory(mode),
            },
        );
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> BackendResult<()> {
        self.check_live()?;
        self.check_writable()?;
        let normalized = Self::normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(BackendError::permission_denied("cannot remove root"));
        }

        let mut entries = self.entries.write();
        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(BackendError::not_a_directory(Self::path_str(&normalized))),
            None => return Err(BackendError::not_found(Self::path_str(&normalized))),
        }

        let has_children = entries
            .keys()
            .any(|k| k.parent() == Some(normalized.as_path()) && k != &normalized);
        if has_children {
            return Err(BackendError::not_empty(Self::path_str(&normalized)));
        }

        entries.remove(&normalized);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> BackendResult<()> {
        self.check_live()?;
        self.check_writable()?;
        let from_normalized = Self::normalize(from);
        let to_normalized = Self::normalize(to);

        let mut entries = self.entries.write();
        Self::check_parent(&entries, &to_normalized)?;

        let entry = entries
            .remove(&from_normalized)
            .ok_or_else(|| BackendError::not_found(Self::path_str(&from_normalized)))?;

        // Directories carry their subtree along
        if matches!(entry, Entry::Directory { .. }) {
            let children: Vec<_> = entries
                .keys()
                .filter(|k| k.starts_with(&from_normalized))
                .cloned()
                .collect();
            for child in children {
                if let (Some(child_entry), Ok(relative)) =
                    (entries.remove(&child), child.strip_prefix(&from_normalized))
                {
                    entries.insert(to_normalized.join(relative), child_entry);
                }
            }
        }

        entries.insert(to_normalized, entry);
        Ok(())
    }

    fn read_file(&self, path: &Path) -> BackendResult<Vec<u8>> {
        self.check_live()?;
        let normalized = Self::normalize(path);
        match self.entries.read().get(&normalized) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Directory { .. }) => {
                Err(BackendError::is_a_directory(Self::path_str(&normalized)))
            }
            None => Err(BackendError::not_found(Self::path_str(&normalized))),
        }
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> BackendResult<()> {
        self.check_live()?;
        self.check_writable()?;
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        Self::check_parent(&entries, &normalized)?;
        if let Some(Entry::Directory { .. }) = entries.get(&normalized) {
            return Err(BackendError::is_a_directory(Self::path_str(&normalized)));
        }
        let attr = FileAttr::file(data.len() as u64, 0o644);
        entries.insert(
            normalized,
            Entry::File {
                data: data.to_vec(),
                attr,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_new(fs: &MemoryBackend, path: &str, data: &[u8]) {
        let h = fs.create(Path::new(path), OpenFlags::create(), 0o644).unwrap();
        fs.write(h, data, 0).unwrap();
        fs.release(h).unwrap();
    }

    #[test]
    fn test_create_and_read() {
        let fs = MemoryBackend::new();
        write_new(&fs, "test.txt", b"hello world");

        let h = fs.open(Path::new("test.txt"), OpenFlags::read()).unwrap();
        assert_eq!(fs.read(h, 100, 0).unwrap(), b"hello world");
        assert_eq!(fs.read(h, 5, 6).unwrap(), b"world");
        fs.release(h).unwrap();
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_mkdir_and_readdir() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("subdir"), 0o755).unwrap();
        write_new(&fs, "subdir/file.txt", b"");
        write_new(&fs, "root.txt", b"");

        let entries = fs.readdir(Path::new("")).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root.txt", "subdir"]);

        let subentries = fs.readdir(Path::new("/subdir")).unwrap();
        assert_eq!(subentries, vec![DirEntry::file("file.txt")]);
    }

    #[test]
    fn test_create_requires_parent() {
        let fs = MemoryBackend::new();
        let err = fs
            .create(Path::new("missing/file.txt"), OpenFlags::create(), 0o644)
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[test]
    fn test_exclusive_create() {
        let fs = MemoryBackend::new();
        write_new(&fs, "a", b"x");
        let err = fs
            .create(Path::new("a"), OpenFlags::create_exclusive(), 0o644)
            .unwrap_err();
        assert!(matches!(err, BackendError::AlreadyExists(_)));
    }

    #[test]
    fn test_unlink_and_rmdir() {
        let fs = MemoryBackend::new();
        write_new(&fs, "test.txt", b"");
        fs.unlink(Path::new("test.txt")).unwrap();
        assert!(fs.getattr(Path::new("test.txt")).is_err());

        fs.insert_file("full/file.txt", "x");
        assert!(matches!(
            fs.rmdir(Path::new("full")),
            Err(BackendError::NotEmpty(_))
        ));
        fs.unlink(Path::new("full/file.txt")).unwrap();
        fs.rmdir(Path::new("full")).unwrap();
    }

    #[test]
    fn test_truncate_and_append() {
        let fs = MemoryBackend::new();
        write_new(&fs, "log", b"hello world");
        fs.truncate(Path::new("log"), 5).unwrap();

        let flags = OpenFlags {
            append: true,
            ..OpenFlags::write()
        };
        let h = fs.open(Path::new("log"), flags).unwrap();
        fs.write(h, b"!", 0).unwrap();
        fs.release(h).unwrap();
        assert_eq!(fs.read_file(Path::new("log")).unwrap(), b"hello!");
    }

    #[test]
    fn test_rename_directory() {
        let fs = MemoryBackend::new();
        fs.insert_file("old/inner.txt", "content");
        fs.rename(Path::new("old"), Path::new("new")).unwrap();
        assert!(fs.getattr(Path::new("old")).is_err());
        assert_eq!(fs.read_file(Path::new("new/inner.txt")).unwrap(), b"content");
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let fs = MemoryBackend::read_only();
        fs.insert_file("seed.txt", "seed");
        assert!(matches!(
            fs.create(Path::new("x"), OpenFlags::create(), 0o644),
            Err(BackendError::ReadOnly)
        ));
        assert!(matches!(
            fs.open(Path::new("seed.txt"), OpenFlags::write()),
            Err(BackendError::ReadOnly)
        ));
        assert_eq!(fs.read_file(Path::new("seed.txt")).unwrap(), b"seed");
    }

    #[test]
    fn test_oversized_write_and_truncate_rejected() {
        let fs = MemoryBackend::new();
        let h = fs.create(Path::new("big"), OpenFlags::create(), 0o644).unwrap();
        fs.write(h, b"abc", 0).unwrap();

        let err = fs.write(h, b"abc", u64::MAX - 1).unwrap_err();
        assert!(matches!(&err, BackendError::Io(e) if e.kind() == io::ErrorKind::FileTooLarge));
        assert!(fs.write(h, b"abc", MAX_FILE_SIZE).is_err());
        assert!(matches!(
            fs.truncate(Path::new("big"), u64::MAX),
            Err(BackendError::Io(_))
        ));
        fs.release(h).unwrap();
        assert_eq!(fs.read_file(Path::new("big")).unwrap(), b"abc");
    }

    #[test]
    fn test_unmounted_backend_fails_io() {
        let fs = MemoryBackend::new();
        fs.insert_file("f", "x");
        fs.unmount().unwrap();
        assert!(matches!(
            fs.getattr(Path::new("f")),
            Err(BackendError::Io(_))
        ));
    }
}
