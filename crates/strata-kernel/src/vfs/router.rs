//! Operation router.
//!
//! Glue between a filesystem protocol transport and the mounted backends.
//! Every call is routed through a resolver snapshot to the owning backend,
//! checked against read-only policy, dispatched with the path rewritten
//! relative to the mount prefix, and has its errors translated to
//! [`FsError`]. Inode-addressed calls go through the [`InodeManager`] first.

use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, debug_span};

use super::conflict::{Resolution, Target};
use super::error::{BackendError, ErrorKind, FsError, FsResult};
use super::inode::{Inode, InodeManager};
use super::mount::MountTable;
use super::ops::StorageBackend;
use super::path::{is_valid_name, normalize, parent};
use super::types::{BackendHandle, DirEntry, FileAttr, MountId, OpenFlags};

/// Chunk size for whole-file reads through handles.
const READ_CHUNK: u32 = 128 * 1024;

/// Reply to calls that hand an inode to the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryReply {
    pub inode: Inode,
    pub attr: FileAttr,
}

/// Reply to `create`: the new entry plus an open file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreateReply {
    pub inode: Inode,
    pub attr: FileAttr,
    pub fh: u64,
}

struct OpenFile {
    ident: MountId,
    backend: Arc<dyn StorageBackend>,
    handle: BackendHandle,
    writable: bool,
    path: PathBuf,
}

/// A backend selected for a mutation.
struct Writable {
    ident: MountId,
    backend: Arc<dyn StorageBackend>,
    relative: PathBuf,
}

/// Routes filesystem calls to mounted backends.
pub struct Router {
    table: Arc<MountTable>,
    inodes: InodeManager,
    open_files: DashMap<u64, OpenFile>,
    next_fh: AtomicU64,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("table", &self.table)
            .field("inodes", &self.inodes.len())
            .field("open_files", &self.open_files.len())
            .finish()
    }
}

impl Router {
    pub fn new(table: Arc<MountTable>) -> Self {
        Self {
            table,
            inodes: InodeManager::new(),
            open_files: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    /// The mount table this router reads from.
    pub fn table(&self) -> &Arc<MountTable> {
        &self.table
    }

    /// Inode bookkeeping, for diagnostics.
    pub fn inodes(&self) -> &InodeManager {
        &self.inodes
    }

    /// Number of open file handles.
    pub fn open_handles(&self) -> usize {
        self.open_files.len()
    }

    // ========================================================================
    // Policy
    // ========================================================================

    fn attr_for(backend: &dyn StorageBackend, attr: FileAttr) -> FileAttr {
        if backend.read_only() {
            attr.without_write_bits()
        } else {
            attr
        }
    }

    /// Pick the backend for a mutation of `res`, refusing synthesized
    /// directories and read-only backends before anything is called.
    fn writable(res: &Resolution<'_>, op: &'static str) -> FsResult<Writable> {
        match &res.target {
            Target::Synthetic => Err(FsError::permission_denied(format!(
                "{op}: {} is a synthesized directory",
                res.path.display()
            ))),
            Target::Backend {
                ident,
                backend,
                relative,
                ..
            } => {
                if backend.read_only() {
                    debug!(op, %ident, path = %res.path.display(), "rejected: read-only backend");
                    return Err(FsError::read_only(res.path.display().to_string()));
                }
                Ok(Writable {
                    ident: *ident,
                    backend: backend.clone(),
                    relative: relative.clone(),
                })
            }
        }
    }

    /// Split a create-like path into its parent and validated entry name.
    fn split(path: &Path) -> FsResult<(PathBuf, String)> {
        let path = normalize(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| FsError::invalid_argument("cannot create the root directory"))?;
        Ok((parent(&path), name))
    }

    fn child_of(&self, parent: Inode, name: &str) -> FsResult<PathBuf> {
        if !is_valid_name(name) {
            return Err(FsError::invalid_argument(format!("invalid entry name '{name}'")));
        }
        Ok(self.inodes.path_of(parent)?.join(name))
    }

    fn issue_fh(&self, file: OpenFile) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.insert(fh, file);
        fh
    }

    // ========================================================================
    // Path-addressed operations
    // ========================================================================

    /// Attributes of a logical path. Directories that exist only because of
    /// deeper mounts report as read-only directories.
    pub fn getattr_path(&self, path: &Path) -> FsResult<FileAttr> {
        let _span = debug_span!("router", op = "getattr", path = %path.display()).entered();
        let resolver = self.table.resolver();
        let res = resolver.route(path)?;
        match &res.target {
            Target::Synthetic => Ok(FileAttr::synthetic_directory()),
            Target::Backend {
                backend, relative, ..
            } => match backend.getattr(relative) {
                Ok(attr) => Ok(Self::attr_for(backend.as_ref(), attr)),
                Err(e) => {
                    let e = FsError::from(e);
                    let shadowed =
                        matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory);
                    if shadowed && res.has_mounts_below() {
                        Ok(FileAttr::synthetic_directory())
                    } else {
                        Err(e)
                    }
                }
            },
        }
    }

    /// Merged listing of a logical directory, led by `.` and `..`.
    pub fn readdir_path(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let _span = debug_span!("router", op = "readdir", path = %path.display()).entered();
        let resolver = self.table.resolver();
        let res = resolver.route(path)?;
        res.view.readdir(&res.path)
    }

    /// Open an existing file and return a router file handle.
    pub fn open_path(&self, path: &Path, flags: OpenFlags) -> FsResult<u64> {
        let _span = debug_span!("router", op = "open", path = %path.display()).entered();
        let resolver = self.table.resolver();
        let res = resolver.route(path)?;
        let (ident, backend, relative) = if flags.is_mutating() {
            let w = Self::writable(&res, "open")?;
            (w.ident, w.backend, w.relative)
        } else {
            match &res.target {
                Target::Synthetic => {
                    return Err(FsError::IsADirectory(res.path.display().to_string()));
                }
                Target::Backend {
                    ident,
                    backend,
                    relative,
                    ..
                } => (*ident, backend.clone(), relative.clone()),
            }
        };

        let handle = backend.open(&relative, flags)?;
        Ok(self.issue_fh(OpenFile {
            ident,
            backend,
            handle,
            writable: flags.write || flags.append,
            path: res.path.clone(),
        }))
    }

    /// Create a file and open it for writing.
    pub fn create_path(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> FsResult<(u64, FileAttr)> {
        let _span = debug_span!("router", op = "create", path = %path.display()).entered();
        let (dir, name) = Self::split(path)?;
        let resolver = self.table.resolver();
        let res = resolver.route(&dir)?;
        let w = Self::writable(&res, "create")?;
        let relative = w.relative.join(&name);

        let handle = w.backend.create(&relative, flags, mode)?;
        let attr = match w.backend.getattr(&relative) {
            Ok(attr) => attr,
            Err(BackendError::NotSupported(_)) => FileAttr::file(0, mode),
            Err(e) => {
                w.backend.release(handle).ok();
                return Err(e.into());
            }
        };
        let fh = self.issue_fh(OpenFile {
            ident: w.ident,
            backend: w.backend.clone(),
            handle,
            writable: true,
            path: res.path.join(&name),
        });
        Ok((fh, Self::attr_for(w.backend.as_ref(), attr)))
    }

    /// Create a directory.
    pub fn mkdir_path(&self, path: &Path, mode: u32) -> FsResult<FileAttr> {
        let _span = debug_span!("router", op = "mkdir", path = %path.display()).entered();
        let (dir, name) = Self::split(path)?;
        let resolver = self.table.resolver();
        let res = resolver.route(&dir)?;
        let w = Self::writable(&res, "mkdir")?;
        let relative = w.relative.join(&name);

        w.backend.mkdir(&relative, mode)?;
        let attr = w
            .backend
            .getattr(&relative)
            .unwrap_or_else(|_| FileAttr::directory(mode));
        Ok(Self::attr_for(w.backend.as_ref(), attr))
    }

    /// Remove a file.
    pub fn unlink_path(&self, path: &Path) -> FsResult<()> {
        let _span = debug_span!("router", op = "unlink", path = %path.display()).entered();
        let resolver = self.table.resolver();
        let res = resolver.route(path)?;
        let w = Self::writable(&res, "unlink")?;
        if w.relative.as_os_str().is_empty() {
            return Err(FsError::Busy(format!("{} is a mount point", res.path.display())));
        }
        w.backend.unlink(&w.relative)?;
        self.inodes.detach(path);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir_path(&self, path: &Path) -> FsResult<()> {
        let _span = debug_span!("router", op = "rmdir", path = %path.display()).entered();
        let resolver = self.table.resolver();
        let res = resolver.route(path)?;
        let w = Self::writable(&res, "rmdir")?;
        if w.relative.as_os_str().is_empty() {
            return Err(FsError::Busy(format!("{} is a mount point", res.path.display())));
        }
        w.backend.rmdir(&w.relative)?;
        self.inodes.detach(path);
        Ok(())
    }

    /// Truncate (or extend) a file.
    pub fn truncate_path(&self, path: &Path, size: u64) -> FsResult<()> {
        let _span = debug_span!("router", op = "truncate", path = %path.display()).entered();
        let resolver = self.table.resolver();
        let res = resolver.route(path)?;
        let w = Self::writable(&res, "truncate")?;
        w.backend.truncate(&w.relative, size)?;
        Ok(())
    }

    /// Rename within one mount.
    pub fn rename_path(&self, from: &Path, to: &Path) -> FsResult<()> {
        let _span = debug_span!(
            "router",
            op = "rename",
            from = %from.display(),
            to = %to.display()
        )
        .entered();
        let (to_dir, to_name) = Self::split(to)?;
        let resolver = self.table.resolver();
        let source = resolver.route(from)?;
        let dest = resolver.route(&to_dir)?;
        let src = Self::writable(&source, "rename")?;
        let dst = Self::writable(&dest, "rename")?;
        if src.ident != dst.ident {
            return Err(FsError::CrossDevice);
        }
        if src.relative.as_os_str().is_empty() {
            return Err(FsError::Busy(format!("{} is a mount point", source.path.display())));
        }
        src.backend.rename(&src.relative, &dst.relative.join(&to_name))?;
        self.inodes.rename_path(from, to);
        Ok(())
    }

    /// Read a whole file. Falls back to open/read/release when the backend
    /// has no bulk read.
    pub fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        let _span = debug_span!("router", op = "read_file", path = %path.display()).entered();
        let resolver = self.table.resolver();
        let res = resolver.route(path)?;
        let Target::Backend {
            backend, relative, ..
        } = &res.target
        else {
            return Err(FsError::IsADirectory(res.path.display().to_string()));
        };

        match backend.read_file(relative) {
            Err(BackendError::NotSupported(_)) => {}
            other => return Ok(other?),
        }

        let handle = backend.open(relative, OpenFlags::read())?;
        let mut data = Vec::new();
        let result = loop {
            match backend.read(handle, READ_CHUNK, data.len() as u64) {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        backend.release(handle).ok();
        result?;
        Ok(data)
    }

    /// Replace a whole file, creating it if needed. Falls back to
    /// create/write/release when the backend has no bulk write.
    pub fn write_file(&self, path: &Path, data: &[u8]) -> FsResult<()> {
        let _span = debug_span!("router", op = "write_file", path = %path.display()).entered();
        Self::split(path)?;
        let resolver = self.table.resolver();
        // Route the full path so a suffixed name reaches the owner it lists.
        let res = resolver.route(path)?;
        let w = Self::writable(&res, "write_file")?;
        let relative = w.relative;

        match w.backend.write_file(&relative, data) {
            Err(BackendError::NotSupported(_)) => {}
            other => return Ok(other?),
        }

        let flags = OpenFlags {
            truncate: true,
            ..OpenFlags::create()
        };
        let handle = w.backend.create(&relative, flags, 0o644)?;
        let result = w.backend.write(handle, data, 0);
        w.backend.release(handle).ok();
        result?;
        Ok(())
    }

    // ========================================================================
    // Handle operations
    // ========================================================================

    /// Read through an open handle.
    pub fn read(&self, fh: u64, size: u32, offset: u64) -> FsResult<Vec<u8>> {
        let file = self
            .open_files
            .get(&fh)
            .ok_or_else(|| FsError::invalid_argument(format!("unknown file handle {fh}")))?;
        Ok(file.backend.read(file.handle, size, offset)?)
    }

    /// Write through an open handle.
    pub fn write(&self, fh: u64, data: &[u8], offset: u64) -> FsResult<u32> {
        let file = self
            .open_files
            .get(&fh)
            .ok_or_else(|| FsError::invalid_argument(format!("unknown file handle {fh}")))?;
        if file.backend.read_only() {
            debug!(
                ident = %file.ident,
                path = %file.path.display(),
                "rejected write: read-only backend"
            );
            return Err(FsError::read_only(file.path.display().to_string()));
        }
        if !file.writable {
            return Err(FsError::permission_denied(format!(
                "{} not opened for writing",
                file.path.display()
            )));
        }
        Ok(file.backend.write(file.handle, data, offset)?)
    }

    /// Release an open handle.
    pub fn release(&self, fh: u64) -> FsResult<()> {
        let (_, file) = self
            .open_files
            .remove(&fh)
            .ok_or_else(|| FsError::invalid_argument(format!("unknown file handle {fh}")))?;
        Ok(file.backend.release(file.handle)?)
    }

    // ========================================================================
    // Inode-addressed operations
    // ========================================================================

    /// Look up `name` under `parent`, counting one reference on the result.
    pub fn lookup(&self, parent: Inode, name: &str) -> FsResult<EntryReply> {
        let path = self.child_of(parent, name)?;
        let attr = self.getattr_path(&path)?;
        let inode = self.inodes.lookup(&path);
        Ok(EntryReply { inode, attr })
    }

    pub fn getattr(&self, inode: Inode) -> FsResult<FileAttr> {
        self.getattr_path(&self.inodes.path_of(inode)?)
    }

    pub fn readdir(&self, inode: Inode) -> FsResult<Vec<DirEntry>> {
        self.readdir_path(&self.inodes.path_of(inode)?)
    }

    pub fn open(&self, inode: Inode, flags: OpenFlags) -> FsResult<u64> {
        self.open_path(&self.inodes.path_of(inode)?, flags)
    }

    /// Create `name` under `parent`; counts one reference on the new inode.
    pub fn create(
        &self,
        parent: Inode,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> FsResult<CreateReply> {
        let path = self.child_of(parent, name)?;
        let (fh, attr) = self.create_path(&path, flags, mode)?;
        let inode = self.inodes.lookup(&path);
        Ok(CreateReply { inode, attr, fh })
    }

    /// Create directory `name` under `parent`; counts one reference.
    pub fn mkdir(&self, parent: Inode, name: &str, mode: u32) -> FsResult<EntryReply> {
        let path = self.child_of(parent, name)?;
        let attr = self.mkdir_path(&path, mode)?;
        let inode = self.inodes.lookup(&path);
        Ok(EntryReply { inode, attr })
    }

    pub fn unlink(&self, parent: Inode, name: &str) -> FsResult<()> {
        self.unlink_path(&self.child_of(parent, name)?)
    }

    pub fn rmdir(&self, parent: Inode, name: &str) -> FsResult<()> {
        self.rmdir_path(&self.child_of(parent, name)?)
    }

    pub fn truncate(&self, inode: Inode, size: u64) -> FsResult<()> {
        self.truncate_path(&self.inodes.path_of(inode)?, size)
    }

    pub fn rename(
        &self,
        parent: Inode,
        name: &str,
        new_parent: Inode,
        new_name: &str,
    ) -> FsResult<()> {
        let from = self.child_of(parent, name)?;
        let to = self.child_of(new_parent, new_name)?;
        self.rename_path(&from, &to)
    }

    /// Drop `n` lookup references. Returns true when the inode was erased.
    pub fn forget(&self, inode: Inode, n: u64) -> FsResult<bool> {
        self.inodes.forget(inode, n)
    }
}
