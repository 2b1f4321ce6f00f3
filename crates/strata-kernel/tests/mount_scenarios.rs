//! End-to-end mount scenarios.
//!
//! Everything here goes through the public surface a host sees: a
//! [`MountTable`] behind a [`Router`], driven directly or through the
//! [`MountController`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use strata_kernel::vfs::{BackendError, BackendHandle, BackendResult, ROOT_INODE};
use strata_kernel::{
    BackendRegistry, ControlCommand, ControlResponse, DirEntry, ErrorKind, FileAttr, LocalBackend,
    MemoryBackend, MountController, MountId, MountOutcome, MountRequest, MountTable, OpenFlags,
    Router, StorageBackend, StorageParams,
};
use tempfile::TempDir;

// ============================================================================
// Shared test setup
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn router() -> Router {
    init_tracing();
    Router::new(Arc::new(MountTable::new()))
}

fn mount(router: &Router, paths: &[&str], backend: Arc<dyn StorageBackend>) -> MountId {
    router
        .table()
        .mount(paths.iter().map(PathBuf::from).collect(), backend, false)
        .unwrap()
}

fn memory(files: &[(&str, &str)]) -> MemoryBackend {
    let backend = MemoryBackend::new();
    for (path, content) in files {
        backend.insert_file(path, content.as_bytes());
    }
    backend
}

fn names(entries: &[DirEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

/// Delegates to a [`MemoryBackend`] and counts every mutating call.
struct Recording {
    inner: MemoryBackend,
    mutations: AtomicUsize,
}

impl Recording {
    fn new(inner: MemoryBackend) -> Arc<Self> {
        Arc::new(Self {
            inner,
            mutations: AtomicUsize::new(0),
        })
    }

    fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn record(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

impl StorageBackend for Recording {
    fn backend_type(&self) -> &str {
        "recording"
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }

    fn getattr(&self, path: &Path) -> BackendResult<FileAttr> {
        self.inner.getattr(path)
    }

    fn readdir(&self, path: &Path) -> BackendResult<Vec<DirEntry>> {
        self.inner.readdir(path)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> BackendResult<BackendHandle> {
        if flags.is_mutating() {
            self.record();
        }
        self.inner.open(path, flags)
    }

    fn read(&self, handle: BackendHandle, size: u32, offset: u64) -> BackendResult<Vec<u8>> {
        self.inner.read(handle, size, offset)
    }

    fn release(&self, handle: BackendHandle) -> BackendResult<()> {
        self.inner.release(handle)
    }

    fn create(&self, path: &Path, flags: OpenFlags, mode: u32) -> BackendResult<BackendHandle> {
        self.record();
        self.inner.create(path, flags, mode)
    }

    fn write(&self, handle: BackendHandle, data: &[u8], offset: u64) -> BackendResult<u32> {
        self.record();
        self.inner.write(handle, data, offset)
    }

    fn truncate(&self, path: &Path, size: u64) -> BackendResult<()> {
        self.record();
        self.inner.truncate(path, size)
    }

    fn unlink(&self, path: &Path) -> BackendResult<()> {
        self.record();
        self.inner.unlink(path)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> BackendResult<()> {
        self.record();
        self.inner.mkdir(path, mode)
    }

    fn rmdir(&self, path: &Path) -> BackendResult<()> {
        self.record();
        self.inner.rmdir(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> BackendResult<()> {
        self.record();
        let _ = (path, data);
        Err(BackendError::NotSupported("write_file"))
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn local_directory_lists_and_reports_writable_file() {
    let router = router();
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("foo.txt"), b"hello").unwrap();
    mount(&router, &["/c1"], Arc::new(LocalBackend::new(dir.path())));

    let entries = router.readdir_path(Path::new("/c1")).unwrap();
    assert_eq!(names(&entries), vec![".", "..", "foo.txt"]);

    let attr = router.getattr_path(Path::new("/c1/foo.txt")).unwrap();
    assert!(attr.is_file());
    assert_eq!(attr.size, 5);
    assert_ne!(attr.perm() & 0o200, 0);

    assert_eq!(router.read_file(Path::new("/c1/foo.txt")).unwrap(), b"hello");
}

#[test]
fn local_symlink_is_unlinked_without_touching_its_target() {
    let router = router();
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("target.txt"), b"kept").unwrap();
    std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();
    mount(&router, &["/c1"], Arc::new(LocalBackend::new(dir.path())));

    assert!(router.getattr_path(Path::new("/c1/link")).unwrap().is_symlink());
    router.unlink_path(Path::new("/c1/link")).unwrap();

    assert!(std::fs::symlink_metadata(dir.path().join("link")).is_err());
    assert_eq!(router.read_file(Path::new("/c1/target.txt")).unwrap(), b"kept");
}

#[test]
fn colliding_names_across_mounts_are_suffixed_and_routable() {
    let router = router();
    let b = Recording::new({
        let backend = MemoryBackend::read_only();
        backend.insert_file("x", "from b");
        backend
    });
    let c = Arc::new(memory(&[("x", "from c")]));

    let ident_b = mount(&router, &["/c1/nested"], b.clone());
    let ident_c = mount(&router, &["/c1/nested2", "/c1/nested"], c);
    assert!(ident_b < ident_c);

    let entries = router.readdir_path(Path::new("/c1/nested")).unwrap();
    assert_eq!(names(&entries), vec![".", "..", "x.wl.1", "x.wl.2"]);

    assert_eq!(router.read_file(Path::new("/c1/nested/x.wl.1")).unwrap(), b"from b");
    assert_eq!(router.read_file(Path::new("/c1/nested/x.wl.2")).unwrap(), b"from c");

    // The lower suffix lands on read-only B, the higher one on C.
    let err = router
        .write_file(Path::new("/c1/nested/x.wl.1"), b"clobber")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(b.mutations(), 0);
    router
        .write_file(Path::new("/c1/nested/x.wl.2"), b"updated")
        .unwrap();
    assert_eq!(router.read_file(Path::new("/c1/nested2/x")).unwrap(), b"updated");

    // The alias is a plain view of C.
    let entries = router.readdir_path(Path::new("/c1/nested2")).unwrap();
    assert_eq!(names(&entries), vec![".", "..", "x"]);

    // /c1 itself only exists because of the mounts below it.
    let entries = router.readdir_path(Path::new("/c1")).unwrap();
    assert_eq!(names(&entries), vec![".", "..", "nested", "nested2"]);
    assert!(router.getattr_path(Path::new("/c1")).unwrap().is_dir());
}

#[test]
fn remount_replaces_occupied_main_path() {
    let router = router();
    let table = router.table();
    let a = mount(&router, &["/c1"], Arc::new(memory(&[("a.txt", "a")])));

    let err = table
        .mount(vec!["/c1".into()], Arc::new(memory(&[("d.txt", "d")])), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyMounted);
    assert_eq!(table.lookup_by_path(Path::new("/c1")), Some(a));

    let d = table
        .mount(vec!["/c1".into()], Arc::new(memory(&[("d.txt", "d")])), true)
        .unwrap();
    assert!(d > a);
    assert!(table.lookup_by_ident(a).is_none());
    assert_eq!(table.lookup_by_path(Path::new("/c1")), Some(d));
    assert_eq!(table.resolver().resolve(Path::new("/c1/a.txt")).unwrap().0, d);

    let entries = router.readdir_path(Path::new("/c1")).unwrap();
    assert_eq!(names(&entries), vec![".", "..", "d.txt"]);
}

#[test]
fn read_only_mutations_never_reach_the_backend() {
    let router = router();
    let b = Recording::new({
        let backend = MemoryBackend::read_only();
        backend.insert_file("x", "data");
        backend.insert_dir("sub");
        backend
    });
    mount(&router, &["/c1/nested"], b.clone());

    let denied = |result: Result<(), strata_kernel::FsError>| {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::PermissionDenied);
    };
    let x = Path::new("/c1/nested/x");
    denied(router.open_path(x, OpenFlags::write()).map(drop));
    denied(router.write_file(x, b"new"));
    denied(router.truncate_path(x, 0));
    denied(router.unlink_path(x));
    denied(
        router
            .create_path(Path::new("/c1/nested/y"), OpenFlags::create(), 0o644)
            .map(drop),
    );
    denied(router.mkdir_path(Path::new("/c1/nested/d"), 0o755).map(drop));
    denied(router.rmdir_path(Path::new("/c1/nested/sub")));

    // A read handle cannot be used to write either.
    let fh = router.open_path(x, OpenFlags::read()).unwrap();
    denied(router.write(fh, b"new", 0).map(drop));
    router.release(fh).unwrap();

    assert_eq!(b.mutations(), 0);
    assert_eq!(router.read_file(x).unwrap(), b"data");

    let attr = router.getattr_path(x).unwrap();
    assert_eq!(attr.perm() & 0o222, 0);
}

#[test]
fn lookups_are_released_by_cumulative_forget() {
    let router = router();
    mount(&router, &["/c1"], Arc::new(memory(&[("f", "")])));

    let dir = router.lookup(ROOT_INODE, "c1").unwrap().inode;
    let first = router.lookup(dir, "f").unwrap();
    let second = router.lookup(dir, "f").unwrap();
    assert_eq!(first.inode, second.inode);
    assert!(first.attr.is_file());

    assert!(!router.forget(first.inode, 1).unwrap());
    assert_eq!(router.inodes().path_of(first.inode).unwrap(), PathBuf::from("/c1/f"));
    assert!(router.forget(first.inode, 1).unwrap());
    assert_eq!(
        router.getattr(first.inode).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    // Over-forgetting a live inode is an invariant violation.
    let again = router.lookup(dir, "f").unwrap().inode;
    assert_eq!(
        router.forget(again, 2).unwrap_err().kind(),
        ErrorKind::ProtocolInvariantViolation
    );
}

#[test]
fn unmount_of_unknown_ident_leaves_table_unchanged() {
    let router = router();
    let table = router.table();
    mount(&router, &["/c1", "/alias"], Arc::new(memory(&[])));
    let before = table.paths();

    let err = table.unmount(MountId(99)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(table.paths(), before);
    assert_eq!(table.len(), 1);
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn longest_prefix_resolution_is_deterministic() {
    let router = router();
    let outer = mount(&router, &["/a"], Arc::new(memory(&[])));
    let inner = mount(&router, &["/a/b"], Arc::new(memory(&[])));
    let resolver = router.table().resolver();

    for (path, ident, relative) in [
        ("/a", outer, ""),
        ("/a/bb/c", outer, "bb/c"),
        ("/a/b", inner, ""),
        ("/a/b/c/d", inner, "c/d"),
    ] {
        assert_eq!(
            resolver.resolve(Path::new(path)).unwrap(),
            (ident, PathBuf::from(relative)),
            "{path}"
        );
    }
}

#[test]
fn merged_listing_is_idempotent() {
    let router = router();
    mount(&router, &["/m"], Arc::new(memory(&[("x", "1"), ("y", "1")])));
    mount(&router, &["/m2", "/m"], Arc::new(memory(&[("x", "2")])));
    mount(&router, &["/m/x"], Arc::new(memory(&[])));

    let first = router.readdir_path(Path::new("/m")).unwrap();
    let second = router.readdir_path(Path::new("/m")).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        names(&first),
        vec![".", "..", "x.wl.1", "x.wl.2", "x.wl.3", "y"]
    );
}

#[test]
fn mount_then_unmount_restores_observable_state() {
    let router = router();
    let table = router.table();
    mount(&router, &["/keep"], Arc::new(memory(&[])));
    let paths_before = table.paths();
    let root_before = router.readdir_path(Path::new("/")).unwrap();

    let ident = mount(&router, &["/keep/inner", "/other"], Arc::new(memory(&[])));
    assert_ne!(table.paths(), paths_before);
    table.unmount(ident).unwrap();

    assert_eq!(table.paths(), paths_before);
    assert_eq!(router.readdir_path(Path::new("/")).unwrap(), root_before);
    assert_eq!(
        router.getattr_path(Path::new("/other")).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn controller_drives_mounts_from_storage_params() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("album")).unwrap();
    std::fs::write(dir.path().join("album/a.jpg"), b"jpg").unwrap();

    let router = Arc::new(Router::new(Arc::new(MountTable::new())));
    let controller = MountController::new(BackendRegistry::with_builtin(), router.clone());

    let request = MountRequest {
        paths: vec!["/photos".into()],
        storage_params: StorageParams::new("local")
            .with_param("path", dir.path().display().to_string())
            .with_param("split_children", true),
        read_only: true,
        remount: false,
    };
    let ControlResponse::Mounted { results } = controller.handle(ControlCommand::Mount {
        requests: vec![request],
    }) else {
        panic!("expected mounted response");
    };
    let [MountOutcome::Ok(ident)] = results.as_slice() else {
        panic!("mount failed: {results:?}");
    };

    assert_eq!(
        router.read_file(Path::new("/photos/album/a.jpg")).unwrap(),
        b"jpg"
    );
    let err = router
        .write_file(Path::new("/photos/album/b.jpg"), b"x")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let ControlResponse::Children(children) =
        controller.handle(ControlCommand::Children { ident: *ident })
    else {
        panic!("expected children");
    };
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].paths, vec![PathBuf::from("/photos/album")]);

    let ControlResponse::Inodes(inodes) = controller.handle(ControlCommand::Inodes) else {
        panic!("expected inodes");
    };
    assert!(inodes.contains_key(&ROOT_INODE));
}
