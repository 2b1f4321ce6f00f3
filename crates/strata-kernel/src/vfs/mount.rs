//! Mount table.
//!
//! Registry of mount records: one backend instance attached under one or
//! more logical paths, keyed by a monotonically assigned ident. The first
//! path of a record is its main path; two live records never share a main
//! path unless the old one is replaced through remount.
//!
//! All bookkeeping sits behind one short-lived lock. Backend `mount()` and
//! `unmount()` run outside it, so a slow backend never stalls routing.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::conflict::ConflictResolver;
use super::error::{FsError, FsResult};
use super::ops::{StorageBackend, SubcontainerDescriptor, WatchEvent, WatchGuard, WatchSink};
use super::path::normalize;
use super::types::MountId;

/// Lifecycle of a mount record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MountState {
    /// `backend.mount()` in flight; not yet routable.
    Mounting,
    /// Routable.
    Mounted,
    /// `backend.unmount()` in flight; still routable until it returns.
    Unmounting,
}

struct MountRecord {
    paths: Vec<PathBuf>,
    backend: Arc<dyn StorageBackend>,
    state: MountState,
}

impl MountRecord {
    fn main_path(&self) -> &Path {
        &self.paths[0]
    }
}

/// Information about a mount point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub ident: MountId,
    /// Logical paths; the first is the main path.
    pub paths: Vec<String>,
    pub backend_type: String,
    pub read_only: bool,
    pub state: MountState,
}

#[derive(Default)]
struct TableState {
    records: BTreeMap<MountId, MountRecord>,
    main_paths: HashMap<PathBuf, MountId>,
    /// Main paths whose `backend.mount()` is in flight.
    pending: HashSet<PathBuf>,
    next_ident: u64,
    resolver: Arc<ConflictResolver>,
}

/// Registry of mounted backends.
pub struct MountTable {
    state: Mutex<TableState>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MountTable")
            .field("mounts", &state.records.len())
            .field("pending", &state.pending.len())
            .field("next_ident", &state.next_ident)
            .finish()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    /// Create a new empty mount table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                next_ident: 1,
                ..Default::default()
            }),
        }
    }

    /// Attach `backend` under `paths`, returning its new ident.
    ///
    /// Fails with `AlreadyMounted` if the main path carries a live record and
    /// `remount` is false. With `remount`, the old record is unmounted first.
    /// A failing `backend.mount()` leaves no record behind.
    pub fn mount(
        &self,
        paths: Vec<PathBuf>,
        backend: Arc<dyn StorageBackend>,
        remount: bool,
    ) -> FsResult<MountId> {
        let mut normalized: Vec<PathBuf> = Vec::with_capacity(paths.len());
        for path in &paths {
            let path = normalize(path);
            if !normalized.contains(&path) {
                normalized.push(path);
            }
        }
        let Some(main) = normalized.first().cloned() else {
            return Err(FsError::invalid_argument("mount requires at least one path"));
        };

        let previous = {
            let mut state = self.state.lock();
            if state.pending.contains(&main) {
                return Err(FsError::Busy(format!("{} is being mounted", main.display())));
            }
            let previous = state.main_paths.get(&main).copied();
            if let Some(ident) = previous {
                if !remount {
                    return Err(FsError::AlreadyMounted {
                        path: main.display().to_string(),
                        ident,
                    });
                }
            }
            state.pending.insert(main.clone());
            previous
        };

        let result = self.attach(normalized, backend, previous);
        self.state.lock().pending.remove(&main);
        result
    }

    fn attach(
        &self,
        paths: Vec<PathBuf>,
        backend: Arc<dyn StorageBackend>,
        previous: Option<MountId>,
    ) -> FsResult<MountId> {
        if let Some(old) = previous {
            info!(ident = %old, path = %paths[0].display(), "remount: detaching previous mount");
            self.unmount(old)?;
        }

        backend.mount().map_err(|e| {
            warn!(path = %paths[0].display(), error = %e, "backend mount failed");
            FsError::io(format!("mount of {} failed: {e}", paths[0].display()))
        })?;

        let mut state = self.state.lock();
        let ident = MountId(state.next_ident);
        state.next_ident += 1;

        let resolver = Arc::make_mut(&mut state.resolver);
        for path in &paths {
            resolver.add(ident, path, backend.clone());
        }
        state.main_paths.insert(paths[0].clone(), ident);
        info!(
            %ident,
            path = %paths[0].display(),
            backend = backend.backend_type(),
            read_only = backend.read_only(),
            "mounted"
        );
        state.records.insert(
            ident,
            MountRecord {
                paths,
                backend,
                state: MountState::Mounted,
            },
        );
        Ok(ident)
    }

    /// Detach a mount. The record stays routable until `backend.unmount()`
    /// returns; a failing unmount leaves it mounted.
    pub fn unmount(&self, ident: MountId) -> FsResult<()> {
        let backend = {
            let mut state = self.state.lock();
            let record = state
                .records
                .get_mut(&ident)
                .ok_or_else(|| FsError::not_found(format!("mount ident {ident}")))?;
            if record.state == MountState::Unmounting {
                return Err(FsError::Busy(format!("mount {ident} is being unmounted")));
            }
            record.state = MountState::Unmounting;
            record.backend.clone()
        };

        if let Err(e) = backend.unmount() {
            warn!(%ident, error = %e, "backend unmount failed");
            if let Some(record) = self.state.lock().records.get_mut(&ident) {
                record.state = MountState::Mounted;
            }
            return Err(FsError::io(format!("unmount of {ident} failed: {e}")));
        }

        let mut state = self.state.lock();
        if let Some(record) = state.records.remove(&ident) {
            let main = record.main_path().to_path_buf();
            if state.main_paths.get(&main) == Some(&ident) {
                state.main_paths.remove(&main);
            }
            info!(%ident, path = %main.display(), "unmounted");
        }
        Arc::make_mut(&mut state.resolver).remove(ident);
        Ok(())
    }

    /// Unmount everything, newest first. Returns the failures.
    pub fn unmount_all(&self) -> Vec<(MountId, FsError)> {
        let idents: Vec<MountId> = self.state.lock().records.keys().rev().copied().collect();
        idents
            .into_iter()
            .filter_map(|ident| self.unmount(ident).err().map(|e| (ident, e)))
            .collect()
    }

    /// Ident of the live record whose main path is exactly `path`.
    pub fn lookup_by_path(&self, path: &Path) -> Option<MountId> {
        self.state.lock().main_paths.get(&normalize(path)).copied()
    }

    /// Description of one record.
    pub fn lookup_by_ident(&self, ident: MountId) -> Option<MountInfo> {
        let state = self.state.lock();
        state.records.get(&ident).map(|record| Self::info(ident, record))
    }

    /// Lifecycle state of whatever is mounted at main path `path`.
    pub fn state_of(&self, path: &Path) -> Option<MountState> {
        let path = normalize(path);
        let state = self.state.lock();
        if state.pending.contains(&path) {
            return Some(MountState::Mounting);
        }
        let ident = state.main_paths.get(&path)?;
        state.records.get(ident).map(|record| record.state)
    }

    /// Backend of a mount.
    pub fn backend(&self, ident: MountId) -> Option<Arc<dyn StorageBackend>> {
        self.state.lock().records.get(&ident).map(|r| r.backend.clone())
    }

    /// Current resolver snapshot. Later table changes do not affect it.
    pub fn resolver(&self) -> Arc<ConflictResolver> {
        self.state.lock().resolver.clone()
    }

    /// All records, ordered by ident.
    pub fn list_mounts(&self) -> Vec<MountInfo> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .map(|(ident, record)| Self::info(*ident, record))
            .collect()
    }

    /// Path → idents mapping, for diagnostics.
    pub fn paths(&self) -> BTreeMap<String, Vec<MountId>> {
        self.resolver().path_map()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// True when nothing is mounted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sub-containers a mount exposes, with paths rewritten to logical paths
    /// under the mount's main path.
    pub fn children(&self, ident: MountId) -> FsResult<Vec<SubcontainerDescriptor>> {
        let (main, backend) = self.main_and_backend(ident)?;
        if !backend.can_have_children() {
            return Err(FsError::not_supported(format!(
                "{} backend has no children",
                backend.backend_type()
            )));
        }
        let children = backend
            .children()?
            .map(|(_, mut descriptor)| {
                for path in &mut descriptor.paths {
                    *path = normalize(&main.join(&*path));
                }
                descriptor
            })
            .collect::<Vec<_>>();
        debug!(%ident, count = children.len(), "enumerated children");
        Ok(children)
    }

    /// Watch a mount for changes. Event paths arrive as logical paths.
    pub fn watch(&self, ident: MountId, sink: WatchSink) -> FsResult<WatchGuard> {
        let (main, backend) = self.main_and_backend(ident)?;
        let rewrite: WatchSink = Arc::new(move |event: WatchEvent| {
            sink(WatchEvent {
                kind: event.kind,
                path: normalize(&main.join(&event.path)),
            })
        });
        Ok(backend.watch(rewrite)?)
    }

    fn main_and_backend(&self, ident: MountId) -> FsResult<(PathBuf, Arc<dyn StorageBackend>)> {
        let state = self.state.lock();
        let record = state
            .records
            .get(&ident)
            .ok_or_else(|| FsError::not_found(format!("mount ident {ident}")))?;
        Ok((record.main_path().to_path_buf(), record.backend.clone()))
    }

    fn info(ident: MountId, record: &MountRecord) -> MountInfo {
        MountInfo {
            ident,
            paths: record.paths.iter().map(|p| p.display().to_string()).collect(),
            backend_type: record.backend.backend_type().to_string(),
            read_only: record.backend.read_only(),
            state: record.state,
        }
    }
}
