//! Path resolution across overlapping mounts.
//!
//! The resolver is a snapshot of the mount table's path associations. It
//! answers two questions:
//!
//! - which backend owns a path for file-level operations (longest mounted
//!   prefix, newest ident on ties), and
//! - what a directory looks like once every contributing backend and every
//!   nested mount point has been merged into one listing.
//!
//! Colliding names in a merged listing are renamed `name.wl.<k>`, with `k`
//! the 1-based position of the owner in ascending ident order. Paths using
//! those names route back to the owner that produced them.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{trace, warn};

use super::error::{FsError, FsResult};
use super::ops::StorageBackend;
use super::path::{child_component, components, depth, normalize, relative_to};
use super::types::{DirEntry, FileType, MountId};

/// Marker placed between a conflicting name and its owner index.
pub const CONFLICT_MARKER: &str = ".wl.";

/// Split `name.wl.<k>` into `("name", k)`. `k` must be a positive integer.
pub fn split_conflict_suffix(name: &str) -> Option<(&str, usize)> {
    let (base, index) = name.rsplit_once(CONFLICT_MARKER)?;
    if base.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let k: usize = index.parse().ok()?;
    (k >= 1).then_some((base, k))
}

/// Render the suffixed form of a conflicting name.
pub fn conflict_name(base: &str, k: usize) -> String {
    format!("{base}{CONFLICT_MARKER}{k}")
}

/// Who contributes an entry to a merged directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimOwner {
    /// The entry came from the backend's own `readdir`; `prefix` is the
    /// logical path that backend is mounted at.
    Backend { prefix: PathBuf },
    /// The entry is a mount point, or an intermediate directory leading to
    /// deeper mount points.
    Nested,
}

/// One contribution to a name in a merged directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub ident: MountId,
    pub owner: ClaimOwner,
    pub kind: FileType,
}

impl Claim {
    fn sort_key(&self) -> (MountId, u8) {
        let rank = match self.owner {
            ClaimOwner::Backend { .. } => 0,
            ClaimOwner::Nested => 1,
        };
        (self.ident, rank)
    }
}

/// A backend taking part in a directory merge.
#[derive(Clone)]
struct Contributor {
    ident: MountId,
    prefix: PathBuf,
    backend: Arc<dyn StorageBackend>,
}

/// Final target of a routed path.
#[derive(Clone)]
pub enum Target {
    /// Served by a backend at `relative` (relative to its mount prefix).
    Backend {
        ident: MountId,
        prefix: PathBuf,
        backend: Arc<dyn StorageBackend>,
        relative: PathBuf,
    },
    /// A directory existing only because something is mounted below it.
    Synthetic,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Backend {
                ident,
                prefix,
                relative,
                ..
            } => f
                .debug_struct("Backend")
                .field("ident", ident)
                .field("prefix", prefix)
                .field("relative", relative)
                .finish_non_exhaustive(),
            Target::Synthetic => f.write_str("Synthetic"),
        }
    }
}

/// Result of routing a logical path.
///
/// `view` is the resolver the path was finally resolved in. It is narrower
/// than the original when a conflict-suffixed component selected one owner;
/// directory listings below that point must be computed against it.
#[derive(Debug, Clone)]
pub struct Resolution<'a> {
    pub view: Cow<'a, ConflictResolver>,
    /// The logical path with conflict suffixes stripped.
    pub path: PathBuf,
    pub target: Target,
}

impl Resolution<'_> {
    /// Owning mount, if a backend serves this path.
    pub fn ident(&self) -> Option<MountId> {
        match &self.target {
            Target::Backend { ident, .. } => Some(*ident),
            Target::Synthetic => None,
        }
    }

    /// Whether any mount lies strictly below the resolved path.
    pub fn has_mounts_below(&self) -> bool {
        self.view.has_mounts_below(&self.path)
    }
}

/// Snapshot of path → mount associations with the backends behind them.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    paths: BTreeMap<PathBuf, BTreeSet<MountId>>,
    backends: BTreeMap<MountId, Arc<dyn StorageBackend>>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `path` with a mount.
    pub fn add(&mut self, ident: MountId, path: &Path, backend: Arc<dyn StorageBackend>) {
        let path = normalize(path);
        trace!(%ident, path = %path.display(), "resolver add");
        self.paths.entry(path).or_default().insert(ident);
        self.backends.insert(ident, backend);
    }

    /// Drop every association of a mount. Returns false if it had none.
    pub fn remove(&mut self, ident: MountId) -> bool {
        let known = self.backends.remove(&ident).is_some();
        self.paths.retain(|_, idents| {
            idents.remove(&ident);
            !idents.is_empty()
        });
        known
    }

    /// True when nothing is mounted.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Backend of a mount, if registered.
    pub fn backend(&self, ident: MountId) -> Option<&Arc<dyn StorageBackend>> {
        self.backends.get(&ident)
    }

    /// Path → idents, for diagnostics.
    pub fn path_map(&self) -> BTreeMap<String, Vec<MountId>> {
        self.paths
            .iter()
            .map(|(path, idents)| (path.display().to_string(), idents.iter().copied().collect()))
            .collect()
    }

    /// Whether any mount lies strictly below `path`.
    pub fn has_mounts_below(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.paths
            .keys()
            .any(|mounted| mounted != &path && mounted.starts_with(&path))
    }

    /// Resolver holding only one mount at one prefix.
    fn only(&self, ident: MountId, prefix: &Path) -> ConflictResolver {
        let mut view = ConflictResolver::new();
        if let Some(backend) = self.backends.get(&ident) {
            view.add(ident, prefix, backend.clone());
        }
        view
    }

    /// Resolver holding only the mounts at or below `dir`.
    fn subtree(&self, dir: &Path) -> ConflictResolver {
        let mut view = ConflictResolver::new();
        for (path, idents) in &self.paths {
            if !path.starts_with(dir) {
                continue;
            }
            for ident in idents {
                if let Some(backend) = self.backends.get(ident) {
                    view.add(*ident, path, backend.clone());
                }
            }
        }
        view
    }

    /// Longest mounted prefix of `path` and the idents mounted there.
    fn longest_prefix(&self, path: &Path) -> Option<(&PathBuf, &BTreeSet<MountId>)> {
        self.paths
            .iter()
            .filter(|(mounted, _)| path.starts_with(mounted))
            .max_by_key(|(mounted, _)| depth(mounted))
    }

    fn contributor(&self, ident: MountId, prefix: &Path) -> Option<Contributor> {
        self.backends.get(&ident).map(|backend| Contributor {
            ident,
            prefix: prefix.to_path_buf(),
            backend: backend.clone(),
        })
    }

    /// Literal resolution without interpreting conflict suffixes.
    ///
    /// When several mounts share the longest prefix, the newest one that has
    /// the first component below that prefix wins; if none has it, the newest
    /// wins outright.
    fn resolve_literal(&self, path: &Path) -> FsResult<Target> {
        let Some((prefix, idents)) = self.longest_prefix(path) else {
            if path == Path::new("/") || self.has_mounts_below(path) {
                return Ok(Target::Synthetic);
            }
            return Err(FsError::not_found(path.display().to_string()));
        };

        let mut chosen = idents.iter().next_back().copied();
        if idents.len() > 1 && path != prefix.as_path() {
            if let Some(name) = child_component(prefix, path) {
                let probe = PathBuf::from(&name);
                chosen = idents
                    .iter()
                    .rev()
                    .find(|ident| {
                        self.backends
                            .get(*ident)
                            .is_some_and(|backend| backend.getattr(&probe).is_ok())
                    })
                    .copied()
                    .or(chosen);
            }
        }

        let ident = chosen.ok_or_else(|| FsError::invariant("empty ident set in resolver"))?;
        let backend = self
            .backends
            .get(&ident)
            .cloned()
            .ok_or_else(|| FsError::invariant(format!("no backend for mount {ident}")))?;
        Ok(Target::Backend {
            ident,
            prefix: prefix.clone(),
            backend,
            relative: relative_to(path, prefix),
        })
    }

    /// Backends whose own listing forms the base of a merged `dir`.
    ///
    /// Every mount exactly at `dir` contributes. Otherwise the single owner
    /// from literal resolution does.
    fn base_contributors(&self, dir: &Path) -> Vec<Contributor> {
        if let Some(idents) = self.paths.get(dir) {
            return idents
                .iter()
                .filter_map(|ident| self.contributor(*ident, dir))
                .collect();
        }
        match self.resolve_literal(dir) {
            Ok(Target::Backend { ident, prefix, .. }) => {
                self.contributor(ident, &prefix).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Every claim on every name in the merged listing of `dir`.
    pub fn claims(&self, dir: &Path) -> FsResult<BTreeMap<String, Vec<Claim>>> {
        let dir = normalize(dir);
        let mut claims: BTreeMap<String, Vec<Claim>> = BTreeMap::new();

        let base = self.base_contributors(&dir);
        let mut listed = false;
        let mut first_error = None;
        for contributor in &base {
            let relative = relative_to(&dir, &contributor.prefix);
            match contributor.backend.readdir(&relative) {
                Ok(entries) => {
                    listed = true;
                    for entry in entries {
                        claims.entry(entry.name).or_default().push(Claim {
                            ident: contributor.ident,
                            owner: ClaimOwner::Backend {
                                prefix: contributor.prefix.clone(),
                            },
                            kind: entry.kind,
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        ident = %contributor.ident,
                        dir = %dir.display(),
                        error = %e,
                        "readdir failed on contributing backend"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        // name -> (lowest ident mounted exactly at dir/name, lowest ident below)
        let mut nested: BTreeMap<String, (Option<MountId>, MountId)> = BTreeMap::new();
        let child_depth = depth(&dir) + 1;
        for (path, idents) in &self.paths {
            let Some(name) = child_component(&dir, path) else {
                continue;
            };
            let Some(lowest) = idents.iter().next().copied() else {
                continue;
            };
            let exact = (depth(path) == child_depth).then_some(lowest);
            nested
                .entry(name)
                .and_modify(|(e, l)| {
                    *e = (*e).or(exact);
                    *l = (*l).min(lowest);
                })
                .or_insert((exact, lowest));
        }

        if !listed && nested.is_empty() {
            if let Some(e) = first_error {
                return Err(e.into());
            }
            if base.is_empty() && dir != Path::new("/") {
                return Err(FsError::not_found(dir.display().to_string()));
            }
        }

        for (name, (exact, lowest)) in nested {
            claims.entry(name).or_default().push(Claim {
                ident: exact.unwrap_or(lowest),
                owner: ClaimOwner::Nested,
                kind: FileType::Directory,
            });
        }

        for owners in claims.values_mut() {
            owners.sort_by_key(Claim::sort_key);
        }
        Ok(claims)
    }

    /// Merged listing of `dir`, led by `.` and `..`.
    ///
    /// Names claimed once pass through; names claimed by two or more owners
    /// are all suffixed. Output is ordered by name then owner, so an unchanged
    /// mount set and unchanged content always list identically.
    pub fn readdir(&self, dir: &Path) -> FsResult<Vec<DirEntry>> {
        let claims = self.claims(dir)?;
        let mut entries = Vec::with_capacity(claims.len() + 2);
        entries.push(DirEntry::directory("."));
        entries.push(DirEntry::directory(".."));
        for (name, owners) in claims {
            if let [single] = owners.as_slice() {
                entries.push(DirEntry::new(name, single.kind));
            } else {
                for (k, claim) in owners.iter().enumerate() {
                    entries.push(DirEntry::new(conflict_name(&name, k + 1), claim.kind));
                }
            }
        }
        Ok(entries)
    }

    /// Route a logical path, following conflict-suffixed components to the
    /// owner that produced them.
    pub fn route(&self, path: &Path) -> FsResult<Resolution<'_>> {
        let path = normalize(path);
        let mut view: Cow<'_, ConflictResolver> = Cow::Borrowed(self);
        let mut logical = PathBuf::from("/");

        for component in components(&path) {
            if let Some((base, k)) = split_conflict_suffix(&component) {
                // A suffix only means something while the base name conflicts.
                let owners = view
                    .claims(&logical)
                    .ok()
                    .and_then(|mut claims| claims.remove(base))
                    .filter(|owners| owners.len() >= 2);
                if let Some(owners) = owners {
                    let claim = owners
                        .get(k - 1)
                        .ok_or_else(|| FsError::not_found(path.display().to_string()))?;
                    let child = logical.join(base);
                    let narrowed = match &claim.owner {
                        ClaimOwner::Backend { prefix } => view.only(claim.ident, prefix),
                        ClaimOwner::Nested => view.subtree(&child),
                    };
                    trace!(
                        path = %path.display(),
                        ident = %claim.ident,
                        "conflict suffix selected owner"
                    );
                    view = Cow::Owned(narrowed);
                    logical = child;
                    continue;
                }
            }
            logical.push(&component);
        }

        let target = view.resolve_literal(&logical)?;
        Ok(Resolution {
            view,
            path: logical,
            target,
        })
    }

    /// Owning mount and backend-relative path for file-level operations.
    ///
    /// Fails with `NotFound` when nothing is mounted at or above `path`, and
    /// with `PermissionDenied` when `path` only exists as a directory leading
    /// to deeper mounts.
    pub fn resolve(&self, path: &Path) -> FsResult<(MountId, PathBuf)> {
        let resolution = self.route(path)?;
        match resolution.target {
            Target::Backend {
                ident, relative, ..
            } => Ok((ident, relative)),
            Target::Synthetic => Err(FsError::permission_denied(format!(
                "{} is a synthesized directory",
                resolution.path.display()
            ))),
        }
    }
}
