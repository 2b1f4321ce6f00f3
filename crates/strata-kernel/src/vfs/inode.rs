//! Inode ↔ path bookkeeping.
//!
//! The filesystem protocol refers to previously looked-up paths by inode
//! number and releases them with explicit `forget` counts. Each inode maps to
//! exactly one logical path and each path to at most one inode; both
//! directions are dropped together when the lookup count reaches zero.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{error, trace};

use super::error::{FsError, FsResult};
use super::path::normalize;

/// Protocol inode number.
pub type Inode = u64;

/// Well-known inode of `/`. Always present, never forgotten.
pub const ROOT_INODE: Inode = 1;

#[derive(Debug)]
struct InodeRecord {
    path: PathBuf,
    lookups: u64,
}

#[derive(Debug)]
struct InodeState {
    by_inode: HashMap<Inode, InodeRecord>,
    by_path: HashMap<PathBuf, Inode>,
    next: Inode,
}

impl InodeState {
    fn violation(&self, msg: String) -> FsError {
        error!(violation = %msg, "inode map invariant violated");
        FsError::invariant(msg)
    }

    /// Drop the path → inode direction, but only if it still points here.
    fn unbind_path(&mut self, inode: Inode, path: &Path) {
        if self.by_path.get(path) == Some(&inode) {
            self.by_path.remove(path);
        }
    }
}

/// One entry of the diagnostic inode dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeSnapshot {
    pub path: String,
    pub lookups: u64,
}

/// Bidirectional inode map with lookup reference counts.
#[derive(Debug)]
pub struct InodeManager {
    state: Mutex<InodeState>,
}

impl Default for InodeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeManager {
    /// Create a manager holding only the root inode.
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut by_inode = HashMap::new();
        by_inode.insert(
            ROOT_INODE,
            InodeRecord {
                path: root.clone(),
                lookups: 1,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(root, ROOT_INODE);
        Self {
            state: Mutex::new(InodeState {
                by_inode,
                by_path,
                next: ROOT_INODE + 1,
            }),
        }
    }

    /// Record one more lookup of `inode` at `path`.
    ///
    /// A known inode must carry the same path; a fresh inode must not claim a
    /// path already bound to another inode.
    pub fn add_path(&self, inode: Inode, path: &Path) -> FsResult<()> {
        let path = normalize(path);
        let mut state = self.state.lock();

        if let Some(record) = state.by_inode.get_mut(&inode) {
            if record.path != path {
                let msg = format!(
                    "inode {inode} is bound to {} but was looked up as {}",
                    record.path.display(),
                    path.display()
                );
                return Err(state.violation(msg));
            }
            record.lookups += 1;
            return Ok(());
        }

        if let Some(other) = state.by_path.get(&path).copied() {
            let msg = format!(
                "{} is already bound to inode {other}, cannot bind inode {inode}",
                path.display()
            );
            return Err(state.violation(msg));
        }

        trace!(inode, path = %path.display(), "inode added");
        state.by_path.insert(path.clone(), inode);
        state.by_inode.insert(inode, InodeRecord { path, lookups: 1 });
        state.next = state.next.max(inode + 1);
        Ok(())
    }

    /// Drop `n` lookups of `inode`, which must be bound to `path`. Returns
    /// true when the entry was erased.
    pub fn remove_path(&self, inode: Inode, path: &Path, n: u64) -> FsResult<bool> {
        if inode == ROOT_INODE {
            return Ok(false);
        }
        let path = normalize(path);
        let mut state = self.state.lock();

        let Some(record) = state.by_inode.get(&inode) else {
            let msg = format!("remove_path on unknown inode {inode}");
            return Err(state.violation(msg));
        };
        if record.path != path {
            let msg = format!(
                "inode {inode} is bound to {}, not {}",
                record.path.display(),
                path.display()
            );
            return Err(state.violation(msg));
        }
        if n > record.lookups {
            let msg = format!(
                "inode {inode} forgotten {n} times with only {} lookups outstanding",
                record.lookups
            );
            return Err(state.violation(msg));
        }

        let remaining = record.lookups - n;
        if remaining > 0 {
            if let Some(record) = state.by_inode.get_mut(&inode) {
                record.lookups = remaining;
            }
            return Ok(false);
        }

        trace!(inode, path = %path.display(), "inode erased");
        state.by_inode.remove(&inode);
        state.unbind_path(inode, &path);
        Ok(true)
    }

    /// Protocol `forget`: drop `n` lookups of `inode` wherever it now lives.
    pub fn forget(&self, inode: Inode, n: u64) -> FsResult<bool> {
        if inode == ROOT_INODE {
            return Ok(false);
        }
        let path = self.path_of(inode)?;
        self.remove_path(inode, &path, n)
    }

    /// Look up `path`, reusing its inode or allocating a new one, and count
    /// the lookup.
    pub fn lookup(&self, path: &Path) -> Inode {
        let path = normalize(path);
        let mut state = self.state.lock();

        if let Some(inode) = state.by_path.get(&path).copied() {
            if let Some(record) = state.by_inode.get_mut(&inode) {
                if inode != ROOT_INODE {
                    record.lookups += 1;
                }
                return inode;
            }
        }

        let inode = state.next;
        state.next += 1;
        trace!(inode, path = %path.display(), "inode allocated");
        state.by_path.insert(path.clone(), inode);
        state.by_inode.insert(inode, InodeRecord { path, lookups: 1 });
        inode
    }

    /// Logical path of an inode.
    pub fn path_of(&self, inode: Inode) -> FsResult<PathBuf> {
        self.state
            .lock()
            .by_inode
            .get(&inode)
            .map(|record| record.path.clone())
            .ok_or_else(|| FsError::not_found(format!("inode {inode}")))
    }

    /// Inode currently bound to a path, if any.
    pub fn inode_of(&self, path: &Path) -> Option<Inode> {
        self.state.lock().by_path.get(&normalize(path)).copied()
    }

    /// Outstanding lookups of an inode.
    pub fn lookup_count(&self, inode: Inode) -> Option<u64> {
        self.state.lock().by_inode.get(&inode).map(|r| r.lookups)
    }

    /// Free `path` for reuse after unlink or rmdir. The inode itself lives on
    /// until its lookups are forgotten.
    pub fn detach(&self, path: &Path) {
        let path = normalize(path);
        let mut state = self.state.lock();
        if let Some(inode) = state.by_path.get(&path).copied() {
            if inode != ROOT_INODE {
                state.by_path.remove(&path);
            }
        }
    }

    /// Move every inode at or below `from` to the same place under `to`.
    pub fn rename_path(&self, from: &Path, to: &Path) {
        let from = normalize(from);
        let to = normalize(to);
        let mut state = self.state.lock();

        // Whatever the rename replaced is no longer reachable by path.
        let replaced: Vec<PathBuf> = state
            .by_path
            .keys()
            .filter(|p| p.starts_with(&to))
            .cloned()
            .collect();
        for path in replaced {
            state.by_path.remove(&path);
        }

        let moved: Vec<(PathBuf, Inode)> = state
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(&from))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (old, inode) in moved {
            let new = match old.strip_prefix(&from) {
                Ok(rest) if !rest.as_os_str().is_empty() => to.join(rest),
                _ => to.clone(),
            };
            state.by_path.remove(&old);
            state.by_path.insert(new.clone(), inode);
            if let Some(record) = state.by_inode.get_mut(&inode) {
                record.path = new;
            }
        }
    }

    /// Number of live inodes, root included.
    pub fn len(&self) -> usize {
        self.state.lock().by_inode.len()
    }

    /// Always false: the root inode cannot be forgotten.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Inode → path and lookup count, for diagnostics.
    pub fn snapshot(&self) -> BTreeMap<Inode, InodeSnapshot> {
        self.state
            .lock()
            .by_inode
            .iter()
            .map(|(inode, record)| {
                (
                    *inode,
                    InodeSnapshot {
                        path: record.path.display().to_string(),
                        lookups: record.lookups,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ErrorKind;

    #[test]
    fn test_root_preregistered_and_unforgettable() {
        let inodes = InodeManager::new();
        assert_eq!(inodes.path_of(ROOT_INODE).unwrap(), PathBuf::from("/"));
        assert!(!inodes.forget(ROOT_INODE, 100).unwrap());
        assert_eq!(inodes.inode_of(Path::new("/")), Some(ROOT_INODE));
        assert_eq!(inodes.lookup(Path::new("/")), ROOT_INODE);
    }

    #[test]
    fn test_lookup_reuses_and_counts() {
        let inodes = InodeManager::new();
        let a = inodes.lookup(Path::new("/c1/foo.txt"));
        let b = inodes.lookup(Path::new("/c1/foo.txt"));
        assert_eq!(a, b);
        assert_eq!(inodes.lookup_count(a), Some(2));

        assert!(!inodes.forget(a, 1).unwrap());
        assert_eq!(inodes.path_of(a).unwrap(), PathBuf::from("/c1/foo.txt"));
        assert!(inodes.forget(a, 1).unwrap());
        assert_eq!(inodes.path_of(a).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(inodes.inode_of(Path::new("/c1/foo.txt")), None);
    }

    #[test]
    fn test_refcount_tracks_net_lookups() {
        let inodes = InodeManager::new();
        let path = Path::new("/m/x");
        let ops: &[(bool, u64)] = &[
            (true, 1),
            (true, 1),
            (true, 1),
            (false, 2),
            (true, 1),
            (false, 1),
        ];
        let mut net = 0u64;
        for &(add, n) in ops {
            if add {
                inodes.add_path(42, path).unwrap();
                net += n;
            } else {
                let erased = inodes.remove_path(42, path, n).unwrap();
                net -= n;
                assert_eq!(erased, net == 0);
            }
            assert_eq!(inodes.path_of(42).is_ok(), net > 0);
        }
        assert!(inodes.remove_path(42, path, 1).unwrap());
        assert!(inodes.path_of(42).is_err());
    }

    #[test]
    fn test_mismatched_path_is_invariant_violation() {
        let inodes = InodeManager::new();
        inodes.add_path(7, Path::new("/a")).unwrap();
        let err = inodes.add_path(7, Path::new("/b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolInvariantViolation);

        let err = inodes.add_path(8, Path::new("/a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolInvariantViolation);

        let err = inodes.remove_path(7, Path::new("/b"), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolInvariantViolation);
        assert_eq!(inodes.lookup_count(7), Some(1));
    }

    #[test]
    fn test_over_decrement_rejected() {
        let inodes = InodeManager::new();
        inodes.add_path(9, Path::new("/a")).unwrap();
        let err = inodes.remove_path(9, Path::new("/a"), 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolInvariantViolation);
        assert_eq!(inodes.lookup_count(9), Some(1));
    }

    #[test]
    fn test_allocation_skips_explicit_inodes() {
        let inodes = InodeManager::new();
        inodes.add_path(50, Path::new("/fixed")).unwrap();
        let fresh = inodes.lookup(Path::new("/other"));
        assert!(fresh > 50);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let inodes = InodeManager::new();
        let dir = inodes.lookup(Path::new("/m/old"));
        let file = inodes.lookup(Path::new("/m/old/f"));
        let victim = inodes.lookup(Path::new("/m/new"));

        inodes.rename_path(Path::new("/m/old"), Path::new("/m/new"));
        assert_eq!(inodes.inode_of(Path::new("/m/new")), Some(dir));
        assert_eq!(inodes.path_of(file).unwrap(), PathBuf::from("/m/new/f"));
        assert_eq!(inodes.inode_of(Path::new("/m/old")), None);

        // Forgetting the replaced inode must not unbind the renamed one.
        assert!(inodes.forget(victim, 1).unwrap());
        assert_eq!(inodes.inode_of(Path::new("/m/new")), Some(dir));
    }

    #[test]
    fn test_detach_frees_path() {
        let inodes = InodeManager::new();
        let old = inodes.lookup(Path::new("/m/f"));
        inodes.detach(Path::new("/m/f"));
        let new = inodes.lookup(Path::new("/m/f"));
        assert_ne!(old, new);
        assert_eq!(inodes.path_of(old).unwrap(), PathBuf::from("/m/f"));
        assert!(inodes.forget(old, 1).unwrap());
        assert_eq!(inodes.inode_of(Path::new("/m/f")), Some(new));
    }

    #[test]
    fn test_snapshot() {
        let inodes = InodeManager::new();
        let a = inodes.lookup(Path::new("/a"));
        let snap = inodes.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[&a].path, "/a");
        assert_eq!(snap[&a].lookups, 1);
        assert_eq!(inodes.len(), 2);
    }
}
