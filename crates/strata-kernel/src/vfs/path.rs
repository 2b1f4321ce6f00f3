//! Logical path helpers.
//!
//! Every path inside the mount table and resolver is absolute, free of `.`
//! and `..`, and has no trailing slash (except `/` itself).

use std::path::{Component, Path, PathBuf};

/// Normalize a logical path. `..` never climbs above `/`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(s) => result.push(s),
            Component::ParentDir => {
                result.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    result
}

/// Path components as owned strings, root excluded.
pub fn components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Number of normal components (`/` has depth 0).
pub fn depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// Parent of a normalized path; `/` is its own parent.
pub fn parent(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// `path` relative to `prefix`; empty when they are equal.
///
/// Both must be normalized and `prefix` must be an ancestor of `path`.
pub fn relative_to(path: &Path, prefix: &Path) -> PathBuf {
    path.strip_prefix(prefix)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// First component of `path` below `dir`, if `path` lies strictly under it.
pub fn child_component(dir: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(dir).ok()?;
    rest.components().find_map(|c| match c {
        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Validate a single entry name handed in by the protocol layer.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
