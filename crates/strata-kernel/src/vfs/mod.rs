//! Virtual filesystem core.
//!
//! Presents many independently mounted storage backends as one namespace.
//! Key components:
//!
//! - [`StorageBackend`] - Capability trait every mounted plugin implements
//! - [`MountTable`] - Registry of mount records keyed by ident and main path
//! - [`ConflictResolver`] - Longest-prefix routing and merged directory views
//! - [`InodeManager`] - Inode ↔ path map with lookup reference counts
//! - [`Router`] - Dispatches protocol calls to backends under read-only policy
//! - [`BackendRegistry`] - Builds backends from `type`-tagged parameters
//!
//! ## Design Decisions
//!
//! - **Synchronous core**: backend calls block the calling worker. Async hosts
//!   wrap at the boundary (see [`crate::control`]).
//! - **Snapshot routing**: the mount table hands out an immutable resolver
//!   snapshot; a mount or unmount swaps in a new one.
//! - **Longest-prefix routing**: the most specific mount wins, newest ident on
//!   ties. Directory listings merge every contributor instead.

pub mod backends;
mod conflict;
mod error;
mod inode;
mod mount;
mod ops;
pub mod path;
mod registry;
mod router;
mod types;

pub use backends::{CachedBackend, LocalBackend, MemoryBackend};
pub use conflict::{
    CONFLICT_MARKER, Claim, ClaimOwner, ConflictResolver, Resolution, Target, conflict_name,
    split_conflict_suffix,
};
pub use error::{BackendError, BackendResult, ErrorKind, FsError, FsResult};
pub use inode::{Inode, InodeManager, InodeSnapshot, ROOT_INODE};
pub use mount::{MountInfo, MountState, MountTable};
pub use ops::{
    Children, StorageBackend, SubcontainerDescriptor, WatchEvent, WatchEventKind, WatchGuard,
    WatchSink,
};
pub use registry::{BackendFactory, BackendRegistry, StorageParams};
pub use router::{CreateReply, EntryReply, Router};
pub use types::{
    BackendHandle, DirEntry, FileAttr, FileType, MountId, OpenFlags, S_IFDIR, S_IFLNK, S_IFMT,
    S_IFREG, now_timestamp,
};
