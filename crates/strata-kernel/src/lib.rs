//! # strata-kernel
//!
//! Virtual filesystem mounting and conflict-resolution core.
//!
//! Many independently mounted storage backends appear as one POSIX-like
//! namespace:
//! - Backends attach at one or more logical paths, possibly overlapping
//! - File operations route to the longest mounted prefix
//! - Directory listings merge every contributor, renaming colliding names
//! - Inodes map to logical paths with protocol lookup counts
//! - An external remounter drives mounts through the control channel

pub mod config;
pub mod control;
pub mod vfs;

pub use config::{ConfigError, StrataConfig};
pub use control::{
    ControlCommand, ControlError, ControlHandle, ControlResponse, ErrorReport, MountController,
    MountOutcome, MountRequest, spawn_control_channel,
};
pub use vfs::{
    BackendRegistry, CachedBackend, DirEntry, ErrorKind, FileAttr, FileType, FsError, FsResult,
    LocalBackend, MemoryBackend, MountId, MountTable, OpenFlags, Router, StorageBackend,
    StorageParams,
};
