//! Core VFS types.
//!
//! The attribute model is shared by every backend: whatever a backend knows
//! about a file is folded into a [`FileAttr`], and the router only ever
//! reasons about that representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// File type bits (`S_IFMT`).
pub const S_IFMT: u32 = 0o170_000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link type bits.
pub const S_IFLNK: u32 = 0o120_000;

/// Write permission for owner, group and other.
const WRITE_BITS: u32 = 0o222;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }

    /// The `S_IFMT` bits for this kind.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::File => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
        }
    }

    /// Decode the kind from a full mode. Unknown type bits read as a file.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            _ => FileType::File,
        }
    }
}

/// File attributes (metadata).
///
/// `mode` carries both the kind (`S_IFMT` bits) and the permission bits, the
/// same way `stat(2)` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes. Backends that cannot know the size report 0.
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub timestamp: i64,
    /// Kind and permission bits.
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u32,
}

impl FileAttr {
    /// Create attributes for a regular file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            size,
            timestamp: now_timestamp(),
            mode: S_IFREG | (perm & 0o7777),
            nlink: 1,
        }
    }

    /// Create attributes for a directory.
    pub fn directory(perm: u32) -> Self {
        Self {
            size: 0,
            timestamp: now_timestamp(),
            mode: S_IFDIR | (perm & 0o7777),
            nlink: 2, // . and ..
        }
    }

    /// Create attributes for a symlink.
    pub fn symlink(target_len: u64) -> Self {
        Self {
            size: target_len,
            timestamp: now_timestamp(),
            mode: S_IFLNK | 0o777,
            nlink: 1,
        }
    }

    /// Attributes of a directory that exists only because something is
    /// mounted below it.
    pub fn synthetic_directory() -> Self {
        Self {
            size: 0,
            timestamp: 0,
            mode: S_IFDIR | 0o555,
            nlink: 2,
        }
    }

    /// Set the modification time.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The kind encoded in `mode`.
    pub fn kind(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// Permission bits only.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind().is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind().is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind().is_symlink()
    }

    /// Same attributes with every write bit cleared.
    pub fn without_write_bits(mut self) -> Self {
        self.mode &= !WRITE_BITS;
        self
    }
}

/// Current time as seconds since the Unix epoch.
pub fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Directory entry as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Create a file entry.
    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, FileType::File)
    }

    /// Create a directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, FileType::Directory)
    }
}

/// Identifier of a mount record. Assigned monotonically by the mount table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountId(pub u64);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-issued handle for an open file. Only meaningful to the backend
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendHandle(pub u64);

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            create: true,
            exclusive: true,
            ..Self::create()
        }
    }

    /// Decode `open(2)` flags as handed over by a FUSE-style transport.
    pub fn from_raw(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        Self {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            create: flags & libc::O_CREAT != 0,
            truncate: flags & libc::O_TRUNC != 0,
            exclusive: flags & libc::O_EXCL != 0,
        }
    }

    /// Whether opening with these flags can modify the file.
    pub fn is_mutating(&self) -> bool {
        self.write || self.append || self.create || self.truncate
    }
}
