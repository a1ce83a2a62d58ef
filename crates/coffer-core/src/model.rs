//! In-memory data model of a logical file.
//!
//! A [`NodeRecord`] is the complete persisted state of one node:
//! metadata, extended attributes and the kind-specific payload. It is
//! what the store hands out on load and accepts on save; the open-file
//! layer wraps it with locking and lifecycle state.

use crate::id::FileId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// File-type bits of the mode word (host-independent octal values).
pub const S_IFMT: u32 = 0o170000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100000;
/// Symlink type bits.
pub const S_IFLNK: u32 = 0o120000;

/// The kind of a logical file. Assigned at creation, immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
}

impl NodeKind {
    /// Human-readable name used in error messages and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::RegularFile => "regular file",
            NodeKind::Directory => "directory",
            NodeKind::Symlink => "symlink",
        }
    }

    /// The `S_IFMT` bits corresponding to this kind.
    pub fn file_type_bits(self) -> u32 {
        match self {
            NodeKind::RegularFile => S_IFREG,
            NodeKind::Directory => S_IFDIR,
            NodeKind::Symlink => S_IFLNK,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A second/nanosecond timestamp pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    /// The current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timespec {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            // Clock before the epoch; clamp rather than fail.
            Err(_) => Timespec::default(),
        }
    }
}

/// Mutable metadata of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

/// One directory entry: the child's identifier and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub id: FileId,
    pub kind: NodeKind,
}

/// Kind-specific payload of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePayload {
    /// File content, read-modify-write in memory until flushed.
    Regular(Vec<u8>),
    /// Name-ordered directory entries.
    Directory(BTreeMap<String, DirEntry>),
    /// Symlink target.
    Symlink(String),
}

impl NodePayload {
    /// The empty payload for a kind.
    pub fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::RegularFile => NodePayload::Regular(Vec::new()),
            NodeKind::Directory => NodePayload::Directory(BTreeMap::new()),
            NodeKind::Symlink => NodePayload::Symlink(String::new()),
        }
    }

    /// The kind this payload belongs to.
    pub fn kind(&self) -> NodeKind {
        match self {
            NodePayload::Regular(_) => NodeKind::RegularFile,
            NodePayload::Directory(_) => NodeKind::Directory,
            NodePayload::Symlink(_) => NodeKind::Symlink,
        }
    }
}

/// The complete persisted state of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub attr: NodeAttr,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub payload: NodePayload,
}

impl NodeRecord {
    /// A zero-initialized record for a freshly allocated node.
    ///
    /// The caller populates mode/uid/gid and links the node into a
    /// directory; until then nlink is zero.
    pub fn empty(kind: NodeKind) -> Self {
        NodeRecord {
            kind,
            attr: NodeAttr::default(),
            xattrs: BTreeMap::new(),
            payload: NodePayload::empty(kind),
        }
    }
}
