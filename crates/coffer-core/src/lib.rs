//! Data model and node I/O layer for the cofferfs encrypted filesystem.
//!
//! This crate defines what a logical file *is*: its 16-byte identifier,
//! its kind, metadata and payload, the mount configuration, the error
//! taxonomy, and the [`NodeIo`] storage seam through which node
//! artifacts are materialized and persisted. The open-file table, path
//! resolution and the host-facing dispatcher live in `coffer-vfs`.

pub mod error;
pub mod id;
pub mod key;
pub mod model;
pub mod options;
pub mod store;

pub use error::{FsError, FsResult};
pub use id::{FileId, ID_LENGTH};
pub use key::{MasterKey, KEY_LENGTH};
pub use model::{
    DirEntry, NodeAttr, NodeKind, NodePayload, NodeRecord, Timespec, S_IFDIR, S_IFLNK, S_IFMT,
    S_IFREG,
};
pub use options::{MountFlags, MountOptions, LOCK_FILENAME, MAX_FORMAT_VERSION};
pub use store::{LocalStore, NodeIo, StatFs};
