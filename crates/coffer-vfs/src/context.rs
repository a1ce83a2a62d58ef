//! Per-mount context.
//!
//! Bundles the open-file table, the path cache and the root identifier
//! for one mount. The dispatcher owns one context; resolver functions
//! borrow it.

use crate::path_cache::PathCache;
use crate::table::OpenTable;
use coffer_core::{
    FileId, FsError, FsResult, LocalStore, MountOptions, NodeIo, NodeKind, S_IFDIR,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// State shared by every operation on one mount.
pub struct FsContext {
    pub(crate) table: OpenTable,
    pub(crate) path_cache: Mutex<PathCache>,
    pub(crate) root_id: FileId,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
}

impl FsContext {
    /// Opens a context over a [`LocalStore`] at the configured root.
    pub fn new(options: MountOptions) -> FsResult<Self> {
        options.validate()?;
        let store: Arc<dyn NodeIo> = Arc::new(LocalStore::new(&options)?);
        Self::with_store(store, options)
    }

    /// Opens a context over an externally provided store.
    pub fn with_store(store: Arc<dyn NodeIo>, options: MountOptions) -> FsResult<Self> {
        options.validate()?;
        let table = OpenTable::new(store, options.flags)?;
        let ctx = FsContext {
            table,
            path_cache: Mutex::new(PathCache::new()),
            root_id: FileId::ROOT,
            uid: current_uid(),
            gid: current_gid(),
        };
        ctx.ensure_root()?;
        Ok(ctx)
    }

    /// The open-file table.
    pub fn table(&self) -> &OpenTable {
        &self.table
    }

    /// Opens the root directory, creating it on a fresh store.
    fn ensure_root(&self) -> FsResult<()> {
        match self.table.open_as(self.root_id, NodeKind::Directory) {
            Ok(_root) => Ok(()),
            Err(FsError::NotFound(_)) => {
                let root = self.table.create_as(self.root_id, NodeKind::Directory)?;
                root.initialize_empty(S_IFDIR | 0o755, self.uid, self.gid);
                root.flush()?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(unix)]
fn current_gid() -> u32 {
    unsafe { libc::getgid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(not(unix))]
fn current_gid() -> u32 {
    0
}
