//! POSIX-shaped dispatch surface.
//!
//! [`FileSystem`] is what a FUSE-style host drives: one method per
//! supported operation, each running inside a trace-logging and
//! error-translation frame. Hosts map an [`FsError`] to a negative
//! error code with [`FsError::to_errno`].
//!
//! Handle-returning operations release the guard's reference into a
//! slab handle the host carries in its file-info; the close path
//! re-adopts a guard over the raw handle and drops it, triggering the
//! normal release machinery.

use crate::context::FsContext;
use crate::node::{FileStat, Node};
use crate::resolver;
use coffer_core::{
    FsError, FsResult, MountOptions, NodeIo, NodeKind, StatFs, Timespec, S_IFDIR, S_IFLNK,
    S_IFMT, S_IFREG,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Access intent of an open call, distilled from the host's O_* flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-only access.
    pub fn read_only() -> Self {
        OpenFlags::default()
    }

    /// Read-write access.
    pub fn read_write() -> Self {
        OpenFlags {
            write: true,
            ..OpenFlags::default()
        }
    }

    fn requires_write(self) -> bool {
        self.write || self.append || self.truncate
    }
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: NodeKind,
}

/// Slab of released node references carried across the host boundary.
///
/// Handle 0 is never issued, so hosts can use it as a null value.
struct HandleRegistry {
    handles: DashMap<u64, Arc<Node>>,
    next_id: AtomicU64,
}

impl HandleRegistry {
    fn new() -> Self {
        HandleRegistry {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn insert(&self, node: Arc<Node>) -> u64 {
        let handle = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(handle, node);
        handle
    }

    fn get(&self, handle: u64) -> Option<Arc<Node>> {
        self.handles.get(&handle).map(|node| Arc::clone(&node))
    }

    fn remove(&self, handle: u64) -> Option<Arc<Node>> {
        self.handles.remove(&handle).map(|(_, node)| node)
    }

    fn len(&self) -> usize {
        self.handles.len()
    }
}

/// The mounted filesystem as seen by the host.
pub struct FileSystem {
    ctx: FsContext,
    handles: HandleRegistry,
}

impl FileSystem {
    /// Mounts over a local store at the configured root.
    pub fn new(options: MountOptions) -> FsResult<Self> {
        Ok(FileSystem {
            ctx: FsContext::new(options)?,
            handles: HandleRegistry::new(),
        })
    }

    /// Mounts over an externally provided store.
    pub fn with_store(store: Arc<dyn NodeIo>, options: MountOptions) -> FsResult<Self> {
        Ok(FileSystem {
            ctx: FsContext::with_store(store, options)?,
            handles: HandleRegistry::new(),
        })
    }

    /// Failure-translation frame: trace the call, log failures at a
    /// level matching their severity, pass the error through.
    fn run<T, F>(&self, op: &'static str, target: &str, f: F) -> FsResult<T>
    where
        F: FnOnce(&FsContext) -> FsResult<T>,
    {
        trace!(op, target, "dispatch");
        match f(&self.ctx) {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_quiet() {
                    debug!(op, target, error = %err, "operation failed");
                } else {
                    warn!(op, target, error = %err, "operation failed");
                }
                Err(err)
            }
        }
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.ctx.table.is_readonly() {
            Err(FsError::ReadOnlyFilesystem)
        } else {
            Ok(())
        }
    }

    fn handle_node(&self, handle: u64) -> FsResult<Arc<Node>> {
        self.handles
            .get(handle)
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown handle {handle}")))
    }

    // ---- metadata ----

    /// Stats the node at `path`. Ownership is reported as the mounting
    /// user regardless of stored metadata.
    pub fn getattr(&self, path: &str) -> FsResult<FileStat> {
        self.run("getattr", path, |ctx| {
            let guard = resolver::open_all_opt(ctx, path)?
                .ok_or_else(|| FsError::NotFound(resolver::canonical_path(ctx, path)))?;
            let mut stat = guard.stat();
            stat.attr.uid = ctx.uid;
            stat.attr.gid = ctx.gid;
            Ok(stat)
        })
    }

    /// Forwards storage statistics.
    pub fn statfs(&self) -> FsResult<StatFs> {
        self.run("statfs", "/", |ctx| ctx.table.statfs())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        self.run("chmod", path, |ctx| {
            self.check_writable()?;
            let guard = resolver::open_all(ctx, path)?;
            guard.set_mode(mode);
            guard.flush()
        })
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.run("chown", path, |ctx| {
            self.check_writable()?;
            let guard = resolver::open_all(ctx, path)?;
            guard.set_uid(uid);
            guard.set_gid(gid);
            guard.flush()
        })
    }

    pub fn utimens(
        &self,
        path: &str,
        atime: Option<Timespec>,
        mtime: Option<Timespec>,
    ) -> FsResult<()> {
        self.run("utimens", path, |ctx| {
            self.check_writable()?;
            let guard = resolver::open_all(ctx, path)?;
            guard.utimens(atime, mtime, ctx.table.is_time_stored());
            guard.flush()
        })
    }

    // ---- directories ----

    pub fn opendir(&self, path: &str) -> FsResult<u64> {
        self.run("opendir", path, |ctx| {
            let guard = resolver::open_all(ctx, path)?;
            if guard.kind() != NodeKind::Directory {
                return Err(FsError::NotADirectory(resolver::canonical_path(ctx, path)));
            }
            Ok(self.handles.insert(guard.release()))
        })
    }

    pub fn releasedir(&self, handle: u64) -> FsResult<()> {
        self.release(handle)
    }

    pub fn readdir(&self, handle: u64) -> FsResult<Vec<DirEntryInfo>> {
        self.run("readdir", "(handle)", |_ctx| {
            let node = self.handle_node(handle)?;
            if node.kind() != NodeKind::Directory {
                return Err(FsError::NotADirectory(format!("handle {handle}")));
            }
            let mut entries = Vec::new();
            node.iterate_entries(|name, _, kind| {
                entries.push(DirEntryInfo {
                    name: name.to_string(),
                    kind,
                });
                true
            })?;
            Ok(entries)
        })
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        self.run("mkdir", path, |ctx| {
            self.check_writable()?;
            let mode = (mode & !S_IFMT) | S_IFDIR;
            resolver::create(ctx, path, NodeKind::Directory, mode, ctx.uid, ctx.gid)?;
            Ok(())
        })
    }

    /// Removal of a directory delegates to [`unlink`](Self::unlink);
    /// the emptiness check fires inside the shared remove path.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        self.unlink(path)
    }

    // ---- files ----

    pub fn create(&self, path: &str, mode: u32) -> FsResult<u64> {
        self.run("create", path, |ctx| {
            self.check_writable()?;
            let mode = (mode & !S_IFMT) | S_IFREG;
            let guard = resolver::create(ctx, path, NodeKind::RegularFile, mode, ctx.uid, ctx.gid)?;
            Ok(self.handles.insert(guard.release()))
        })
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<u64> {
        self.run("open", path, |ctx| {
            if flags.requires_write() {
                self.check_writable()?;
            }
            let guard = resolver::open_all(ctx, path)?;
            match guard.kind() {
                NodeKind::RegularFile => {}
                NodeKind::Directory => {
                    return Err(FsError::IsADirectory(resolver::canonical_path(ctx, path)));
                }
                NodeKind::Symlink => {
                    return Err(FsError::KindMismatch {
                        expected: NodeKind::RegularFile.as_str(),
                        actual: NodeKind::Symlink.as_str(),
                    });
                }
            }
            if flags.truncate {
                guard.truncate(0)?;
            }
            Ok(self.handles.insert(guard.release()))
        })
    }

    /// Returns a handle to the table. Flushes first so that write
    /// errors surface here rather than being swallowed on the drop path.
    pub fn release(&self, handle: u64) -> FsResult<()> {
        self.run("release", "(handle)", |ctx| {
            let node = self
                .handles
                .remove(handle)
                .ok_or_else(|| FsError::InvalidArgument(format!("unknown handle {handle}")))?;
            let flushed = node.flush();
            drop(ctx.table.adopt(node));
            flushed
        })
    }

    pub fn read(&self, handle: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        self.run("read", "(handle)", |_ctx| {
            self.handle_node(handle)?.read(offset, size)
        })
    }

    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.run("write", "(handle)", |_ctx| {
            self.check_writable()?;
            self.handle_node(handle)?.write(offset, data)
        })
    }

    pub fn flush(&self, handle: u64) -> FsResult<()> {
        self.run("flush", "(handle)", |_ctx| self.handle_node(handle)?.flush())
    }

    pub fn fsync(&self, handle: u64) -> FsResult<()> {
        self.run("fsync", "(handle)", |_ctx| self.handle_node(handle)?.fsync())
    }

    pub fn fsyncdir(&self, handle: u64) -> FsResult<()> {
        self.fsync(handle)
    }

    pub fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        self.run("truncate", path, |ctx| {
            self.check_writable()?;
            let guard = resolver::open_all(ctx, path)?;
            guard.truncate(size)?;
            guard.flush()
        })
    }

    pub fn ftruncate(&self, handle: u64, size: u64) -> FsResult<()> {
        self.run("ftruncate", "(handle)", |_ctx| {
            self.check_writable()?;
            let node = self.handle_node(handle)?;
            node.truncate(size)?;
            node.flush()
        })
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        self.run("unlink", path, |ctx| {
            self.check_writable()?;
            resolver::remove(ctx, path)
        })
    }

    // ---- links ----

    pub fn symlink(&self, target: &str, path: &str) -> FsResult<()> {
        self.run("symlink", path, |ctx| {
            self.check_writable()?;
            let guard =
                resolver::create(ctx, path, NodeKind::Symlink, S_IFLNK | 0o755, ctx.uid, ctx.gid)?;
            guard.set_link_target(target)
        })
    }

    /// Reads a symlink target into a buffer of `size` bytes, leaving
    /// room for the host's NUL terminator.
    pub fn readlink(&self, path: &str, size: usize) -> FsResult<Vec<u8>> {
        if size == 0 {
            return Err(FsError::InvalidArgument("zero-sized readlink buffer".into()));
        }
        self.run("readlink", path, |ctx| {
            let guard = resolver::open_all(ctx, path)?;
            let mut bytes = guard.link_target()?.into_bytes();
            bytes.truncate(size - 1);
            Ok(bytes)
        })
    }

    pub fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        self.run("rename", src, |ctx| {
            self.check_writable()?;
            resolver::rename(ctx, src, dst)
        })
    }

    pub fn link(&self, src: &str, dst: &str) -> FsResult<()> {
        self.run("link", src, |ctx| {
            self.check_writable()?;
            resolver::link(ctx, src, dst)
        })
    }

    // ---- extended attributes ----

    pub fn listxattr(&self, path: &str) -> FsResult<Vec<String>> {
        self.run("listxattr", path, |ctx| {
            Ok(resolver::open_all(ctx, path)?.listxattr())
        })
    }

    pub fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        self.run("getxattr", path, |ctx| {
            resolver::open_all(ctx, path)?.getxattr(name)
        })
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> FsResult<()> {
        self.run("setxattr", path, |ctx| {
            self.check_writable()?;
            let guard = resolver::open_all(ctx, path)?;
            guard.setxattr(name, value)?;
            guard.flush()
        })
    }

    pub fn removexattr(&self, path: &str, name: &str) -> FsResult<()> {
        self.run("removexattr", path, |ctx| {
            self.check_writable()?;
            let guard = resolver::open_all(ctx, path)?;
            guard.removexattr(name)?;
            guard.flush()
        })
    }

    // ---- maintenance ----

    /// Synchronously finalizes every node awaiting background close.
    pub fn gc(&self) {
        self.ctx.table.gc();
    }

    /// Nodes currently held in the open table.
    pub fn open_node_count(&self) -> usize {
        self.ctx.table.active_len()
    }

    /// Raw handles currently outstanding at the host boundary.
    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }
}
