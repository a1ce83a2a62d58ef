//! In-memory node handles.
//!
//! A [`Node`] is the single live in-memory object for one logical file.
//! The open table owns it and deduplicates by identifier; guards hold a
//! counted reference. All node I/O runs under the node's own state lock,
//! never under the table's bookkeeping lock.
//!
//! Writes use a read-modify-write buffer: the payload lives in memory
//! while the node is open and is written back through the store on
//! flush. The cryptographic block layer cannot update artifacts in
//! place, so whole-artifact write-back is the natural unit.

use coffer_core::{
    FileId, FsError, FsResult, NodeAttr, NodeIo, NodeKind, NodePayload, NodeRecord, Timespec,
    S_IFMT,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Extended attribute namespace reserved for the filesystem itself.
/// Writes under this prefix are rejected.
pub const RESERVED_XATTR_PREFIX: &str = "coffer.";

/// Metadata snapshot returned by [`Node::stat`].
#[derive(Debug, Clone)]
pub struct FileStat {
    pub id: FileId,
    pub kind: NodeKind,
    pub attr: NodeAttr,
}

struct NodeState {
    record: NodeRecord,
    dirty: bool,
}

/// One live logical file.
///
/// The reference count tracks outstanding guards; it is only mutated
/// while the open table's bookkeeping lock is held.
pub struct Node {
    id: FileId,
    kind: NodeKind,
    refcount: AtomicU32,
    state: Mutex<NodeState>,
    store: Arc<dyn NodeIo>,
}

impl Node {
    pub(crate) fn from_record(store: Arc<dyn NodeIo>, id: FileId, record: NodeRecord) -> Self {
        Node {
            id,
            kind: record.kind,
            refcount: AtomicU32::new(0),
            state: Mutex::new(NodeState {
                record,
                dirty: false,
            }),
            store,
        }
    }

    /// The node's identifier.
    pub fn id(&self) -> &FileId {
        &self.id
    }

    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn inc_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn dec_ref(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reference count underflow");
        prev - 1
    }

    /// Whether the node has unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    // ---- capabilities shared by all kinds ----

    /// Returns a metadata snapshot.
    pub fn stat(&self) -> FileStat {
        let state = self.state.lock();
        FileStat {
            id: self.id,
            kind: self.kind,
            attr: state.record.attr.clone(),
        }
    }

    /// Populates the metadata of a freshly created node.
    pub fn initialize_empty(&self, mode: u32, uid: u32, gid: u32) {
        let mut state = self.state.lock();
        let now = Timespec::now();
        state.record.attr = NodeAttr {
            mode,
            uid,
            gid,
            nlink: 1,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        };
        state.dirty = true;
    }

    /// Persists pending changes through the store.
    ///
    /// The dirty flag is cleared only after a successful save.
    pub fn flush(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        self.store.save(&self.id, &state.record)?;
        state.dirty = false;
        trace!(id = %self.id, "flushed node");
        Ok(())
    }

    /// Synchronizes the node to storage. Write-back is whole-artifact,
    /// so this is the same as [`flush`](Self::flush).
    pub fn fsync(&self) -> FsResult<()> {
        self.flush()
    }

    /// Flushes and, once no directory entry names this node, removes
    /// its on-disk artifacts. Called when the node leaves the table.
    pub(crate) fn finalize(&self) -> FsResult<()> {
        self.flush()?;
        let nlink = self.state.lock().record.attr.nlink;
        if nlink == 0 {
            self.store.delete(&self.id)?;
        }
        Ok(())
    }

    /// Replaces the permission bits, preserving the file-type bits.
    /// Special bits (setuid/setgid/sticky) are discarded.
    pub fn set_mode(&self, mode: u32) {
        let mut state = self.state.lock();
        let attr = &mut state.record.attr;
        attr.mode = (attr.mode & S_IFMT) | (mode & 0o777);
        attr.ctime = Timespec::now();
        state.dirty = true;
    }

    pub fn set_uid(&self, uid: u32) {
        let mut state = self.state.lock();
        state.record.attr.uid = uid;
        state.record.attr.ctime = Timespec::now();
        state.dirty = true;
    }

    pub fn set_gid(&self, gid: u32) {
        let mut state = self.state.lock();
        state.record.attr.gid = gid;
        state.record.attr.ctime = Timespec::now();
        state.dirty = true;
    }

    pub fn get_nlink(&self) -> u32 {
        self.state.lock().record.attr.nlink
    }

    pub fn set_nlink(&self, nlink: u32) {
        let mut state = self.state.lock();
        state.record.attr.nlink = nlink;
        state.record.attr.ctime = Timespec::now();
        state.dirty = true;
    }

    /// Drops one directory reference. Artifacts are removed at
    /// finalization once the count reaches zero.
    pub fn unlink(&self) {
        let mut state = self.state.lock();
        let attr = &mut state.record.attr;
        attr.nlink = attr.nlink.saturating_sub(1);
        attr.ctime = Timespec::now();
        state.dirty = true;
    }

    /// Updates access/modification times.
    ///
    /// Without `store_time` the change is visible in memory but never
    /// marked dirty, so it is not persisted.
    pub fn utimens(&self, atime: Option<Timespec>, mtime: Option<Timespec>, store_time: bool) {
        let mut state = self.state.lock();
        let attr = &mut state.record.attr;
        if let Some(atime) = atime {
            attr.atime = atime;
        }
        if let Some(mtime) = mtime {
            attr.mtime = mtime;
        }
        attr.ctime = Timespec::now();
        if store_time {
            state.dirty = true;
        }
    }

    // ---- extended attributes ----

    /// Lists extended attribute names.
    pub fn listxattr(&self) -> Vec<String> {
        self.state.lock().record.xattrs.keys().cloned().collect()
    }

    /// Reads one extended attribute.
    pub fn getxattr(&self, name: &str) -> FsResult<Vec<u8>> {
        self.state
            .lock()
            .record
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NoSuchAttribute(name.to_string()))
    }

    /// Writes one extended attribute.
    pub fn setxattr(&self, name: &str, value: &[u8]) -> FsResult<()> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument("empty xattr name".into()));
        }
        if name.starts_with(RESERVED_XATTR_PREFIX) {
            return Err(FsError::NotPermitted(format!(
                "xattr namespace {RESERVED_XATTR_PREFIX}* is reserved"
            )));
        }
        let mut state = self.state.lock();
        state.record.xattrs.insert(name.to_string(), value.to_vec());
        state.dirty = true;
        Ok(())
    }

    /// Removes one extended attribute.
    pub fn removexattr(&self, name: &str) -> FsResult<()> {
        let mut state = self.state.lock();
        if state.record.xattrs.remove(name).is_none() {
            return Err(FsError::NoSuchAttribute(name.to_string()));
        }
        state.dirty = true;
        Ok(())
    }

    // ---- regular file capabilities ----

    /// Reads up to `size` bytes at `offset`. Short reads happen only at
    /// end of file.
    pub fn read(&self, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let state = self.state.lock();
        let content = regular(&state.record)?;
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(Vec::new());
        }
        let end = (offset + size).min(content.len());
        Ok(content[offset..end].to_vec())
    }

    /// Writes `data` at `offset`, zero-filling any gap past the current
    /// end of file.
    pub fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut state = self.state.lock();
        let content = regular_mut(&mut state.record)?;
        let offset = offset as usize;
        let end = offset + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(data);
        let size = content.len() as u64;
        state.record.attr.size = size;
        state.record.attr.mtime = Timespec::now();
        state.dirty = true;
        Ok(data.len())
    }

    /// Truncates or zero-extends the file to `size` bytes.
    pub fn truncate(&self, size: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        let content = regular_mut(&mut state.record)?;
        content.resize(size as usize, 0);
        state.record.attr.size = size;
        state.record.attr.mtime = Timespec::now();
        state.dirty = true;
        Ok(())
    }

    // ---- directory capabilities ----

    /// Looks up one entry by name.
    pub fn get_entry(&self, name: &str) -> FsResult<Option<(FileId, NodeKind)>> {
        let state = self.state.lock();
        let entries = directory(&state.record)?;
        Ok(entries.get(name).map(|e| (e.id, e.kind)))
    }

    /// Adds an entry. Returns false (leaving the directory untouched)
    /// if the name is already present.
    pub fn add_entry(&self, name: &str, id: FileId, kind: NodeKind) -> FsResult<bool> {
        let mut state = self.state.lock();
        let entries = directory_mut(&mut state.record)?;
        if entries.contains_key(name) {
            return Ok(false);
        }
        entries.insert(name.to_string(), coffer_core::DirEntry { id, kind });
        state.record.attr.mtime = Timespec::now();
        state.dirty = true;
        Ok(true)
    }

    /// Removes an entry by name.
    pub fn remove_entry(&self, name: &str) -> FsResult<()> {
        let mut state = self.state.lock();
        let entries = directory_mut(&mut state.record)?;
        if entries.remove(name).is_none() {
            return Err(FsError::NotFound(name.to_string()));
        }
        state.record.attr.mtime = Timespec::now();
        state.dirty = true;
        Ok(())
    }

    /// Whether the directory has no entries.
    pub fn is_empty_dir(&self) -> FsResult<bool> {
        let state = self.state.lock();
        Ok(directory(&state.record)?.is_empty())
    }

    /// Visits entries in name order until the visitor returns false.
    pub fn iterate_entries<F>(&self, mut visitor: F) -> FsResult<()>
    where
        F: FnMut(&str, &FileId, NodeKind) -> bool,
    {
        let state = self.state.lock();
        for (name, entry) in directory(&state.record)? {
            if !visitor(name, &entry.id, entry.kind) {
                break;
            }
        }
        Ok(())
    }

    // ---- symlink capabilities ----

    /// Reads the symlink target.
    pub fn link_target(&self) -> FsResult<String> {
        let state = self.state.lock();
        match &state.record.payload {
            NodePayload::Symlink(target) => Ok(target.clone()),
            _ => Err(kind_mismatch(NodeKind::Symlink, self.kind)),
        }
    }

    /// Sets the symlink target.
    pub fn set_link_target(&self, target: &str) -> FsResult<()> {
        let mut state = self.state.lock();
        match &mut state.record.payload {
            NodePayload::Symlink(slot) => {
                *slot = target.to_string();
            }
            _ => return Err(kind_mismatch(NodeKind::Symlink, self.kind)),
        }
        state.record.attr.size = target.len() as u64;
        state.record.attr.mtime = Timespec::now();
        state.dirty = true;
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("refcount", &self.ref_count())
            .finish()
    }
}

fn kind_mismatch(expected: NodeKind, actual: NodeKind) -> FsError {
    FsError::KindMismatch {
        expected: expected.as_str(),
        actual: actual.as_str(),
    }
}

fn regular(record: &NodeRecord) -> FsResult<&Vec<u8>> {
    match &record.payload {
        NodePayload::Regular(content) => Ok(content),
        _ => Err(kind_mismatch(NodeKind::RegularFile, record.kind)),
    }
}

fn regular_mut(record: &mut NodeRecord) -> FsResult<&mut Vec<u8>> {
    match &mut record.payload {
        NodePayload::Regular(content) => Ok(content),
        _ => Err(kind_mismatch(NodeKind::RegularFile, record.kind)),
    }
}

fn directory(record: &NodeRecord) -> FsResult<&BTreeMap<String, coffer_core::DirEntry>> {
    match &record.payload {
        NodePayload::Directory(entries) => Ok(entries),
        _ => Err(kind_mismatch(NodeKind::Directory, record.kind)),
    }
}

fn directory_mut(record: &mut NodeRecord) -> FsResult<&mut BTreeMap<String, coffer_core::DirEntry>> {
    match &mut record.payload {
        NodePayload::Directory(entries) => Ok(entries),
        _ => Err(kind_mismatch(NodeKind::Directory, record.kind)),
    }
}
