//! The open-file table.
//!
//! The table owns every live [`Node`], deduplicates by identifier and
//! governs destruction. Closed nodes linger in the table for cheap
//! reuse; once too many accumulate, the oldest are ejected to a
//! background finalizer that flushes them and tears down their
//! artifacts off the hot path.
//!
//! # Locking
//!
//! Two locks, always acquired bookkeeping-first:
//!
//! - `inner` protects the active map and the recently-closed queue. It
//!   is held for bookkeeping and for constructing a missing node (which
//!   is what makes "at most one live node per identifier" hold), never
//!   for node I/O.
//! - `Shared::closing` protects the pending-close map and the set of
//!   identifiers currently being finalized, with a condvar for the
//!   opener/worker handoff. An opener that races a finalization waits
//!   on the condvar and re-examines state; either the worker finishes
//!   the teardown or the opener reclaims the node, never both.

use crate::node::Node;
use coffer_core::{FileId, FsError, FsResult, MountFlags, NodeIo, NodeKind, StatFs};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Closed nodes kept in the table for reuse before eviction starts.
pub const MAX_NUM_CLOSED: usize = 201;

/// Nodes moved to the background finalizer per eviction round.
pub const NUM_EJECT: usize = 150;

#[derive(Default)]
struct TableInner {
    /// Every node currently referenced or recently used.
    active: HashMap<FileId, Arc<Node>>,
    /// Identifiers in `active` whose reference count dropped to zero,
    /// oldest first. Entries go stale when a node is reopened; eviction
    /// skips those.
    recently_closed: VecDeque<FileId>,
}

#[derive(Default)]
struct ClosingState {
    /// Nodes evicted from `active`, waiting for the finalizer.
    pending: HashMap<FileId, Arc<Node>>,
    /// Identifiers a worker is finalizing right now.
    closing_ids: HashSet<FileId>,
}

struct Shared {
    closing: Mutex<ClosingState>,
    cond: Condvar,
}

impl Shared {
    /// Runs one finalization task. The opener may have reclaimed the
    /// node in the meantime, in which case there is nothing to do.
    fn finalize_pending(&self, id: FileId) {
        let node = {
            let mut closing = self.closing.lock();
            match closing.pending.remove(&id) {
                Some(node) => {
                    closing.closing_ids.insert(id);
                    node
                }
                None => return,
            }
        };
        // Teardown happens outside the lock; failures cannot be
        // returned to anyone, so they are logged and swallowed.
        if let Err(err) = node.finalize() {
            error!(id = %id, error = %err, "background finalization failed");
        }
        let mut closing = self.closing.lock();
        closing.closing_ids.remove(&id);
        drop(closing);
        self.cond.notify_all();
    }
}

/// Owner of every in-memory node.
pub struct OpenTable {
    inner: Mutex<TableInner>,
    shared: Arc<Shared>,
    queue: Option<mpsc::Sender<FileId>>,
    worker: Option<JoinHandle<()>>,
    store: Arc<dyn NodeIo>,
    flags: MountFlags,
}

impl OpenTable {
    /// Creates a table over the given store and spawns the finalizer.
    pub fn new(store: Arc<dyn NodeIo>, flags: MountFlags) -> FsResult<Self> {
        let shared = Arc::new(Shared {
            closing: Mutex::new(ClosingState::default()),
            cond: Condvar::new(),
        });
        let (tx, rx) = mpsc::channel::<FileId>();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("coffer-finalizer".to_string())
            .spawn(move || {
                while let Ok(id) = rx.recv() {
                    worker_shared.finalize_pending(id);
                }
            })
            .map_err(FsError::Io)?;
        Ok(OpenTable {
            inner: Mutex::new(TableInner::default()),
            shared,
            queue: Some(tx),
            worker: Some(worker),
            store,
            flags,
        })
    }

    /// The mount flags.
    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    /// Whether every mutating operation must be rejected.
    pub fn is_readonly(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }

    /// Whether timestamp updates are persisted.
    pub fn is_time_stored(&self) -> bool {
        self.flags.contains(MountFlags::STORE_TIME)
    }

    /// Whether path resolution is case-insensitive.
    pub fn is_case_folded(&self) -> bool {
        self.flags.contains(MountFlags::CASE_FOLD_NAME)
    }

    /// Opens the node with identifier `id`, materializing it if needed.
    ///
    /// # Errors
    ///
    /// Kind-mismatch if the node exists with a different kind;
    /// not-found if the artifacts are absent; corruption if integrity
    /// verification fails.
    pub fn open_as(&self, id: FileId, kind: NodeKind) -> FsResult<NodeGuard<'_>> {
        loop {
            let mut inner = self.inner.lock();
            if let Some(node) = inner.active.get(&id) {
                if node.kind() != kind {
                    return Err(kind_mismatch(kind, node.kind()));
                }
                let node = Arc::clone(node);
                node.inc_ref();
                return Ok(NodeGuard::new(self, node));
            }

            let mut closing = self.shared.closing.lock();
            if let Some(node) = closing.pending.remove(&id) {
                // Reclaim from the eviction pipeline before the worker
                // gets to it.
                drop(closing);
                trace!(id = %id, "reclaimed node from pending close");
                inner.active.insert(id, Arc::clone(&node));
                if node.kind() != kind {
                    inner.recently_closed.push_back(id);
                    return Err(kind_mismatch(kind, node.kind()));
                }
                node.inc_ref();
                return Ok(NodeGuard::new(self, node));
            }
            if closing.closing_ids.contains(&id) {
                // A worker is tearing this node down. Release the table
                // so other operations proceed, wait for the handoff,
                // then re-examine everything.
                drop(inner);
                self.shared.cond.wait(&mut closing);
                continue;
            }
            drop(closing);

            // Absent everywhere. Materialize while still holding the
            // bookkeeping lock so a concurrent opener cannot build a
            // second node for the same identifier.
            let record = self.store.load(&id)?;
            if record.kind != kind {
                return Err(kind_mismatch(kind, record.kind));
            }
            let node = Arc::new(Node::from_record(Arc::clone(&self.store), id, record));
            node.inc_ref();
            inner.active.insert(id, Arc::clone(&node));
            return Ok(NodeGuard::new(self, node));
        }
    }

    /// Creates a node with fresh on-disk artifacts.
    ///
    /// The returned node has zero-initialized metadata; the caller
    /// populates it and links it into a directory.
    ///
    /// # Errors
    ///
    /// Already-exists if the identifier is live or its artifacts exist.
    pub fn create_as(&self, id: FileId, kind: NodeKind) -> FsResult<NodeGuard<'_>> {
        let mut inner = self.inner.lock();
        {
            let closing = self.shared.closing.lock();
            if inner.active.contains_key(&id)
                || closing.pending.contains_key(&id)
                || closing.closing_ids.contains(&id)
            {
                return Err(FsError::AlreadyExists(format!("node {id}")));
            }
        }
        let record = self.store.allocate(&id, kind)?;
        let node = Arc::new(Node::from_record(Arc::clone(&self.store), id, record));
        node.inc_ref();
        inner.active.insert(id, Arc::clone(&node));
        Ok(NodeGuard::new(self, node))
    }

    /// Returns one reference. Called by guard drop.
    ///
    /// When the count reaches zero the node is flushed and either kept
    /// in the table for reuse or, past [`MAX_NUM_CLOSED`], ejected to
    /// the background finalizer.
    fn close(&self, node: &Arc<Node>) {
        {
            let inner = self.inner.lock();
            if node.dec_ref() > 0 {
                return;
            }
            drop(inner);
        }
        // Flush outside the bookkeeping lock. Nothing can be returned
        // to the dropper; the release dispatcher op flushes explicitly
        // beforehand so real errors still surface.
        if let Err(err) = node.flush() {
            warn!(id = %node.id(), error = %err, "flush on close failed");
        }
        let mut inner = self.inner.lock();
        if node.ref_count() > 0 {
            // Reopened while we were flushing.
            return;
        }
        let id = *node.id();
        if !inner.active.contains_key(&id) {
            // Concurrently ejected by another close.
            return;
        }
        inner.recently_closed.push_back(id);
        if inner.active.len() > MAX_NUM_CLOSED {
            self.eject(&mut inner);
        }
    }

    /// Moves the oldest closed nodes to the background finalizer.
    fn eject(&self, inner: &mut TableInner) {
        let mut evicted = 0usize;
        while evicted < NUM_EJECT {
            let Some(id) = inner.recently_closed.pop_front() else {
                break;
            };
            let still_closed = match inner.active.get(&id) {
                Some(node) => node.ref_count() == 0,
                // Stale entry: already ejected under an earlier round.
                None => continue,
            };
            if !still_closed {
                // Became live again; drop the candidate without eviction.
                continue;
            }
            if let Some(node) = inner.active.remove(&id) {
                let mut closing = self.shared.closing.lock();
                closing.pending.insert(id, node);
                drop(closing);
                self.enqueue_finalize(id);
                evicted += 1;
            }
        }
        debug!(evicted, active = inner.active.len(), "ejected closed nodes");
    }

    fn enqueue_finalize(&self, id: FileId) {
        let sent = match &self.queue {
            Some(tx) => tx.send(id).is_ok(),
            None => false,
        };
        if !sent {
            // Worker already gone (teardown); finalize inline.
            self.shared.finalize_pending(id);
        }
    }

    /// Drains the pending-close pool, finalizing every node
    /// synchronously. Used at shutdown and on explicit request.
    pub fn gc(&self) {
        loop {
            let mut closing = self.shared.closing.lock();
            let next = closing.pending.keys().next().copied();
            match next {
                Some(id) => {
                    let Some(node) = closing.pending.remove(&id) else {
                        continue;
                    };
                    closing.closing_ids.insert(id);
                    drop(closing);
                    if let Err(err) = node.finalize() {
                        error!(id = %id, error = %err, "finalization during gc failed");
                    }
                    let mut closing = self.shared.closing.lock();
                    closing.closing_ids.remove(&id);
                    drop(closing);
                    self.shared.cond.notify_all();
                }
                None if !closing.closing_ids.is_empty() => {
                    // Wait out in-flight workers so gc really drains.
                    self.shared.cond.wait(&mut closing);
                }
                None => break,
            }
        }
    }

    /// Forwards storage statistics.
    pub fn statfs(&self) -> FsResult<StatFs> {
        self.store.statfs()
    }

    /// Reconstructs a guard over a reference previously released with
    /// [`NodeGuard::release`]. Does not touch the reference count; the
    /// obligation travels with the raw handle.
    pub fn adopt(&self, node: Arc<Node>) -> NodeGuard<'_> {
        NodeGuard::new(self, node)
    }

    /// Number of nodes in the active map.
    pub fn active_len(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Number of nodes awaiting background finalization.
    pub fn pending_len(&self) -> usize {
        self.shared.closing.lock().pending.len()
    }
}

impl Drop for OpenTable {
    fn drop(&mut self) {
        self.gc();
        // Stop the worker: dropping the sender ends its recv loop.
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let mut inner = self.inner.lock();
        for (id, node) in inner.active.drain() {
            let refs = node.ref_count();
            if refs != 0 {
                error!(id = %id, refs, "node still referenced at table teardown");
            }
            if let Err(err) = node.finalize() {
                error!(id = %id, error = %err, "finalization at teardown failed");
            }
        }
    }
}

fn kind_mismatch(expected: NodeKind, actual: NodeKind) -> FsError {
    FsError::KindMismatch {
        expected: expected.as_str(),
        actual: actual.as_str(),
    }
}

/// A counted reference on a node, returned to the table on drop.
///
/// Move-only; [`release`](Self::release) converts the reference into a
/// raw handle for the host boundary, to be re-adopted later with
/// [`OpenTable::adopt`].
pub struct NodeGuard<'t> {
    table: &'t OpenTable,
    node: Option<Arc<Node>>,
}

impl<'t> std::fmt::Debug for NodeGuard<'t> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGuard").field("node", &self.node).finish()
    }
}

impl<'t> NodeGuard<'t> {
    fn new(table: &'t OpenTable, node: Arc<Node>) -> Self {
        NodeGuard {
            table,
            node: Some(node),
        }
    }

    /// The underlying node.
    pub fn node(&self) -> &Arc<Node> {
        self.node
            .as_ref()
            .expect("guard accessed after release")
    }

    /// Detaches the reference without returning it; the caller must
    /// hand it back via [`OpenTable::adopt`] eventually.
    pub fn release(mut self) -> Arc<Node> {
        self.node
            .take()
            .expect("guard already released")
    }
}

impl Deref for NodeGuard<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        self.node()
    }
}

impl Drop for NodeGuard<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            self.table.close(&node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_core::{LocalStore, MasterKey, MountOptions};
    use std::time::Duration;
    use tempfile::TempDir;

    fn new_table() -> (TempDir, OpenTable) {
        let dir = TempDir::new().unwrap();
        let options = MountOptions::new(dir.path(), MasterKey::from_bytes([1u8; 32]));
        let store: Arc<dyn NodeIo> = Arc::new(LocalStore::new(&options).unwrap());
        let table = OpenTable::new(store, MountFlags::empty()).unwrap();
        (dir, table)
    }

    fn create_file(table: &OpenTable) -> FileId {
        let id = FileId::random();
        let guard = table.create_as(id, NodeKind::RegularFile).unwrap();
        guard.initialize_empty(0o644, 0, 0);
        id
    }

    #[test]
    fn test_open_deduplicates_by_identifier() {
        let (_dir, table) = new_table();
        let id = create_file(&table);

        let a = table.open_as(id, NodeKind::RegularFile).unwrap();
        let b = table.open_as(id, NodeKind::RegularFile).unwrap();
        assert!(Arc::ptr_eq(a.node(), b.node()));
        assert_eq!(a.ref_count(), 2);
    }

    #[test]
    fn test_open_with_wrong_kind_fails() {
        let (_dir, table) = new_table();
        let id = create_file(&table);
        assert!(matches!(
            table.open_as(id, NodeKind::Directory),
            Err(FsError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let (_dir, table) = new_table();
        assert!(matches!(
            table.open_as(FileId::random(), NodeKind::RegularFile),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_twice_fails() {
        let (_dir, table) = new_table();
        let id = create_file(&table);
        assert!(matches!(
            table.create_as(id, NodeKind::RegularFile),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_closed_node_is_cached_for_reuse() {
        let (_dir, table) = new_table();
        let id = create_file(&table);

        let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
        let first = Arc::as_ptr(guard.node());
        drop(guard);

        // Still in the table with refcount zero.
        assert_eq!(table.active_len(), 1);
        let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
        assert_eq!(Arc::as_ptr(guard.node()), first);
    }

    #[test]
    fn test_close_flushes_dirty_state() {
        let (_dir, table) = new_table();
        let id = create_file(&table);

        let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
        guard.write(0, b"payload").unwrap();
        assert!(guard.is_dirty());
        drop(guard);

        let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
        assert!(!guard.is_dirty());
    }

    #[test]
    fn test_eviction_bounds_active_map() {
        let (_dir, table) = new_table();
        for _ in 0..(MAX_NUM_CLOSED + 60) {
            create_file(&table);
            assert!(table.active_len() <= MAX_NUM_CLOSED);
        }
        // One eviction round must have run.
        table.gc();
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn test_evicted_node_survives_round_trip() {
        let (_dir, table) = new_table();
        let id = create_file(&table);
        {
            let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
            guard.write(0, b"durable").unwrap();
        }
        // Push the node through eviction.
        for _ in 0..(MAX_NUM_CLOSED + NUM_EJECT) {
            create_file(&table);
        }
        table.gc();

        let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
        assert_eq!(guard.read(0, 7).unwrap(), b"durable");
    }

    #[test]
    fn test_gc_drains_pending() {
        let (_dir, table) = new_table();
        for _ in 0..(MAX_NUM_CLOSED + 10) {
            create_file(&table);
        }
        table.gc();
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn test_release_and_adopt_round_trip() {
        let (_dir, table) = new_table();
        let id = create_file(&table);

        let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
        let raw = guard.release();
        assert_eq!(raw.ref_count(), 1);

        let guard = table.adopt(raw);
        drop(guard);
        let reopened = table.open_as(id, NodeKind::RegularFile).unwrap();
        assert_eq!(reopened.ref_count(), 1);
    }

    #[test]
    fn test_concurrent_open_single_node_per_id() {
        let (_dir, table) = new_table();
        let id = create_file(&table);
        let table = Arc::new(table);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let mut last_ptr = 0usize;
                for _ in 0..200 {
                    let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
                    let ptr = Arc::as_ptr(guard.node()) as usize;
                    drop(guard);
                    last_ptr = ptr;
                }
                last_ptr
            }));
        }
        let pointers: HashSet<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        // All threads ended on the same in-memory object.
        assert_eq!(pointers.len(), 1);
    }

    #[test]
    fn test_open_during_finalization_waits_and_succeeds() {
        let (_dir, table) = new_table();
        let table = Arc::new(table);

        let id = create_file(&table);
        {
            let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
            guard.write(0, b"latest").unwrap();
        }
        // Evict our node into the finalizer pipeline, then immediately
        // race reopen attempts against the worker.
        for _ in 0..(MAX_NUM_CLOSED + NUM_EJECT) {
            create_file(&table);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let guard = table.open_as(id, NodeKind::RegularFile).unwrap();
                guard.read(0, 6).unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"latest");
        }
        // Let the worker settle before the table drops.
        std::thread::sleep(Duration::from_millis(50));
        table.gc();
    }
}
