//! Plaintext-path to identifier cache.
//!
//! Resolving a path means opening every intermediate directory and
//! decrypting an entry lookup at each level. This cache short-circuits
//! the walk by remembering which identifier each path prefix resolved
//! to. It is an accelerator only: absence never means nonexistence.
//!
//! The forward map is ordered, so invalidating a subtree is one bounded
//! range scan starting at the first key greater or equal to the prefix.

use coffer_core::FileId;
use std::collections::{BTreeMap, HashMap};

/// Bidirectional cache between normalized path prefixes and identifiers.
///
/// Invariant: `forward[p] == id` iff `reverse[id] == p`.
#[derive(Debug, Default)]
pub struct PathCache {
    forward: BTreeMap<String, FileId>,
    reverse: HashMap<FileId, String>,
}

impl PathCache {
    pub fn new() -> Self {
        PathCache::default()
    }

    /// Looks up the identifier cached for a path prefix.
    pub fn lookup(&self, path: &str) -> Option<FileId> {
        self.forward.get(path).copied()
    }

    /// Records a path prefix resolution, displacing any stale mapping
    /// in either direction.
    pub fn insert(&mut self, path: &str, id: FileId) {
        if let Some(old_id) = self.forward.insert(path.to_string(), id) {
            if old_id != id {
                self.reverse.remove(&old_id);
            }
        }
        if let Some(old_path) = self.reverse.insert(id, path.to_string()) {
            if old_path != path {
                self.forward.remove(&old_path);
            }
        }
    }

    /// Removes the entry for `path` and every entry below it.
    pub fn invalidate_subtree(&mut self, path: &str) {
        if let Some(id) = self.forward.remove(path) {
            self.reverse.remove(&id);
        }
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        let descendants: Vec<String> = self
            .forward
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in descendants {
            if let Some(id) = self.forward.remove(&key) {
                self.reverse.remove(&id);
            }
        }
    }

    /// Removes the subtree rooted at whatever path `id` is cached under.
    pub fn invalidate_id(&mut self, id: &FileId) {
        if let Some(path) = self.reverse.get(id).cloned() {
            self.invalidate_subtree(&path);
        }
    }

    /// Number of cached prefixes.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> FileId {
        FileId::random()
    }

    #[test]
    fn test_lookup_after_insert() {
        let mut cache = PathCache::new();
        let a = id();
        cache.insert("/docs", a);
        assert_eq!(cache.lookup("/docs"), Some(a));
        assert_eq!(cache.lookup("/doc"), None);
    }

    #[test]
    fn test_bidirectional_consistency_on_remap() {
        let mut cache = PathCache::new();
        let a = id();
        let b = id();

        cache.insert("/docs", a);
        // Same path, new identifier: the old reverse entry must go.
        cache.insert("/docs", b);
        assert_eq!(cache.lookup("/docs"), Some(b));
        cache.invalidate_id(&a);
        assert_eq!(cache.lookup("/docs"), Some(b));

        // Same identifier, new path: the old forward entry must go.
        cache.insert("/archive", b);
        assert_eq!(cache.lookup("/docs"), None);
        assert_eq!(cache.lookup("/archive"), Some(b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_subtree_removes_descendants() {
        let mut cache = PathCache::new();
        cache.insert("/a", id());
        cache.insert("/a/b", id());
        cache.insert("/a/b/c", id());
        cache.insert("/other", id());

        cache.invalidate_subtree("/a");
        assert_eq!(cache.lookup("/a"), None);
        assert_eq!(cache.lookup("/a/b"), None);
        assert_eq!(cache.lookup("/a/b/c"), None);
        assert!(cache.lookup("/other").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_subtree_is_path_aware() {
        let mut cache = PathCache::new();
        let sibling = id();
        // "/ab" shares a string prefix with "/a" but is a sibling.
        cache.insert("/ab", sibling);
        cache.insert("/a", id());
        cache.insert("/a/x", id());

        cache.invalidate_subtree("/a");
        assert_eq!(cache.lookup("/ab"), Some(sibling));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_id_routes_through_reverse_map() {
        let mut cache = PathCache::new();
        let a = id();
        cache.insert("/d1", a);
        cache.insert("/d1/sub", id());

        cache.invalidate_id(&a);
        assert!(cache.is_empty());

        // Unknown identifiers are a no-op.
        cache.invalidate_id(&id());
    }

    #[test]
    fn test_reverse_entries_follow_forward_removals() {
        let mut cache = PathCache::new();
        let a = id();
        cache.insert("/x", a);
        cache.invalidate_subtree("/x");
        // Re-inserting under a different path must not resurrect "/x".
        cache.insert("/y", a);
        assert_eq!(cache.lookup("/x"), None);
        assert_eq!(cache.lookup("/y"), Some(a));
    }
}
