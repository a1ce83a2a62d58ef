//! Path resolution.
//!
//! Walks plaintext paths to guarded nodes, consulting the path cache
//! for the longest already-resolved prefix and filling it as the walk
//! descends. Also home to the structural operations (create, remove,
//! rename, link) that must keep directory state and cache consistent.

use crate::context::FsContext;
use crate::table::NodeGuard;
use coffer_core::{FileId, FsError, FsResult, NodeKind};
use tracing::{debug, warn};

/// Unicode case folding applied to whole paths on case-insensitive mounts.
pub(crate) fn case_fold(path: &str) -> String {
    path.to_lowercase()
}

fn split_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// The normalized (and, if configured, case-folded) form of a path.
/// This is the key format used by the path cache.
pub(crate) fn canonical_path(ctx: &FsContext, path: &str) -> String {
    let folded;
    let path = if ctx.table.is_case_folded() {
        folded = case_fold(path);
        folded.as_str()
    } else {
        path
    };
    let components = split_components(path);
    if components.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for component in components {
        out.push('/');
        out.push_str(component);
    }
    out
}

/// Opens the parent directory of `path` and returns it with the final
/// component. An empty final component means `path` named the root.
pub(crate) fn open_base_dir<'c>(
    ctx: &'c FsContext,
    path: &str,
) -> FsResult<(NodeGuard<'c>, String)> {
    let folded;
    let path = if ctx.table.is_case_folded() {
        folded = case_fold(path);
        folded.as_str()
    } else {
        path
    };
    let components = split_components(path);
    if components.is_empty() {
        let root = ctx.table.open_as(ctx.root_id, NodeKind::Directory)?;
        return Ok((root, String::new()));
    }

    let mut prefixes = Vec::with_capacity(components.len());
    let mut prefix = String::new();
    for component in &components {
        prefix.push('/');
        prefix.push_str(component);
        prefixes.push(prefix.clone());
    }

    // Skip ahead over the longest cached chain of intermediate prefixes.
    let mut id = ctx.root_id;
    let mut first = 0usize;
    {
        let cache = ctx.path_cache.lock();
        while first + 1 < components.len() {
            match cache.lookup(&prefixes[first]) {
                Some(cached) => {
                    id = cached;
                    first += 1;
                }
                None => break,
            }
        }
    }

    let mut dir = ctx.table.open_as(id, NodeKind::Directory)?;
    for i in first..components.len() - 1 {
        let (next, kind) = dir
            .get_entry(components[i])?
            .ok_or_else(|| FsError::NotFound(prefixes[i].clone()))?;
        if kind != NodeKind::Directory {
            return Err(FsError::NotADirectory(prefixes[i].clone()));
        }
        dir = ctx.table.open_as(next, NodeKind::Directory)?;
        ctx.path_cache.lock().insert(&prefixes[i], next);
    }
    let last = components[components.len() - 1].to_string();
    Ok((dir, last))
}

/// Opens the node named by `path` with its stored kind.
pub(crate) fn open_all<'c>(ctx: &'c FsContext, path: &str) -> FsResult<NodeGuard<'c>> {
    match open_all_opt(ctx, path)? {
        Some(guard) => Ok(guard),
        None => Err(FsError::NotFound(canonical_path(ctx, path))),
    }
}

/// Like [`open_all`] but a missing final component is `Ok(None)`.
///
/// Missing paths dominate stat-heavy workloads; this variant lets the
/// dispatcher answer them without treating the miss as a failure.
pub(crate) fn open_all_opt<'c>(
    ctx: &'c FsContext,
    path: &str,
) -> FsResult<Option<NodeGuard<'c>>> {
    let (dir, last) = open_base_dir(ctx, path)?;
    if last.is_empty() {
        return Ok(Some(dir));
    }
    let Some((id, kind)) = dir.get_entry(&last)? else {
        return Ok(None);
    };
    let node = ctx.table.open_as(id, kind)?;
    Ok(Some(node))
}

/// Creates a node of `kind` at `path` and links it into its parent.
///
/// If linking fails the freshly created node is unlinked before the
/// error propagates, so no reachable artifacts are left behind.
pub(crate) fn create<'c>(
    ctx: &'c FsContext,
    path: &str,
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
) -> FsResult<NodeGuard<'c>> {
    let (dir, last) = open_base_dir(ctx, path)?;
    if last.is_empty() {
        return Err(FsError::AlreadyExists("/".to_string()));
    }
    let id = FileId::random();
    let node = ctx.table.create_as(id, kind)?;
    node.initialize_empty(mode, uid, gid);
    let added = match dir.add_entry(&last, id, kind) {
        Ok(added) => added,
        Err(err) => {
            node.unlink();
            return Err(err);
        }
    };
    if !added {
        node.unlink();
        return Err(FsError::AlreadyExists(canonical_path(ctx, path)));
    }
    Ok(node)
}

/// Removes the entry at `path` and unlinks its node.
///
/// A non-empty directory is refused; its contents are logged to make
/// "why won't this delete" reports diagnosable.
pub(crate) fn remove(ctx: &FsContext, path: &str) -> FsResult<()> {
    let (dir, last) = open_base_dir(ctx, path)?;
    if last.is_empty() {
        return Err(FsError::NotPermitted(
            "cannot remove the root directory".to_string(),
        ));
    }
    let canonical = canonical_path(ctx, path);
    let (id, kind) = dir
        .get_entry(&last)?
        .ok_or_else(|| FsError::NotFound(canonical.clone()))?;
    let node = ctx.table.open_as(id, kind)?;
    if kind == NodeKind::Directory && !node.is_empty_dir()? {
        let mut contents = String::new();
        node.iterate_entries(|name, _, _| {
            contents.push('\n');
            contents.push_str(name);
            true
        })?;
        warn!(
            path = %canonical,
            contents = %contents,
            "refusing to remove non-empty directory"
        );
        return Err(FsError::NotEmpty(canonical));
    }
    dir.remove_entry(&last)?;
    node.unlink();
    ctx.path_cache.lock().invalidate_subtree(&canonical);
    Ok(())
}

/// Best-effort unlink of a node already detached from every directory.
/// The logical tree is consistent whether or not this succeeds.
pub(crate) fn remove_by_id(ctx: &FsContext, id: FileId, kind: NodeKind) {
    match ctx.table.open_as(id, kind) {
        Ok(node) => node.unlink(),
        Err(err) => {
            debug!(id = %id, error = %err, "ignoring unlink failure for detached node");
        }
    }
    ctx.path_cache.lock().invalidate_id(&id);
}

/// Moves the entry at `src` to `dst`, displacing a same-kind target.
pub(crate) fn rename(ctx: &FsContext, src: &str, dst: &str) -> FsResult<()> {
    let (src_dir, src_name) = open_base_dir(ctx, src)?;
    let (dst_dir, dst_name) = open_base_dir(ctx, dst)?;
    if src_name.is_empty() || dst_name.is_empty() {
        return Err(FsError::NotPermitted(
            "cannot rename the root directory".to_string(),
        ));
    }

    let (src_id, src_kind) = src_dir
        .get_entry(&src_name)?
        .ok_or_else(|| FsError::NotFound(canonical_path(ctx, src)))?;
    let dst_entry = dst_dir.get_entry(&dst_name)?;

    if let Some((dst_id, dst_kind)) = dst_entry {
        if dst_id == src_id {
            // Same identifier on both sides: nothing changes, and every
            // cached mapping stays true.
            return Ok(());
        }
        if src_kind != NodeKind::Directory && dst_kind == NodeKind::Directory {
            return Err(FsError::IsADirectory(canonical_path(ctx, dst)));
        }
        if src_kind != dst_kind {
            return Err(FsError::InvalidArgument(format!(
                "rename of a {src_kind} onto a {dst_kind}"
            )));
        }
        dst_dir.remove_entry(&dst_name)?;
    }
    src_dir.remove_entry(&src_name)?;
    if !dst_dir.add_entry(&dst_name, src_id, src_kind)? {
        return Err(FsError::AlreadyExists(canonical_path(ctx, dst)));
    }

    if let Some((dst_id, dst_kind)) = dst_entry {
        remove_by_id(ctx, dst_id, dst_kind);
    }
    ctx.path_cache
        .lock()
        .invalidate_subtree(&canonical_path(ctx, src));
    Ok(())
}

/// Adds a hard link at `dst` to the regular file at `src`.
pub(crate) fn link(ctx: &FsContext, src: &str, dst: &str) -> FsResult<()> {
    let (src_dir, src_name) = open_base_dir(ctx, src)?;
    let (dst_dir, dst_name) = open_base_dir(ctx, dst)?;
    if src_name.is_empty() || dst_name.is_empty() {
        return Err(FsError::NotPermitted("cannot hard-link the root".to_string()));
    }

    let (src_id, src_kind) = src_dir
        .get_entry(&src_name)?
        .ok_or_else(|| FsError::NotFound(canonical_path(ctx, src)))?;
    if dst_dir.get_entry(&dst_name)?.is_some() {
        return Err(FsError::AlreadyExists(canonical_path(ctx, dst)));
    }

    let node = ctx.table.open_as(src_id, src_kind)?;
    if node.kind() != NodeKind::RegularFile {
        return Err(FsError::NotPermitted(
            "hard links require a regular file".to_string(),
        ));
    }
    if !dst_dir.add_entry(&dst_name, src_id, src_kind)? {
        return Err(FsError::AlreadyExists(canonical_path(ctx, dst)));
    }
    node.set_nlink(node.get_nlink() + 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_core::{MasterKey, MountFlags, MountOptions, S_IFDIR, S_IFLNK, S_IFREG};
    use tempfile::TempDir;

    fn new_ctx(flags: MountFlags) -> (TempDir, FsContext) {
        let dir = TempDir::new().unwrap();
        let options = MountOptions::new(dir.path(), MasterKey::random()).flags(flags);
        let ctx = FsContext::new(options).unwrap();
        (dir, ctx)
    }

    fn mkdir(ctx: &FsContext, path: &str) {
        create(ctx, path, NodeKind::Directory, S_IFDIR | 0o755, 0, 0).unwrap();
    }

    fn mkfile(ctx: &FsContext, path: &str, content: &[u8]) {
        let node = create(ctx, path, NodeKind::RegularFile, S_IFREG | 0o644, 0, 0).unwrap();
        node.write(0, content).unwrap();
    }

    #[test]
    fn test_open_base_dir_of_root() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        let (root, last) = open_base_dir(&ctx, "/").unwrap();
        assert!(last.is_empty());
        assert_eq!(root.kind(), NodeKind::Directory);
    }

    #[test]
    fn test_create_then_open_round_trip() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkdir(&ctx, "/docs");
        mkfile(&ctx, "/docs/a.txt", b"hi");

        let node = open_all(&ctx, "/docs/a.txt").unwrap();
        assert_eq!(node.kind(), NodeKind::RegularFile);
        assert_eq!(node.read(0, 2).unwrap(), b"hi");
    }

    #[test]
    fn test_walk_fills_path_cache() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkdir(&ctx, "/a");
        mkdir(&ctx, "/a/b");
        mkfile(&ctx, "/a/b/f", b"x");

        assert!(ctx.path_cache.lock().is_empty());
        open_all(&ctx, "/a/b/f").unwrap();
        let cache = ctx.path_cache.lock();
        assert!(cache.lookup("/a").is_some());
        assert!(cache.lookup("/a/b").is_some());
        // The final component is not a prefix and is never cached.
        assert!(cache.lookup("/a/b/f").is_none());
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        assert!(matches!(
            open_all(&ctx, "/nope"),
            Err(FsError::NotFound(_))
        ));
        assert!(open_all_opt(&ctx, "/nope").unwrap().is_none());
        assert!(matches!(
            open_all(&ctx, "/nope/deeper"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_file_as_intermediate_is_not_a_directory() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkfile(&ctx, "/f", b"");
        assert!(matches!(
            open_all(&ctx, "/f/child"),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_create_duplicate_fails() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkfile(&ctx, "/dup", b"");
        let err = create(&ctx, "/dup", NodeKind::RegularFile, S_IFREG | 0o644, 0, 0).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[test]
    fn test_remove_file_and_invalidate() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkdir(&ctx, "/d");
        mkfile(&ctx, "/d/f", b"x");
        open_all(&ctx, "/d/f").unwrap();

        remove(&ctx, "/d/f").unwrap();
        assert!(open_all_opt(&ctx, "/d/f").unwrap().is_none());
        // The parent prefix survives; nothing under "/d/f" may.
        assert!(ctx.path_cache.lock().lookup("/d").is_some());
    }

    #[test]
    fn test_remove_non_empty_directory_fails() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkdir(&ctx, "/d");
        mkfile(&ctx, "/d/f", b"x");

        assert!(matches!(remove(&ctx, "/d"), Err(FsError::NotEmpty(_))));
        // The directory and its child are intact.
        assert!(open_all(&ctx, "/d/f").is_ok());

        remove(&ctx, "/d/f").unwrap();
        remove(&ctx, "/d").unwrap();
        assert!(open_all_opt(&ctx, "/d").unwrap().is_none());
    }

    #[test]
    fn test_remove_root_is_not_permitted() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        assert!(matches!(remove(&ctx, "/"), Err(FsError::NotPermitted(_))));
    }

    #[test]
    fn test_rename_to_absent_target() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkfile(&ctx, "/old", b"data");
        rename(&ctx, "/old", "/new").unwrap();

        assert!(open_all_opt(&ctx, "/old").unwrap().is_none());
        let node = open_all(&ctx, "/new").unwrap();
        assert_eq!(node.read(0, 4).unwrap(), b"data");
    }

    #[test]
    fn test_rename_displaces_same_kind_target() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkfile(&ctx, "/src", b"source");
        mkfile(&ctx, "/dst", b"target");

        rename(&ctx, "/src", "/dst").unwrap();
        let node = open_all(&ctx, "/dst").unwrap();
        assert_eq!(node.read(0, 6).unwrap(), b"source");
        assert!(open_all_opt(&ctx, "/src").unwrap().is_none());
    }

    #[test]
    fn test_rename_file_onto_directory_fails() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkfile(&ctx, "/f", b"");
        mkdir(&ctx, "/d");
        assert!(matches!(
            rename(&ctx, "/f", "/d"),
            Err(FsError::IsADirectory(_))
        ));
    }

    #[test]
    fn test_rename_kind_mismatch_is_invalid() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkdir(&ctx, "/d");
        mkfile(&ctx, "/f", b"");
        assert!(matches!(
            rename(&ctx, "/d", "/f"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rename_onto_same_identifier_is_noop() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkdir(&ctx, "/d");
        mkfile(&ctx, "/d/f", b"keep");
        let id = open_all(&ctx, "/d/f").unwrap().stat().id;

        rename(&ctx, "/d/f", "/d/f").unwrap();
        let node = open_all(&ctx, "/d/f").unwrap();
        assert_eq!(node.stat().id, id);
        assert_eq!(node.read(0, 4).unwrap(), b"keep");
    }

    #[test]
    fn test_rename_directory_invalidates_src_subtree() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkdir(&ctx, "/d1");
        mkdir(&ctx, "/d1/sub");
        mkfile(&ctx, "/d1/sub/f", b"x");

        // Prime the cache with deep prefixes.
        open_all(&ctx, "/d1/sub/f").unwrap();
        assert!(ctx.path_cache.lock().lookup("/d1/sub").is_some());

        rename(&ctx, "/d1", "/d2").unwrap();
        {
            let cache = ctx.path_cache.lock();
            assert!(cache.lookup("/d1").is_none());
            assert!(cache.lookup("/d1/sub").is_none());
        }
        assert!(open_all_opt(&ctx, "/d1/sub/f").unwrap().is_none());
        assert!(open_all(&ctx, "/d2/sub/f").is_ok());
    }

    #[test]
    fn test_rename_missing_source_fails() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        assert!(matches!(
            rename(&ctx, "/ghost", "/elsewhere"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_link_regular_file_bumps_nlink() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkfile(&ctx, "/f", b"shared");
        link(&ctx, "/f", "/f2").unwrap();

        let a = open_all(&ctx, "/f").unwrap();
        let b = open_all(&ctx, "/f2").unwrap();
        assert_eq!(a.stat().id, b.stat().id);
        assert_eq!(a.get_nlink(), 2);
    }

    #[test]
    fn test_link_non_regular_is_not_permitted() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        let node = create(&ctx, "/s", NodeKind::Symlink, S_IFLNK | 0o755, 0, 0).unwrap();
        node.set_link_target("t").unwrap();
        drop(node);

        assert!(matches!(
            link(&ctx, "/s", "/s2"),
            Err(FsError::NotPermitted(_))
        ));
        mkdir(&ctx, "/d");
        assert!(matches!(
            link(&ctx, "/d", "/d2"),
            Err(FsError::NotPermitted(_))
        ));
    }

    #[test]
    fn test_link_existing_target_fails() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        mkfile(&ctx, "/a", b"");
        mkfile(&ctx, "/b", b"");
        assert!(matches!(
            link(&ctx, "/a", "/b"),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_case_folded_resolution() {
        let (_dir, ctx) = new_ctx(MountFlags::CASE_FOLD_NAME);
        mkdir(&ctx, "/Docs");
        mkfile(&ctx, "/Docs/Readme.TXT", b"hi");

        let a = open_all(&ctx, "/docs/readme.txt").unwrap();
        let b = open_all(&ctx, "/DOCS/README.txt").unwrap();
        assert_eq!(a.stat().id, b.stat().id);
    }

    #[test]
    fn test_canonical_path_normalizes() {
        let (_dir, ctx) = new_ctx(MountFlags::empty());
        assert_eq!(canonical_path(&ctx, "/a//b/"), "/a/b");
        assert_eq!(canonical_path(&ctx, ""), "/");
        assert_eq!(canonical_path(&ctx, "/"), "/");
    }
}
