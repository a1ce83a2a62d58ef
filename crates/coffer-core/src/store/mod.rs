//! Node I/O: materializing and persisting node artifacts.
//!
//! Every logical file is represented on disk by a pair of artifacts
//! keyed by its identifier: the metadata/content artifact and a sibling
//! integrity MAC. The [`NodeIo`] trait is the seam between the open-file
//! core and the storage backend; [`LocalStore`] is the host-directory
//! implementation.

mod artifact;

pub use artifact::{decode_record, encode_record};

use crate::error::{FsError, FsResult};
use crate::id::FileId;
use crate::model::{NodeKind, NodeRecord};
use crate::options::MountOptions;
use ring::hmac;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// Suffix of the integrity artifact.
const MAC_SUFFIX: &str = "mac";

/// Storage statistics forwarded to the host's statfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub max_name_length: u32,
}

/// Storage backend for node artifacts.
///
/// Implementations key everything by identifier; the core never sees
/// artifact paths.
pub trait NodeIo: Send + Sync {
    /// Reads and verifies the artifacts of `id`.
    ///
    /// # Errors
    ///
    /// Not-found if the artifact is absent; corruption if integrity
    /// verification fails or the artifact does not parse.
    fn load(&self, id: &FileId) -> FsResult<NodeRecord>;

    /// Creates fresh artifacts for `id` holding a zero-initialized record.
    ///
    /// # Errors
    ///
    /// Already-exists if artifacts for `id` are present.
    fn allocate(&self, id: &FileId, kind: NodeKind) -> FsResult<NodeRecord>;

    /// Persists `record` and recomputes the integrity MAC.
    fn save(&self, id: &FileId, record: &NodeRecord) -> FsResult<()>;

    /// Removes both artifacts of `id`.
    fn delete(&self, id: &FileId) -> FsResult<()>;

    /// Whether artifacts for `id` exist.
    fn exists(&self, id: &FileId) -> bool;

    /// Forwards storage statistics.
    fn statfs(&self) -> FsResult<StatFs>;
}

/// Artifact store over a host directory.
///
/// An identifier `I` maps to `<root>/<hex(I)[0..2]>/<hex(I)[2..]>` with
/// the MAC in a `.mac` sibling. The two-level fanout keeps directory
/// sizes bounded on large mounts.
pub struct LocalStore {
    root: PathBuf,
    mac_key: hmac::Key,
    verify: bool,
    block_size: u32,
}

impl LocalStore {
    /// Opens (or initializes) a store at the root named by `options`.
    pub fn new(options: &MountOptions) -> FsResult<Self> {
        fs::create_dir_all(&options.root)?;
        Ok(LocalStore {
            root: options.root.clone(),
            mac_key: hmac::Key::new(hmac::HMAC_SHA256, options.master_key.as_bytes()),
            verify: options.is_auth_enabled(),
            block_size: options.block_size,
        })
    }

    fn artifact_path(&self, id: &FileId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn mac_path(&self, id: &FileId) -> PathBuf {
        let mut path = self.artifact_path(id);
        path.set_extension(MAC_SUFFIX);
        path
    }

    fn write_artifact(&self, id: &FileId, bytes: &[u8]) -> FsResult<()> {
        let path = self.artifact_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        let tag = hmac::sign(&self.mac_key, bytes);
        fs::write(self.mac_path(id), tag.as_ref())?;
        Ok(())
    }
}

impl NodeIo for LocalStore {
    fn load(&self, id: &FileId) -> FsResult<NodeRecord> {
        let bytes = match fs::read(self.artifact_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(format!("node {id}")));
            }
            Err(e) => return Err(e.into()),
        };
        if self.verify {
            let tag = match fs::read(self.mac_path(id)) {
                Ok(tag) => tag,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(FsError::Corruption(format!(
                        "node {id}: integrity artifact missing"
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            hmac::verify(&self.mac_key, &bytes, &tag)
                .map_err(|_| FsError::Corruption(format!("node {id}: MAC mismatch")))?;
        }
        decode_record(id, &bytes)
    }

    fn allocate(&self, id: &FileId, kind: NodeKind) -> FsResult<NodeRecord> {
        if self.exists(id) {
            return Err(FsError::AlreadyExists(format!("node {id}")));
        }
        let record = NodeRecord::empty(kind);
        self.write_artifact(id, &encode_record(&record)?)?;
        debug!(id = %id, kind = %kind, "allocated node artifacts");
        Ok(record)
    }

    fn save(&self, id: &FileId, record: &NodeRecord) -> FsResult<()> {
        self.write_artifact(id, &encode_record(record)?)
    }

    fn delete(&self, id: &FileId) -> FsResult<()> {
        match fs::remove_file(self.artifact_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(format!("node {id}")));
            }
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.mac_path(id)) {
            Ok(()) => {}
            // A missing MAC next to a present artifact is tolerated on
            // deletion; the node is going away either way.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(id = %id, "deleted node artifacts");
        Ok(())
    }

    fn exists(&self, id: &FileId) -> bool {
        self.artifact_path(id).exists()
    }

    #[cfg(unix)]
    fn statfs(&self) -> FsResult<StatFs> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| FsError::InvalidArgument("storage root contains NUL".into()))?;
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut vfs) };
        if rc != 0 {
            return Err(FsError::Io(io::Error::last_os_error()));
        }
        Ok(StatFs {
            // Report the mount's logical block size, not the host's.
            block_size: self.block_size,
            blocks: vfs.f_blocks as u64,
            blocks_free: vfs.f_bfree as u64,
            blocks_available: vfs.f_bavail as u64,
            files: vfs.f_files as u64,
            files_free: vfs.f_ffree as u64,
            max_name_length: vfs.f_namemax as u32,
        })
    }

    #[cfg(not(unix))]
    fn statfs(&self) -> FsResult<StatFs> {
        Ok(StatFs {
            block_size: self.block_size,
            ..StatFs::default()
        })
    }
}
