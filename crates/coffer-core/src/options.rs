//! Mount configuration.
//!
//! A mount is described by a [`MountOptions`] value: the storage root,
//! the master key, a flags bitmask and the block-layer geometry. The
//! recognized flags are deliberately few; anything else belongs to the
//! host command line, which is out of scope for this crate.

use crate::error::{FsError, FsResult};
use crate::key::MasterKey;
use bitflags::bitflags;
use std::path::{Path, PathBuf};

/// Lock file reserved at the storage root. Mount bootstrap creates it;
/// the store never treats it as an artifact.
pub const LOCK_FILENAME: &str = ".cofferfs.lock";

/// Highest on-disk format version this crate understands.
pub const MAX_FORMAT_VERSION: u32 = 3;

bitflags! {
    /// Behavior flags fixed at mount time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Reject every mutating operation with a read-only-filesystem error.
        const READ_ONLY = 1 << 0;
        /// Skip integrity verification when loading node artifacts.
        const NO_AUTHENTICATION = 1 << 1;
        /// Persist timestamp updates into node metadata.
        const STORE_TIME = 1 << 2;
        /// Resolve paths case-insensitively via Unicode case folding.
        const CASE_FOLD_NAME = 1 << 3;
    }
}

/// Configuration for one mount.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// On-disk format version (1, 2 or 3).
    pub version: u32,
    /// Root of the encrypted storage tree.
    pub root: PathBuf,
    /// Master key for the integrity MAC.
    pub master_key: MasterKey,
    /// Behavior flags.
    pub flags: MountFlags,
    /// Block size of the (external) cryptographic block layer.
    pub block_size: u32,
    /// IV size of the (external) cryptographic block layer.
    pub iv_size: u32,
}

impl MountOptions {
    /// Creates options with the current format version and default geometry.
    pub fn new(root: impl AsRef<Path>, master_key: MasterKey) -> Self {
        Self {
            version: MAX_FORMAT_VERSION,
            root: root.as_ref().to_path_buf(),
            master_key,
            flags: MountFlags::empty(),
            block_size: 4096,
            iv_size: 12,
        }
    }

    /// Sets the behavior flags.
    #[must_use]
    pub fn flags(mut self, flags: MountFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the on-disk format version.
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the block size.
    #[must_use]
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the IV size.
    #[must_use]
    pub fn iv_size(mut self, iv_size: u32) -> Self {
        self.iv_size = iv_size;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns invalid-argument for an unsupported format version or a
    /// zero block size.
    pub fn validate(&self) -> FsResult<()> {
        if self.version == 0 || self.version > MAX_FORMAT_VERSION {
            return Err(FsError::InvalidArgument(format!(
                "unsupported format version {} (supported: 1..={MAX_FORMAT_VERSION})",
                self.version
            )));
        }
        if self.block_size == 0 {
            return Err(FsError::InvalidArgument("block size must be nonzero".into()));
        }
        Ok(())
    }

    /// Whether every mutating operation must be rejected.
    pub fn is_readonly(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }

    /// Whether artifact integrity is verified on load.
    pub fn is_auth_enabled(&self) -> bool {
        !self.flags.contains(MountFlags::NO_AUTHENTICATION)
    }

    /// Whether timestamp updates are persisted.
    pub fn is_time_stored(&self) -> bool {
        self.flags.contains(MountFlags::STORE_TIME)
    }

    /// Whether path resolution is case-insensitive.
    pub fn is_case_folded(&self) -> bool {
        self.flags.contains(MountFlags::CASE_FOLD_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> MountOptions {
        MountOptions::new("/tmp/store", MasterKey::from_bytes([0u8; 32]))
    }

    #[test]
    fn test_defaults() {
        let opt = options();
        assert_eq!(opt.version, MAX_FORMAT_VERSION);
        assert_eq!(opt.block_size, 4096);
        assert_eq!(opt.iv_size, 12);
        assert!(opt.flags.is_empty());
        assert!(opt.validate().is_ok());
    }

    #[test]
    fn test_version_validation() {
        assert!(options().version(4).validate().is_err());
        assert!(options().version(0).validate().is_err());
        for version in 1..=MAX_FORMAT_VERSION {
            assert!(options().version(version).validate().is_ok());
        }
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(options().block_size(0).validate().is_err());
    }

    #[test]
    fn test_flag_helpers() {
        let opt = options().flags(MountFlags::READ_ONLY | MountFlags::CASE_FOLD_NAME);
        assert!(opt.is_readonly());
        assert!(opt.is_case_folded());
        assert!(opt.is_auth_enabled());
        assert!(!opt.is_time_stored());

        let opt = options().flags(MountFlags::NO_AUTHENTICATION | MountFlags::STORE_TIME);
        assert!(!opt.is_auth_enabled());
        assert!(opt.is_time_stored());
    }
}
