//! Stable identifiers for logical files.
//!
//! Every logical file in a mount is named by a 16-byte identifier drawn
//! from the operating system RNG at creation time. Identifiers are the
//! hashing and equality key everywhere in the filesystem: the open-file
//! table deduplicates by identifier, and the on-disk store derives
//! artifact paths from the hex form.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a file identifier in bytes.
pub const ID_LENGTH: usize = 16;

/// A 16-byte opaque identifier naming one logical file.
///
/// Identifiers compare byte-wise and are globally unique within a mount
/// (collision probability of 128-bit random values is negligible).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId([u8; ID_LENGTH]);

impl FileId {
    /// The identifier of the root directory (all zero bytes).
    pub const ROOT: FileId = FileId([0u8; ID_LENGTH]);

    /// Generates a fresh identifier from the operating system RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        FileId(bytes)
    }

    /// Constructs an identifier from raw bytes.
    pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        FileId(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Returns the lower-case hex form used for artifact naming.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(ID_LENGTH * 2);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.to_hex())
    }
}
