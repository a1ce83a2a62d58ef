//! Master key handling.
//!
//! The master key is derived during mount bootstrap (out of scope here)
//! and handed to the store, which uses it to key the integrity MAC over
//! node artifacts. The key material is wiped from memory on drop.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the master key in bytes.
pub const KEY_LENGTH: usize = 32;

/// The mount's master key.
///
/// Cloneable so that it can be shared between the store and the mount
/// configuration; every copy is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LENGTH]);

impl MasterKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        MasterKey(bytes)
    }

    /// Generates a fresh random key. Used by filesystem creation and tests.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        MasterKey(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.write_str("MasterKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_key_material() {
        let key = MasterKey::from_bytes([0xaa; KEY_LENGTH]);
        let printed = format!("{key:?}");
        assert!(!printed.contains("aa"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let key = MasterKey::from_bytes([7u8; KEY_LENGTH]);
        assert_eq!(key.as_bytes(), &[7u8; KEY_LENGTH]);
    }

    #[test]
    fn test_random_keys_differ() {
        let a = MasterKey::random();
        let b = MasterKey::random();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
