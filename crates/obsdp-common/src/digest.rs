//! Content digests for published snapshots
//!
//! Digests are computed over a canonical serialization so two snapshots built
//! from the same verbatim content compare equal byte for byte.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Incremental SHA-256 over a sequence of serialized items
#[derive(Default)]
pub struct ContentDigest {
    hasher: Sha256,
    items: u64,
}

impl ContentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one item; items are length-prefixed so boundaries are unambiguous
    pub fn update<T: Serialize>(&mut self, item: &T) -> Result<()> {
        let bytes = serde_json::to_vec(item)?;
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(&bytes);
        self.items += 1;
        Ok(())
    }

    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Digest of raw bytes, used for uploaded archives
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_digest_is_order_sensitive() {
        let mut a = ContentDigest::new();
        a.update(&"first").unwrap();
        a.update(&"second").unwrap();

        let mut b = ContentDigest::new();
        b.update(&"second").unwrap();
        b.update(&"first").unwrap();

        assert_eq!(a.items(), 2);
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_item_boundaries_matter() {
        let mut a = ContentDigest::new();
        a.update(&"ab").unwrap();

        let mut b = ContentDigest::new();
        b.update(&"a").unwrap();
        b.update(&"b").unwrap();

        assert_ne!(a.finalize(), b.finalize());
    }
}
