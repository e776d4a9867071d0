//! Block content hashes
//!
//! Every non-zero block carries the MD5 of its plaintext payload, persisted
//! in object metadata and used for conditional reads and integrity checks.
//! All-zero blocks are represented by object absence and have no hash.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// MD5 content hash of a plaintext block payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash([u8; 16]);

impl BlockHash {
    /// Compute the hash of a payload
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Wrap raw digest bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering, as stored in object metadata and ETags
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32-character hex rendering
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| Error::integrity(format!("malformed content hash {s:?}: {e}")))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| Error::integrity(format!("content hash {s:?} has wrong length")))?;
        Ok(Self(bytes))
    }

    /// Check a payload against this hash
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl std::fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // RFC 1321 test vector
        let h = BlockHash::compute(b"abc");
        assert_eq!(h.to_hex(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_hex_round_trip() {
        let h = BlockHash::compute(b"some block payload");
        let parsed = BlockHash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(BlockHash::from_hex("zz").is_err());
        assert!(BlockHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_matches() {
        let h = BlockHash::compute(b"payload");
        assert!(h.matches(b"payload"));
        assert!(!h.matches(b"payloae"));
    }
}
