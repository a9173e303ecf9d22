//! Stable key digests.
//!
//! Both halves of the index must agree on a key's representation across
//! processes, so keys are hashed with SHA-256 rather than a per-process
//! hasher.

use sha2::{Digest, Sha256};

/// Number of addressable bits in a digest.
pub const DIGEST_BITS: u16 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyDigest([u8; 32]);

impl KeyDigest {
    pub fn of(key: &str) -> Self {
        let hash = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Bit `i` of the digest, most significant bit of byte 0 first.
    pub fn bit(&self, i: u16) -> bool {
        let byte = self.0[usize::from(i / 8)];
        (byte >> (7 - (i % 8))) & 1 == 1
    }

    /// The `n`th little-endian 64-bit word (0..4).
    pub fn word(&self, n: usize) -> u64 {
        let mut w = [0u8; 8];
        w.copy_from_slice(&self.0[n * 8..n * 8 + 8]);
        u64::from_le_bytes(w)
    }
}
