//! Negative filter — a Bloom filter over key digests.
//!
//! Sized from the expected key count and a target false-positive rate.
//! Bit positions come from double hashing two digest words.
//!
//! Wire form (little-endian):
//!
//! ```text
//! u8  magic 'B' | u8 version | u32 hash_count | u64 bit_count | u64 × words
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::digest::KeyDigest;
use crate::error::{IndexError, IndexResult};

const MAGIC: u8 = b'B';
const VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + 4 + 8;
const MAX_HASHES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegativeFilter {
    bits: Vec<u64>,
    bit_count: u64,
    hash_count: u32,
}

impl NegativeFilter {
    /// Create a filter for `expected` keys at `fp_rate`.
    pub fn with_capacity(expected: usize, fp_rate: f64) -> IndexResult<Self> {
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(IndexError::InvalidParameter(format!(
                "false-positive rate must be in (0, 1), got {fp_rate}"
            )));
        }
        let n = expected.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(64.0);
        let k = ((m / n) * ln2).round().clamp(1.0, f64::from(MAX_HASHES));

        let words = (m as u64).div_ceil(64);
        Ok(Self {
            bits: vec![0u64; words as usize],
            bit_count: words * 64,
            hash_count: k as u32,
        })
    }

    pub fn insert(&mut self, digest: &KeyDigest) {
        for pos in positions(digest, self.bit_count, self.hash_count) {
            self.bits[(pos / 64) as usize] |= 1u64 << (pos % 64);
        }
    }

    /// `false` means the key was definitely never inserted.
    pub fn may_contain(&self, digest: &KeyDigest) -> bool {
        positions(digest, self.bit_count, self.hash_count)
            .all(|pos| self.bits[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.bits.len() * 8);
        buf.put_u8(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u32_le(self.hash_count);
        buf.put_u64_le(self.bit_count);
        for word in &self.bits {
            buf.put_u64_le(*word);
        }
        buf.to_vec()
    }

    pub fn decode(mut bytes: &[u8]) -> IndexResult<Self> {
        if bytes.remaining() < HEADER_LEN {
            return Err(IndexError::decode("filter", "truncated header"));
        }
        if bytes.get_u8() != MAGIC {
            return Err(IndexError::decode("filter", "bad magic"));
        }
        let version = bytes.get_u8();
        if version != VERSION {
            return Err(IndexError::decode("filter", format!("unsupported version {version}")));
        }
        let hash_count = bytes.get_u32_le();
        let bit_count = bytes.get_u64_le();

        if hash_count == 0 || hash_count > MAX_HASHES {
            return Err(IndexError::decode("filter", format!("hash count {hash_count}")));
        }
        if bit_count == 0 || bit_count % 64 != 0 {
            return Err(IndexError::decode("filter", format!("bit count {bit_count}")));
        }
        let words = (bit_count / 64) as usize;
        if bytes.remaining() != words * 8 {
            return Err(IndexError::decode(
                "filter",
                format!("expected {} payload bytes, found {}", words * 8, bytes.remaining()),
            ));
        }

        let bits = (0..words).map(|_| bytes.get_u64_le()).collect();
        Ok(Self {
            bits,
            bit_count,
            hash_count,
        })
    }
}

/// Double-hashed bit positions. Borrows nothing from the filter, so
/// `insert` can write the bit array while iterating.
fn positions(digest: &KeyDigest, bit_count: u64, hash_count: u32) -> impl Iterator<Item = u64> {
    let h1 = digest.word(0);
    let h2 = digest.word(1) | 1;
    (0..u64::from(hash_count)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bit_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests(prefix: &str, n: usize) -> Vec<KeyDigest> {
        (0..n).map(|i| KeyDigest::of(&format!("{prefix}-{i}"))).collect()
    }

    #[test]
    fn sizing_follows_target_rate() {
        let f = NegativeFilter::with_capacity(1000, 0.01).unwrap();
        // ~9.6 bits per key, 7 hashes.
        assert!(f.bit_count() >= 9585 && f.bit_count() < 9585 + 64);
        assert_eq!(f.hash_count(), 7);
    }

    #[test]
    fn rejects_bad_rate() {
        assert!(NegativeFilter::with_capacity(10, 0.0).is_err());
        assert!(NegativeFilter::with_capacity(10, 1.0).is_err());
    }

    #[test]
    fn inserted_keys_always_match() {
        let mut f = NegativeFilter::with_capacity(500, 0.01).unwrap();
        let keys = digests("in", 500);
        for d in &keys {
            f.insert(d);
        }
        assert!(keys.iter().all(|d| f.may_contain(d)));
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut f = NegativeFilter::with_capacity(1000, 0.01).unwrap();
        for d in digests("in", 1000) {
            f.insert(&d);
        }
        let probes = digests("out", 10_000);
        let hits = probes.iter().filter(|d| f.may_contain(d)).count();
        // Expected ~100; allow generous slack for variance.
        assert!(hits < 250, "false positives: {hits}");
    }

    #[test]
    fn insert_sets_exactly_hash_count_bits_or_fewer() {
        let mut f = NegativeFilter::with_capacity(10, 0.01).unwrap();
        let d = KeyDigest::of("only");
        f.insert(&d);
        let set: u32 = f.bits.iter().map(|w| w.count_ones()).sum();
        assert!((1..=f.hash_count()).contains(&set));
        assert!(f.may_contain(&d));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let f = NegativeFilter::with_capacity(0, 0.01).unwrap();
        assert!(digests("any", 100).iter().all(|d| !f.may_contain(d)));
    }

    #[test]
    fn decode_restores_membership() {
        let mut f = NegativeFilter::with_capacity(50, 0.05).unwrap();
        let keys = digests("k", 50);
        for d in &keys {
            f.insert(d);
        }
        let back = NegativeFilter::decode(&f.encode()).unwrap();
        assert_eq!(back, f);
        assert!(keys.iter().all(|d| back.may_contain(d)));
    }

    #[test]
    fn decode_rejects_truncation() {
        let bytes = NegativeFilter::with_capacity(50, 0.05).unwrap().encode();
        assert!(NegativeFilter::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(NegativeFilter::decode(&bytes[..4]).is_err());

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(NegativeFilter::decode(&bad).is_err());
    }
}
