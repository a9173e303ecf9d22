//! Decision-tree classifier over key digest bits.
//!
//! Training splits the sample set on the digest bit with the lowest
//! weighted Gini impurity until every leaf holds a single owner, so each
//! trained key is classified exactly. Only bits that actually separate the
//! samples are chosen, so no leaf is empty.
//!
//! Nodes live in a flat array; the root is node 0 and children always have
//! a larger index than their parent.
//!
//! Wire form (little-endian):
//!
//! ```text
//! u8 magic 'C' | u8 version | u32 node_count | node × node_count
//! node := 0x00 u32 owner                     (leaf)
//!       | 0x01 u16 bit u32 zero u32 one     (split)
//! ```

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::digest::{DIGEST_BITS, KeyDigest};
use crate::error::{IndexError, IndexResult};

const MAGIC: u8 = b'C';
const VERSION: u8 = 1;
const TAG_LEAF: u8 = 0;
const TAG_SPLIT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Leaf { owner: u32 },
    Split { bit: u16, zero: u32, one: u32 },
}

/// A trained sample: the key (kept for error reporting) and its owner.
pub(crate) struct Sample<'a> {
    pub key: &'a str,
    pub digest: KeyDigest,
    pub owner: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classifier {
    nodes: Vec<Node>,
}

impl Classifier {
    pub(crate) fn train(samples: &[Sample<'_>]) -> IndexResult<Self> {
        let mut classifier = Classifier::default();
        if samples.is_empty() {
            return Ok(classifier);
        }
        let all: Vec<usize> = (0..samples.len()).collect();
        classifier.grow(samples, &all)?;
        Ok(classifier)
    }

    fn grow(&mut self, samples: &[Sample<'_>], subset: &[usize]) -> IndexResult<u32> {
        let id = self.nodes.len() as u32;
        let first = &samples[subset[0]];

        if subset.iter().all(|&i| samples[i].owner == first.owner) {
            self.nodes.push(Node::Leaf { owner: first.owner });
            return Ok(id);
        }

        let Some(bit) = best_split(samples, subset) else {
            // Every digest bit agrees yet owners differ.
            let other = subset
                .iter()
                .map(|&i| &samples[i])
                .find(|s| s.owner != first.owner)
                .map(|s| s.key.to_string())
                .unwrap_or_default();
            return Err(IndexError::Collision(first.key.to_string(), other));
        };

        // Placeholder, patched once both children exist.
        self.nodes.push(Node::Leaf { owner: 0 });

        let (ones, zeros): (Vec<usize>, Vec<usize>) =
            subset.iter().copied().partition(|&i| samples[i].digest.bit(bit));
        let zero = self.grow(samples, &zeros)?;
        let one = self.grow(samples, &ones)?;
        self.nodes[id as usize] = Node::Split { bit, zero, one };
        Ok(id)
    }

    /// Owner the digest classifies to, or `None` for an untrained classifier.
    pub fn classify(&self, digest: &KeyDigest) -> Option<u32> {
        let mut at = 0usize;
        // Children are strictly after parents, so this walk terminates.
        loop {
            match self.nodes.get(at)? {
                Node::Leaf { owner } => return Some(*owner),
                Node::Split { bit, zero, one } => {
                    let next = if digest.bit(*bit) { *one } else { *zero };
                    at = next as usize;
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf { .. })).count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match nodes[at] {
                Node::Leaf { .. } => 0,
                Node::Split { zero, one, .. } => {
                    1 + walk(nodes, zero as usize).max(walk(nodes, one as usize))
                }
            }
        }
        if self.nodes.is_empty() { 0 } else { walk(&self.nodes, 0) }
    }

    /// One rule per leaf: the bit path leading to it and the owner.
    pub fn rules(&self) -> Vec<String> {
        fn walk(nodes: &[Node], at: usize, path: &mut Vec<String>, out: &mut Vec<String>) {
            match nodes[at] {
                Node::Leaf { owner } => {
                    let cond = if path.is_empty() {
                        "*".to_string()
                    } else {
                        path.join(" & ")
                    };
                    out.push(format!("{cond} -> {owner}"));
                }
                Node::Split { bit, zero, one } => {
                    path.push(format!("b{bit}=0"));
                    walk(nodes, zero as usize, path, out);
                    path.pop();
                    path.push(format!("b{bit}=1"));
                    walk(nodes, one as usize, path, out);
                    path.pop();
                }
            }
        }
        let mut out = Vec::new();
        if !self.nodes.is_empty() {
            walk(&self.nodes, 0, &mut Vec::new(), &mut out);
        }
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(6 + self.nodes.len() * 11);
        buf.put_u8(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u32_le(self.nodes.len() as u32);
        for node in &self.nodes {
            match *node {
                Node::Leaf { owner } => {
                    buf.put_u8(TAG_LEAF);
                    buf.put_u32_le(owner);
                }
                Node::Split { bit, zero, one } => {
                    buf.put_u8(TAG_SPLIT);
                    buf.put_u16_le(bit);
                    buf.put_u32_le(zero);
                    buf.put_u32_le(one);
                }
            }
        }
        buf.to_vec()
    }

    pub fn decode(mut bytes: &[u8]) -> IndexResult<Self> {
        if bytes.remaining() < 6 {
            return Err(IndexError::decode("classifier", "truncated header"));
        }
        if bytes.get_u8() != MAGIC {
            return Err(IndexError::decode("classifier", "bad magic"));
        }
        let version = bytes.get_u8();
        if version != VERSION {
            return Err(IndexError::decode("classifier", format!("unsupported version {version}")));
        }
        let count = bytes.get_u32_le() as usize;

        let mut nodes = Vec::with_capacity(count.min(bytes.remaining()));
        for id in 0..count {
            if bytes.remaining() < 1 {
                return Err(IndexError::decode("classifier", format!("truncated at node {id}")));
            }
            let node = match bytes.get_u8() {
                TAG_LEAF => {
                    if bytes.remaining() < 4 {
                        return Err(IndexError::decode("classifier", format!("truncated leaf {id}")));
                    }
                    Node::Leaf { owner: bytes.get_u32_le() }
                }
                TAG_SPLIT => {
                    if bytes.remaining() < 10 {
                        return Err(IndexError::decode("classifier", format!("truncated split {id}")));
                    }
                    let bit = bytes.get_u16_le();
                    let zero = bytes.get_u32_le();
                    let one = bytes.get_u32_le();
                    let in_order = |child: u32| (child as usize) > id && (child as usize) < count;
                    if bit >= DIGEST_BITS || !in_order(zero) || !in_order(one) {
                        return Err(IndexError::decode("classifier", format!("invalid split {id}")));
                    }
                    Node::Split { bit, zero, one }
                }
                tag => {
                    return Err(IndexError::decode("classifier", format!("unknown node tag {tag}")));
                }
            };
            nodes.push(node);
        }
        if bytes.has_remaining() {
            return Err(IndexError::decode("classifier", "trailing bytes"));
        }
        Ok(Self { nodes })
    }
}

/// The digest bit with the lowest weighted Gini impurity that leaves both
/// sides non-empty. Ties go to the lowest bit.
fn best_split(samples: &[Sample<'_>], subset: &[usize]) -> Option<u16> {
    let mut best: Option<(f64, u16)> = None;
    for bit in 0..DIGEST_BITS {
        let mut zeros: HashMap<u32, usize> = HashMap::new();
        let mut ones: HashMap<u32, usize> = HashMap::new();
        for &i in subset {
            let side = if samples[i].digest.bit(bit) { &mut ones } else { &mut zeros };
            *side.entry(samples[i].owner).or_insert(0) += 1;
        }
        let n0: usize = zeros.values().sum();
        let n1: usize = ones.values().sum();
        if n0 == 0 || n1 == 0 {
            continue;
        }
        let score = n0 as f64 * gini(&zeros, n0) + n1 as f64 * gini(&ones, n1);
        if best.is_none_or(|(s, _)| score < s) {
            best = Some((score, bit));
        }
    }
    best.map(|(_, bit)| bit)
}

fn gini(counts: &HashMap<u32, usize>, total: usize) -> f64 {
    let total = total as f64;
    1.0 - counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            p * p
        })
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples<'a>(keys: &'a [String], owners: usize) -> Vec<Sample<'a>> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| Sample {
                key: k,
                digest: KeyDigest::of(k),
                owner: (i % owners) as u32,
            })
            .collect()
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{i}")).collect()
    }

    #[test]
    fn single_owner_is_one_leaf() {
        let keys = keys(20);
        let c = Classifier::train(&samples(&keys, 1)).unwrap();
        assert_eq!(c.node_count(), 1);
        assert_eq!(c.depth(), 0);
        assert_eq!(c.classify(&KeyDigest::of("anything")), Some(0));
        assert_eq!(c.rules(), vec!["* -> 0".to_string()]);
    }

    #[test]
    fn every_trained_key_classifies_exactly() {
        let keys = keys(400);
        let s = samples(&keys, 5);
        let c = Classifier::train(&s).unwrap();
        for sample in &s {
            assert_eq!(c.classify(&sample.digest), Some(sample.owner), "key {}", sample.key);
        }
        assert_eq!(c.leaf_count(), c.node_count() / 2 + 1);
    }

    #[test]
    fn untrained_classifier_yields_none() {
        let c = Classifier::train(&[]).unwrap();
        assert!(c.is_empty());
        assert_eq!(c.classify(&KeyDigest::of("k")), None);
        assert!(c.rules().is_empty());
    }

    #[test]
    fn identical_digests_with_different_owners_collide() {
        let d = KeyDigest::of("same");
        let s = vec![
            Sample { key: "a", digest: d, owner: 0 },
            Sample { key: "b", digest: d, owner: 1 },
        ];
        let err = Classifier::train(&s).unwrap_err();
        assert!(matches!(err, IndexError::Collision(a, b) if a == "a" && b == "b"));
    }

    #[test]
    fn decode_restores_tree() {
        let keys = keys(64);
        let c = Classifier::train(&samples(&keys, 3)).unwrap();
        let back = Classifier::decode(&c.encode()).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn decode_rejects_backward_children() {
        // Header + one split pointing at itself.
        let mut bytes = vec![MAGIC, VERSION];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(TAG_SPLIT);
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(Classifier::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let keys = keys(4);
        let mut bytes = Classifier::train(&samples(&keys, 2)).unwrap().encode();
        bytes.push(0);
        assert!(Classifier::decode(&bytes).is_err());
    }
}
