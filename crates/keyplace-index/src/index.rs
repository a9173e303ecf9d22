//! Compact relocation index — filter and classifier trained together.

use std::collections::HashMap;

use tracing::debug;

use crate::classifier::{Classifier, Sample};
use crate::digest::KeyDigest;
use crate::error::{IndexError, IndexResult};
use crate::filter::NegativeFilter;

/// Result of asking an index where a key went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The key moves to the member at this index.
    Relocated(usize),
    NotRelocated,
}

/// Size figures for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub trained_keys: usize,
    pub filter_bits: u64,
    pub hash_count: u32,
    pub node_count: usize,
    pub depth: usize,
    pub encoded_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactRelocationIndex {
    filter: NegativeFilter,
    classifier: Classifier,
    trained_keys: usize,
}

impl CompactRelocationIndex {
    /// Train from a node's relocation decisions.
    ///
    /// If a key appears more than once, the last decision wins.
    pub fn train(decisions: &[(String, usize)], fp_rate: f64) -> IndexResult<Self> {
        let mut latest: HashMap<&str, usize> = HashMap::with_capacity(decisions.len());
        for (key, owner) in decisions {
            latest.insert(key.as_str(), *owner);
        }

        let mut samples = Vec::with_capacity(latest.len());
        for (key, owner) in latest {
            let owner = u32::try_from(owner).map_err(|_| IndexError::OwnerOutOfRange(owner))?;
            samples.push(Sample {
                key,
                digest: KeyDigest::of(key),
                owner,
            });
        }
        // Deterministic tree shape for a given decision set.
        samples.sort_by(|a, b| a.key.cmp(b.key));

        let mut filter = NegativeFilter::with_capacity(samples.len(), fp_rate)?;
        for s in &samples {
            filter.insert(&s.digest);
        }
        let classifier = Classifier::train(&samples)?;

        let index = Self {
            filter,
            classifier,
            trained_keys: samples.len(),
        };
        debug!(
            keys = index.trained_keys,
            nodes = index.classifier.node_count(),
            depth = index.classifier.depth(),
            filter_bits = index.filter.bit_count(),
            "relocation index trained"
        );
        Ok(index)
    }

    pub fn lookup(&self, key: &str) -> Lookup {
        let digest = KeyDigest::of(key);
        if !self.filter.may_contain(&digest) {
            return Lookup::NotRelocated;
        }
        match self.classifier.classify(&digest) {
            Some(owner) => Lookup::Relocated(owner as usize),
            None => Lookup::NotRelocated,
        }
    }

    pub fn filter(&self) -> &NegativeFilter {
        &self.filter
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Wire form: `(filter bytes, classifier bytes)`.
    pub fn encode(&self) -> (Vec<u8>, Vec<u8>) {
        (self.filter.encode(), self.classifier.encode())
    }

    /// Rebuild a received index without retraining.
    ///
    /// The trained key count is not carried on the wire; decoded indices
    /// report the classifier's leaf count in its place.
    pub fn decode(filter: &[u8], classifier: &[u8]) -> IndexResult<Self> {
        let filter = NegativeFilter::decode(filter)?;
        let classifier = Classifier::decode(classifier)?;
        let trained_keys = classifier.leaf_count();
        Ok(Self {
            filter,
            classifier,
            trained_keys,
        })
    }

    pub fn stats(&self) -> IndexStats {
        let (f, c) = self.encode();
        IndexStats {
            trained_keys: self.trained_keys,
            filter_bits: self.filter.bit_count(),
            hash_count: self.filter.hash_count(),
            node_count: self.classifier.node_count(),
            depth: self.classifier.depth(),
            encoded_len: f.len() + c.len(),
        }
    }

    /// Human-readable rule listing, one line per classifier leaf.
    pub fn describe(&self) -> String {
        self.classifier.rules().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decisions(n: usize, owners: usize) -> Vec<(String, usize)> {
        (0..n).map(|i| (format!("user:{i}"), i % owners)).collect()
    }

    #[test]
    fn no_false_negatives() {
        let d = decisions(1500, 4);
        let index = CompactRelocationIndex::train(&d, 0.01).unwrap();
        for (key, owner) in &d {
            assert_eq!(index.lookup(key), Lookup::Relocated(*owner), "key {key}");
        }
    }

    #[test]
    fn untrained_keys_are_mostly_not_relocated() {
        let index = CompactRelocationIndex::train(&decisions(1000, 3), 0.01).unwrap();
        let misses = (0..10_000)
            .filter(|i| index.lookup(&format!("other:{i}")) == Lookup::NotRelocated)
            .count();
        // At least 1 - fp_rate with generous variance slack.
        assert!(misses >= 9_750, "not relocated: {misses}");
    }

    #[test]
    fn empty_decision_list_relocates_nothing() {
        let index = CompactRelocationIndex::train(&[], 0.01).unwrap();
        assert_eq!(index.lookup("k1"), Lookup::NotRelocated);
        assert_eq!(index.stats().trained_keys, 0);
        assert_eq!(index.describe(), "");
    }

    #[test]
    fn last_duplicate_decision_wins() {
        let d = vec![("k".to_string(), 1), ("j".to_string(), 0), ("k".to_string(), 2)];
        let index = CompactRelocationIndex::train(&d, 0.01).unwrap();
        assert_eq!(index.lookup("k"), Lookup::Relocated(2));
        assert_eq!(index.lookup("j"), Lookup::Relocated(0));
        assert_eq!(index.stats().trained_keys, 2);
    }

    #[test]
    fn decoded_index_answers_like_the_original() {
        let d = decisions(300, 3);
        let index = CompactRelocationIndex::train(&d, 0.02).unwrap();
        let (f, c) = index.encode();
        let back = CompactRelocationIndex::decode(&f, &c).unwrap();
        for (key, owner) in &d {
            assert_eq!(back.lookup(key), Lookup::Relocated(*owner));
        }
        for i in 0..200 {
            let key = format!("probe:{i}");
            assert_eq!(back.lookup(&key), index.lookup(&key));
        }
    }

    #[test]
    fn wire_form_is_independent_of_key_length() {
        let short: Vec<_> = (0..200).map(|i| (format!("{i}"), i % 2)).collect();
        let long: Vec<_> = (0..200).map(|i| (format!("{i}:{}", "x".repeat(500)), i % 2)).collect();
        let a = CompactRelocationIndex::train(&short, 0.01).unwrap().stats();
        let b = CompactRelocationIndex::train(&long, 0.01).unwrap().stats();
        assert_eq!(a.filter_bits, b.filter_bits);
        assert!(b.encoded_len < 200 * 500);
    }

    #[test]
    fn bad_fp_rate_is_rejected() {
        let err = CompactRelocationIndex::train(&decisions(10, 2), 1.5).unwrap_err();
        assert!(matches!(err, IndexError::InvalidParameter(_)));
    }

    #[test]
    fn describe_lists_every_leaf() {
        let index = CompactRelocationIndex::train(&decisions(10, 2), 0.01).unwrap();
        let rules = index.describe();
        assert_eq!(rules.lines().count(), index.classifier().leaf_count());
        assert!(rules.lines().all(|l| l.ends_with("-> 0") || l.ends_with("-> 1")));
    }
}
