//! keyplace-index — the compact relocation index.
//!
//! A node that has decided to give keys away trains an index from its
//! `(key, new owner)` decisions and broadcasts it. Receivers can then ask
//! "where did this key go?" without holding the full key list.
//!
//! # Components
//!
//! - **`digest`** — SHA-256 key digests shared by filter and classifier
//! - **`filter`** — Bloom filter used as a "definitely not relocated" check
//! - **`classifier`** — Decision tree over digest bits yielding an owner
//! - **`index`** — `CompactRelocationIndex`: train, lookup, wire form
//!
//! Every trained key classifies to exactly its trained owner. Keys that
//! were never trained are rejected by the filter except for its bounded
//! false-positive rate.

pub mod classifier;
pub mod digest;
pub mod error;
pub mod filter;
pub mod index;

pub use classifier::Classifier;
pub use digest::KeyDigest;
pub use error::{IndexError, IndexResult};
pub use filter::NegativeFilter;
pub use index::{CompactRelocationIndex, IndexStats, Lookup};
