// SPDX-License-Identifier: PMPL-1.0-or-later

//! Response caching, exact dedup and approximate similarity hashing.
//!
//! The pieces are independent: [`MemoryCache`] holds bodies under a byte
//! budget, [`ExactDedup`] rejects byte-identical bodies, and
//! [`SimHasher`]/[`SimilarityIndex`] plus [`MinHasher`]/[`LshIndex`] find
//! near-duplicates. The analyzer composes them.

mod fingerprint;
mod memory;
mod minhash;
mod normalize;
mod similarity;
mod simhash;

pub use fingerprint::{ContentFingerprint, ExactDedup};
pub use memory::{CacheEntry, CacheStats, MemoryCache, MemoryCacheConfig};
pub use minhash::{jaccard_estimate, LshIndex, MinHasher, Signature};
pub use normalize::Normalizer;
pub use similarity::{CachedItem, SimilarityConfig, SimilarityIndex};
pub use simhash::{hamming_distance, majority, similarity, SimHasher, SIMHASH_BITS};
