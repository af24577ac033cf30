// SPDX-License-Identifier: PMPL-1.0-or-later

//! MinHash signatures and a banded LSH index for Jaccard near-duplicates.

use super::simhash::{mix64, shingle_hash, shingles};
use crate::error::{EngineError, EngineResult};
use log::warn;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::{SystemTime, UNIX_EPOCH};

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

pub type Signature = Vec<u64>;

#[derive(Debug, Clone)]
pub struct MinHasher {
    shingle_size: usize,
    seeds: Vec<u64>,
}

impl MinHasher {
    /// `k` permutations seeded from the OS entropy source.
    pub fn new(k: usize, shingle_size: usize) -> EngineResult<Self> {
        let mut buf = [0u8; 8];
        let seed = match getrandom::getrandom(&mut buf) {
            Ok(()) => u64::from_le_bytes(buf),
            Err(err) => {
                warn!("getrandom failed ({}), seeding minhash from the clock", err);
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(GOLDEN_GAMMA)
            }
        };
        Self::with_seed(k, shingle_size, seed)
    }

    /// Deterministic permutations; two hashers with the same seed produce
    /// comparable signatures.
    pub fn with_seed(k: usize, shingle_size: usize, seed: u64) -> EngineResult<Self> {
        if k == 0 {
            return Err(EngineError::invalid("minhash signature length must be > 0"));
        }
        if shingle_size == 0 {
            return Err(EngineError::invalid("minhash shingle size must be > 0"));
        }
        let mut state = seed;
        let seeds = (0..k)
            .map(|_| {
                state = state.wrapping_add(GOLDEN_GAMMA);
                mix64(state)
            })
            .collect();
        Ok(Self {
            shingle_size,
            seeds,
        })
    }

    pub fn k(&self) -> usize {
        self.seeds.len()
    }

    /// Minimum of each permuted shingle hash. Empty input yields all
    /// `u64::MAX`, which matches nothing but another empty input.
    pub fn signature(&self, data: &[u8]) -> Signature {
        let mut signature = vec![u64::MAX; self.seeds.len()];
        let unique: HashSet<u64> = shingles(data, self.shingle_size)
            .map(shingle_hash)
            .collect();
        for h in unique {
            for (slot, seed) in signature.iter_mut().zip(&self.seeds) {
                let permuted = mix64(h ^ seed);
                if permuted < *slot {
                    *slot = permuted;
                }
            }
        }
        signature
    }

    pub fn signature_batch<B>(&self, items: &[B]) -> Vec<Signature>
    where
        B: AsRef<[u8]> + Sync,
    {
        items
            .par_iter()
            .map(|item| self.signature(item.as_ref()))
            .collect()
    }
}

/// Fraction of agreeing positions, estimating Jaccard similarity.
pub fn jaccard_estimate(a: &[u64], b: &[u64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let same = a.iter().zip(b).filter(|(x, y)| x == y).count();
    same as f64 / a.len() as f64
}

fn band_key(band: usize, rows: &[u64]) -> u64 {
    rows.iter()
        .fold(mix64(band as u64 ^ GOLDEN_GAMMA), |acc, value| mix64(acc ^ value))
}

struct LshTables<K> {
    bands: Vec<HashMap<u64, Vec<K>>>,
    signatures: HashMap<K, Signature>,
    order: VecDeque<K>,
}

/// Banded locality-sensitive index. Two signatures are candidates iff at
/// least one band of `rows` values hashes to the same bucket.
pub struct LshIndex<K> {
    bands: usize,
    rows: usize,
    max_items: usize,
    tables: RwLock<LshTables<K>>,
}

impl<K> LshIndex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(bands: usize, rows: usize, max_items: usize) -> EngineResult<Self> {
        if bands == 0 || rows == 0 {
            return Err(EngineError::invalid("lsh bands and rows must be > 0"));
        }
        if max_items == 0 {
            return Err(EngineError::invalid("lsh max_items must be > 0"));
        }
        Ok(Self {
            bands,
            rows,
            max_items,
            tables: RwLock::new(LshTables {
                bands: (0..bands).map(|_| HashMap::new()).collect(),
                signatures: HashMap::new(),
                order: VecDeque::new(),
            }),
        })
    }

    /// Index sized for `hasher`; fails unless `bands` divides its `k`.
    pub fn for_hasher(hasher: &MinHasher, bands: usize, max_items: usize) -> EngineResult<Self> {
        if bands == 0 || hasher.k() % bands != 0 {
            return Err(EngineError::invalid(format!(
                "lsh bands ({}) must divide the signature length ({})",
                bands,
                hasher.k()
            )));
        }
        Self::new(bands, hasher.k() / bands, max_items)
    }

    pub fn signature_len(&self) -> usize {
        self.bands * self.rows
    }

    fn check(&self, signature: &[u64]) -> EngineResult<()> {
        if signature.len() != self.signature_len() {
            return Err(EngineError::invalid(format!(
                "signature length {} does not match bands * rows = {}",
                signature.len(),
                self.signature_len()
            )));
        }
        Ok(())
    }

    fn band_keys(&self, signature: &[u64]) -> Vec<u64> {
        signature
            .chunks(self.rows)
            .enumerate()
            .map(|(band, rows)| band_key(band, rows))
            .collect()
    }

    /// Adds or replaces `id`, evicting the oldest entries past `max_items`.
    pub fn insert(&self, id: K, signature: Signature) -> EngineResult<()> {
        self.check(&signature)?;
        let keys = self.band_keys(&signature);
        let mut tables = self.tables.write();
        Self::unlink(&mut tables, &id, self.rows);
        while tables.signatures.len() >= self.max_items {
            let Some(oldest) = tables.order.pop_front() else { break };
            Self::detach(&mut tables, &oldest, self.rows);
        }
        for (band, key) in keys.into_iter().enumerate() {
            tables.bands[band].entry(key).or_default().push(id.clone());
        }
        tables.order.push_back(id.clone());
        tables.signatures.insert(id, signature);
        Ok(())
    }

    fn unlink(tables: &mut LshTables<K>, id: &K, rows: usize) -> bool {
        if !Self::detach(tables, id, rows) {
            return false;
        }
        if let Some(pos) = tables.order.iter().position(|member| member == id) {
            tables.order.remove(pos);
        }
        true
    }

    /// Removes `id` from the signature map and band buckets. The caller
    /// owns its `order` slot.
    fn detach(tables: &mut LshTables<K>, id: &K, rows: usize) -> bool {
        let Some(signature) = tables.signatures.remove(id) else {
            return false;
        };
        for (band, chunk) in signature.chunks(rows).enumerate() {
            let key = band_key(band, chunk);
            if let Some(bucket) = tables.bands[band].get_mut(&key) {
                bucket.retain(|member| member != id);
                if bucket.is_empty() {
                    tables.bands[band].remove(&key);
                }
            }
        }
        true
    }

    pub fn remove(&self, id: &K) -> bool {
        Self::unlink(&mut self.tables.write(), id, self.rows)
    }

    /// Every stored id sharing at least one band bucket with `signature`.
    pub fn candidates(&self, signature: &[u64]) -> EngineResult<Vec<K>> {
        self.check(signature)?;
        let tables = self.tables.read();
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for (band, key) in self.band_keys(signature).into_iter().enumerate() {
            if let Some(bucket) = tables.bands[band].get(&key) {
                for id in bucket {
                    if seen.insert(id.clone()) {
                        found.push(id.clone());
                    }
                }
            }
        }
        Ok(found)
    }

    /// Candidates whose estimated Jaccard similarity is at least
    /// `threshold`, most similar first.
    pub fn query(&self, signature: &[u64], threshold: f64) -> EngineResult<Vec<(K, f64)>> {
        let candidates = self.candidates(signature)?;
        let tables = self.tables.read();
        let mut scored: Vec<(K, f64)> = candidates
            .into_iter()
            .filter_map(|id| {
                let stored = tables.signatures.get(&id)?;
                let score = jaccard_estimate(signature, stored);
                (score >= threshold).then_some((id, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored)
    }

    pub fn len(&self) -> usize {
        self.tables.read().signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(words: &[&str]) -> Vec<u8> {
        words.join(" ").into_bytes()
    }

    #[test]
    fn identical_bodies_share_signature() {
        let hasher = MinHasher::with_seed(64, 4, 7).unwrap();
        let a = hasher.signature(b"the quick brown fox jumps over the lazy dog");
        let b = hasher.signature(b"the quick brown fox jumps over the lazy dog");
        assert_eq!(jaccard_estimate(&a, &b), 1.0);
    }

    #[test]
    fn estimate_tracks_overlap() {
        let hasher = MinHasher::with_seed(128, 4, 11).unwrap();
        let words: Vec<String> = (0..200).map(|i| format!("token{}", i)).collect();
        let refs: Vec<&str> = words.iter().map(String::as_str).collect();
        let mut edited = refs.clone();
        edited[100] = "changed";
        let near = jaccard_estimate(
            &hasher.signature(&body(&refs)),
            &hasher.signature(&body(&edited)),
        );
        let far = jaccard_estimate(
            &hasher.signature(&body(&refs)),
            &hasher.signature(b"something else entirely, nothing shared here at all"),
        );
        assert!(near > 0.8, "near {}", near);
        assert!(far < 0.2, "far {}", far);
    }

    #[test]
    fn same_seed_same_permutations() {
        let a = MinHasher::with_seed(16, 4, 99).unwrap();
        let b = MinHasher::with_seed(16, 4, 99).unwrap();
        assert_eq!(a.signature(b"payload"), b.signature(b"payload"));
    }

    #[test]
    fn lsh_finds_near_duplicate() {
        let hasher = MinHasher::with_seed(64, 4, 3).unwrap();
        let index = LshIndex::for_hasher(&hasher, 16, 100).unwrap();
        let page = b"<html><body><h1>Error</h1><p>Invalid parameter id</p></body></html>";
        let other = b"completely unrelated payload with no common structure 1234567890";
        index.insert(1u64, hasher.signature(page)).unwrap();
        index.insert(2u64, hasher.signature(other)).unwrap();

        let hits = index.query(&hasher.signature(page), 0.9).unwrap();
        assert_eq!(hits.first().map(|(id, _)| *id), Some(1));
        assert!(hits.iter().all(|(id, _)| *id != 2));
    }

    #[test]
    fn lsh_rejects_wrong_length() {
        let index: LshIndex<u64> = LshIndex::new(4, 4, 10).unwrap();
        assert!(index.insert(1, vec![0; 15]).is_err());
        let hasher = MinHasher::with_seed(30, 4, 1).unwrap();
        assert!(LshIndex::<u64>::for_hasher(&hasher, 4, 10).is_err());
    }

    #[test]
    fn lsh_is_bounded() {
        let hasher = MinHasher::with_seed(16, 4, 5).unwrap();
        let index = LshIndex::for_hasher(&hasher, 4, 3).unwrap();
        for id in 0..5u64 {
            index
                .insert(id, hasher.signature(format!("body number {}", id).as_bytes()))
                .unwrap();
        }
        assert_eq!(index.len(), 3);
        let sig = hasher.signature(b"body number 0");
        assert!(index.candidates(&sig).unwrap().iter().all(|id| *id >= 2));
        assert!(index.remove(&4));
        assert!(!index.remove(&4));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn lsh_eviction_follows_insertion_order() {
        let hasher = MinHasher::with_seed(16, 4, 7).unwrap();
        let index = LshIndex::for_hasher(&hasher, 4, 3).unwrap();
        let sig = |id: u64| hasher.signature(format!("response body {}", id).as_bytes());
        for id in 0..3u64 {
            index.insert(id, sig(id)).unwrap();
        }
        index.insert(0, sig(0)).unwrap();
        index.insert(3, sig(3)).unwrap();
        assert_eq!(index.len(), 3);
        assert!(!index.remove(&1));
        assert!(index.remove(&0));
        for id in 4..50u64 {
            index.insert(id, sig(id)).unwrap();
        }
        assert_eq!(index.len(), 3);
        assert!(!index.remove(&46));
        assert!(index.remove(&47));
    }
}
