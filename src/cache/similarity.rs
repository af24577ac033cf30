// SPDX-License-Identifier: PMPL-1.0-or-later

//! SimHash bucket index for near-duplicate lookup.
//!
//! The 64-bit hash is split into four 16-bit blocks and each of the first
//! `tables` blocks keys its own bucket table, table 0 being the top block.
//! Two hashes differing in fewer than `tables` bits agree on at least one
//! block, so they always meet in some bucket; a lookup scans only the
//! buckets it lands in.

use super::simhash::{hamming_distance, SIMHASH_BITS};
use crate::error::{EngineError, EngineResult};
use crate::types::TaskId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

const BLOCK_BITS: u32 = 16;
const MAX_TABLES: usize = (SIMHASH_BITS / BLOCK_BITS) as usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub shingle_size: usize,
    /// Hamming distance at or below which two bodies are near-duplicates.
    pub simhash_threshold: u32,
    /// Number of 16-bit bucket tables, 1..=4.
    pub tables: usize,
    pub max_items: usize,
    pub minhash_permutations: usize,
    pub lsh_bands: usize,
    pub lsh_rows: usize,
    pub jaccard_threshold: f64,
    pub dedup_capacity: usize,
    /// Mask dates, tokens and nonces before hashing.
    pub normalize: bool,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            shingle_size: 4,
            simhash_threshold: 3,
            tables: 4,
            max_items: 100_000,
            minhash_permutations: 128,
            lsh_bands: 32,
            lsh_rows: 4,
            jaccard_threshold: 0.8,
            dedup_capacity: 100_000,
            normalize: true,
        }
    }
}

impl SimilarityConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.shingle_size == 0 {
            return Err(EngineError::invalid("similarity shingle_size must be > 0"));
        }
        if !(1..=MAX_TABLES).contains(&self.tables) {
            return Err(EngineError::invalid(format!(
                "similarity tables must be within 1..={}",
                MAX_TABLES
            )));
        }
        if self.simhash_threshold > SIMHASH_BITS {
            return Err(EngineError::invalid("simhash_threshold exceeds 64 bits"));
        }
        if self.max_items == 0 || self.dedup_capacity == 0 {
            return Err(EngineError::invalid(
                "similarity max_items and dedup_capacity must be > 0",
            ));
        }
        if self.minhash_permutations == 0
            || self.lsh_bands * self.lsh_rows != self.minhash_permutations
        {
            return Err(EngineError::invalid(format!(
                "lsh_bands ({}) * lsh_rows ({}) must equal minhash_permutations ({})",
                self.lsh_bands, self.lsh_rows, self.minhash_permutations
            )));
        }
        if !(0.0..=1.0).contains(&self.jaccard_threshold) {
            return Err(EngineError::invalid("jaccard_threshold must be in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedItem {
    pub id: TaskId,
    pub hash: u64,
    pub inserted_at: DateTime<Utc>,
}

struct Tables {
    buckets: Vec<HashMap<u16, Vec<CachedItem>>>,
    items: HashMap<TaskId, u64>,
    order: VecDeque<TaskId>,
}

pub struct SimilarityIndex {
    tables: usize,
    threshold: u32,
    max_items: usize,
    inner: RwLock<Tables>,
}

fn block(hash: u64, table: usize) -> u16 {
    let shift = SIMHASH_BITS - BLOCK_BITS * (table as u32 + 1);
    (hash >> shift) as u16
}

impl SimilarityIndex {
    pub fn new(tables: usize, threshold: u32, max_items: usize) -> EngineResult<Self> {
        if !(1..=MAX_TABLES).contains(&tables) {
            return Err(EngineError::invalid(format!(
                "similarity tables must be within 1..={}",
                MAX_TABLES
            )));
        }
        if max_items == 0 {
            return Err(EngineError::invalid("similarity max_items must be > 0"));
        }
        Ok(Self {
            tables,
            threshold,
            max_items,
            inner: RwLock::new(Tables {
                buckets: (0..tables).map(|_| HashMap::new()).collect(),
                items: HashMap::new(),
                order: VecDeque::new(),
            }),
        })
    }

    pub fn from_config(config: &SimilarityConfig) -> EngineResult<Self> {
        Self::new(config.tables, config.simhash_threshold, config.max_items)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Adds or replaces `id`; the oldest items go first past `max_items`.
    pub fn insert(&self, id: TaskId, hash: u64) {
        let mut inner = self.inner.write();
        Self::unlink(&mut inner, id);
        while inner.items.len() >= self.max_items {
            let Some(oldest) = inner.order.pop_front() else { break };
            Self::detach(&mut inner, oldest);
        }
        let item = CachedItem {
            id,
            hash,
            inserted_at: Utc::now(),
        };
        for table in 0..self.tables {
            inner.buckets[table]
                .entry(block(hash, table))
                .or_default()
                .push(item.clone());
        }
        inner.items.insert(id, hash);
        inner.order.push_back(id);
    }

    fn unlink(inner: &mut Tables, id: TaskId) -> bool {
        if !Self::detach(inner, id) {
            return false;
        }
        if let Some(pos) = inner.order.iter().position(|other| *other == id) {
            inner.order.remove(pos);
        }
        true
    }

    /// Drops `id` from the item map and every bucket, leaving `order` alone.
    fn detach(inner: &mut Tables, id: TaskId) -> bool {
        let Some(hash) = inner.items.remove(&id) else {
            return false;
        };
        for (table, buckets) in inner.buckets.iter_mut().enumerate() {
            let key = block(hash, table);
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.retain(|item| item.id != id);
                if bucket.is_empty() {
                    buckets.remove(&key);
                }
            }
        }
        true
    }

    pub fn remove(&self, id: TaskId) -> bool {
        Self::unlink(&mut self.inner.write(), id)
    }

    /// Items sharing a bucket with `hash` and within `max_distance`,
    /// closest first.
    pub fn find_similar(&self, hash: u64, max_distance: u32) -> Vec<(CachedItem, u32)> {
        let inner = self.inner.read();
        let mut found: HashMap<TaskId, (CachedItem, u32)> = HashMap::new();
        for table in 0..self.tables {
            let Some(bucket) = inner.buckets[table].get(&block(hash, table)) else {
                continue;
            };
            for item in bucket {
                let distance = hamming_distance(hash, item.hash);
                if distance <= max_distance {
                    found
                        .entry(item.id)
                        .or_insert_with(|| (item.clone(), distance));
                }
            }
        }
        let mut found: Vec<_> = found.into_values().collect();
        found.sort_by_key(|(item, distance)| (*distance, item.id));
        found
    }

    /// Closest item within the configured threshold.
    pub fn nearest(&self, hash: u64) -> Option<(CachedItem, u32)> {
        self.find_similar(hash, self.threshold).into_iter().next()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.inner.read().items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_zero_is_top_block() {
        let hash = 0xABCD_0000_0000_1234;
        assert_eq!(block(hash, 0), 0xABCD);
        assert_eq!(block(hash, 3), 0x1234);
    }

    #[test]
    fn near_hash_is_found() {
        let index = SimilarityIndex::new(4, 3, 100).unwrap();
        let base = 0x0123_4567_89AB_CDEF;
        index.insert(1, base);
        index.insert(2, !base);

        // Three flipped bits, one in each of three blocks.
        let probe = base ^ (1 << 63) ^ (1 << 40) ^ (1 << 20);
        let (item, distance) = index.nearest(probe).expect("within threshold");
        assert_eq!(item.id, 1);
        assert_eq!(distance, 3);
        assert!(index.nearest(base ^ 0xFF).is_none());
    }

    #[test]
    fn results_sorted_by_distance() {
        let index = SimilarityIndex::new(4, 8, 100).unwrap();
        index.insert(10, 0xF0);
        index.insert(11, 0xF1);
        index.insert(12, 0xF3);
        let ids: Vec<_> = index
            .find_similar(0xF0, 8)
            .into_iter()
            .map(|(item, _)| item.id)
            .collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn bounded_fifo() {
        let index = SimilarityIndex::new(2, 0, 2).unwrap();
        index.insert(1, 1);
        index.insert(2, 2);
        index.insert(3, 3);
        assert_eq!(index.len(), 2);
        assert!(!index.contains(1));
        assert!(index.find_similar(1, 0).is_empty());
        assert!(index.remove(2));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn reinsert_moves_to_back_of_eviction_order() {
        let index = SimilarityIndex::new(2, 0, 3).unwrap();
        for id in 1..=3 {
            index.insert(id, id);
        }
        index.insert(1, 1);
        index.insert(4, 4);
        index.insert(5, 5);
        assert_eq!(index.len(), 3);
        assert!(index.contains(1));
        assert!(!index.contains(2));
        assert!(!index.contains(3));
        for id in 6..100 {
            index.insert(id, id);
        }
        assert_eq!(index.len(), 3);
        assert!((97..100).all(|id| index.contains(id)));
    }

    #[test]
    fn default_config_is_consistent() {
        SimilarityConfig::default().validate().expect("valid");
        let bad = SimilarityConfig {
            lsh_bands: 10,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
