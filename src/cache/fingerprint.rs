// SPDX-License-Identifier: PMPL-1.0-or-later

//! Exact content fingerprints and a bounded exact-duplicate filter.

use crate::error::{EngineError, EngineResult};
use crate::sync::AtomicCounter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

/// Equal iff hash, length and checksum all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint {
    /// BLAKE3 digest, hex encoded.
    pub hash: String,
    pub length: usize,
    /// First four bytes of the SHA-256 digest, big endian.
    pub checksum: u32,
}

impl ContentFingerprint {
    pub fn generate(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let checksum = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        Self {
            hash: blake3::hash(data).to_hex().to_string(),
            length: data.len(),
            checksum,
        }
    }

    pub fn short(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:08x}", self.short(), self.length, self.checksum)
    }
}

struct Seen<K> {
    set: HashSet<K>,
    order: VecDeque<K>,
}

/// Remembers the last `max_items` keys; older keys are forgotten first.
pub struct ExactDedup<K = ContentFingerprint> {
    max_items: usize,
    seen: Mutex<Seen<K>>,
    duplicates: AtomicCounter,
}

impl<K> ExactDedup<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(max_items: usize) -> EngineResult<Self> {
        if max_items == 0 {
            return Err(EngineError::invalid("dedup max_items must be > 0"));
        }
        Ok(Self {
            max_items,
            seen: Mutex::new(Seen {
                set: HashSet::new(),
                order: VecDeque::new(),
            }),
            duplicates: AtomicCounter::new(),
        })
    }

    /// Records `key`. `true` if it was new, `false` for a duplicate.
    pub fn check_and_insert(&self, key: K) -> bool {
        let mut seen = self.seen.lock();
        if seen.set.contains(&key) {
            drop(seen);
            self.duplicates.inc();
            return false;
        }
        while seen.set.len() >= self.max_items {
            let Some(oldest) = seen.order.pop_front() else { break };
            seen.set.remove(&oldest);
        }
        seen.set.insert(key.clone());
        seen.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.lock().set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.get()
    }

    /// Keeps only the keys matching `keep`. Returns how many were dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut seen = self.seen.lock();
        let Seen { set, order } = &mut *seen;
        let mut dropped = 0;
        order.retain(|key| {
            if keep(key) {
                return true;
            }
            set.remove(key);
            dropped += 1;
            false
        });
        dropped
    }

    pub fn clear(&self) {
        let mut seen = self.seen.lock();
        seen.set.clear();
        seen.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let a = ContentFingerprint::generate(b"response body");
        let b = ContentFingerprint::generate(b"response body");
        assert_eq!(a, b);
        assert_eq!(a.length, 13);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn one_byte_changes_fingerprint() {
        let a = ContentFingerprint::generate(b"response body");
        let b = ContentFingerprint::generate(b"response bodY");
        assert_ne!(a, b);
        assert_eq!(a.length, b.length);
    }

    #[test]
    fn display_is_compact() {
        let fp = ContentFingerprint::generate(b"");
        let text = fp.to_string();
        assert!(text.starts_with(fp.short()));
        assert!(text.contains(":0:"));
    }

    #[test]
    fn dedup_rejects_repeat() {
        let dedup = ExactDedup::new(10).unwrap();
        let fp = ContentFingerprint::generate(b"same");
        assert!(dedup.check_and_insert(fp.clone()));
        assert!(!dedup.check_and_insert(fp.clone()));
        assert!(dedup.contains(&fp));
        assert_eq!(dedup.duplicates(), 1);
    }

    #[test]
    fn dedup_forgets_oldest() {
        let dedup = ExactDedup::new(2).unwrap();
        assert!(dedup.check_and_insert(1u32));
        assert!(dedup.check_and_insert(2));
        assert!(dedup.check_and_insert(3));
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.contains(&1));
        assert!(dedup.check_and_insert(1));
    }

    #[test]
    fn dedup_retain_drops_unmatched() {
        let dedup = ExactDedup::new(10).unwrap();
        for n in 0..6u32 {
            dedup.check_and_insert(n);
        }
        assert_eq!(dedup.retain(|n| n % 2 == 0), 3);
        assert_eq!(dedup.len(), 3);
        assert!(!dedup.contains(&1));
        assert!(dedup.check_and_insert(1));
        assert!(!dedup.check_and_insert(2));
    }
}
