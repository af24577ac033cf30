// SPDX-License-Identifier: PMPL-1.0-or-later

//! Properties of the LRU cache, SimHash and content fingerprints

use proptest::prelude::*;
use std::collections::VecDeque;
use std::time::Duration;
use swarm_fuzz::cache::{
    hamming_distance, jaccard_estimate, ContentFingerprint, ExactDedup, LshIndex, MemoryCache,
    MemoryCacheConfig, MinHasher, SimHasher, SimilarityIndex,
};

#[derive(Debug, Clone)]
enum Op {
    Set(u8, usize),
    Get(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..16, 0usize..40).prop_map(|(k, len)| Op::Set(k, len)),
        (0u8..16).prop_map(Op::Get),
    ]
}

fn cache(capacity: usize) -> MemoryCache {
    MemoryCache::new(MemoryCacheConfig {
        capacity,
        ttl: Duration::ZERO,
        ..Default::default()
    })
    .unwrap()
}

proptest! {
    #[test]
    fn lru_never_exceeds_capacity(ops in prop::collection::vec(op(), 1..200)) {
        let cache = cache(100);
        for op in ops {
            match op {
                Op::Set(k, len) => { cache.set(format!("k{}", k), vec![0u8; len]); }
                Op::Get(k) => { cache.get(&format!("k{}", k)); }
            }
            prop_assert!(cache.size_bytes() <= cache.capacity());
        }
    }

    /// Mirrors the cache with a recency list and checks every eviction
    /// removes the least recently used key.
    #[test]
    fn lru_evicts_least_recent(ops in prop::collection::vec(op(), 1..200)) {
        let capacity = 100;
        let cache = cache(capacity);
        let mut model: VecDeque<(String, usize)> = VecDeque::new();
        for op in ops {
            match op {
                Op::Set(k, len) => {
                    let key = format!("k{}", k);
                    let size = key.len() + len;
                    model.retain(|(other, _)| *other != key);
                    while model.iter().map(|(_, s)| s).sum::<usize>() + size > capacity {
                        model.pop_front();
                    }
                    model.push_back((key.clone(), size));
                    prop_assert!(cache.set(key, vec![0u8; len]));
                }
                Op::Get(k) => {
                    let key = format!("k{}", k);
                    let hit = cache.get(&key).is_some();
                    let pos = model.iter().position(|(other, _)| *other == key);
                    prop_assert_eq!(hit, pos.is_some());
                    if let Some(pos) = pos {
                        let entry = model.remove(pos).unwrap();
                        model.push_back(entry);
                    }
                }
            }
            prop_assert_eq!(cache.len(), model.len());
            for (key, _) in &model {
                prop_assert!(cache.contains(key));
            }
        }
    }

    #[test]
    fn simhash_is_idempotent_and_symmetric(
        a in prop::collection::vec(any::<u8>(), 0..256),
        b in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let hasher = SimHasher::default();
        let (ha, hb) = (hasher.hash(&a), hasher.hash(&b));
        prop_assert_eq!(ha, hasher.hash(&a));
        prop_assert_eq!(hamming_distance(ha, ha), 0);
        prop_assert_eq!(hamming_distance(ha, hb), hamming_distance(hb, ha));
        prop_assert!(hamming_distance(ha, hb) <= 64);
    }

    #[test]
    fn fingerprint_equality(
        a in prop::collection::vec(any::<u8>(), 0..128),
        b in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        prop_assert_eq!(ContentFingerprint::generate(&a), ContentFingerprint::generate(&a));
        if a.len() != b.len() {
            prop_assert_ne!(ContentFingerprint::generate(&a), ContentFingerprint::generate(&b));
        }
    }
}

#[test]
fn test_near_duplicate_pages_share_a_bucket() {
    let hasher = SimHasher::default();
    let index = SimilarityIndex::new(4, 3, 1_000).unwrap();
    let hash = hasher.hash(b"<html><body>Order 1001 shipped</body></html>");
    index.insert(1, hash);
    index.insert(2, hasher.hash(b"{\"error\":\"not found\"}"));

    // Two flipped bits in different blocks.
    let (item, distance) = index.nearest(hash ^ (1 << 5) ^ (1 << 50)).unwrap();
    assert_eq!(item.id, 1);
    assert_eq!(distance, 2);
}

#[test]
fn test_lsh_groups_edited_listing() {
    let hasher = MinHasher::with_seed(128, 4, 2024).unwrap();
    let index = LshIndex::for_hasher(&hasher, 32, 1_000).unwrap();
    let words: Vec<String> = (0..200).map(|i| format!("product{}", i)).collect();
    let listing = words.join(" ");
    index.insert("listing", hasher.signature(listing.as_bytes())).unwrap();
    index
        .insert("login", hasher.signature(b"<form action=/login><input name=user></form>"))
        .unwrap();

    let edited = listing.replacen("product100", "discontinued", 1);
    let hits = index.query(&hasher.signature(edited.as_bytes()), 0.8).unwrap();
    assert_eq!(hits.first().map(|(id, _)| *id), Some("listing"));
    assert!(hits.iter().all(|(id, _)| *id != "login"));
    assert!(jaccard_estimate(
        &hasher.signature(listing.as_bytes()),
        &hasher.signature(edited.as_bytes())
    ) > 0.8);
}

#[test]
fn test_batch_helpers_agree_with_single_calls() {
    let bodies: Vec<Vec<u8>> = (0..32)
        .map(|i| format!("response body {}", i).into_bytes())
        .collect();
    let simhasher = SimHasher::default();
    let minhasher = MinHasher::with_seed(64, 4, 42).unwrap();
    let hashes = simhasher.hash_batch(&bodies);
    let signatures = minhasher.signature_batch(&bodies);
    for (i, body) in bodies.iter().enumerate() {
        assert_eq!(hashes[i], simhasher.hash(body));
        assert_eq!(signatures[i], minhasher.signature(body));
    }
}

#[test]
fn test_exact_dedup_by_fingerprint() {
    let dedup = ExactDedup::new(100).unwrap();
    assert!(dedup.check_and_insert(ContentFingerprint::generate(b"<p>one</p>")));
    assert!(dedup.check_and_insert(ContentFingerprint::generate(b"<p>two</p>")));
    assert!(!dedup.check_and_insert(ContentFingerprint::generate(b"<p>one</p>")));
    assert_eq!(dedup.len(), 2);
}
