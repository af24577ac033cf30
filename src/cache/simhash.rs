// SPDX-License-Identifier: PMPL-1.0-or-later

//! 64-bit SimHash over byte shingles.

use crate::error::{EngineError, EngineResult};
use rayon::prelude::*;

pub const SIMHASH_BITS: u32 = 64;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a followed by a splitmix64 finaliser so every output bit depends
/// on every input byte.
pub(crate) fn shingle_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    mix64(hash)
}

pub(crate) fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Overlapping `size`-byte windows; input shorter than a window is one
/// shingle.
pub(crate) fn shingles(data: &[u8], size: usize) -> impl Iterator<Item = &[u8]> {
    let whole = (data.len() < size && !data.is_empty()).then_some(data);
    let windows = if data.len() >= size {
        Some(data.windows(size))
    } else {
        None
    };
    whole.into_iter().chain(windows.into_iter().flatten())
}

#[derive(Debug, Clone)]
pub struct SimHasher {
    shingle_size: usize,
}

impl Default for SimHasher {
    fn default() -> Self {
        Self { shingle_size: 4 }
    }
}

impl SimHasher {
    pub fn new(shingle_size: usize) -> EngineResult<Self> {
        if shingle_size == 0 {
            return Err(EngineError::invalid("simhash shingle size must be > 0"));
        }
        Ok(Self { shingle_size })
    }

    pub fn shingle_size(&self) -> usize {
        self.shingle_size
    }

    /// Bit `i` is set iff the shingles voting for it are at least as many
    /// as those voting against. Empty input has no shingles, every vote is
    /// a tie, and the hash is `u64::MAX`.
    pub fn hash(&self, data: &[u8]) -> u64 {
        let mut votes = [0i64; SIMHASH_BITS as usize];
        for shingle in shingles(data, self.shingle_size) {
            let h = shingle_hash(shingle);
            for (bit, vote) in votes.iter_mut().enumerate() {
                if (h >> bit) & 1 == 1 {
                    *vote += 1;
                } else {
                    *vote -= 1;
                }
            }
        }
        votes
            .iter()
            .enumerate()
            .filter(|(_, vote)| **vote >= 0)
            .fold(0u64, |acc, (bit, _)| acc | (1 << bit))
    }

    pub fn hash_batch<B>(&self, items: &[B]) -> Vec<u64>
    where
        B: AsRef<[u8]> + Sync,
    {
        items.par_iter().map(|item| self.hash(item.as_ref())).collect()
    }
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// `1 - distance / 64`, in `[0, 1]`.
pub fn similarity(a: u64, b: u64) -> f64 {
    1.0 - f64::from(hamming_distance(a, b)) / f64::from(SIMHASH_BITS)
}

/// Bitwise majority over a set of hashes; ties set the bit.
pub fn majority(hashes: &[u64]) -> u64 {
    if hashes.is_empty() {
        return 0;
    }
    let mut result = 0u64;
    for bit in 0..SIMHASH_BITS {
        let ones = hashes.iter().filter(|&&h| (h >> bit) & 1 == 1).count();
        if ones * 2 >= hashes.len() {
            result |= 1 << bit;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_input_identical_hash() {
        let hasher = SimHasher::default();
        let body = b"<html><body>Welcome back, user 42</body></html>";
        assert_eq!(hasher.hash(body), hasher.hash(body));
        assert_eq!(hamming_distance(hasher.hash(body), hasher.hash(body)), 0);
    }

    #[test]
    fn small_edit_stays_close() {
        let hasher = SimHasher::default();
        let base: Vec<u8> = b"<div class=\"row\"><span>item</span></div>\n"
            .iter()
            .copied()
            .cycle()
            .take(2_000)
            .collect();
        let mut edited = base.clone();
        edited[1_000] = b'X';
        let unrelated: Vec<u8> = (0..2_000u32).map(|i| (i * 7919 % 251) as u8).collect();

        let near = hamming_distance(hasher.hash(&base), hasher.hash(&edited));
        let far = hamming_distance(hasher.hash(&base), hasher.hash(&unrelated));
        assert!(near <= 5, "near distance {}", near);
        assert!(far > near);
    }

    #[test]
    fn short_input_is_one_shingle() {
        let hasher = SimHasher::default();
        assert_ne!(hasher.hash(b"ab"), 0);
        assert_eq!(hasher.hash(b""), u64::MAX);
        assert_eq!(shingles(b"abcdef", 4).count(), 3);
        assert_eq!(shingles(b"ab", 4).count(), 1);
        assert_eq!(shingles(b"", 4).count(), 0);
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity(0, 0), 1.0);
        assert_eq!(similarity(0, u64::MAX), 0.0);
        assert_eq!(hamming_distance(0b1010, 0b0110), 2);
    }

    #[test]
    fn majority_vote() {
        assert_eq!(majority(&[0b110, 0b011, 0b010]), 0b010);
        assert_eq!(majority(&[0b1, 0b0]), 0b1);
        assert_eq!(majority(&[]), 0);
    }

    #[test]
    fn batch_matches_single() {
        let hasher = SimHasher::default();
        let bodies = vec![b"alpha beta".to_vec(), b"gamma delta".to_vec()];
        let batch = hasher.hash_batch(&bodies);
        assert_eq!(batch, vec![hasher.hash(&bodies[0]), hasher.hash(&bodies[1])]);
    }

    #[test]
    fn zero_shingle_rejected() {
        assert!(SimHasher::new(0).is_err());
    }
}
