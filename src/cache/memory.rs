// SPDX-License-Identifier: PMPL-1.0-or-later

//! Byte-bounded LRU cache with per-entry TTL.
//!
//! The running byte total (key plus value lengths) never exceeds the
//! configured capacity once a mutating call returns. `get` takes the write
//! lock because it reorders recency; `peek`, `contains` and `stats` only read.

use crate::config::duration_str;
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::sync::AtomicCounter;
use log::debug;
use lru::LruCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Upper bound on key plus value bytes held.
    pub capacity: usize,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024,
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl MemoryCacheConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.capacity == 0 {
            return Err(EngineError::invalid("cache capacity must be > 0"));
        }
        if self.sweep_interval.is_zero() {
            return Err(EngineError::invalid("cache sweep_interval must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub size: usize,
    pub created_at: Instant,
    /// `None` never expires.
    pub expires_at: Option<Instant>,
    pub hits: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Values larger than the whole cache.
    pub rejected: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

struct Store {
    entries: LruCache<String, CacheEntry>,
    bytes: usize,
}

impl Store {
    fn take(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes -= entry.size;
        Some(entry)
    }
}

pub struct MemoryCache {
    config: MemoryCacheConfig,
    store: RwLock<Store>,
    hits: AtomicCounter,
    misses: AtomicCounter,
    evictions: AtomicCounter,
    expirations: AtomicCounter,
    rejected: AtomicCounter,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: RwLock::new(Store {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            hits: AtomicCounter::new(),
            misses: AtomicCounter::new(),
            evictions: AtomicCounter::new(),
            expirations: AtomicCounter::new(),
            rejected: AtomicCounter::new(),
        })
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// Inserts with the configured TTL. `false` if the entry alone exceeds
    /// capacity; the cache is left untouched in that case.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> bool {
        let ttl = (!self.config.ttl.is_zero()).then_some(self.config.ttl);
        self.insert(key.into(), value.into(), ttl)
    }

    /// Inserts with an explicit TTL; `Duration::ZERO` means no expiry.
    pub fn set_with_ttl(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> bool {
        self.insert(key.into(), value.into(), (!ttl.is_zero()).then_some(ttl))
    }

    fn insert(&self, key: String, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        let size = key.len() + value.len();
        if size > self.config.capacity {
            self.rejected.inc();
            return false;
        }
        let now = Instant::now();
        let entry = CacheEntry {
            size,
            created_at: now,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            hits: 0,
            value,
            key: key.clone(),
        };

        let mut store = self.store.write();
        store.take(&key);
        while store.bytes + size > self.config.capacity {
            match store.entries.pop_lru() {
                Some((evicted, old)) => {
                    store.bytes -= old.size;
                    self.evictions.inc();
                    debug!("cache evicted {} ({} bytes)", evicted, old.size);
                }
                None => break,
            }
        }
        store.bytes += size;
        store.entries.put(key, entry);
        true
    }

    /// Returns the value and marks it most recently used. Expired entries
    /// are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut store = self.store.write();
        let mut expired = false;
        if let Some(entry) = store.entries.get_mut(key) {
            if entry.is_expired(now) {
                expired = true;
            } else {
                entry.hits += 1;
                self.hits.inc();
                return Some(entry.value.clone());
            }
        }
        if expired {
            store.take(key);
            self.expirations.inc();
        }
        self.misses.inc();
        None
    }

    /// Copy of the live entry without touching recency or counters.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let store = self.store.read();
        store
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.store.write().take(key).is_some()
    }

    pub fn clear(&self) {
        let mut store = self.store.write();
        store.entries.clear();
        store.bytes = 0;
    }

    /// Removes every expired entry, returning how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.write();
        let expired: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            store.take(key);
        }
        self.expirations.add(expired.len() as u64);
        expired.len()
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval` until `ctx` is done
    /// or the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>, ctx: &Context) -> EngineResult<JoinHandle<()>> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let ctx = ctx.clone();
        let interval = self.config.sweep_interval;
        thread::Builder::new()
            .name("swarm-cache-sweeper".to_string())
            .spawn(move || {
                while ctx.sleep(interval).is_ok() {
                    let Some(cache) = cache.upgrade() else { break };
                    let removed = cache.sweep();
                    if removed > 0 {
                        debug!("cache sweep removed {} expired entries", removed);
                    }
                }
            })
            .map_err(|err| EngineError::WorkerSpawn(err.to_string()))
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.store.read().bytes
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.store.read();
        CacheStats {
            entries: store.entries.len(),
            size_bytes: store.bytes,
            capacity: self.config.capacity,
            hits: self.hits.get(),
            misses: self.misses.get(),
            evictions: self.evictions.get(),
            expirations: self.expirations.get(),
            rejected: self.rejected.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> MemoryCache {
        MemoryCache::new(MemoryCacheConfig {
            capacity,
            ttl: Duration::ZERO,
            ..Default::default()
        })
        .expect("valid config")
    }

    #[test]
    fn get_returns_what_was_set() {
        let cache = cache(1024);
        assert!(cache.set("a", b"alpha".to_vec()));
        assert_eq!(cache.get("a"), Some(b"alpha".to_vec()));
        assert_eq!(cache.get("missing"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size_bytes, 6);
    }

    #[test]
    fn evicts_least_recently_used() {
        // Each entry is 1 key byte + 9 value bytes.
        let cache = cache(30);
        cache.set("a", vec![0; 9]);
        cache.set("b", vec![0; 9]);
        cache.set("c", vec![0; 9]);
        assert!(cache.get("a").is_some());
        cache.set("d", vec![0; 9]);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.size_bytes(), 30);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn replacing_key_adjusts_size() {
        let cache = cache(100);
        cache.set("k", vec![0; 50]);
        cache.set("k", vec![0; 10]);
        assert_eq!(cache.size_bytes(), 11);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn oversize_value_rejected() {
        let cache = cache(16);
        cache.set("keep", vec![1; 4]);
        assert!(!cache.set("big", vec![0; 64]));
        assert!(cache.contains("keep"));
        assert_eq!(cache.stats().rejected, 1);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = cache(1024);
        cache.set_with_ttl("short", b"v".to_vec(), Duration::from_millis(5));
        cache.set("forever", b"v".to_vec());
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("forever"), Some(b"v".to_vec()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn sweep_drops_expired() {
        let cache = cache(1024);
        for i in 0..5 {
            cache.set_with_ttl(format!("k{}", i), b"v".to_vec(), Duration::from_millis(1));
        }
        cache.set("stay", b"v".to_vec());
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.sweep(), 5);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), 5);
    }

    #[test]
    fn sweeper_thread_stops_with_context() {
        let cache = Arc::new(
            MemoryCache::new(MemoryCacheConfig {
                capacity: 1024,
                ttl: Duration::from_millis(1),
                sweep_interval: Duration::from_millis(5),
            })
            .expect("valid config"),
        );
        let ctx = Context::background();
        let handle = cache.start_sweeper(&ctx).expect("spawn");
        cache.set("k", b"v".to_vec());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cache.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(cache.is_empty());
        ctx.cancel();
        handle.join().expect("sweeper exits");
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(MemoryCache::new(MemoryCacheConfig {
            capacity: 0,
            ..Default::default()
        })
        .is_err());
    }
}
