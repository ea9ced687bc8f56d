//! L1 Cache - In-Process Memory Tier
//!
//! Capacity-bounded LRU map guarded by a single mutex. Every hit moves the
//! entry to the most-recently-used position, so eviction follows access
//! order rather than insertion order. Expiry is checked lazily on read.
//!
//! # Design
//!
//! - `lru::LruCache` gives O(1) get/put/pop with recency tracking
//! - Entry-count bound always applies; a byte budget is optional
//! - No I/O: every operation finishes inside one short critical section

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};
use super::entry::CacheEntry;
use super::health::ComponentHealth;
use super::metrics::{LatencyTracker, TierMetrics, TierStats};
use super::tier::{CacheTier, TierStore};
use super::DEFAULT_L1_MAX_ENTRIES;

/// L1 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Optional byte budget across all entries
    pub max_bytes: Option<u64>,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_L1_MAX_ENTRIES,
            max_bytes: None,
        }
    }
}

struct L1State {
    entries: LruCache<String, CacheEntry>,
    bytes: u64,
}

impl L1State {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(removed.size_bytes);
        Some(removed)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, removed) = self.entries.pop_lru()?;
        self.bytes = self.bytes.saturating_sub(removed.size_bytes);
        Some(removed)
    }

    fn remove_matching(&mut self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }
}

/// L1 Cache - in-memory LRU tier
pub struct MemoryTier {
    state: Mutex<L1State>,
    config: L1Config,
    clock: Arc<dyn Clock>,
    metrics: TierMetrics,
}

impl MemoryTier {
    /// Create a memory tier using the system clock
    pub fn new(config: L1Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a memory tier reading time from `clock`
    pub fn with_clock(config: L1Config, clock: Arc<dyn Clock>) -> Self {
        let config = L1Config {
            max_entries: config.max_entries.max(1),
            ..config
        };
        Self {
            state: Mutex::new(L1State {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            config,
            clock,
            metrics: TierMetrics::new(),
        }
    }

    /// Shorthand for an entry-count-bounded tier
    pub fn with_capacity(max_entries: usize) -> Self {
        Self::new(L1Config {
            max_entries,
            max_bytes: None,
        })
    }

    /// Configured entry capacity
    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    /// Configuration
    pub fn config(&self) -> &L1Config {
        &self.config
    }

    /// Insert a value copied up from a slower tier; counts as a promotion
    /// rather than a write
    pub fn insert_promoted(&self, entry: CacheEntry) -> bool {
        self.insert(entry)
    }

    /// Look at an entry without touching recency or counters
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
    }

    fn insert(&self, entry: CacheEntry) -> bool {
        let entry = entry.as_uncompressed();
        let size = entry.size_bytes;

        if let Some(max_bytes) = self.config.max_bytes {
            if size > max_bytes {
                tracing::debug!(key = %entry.key, size, max_bytes, "Value larger than L1 byte budget, skipped");
                return false;
            }
        }

        let mut evicted = 0u64;
        {
            let mut state = self.state.lock();
            state.remove(&entry.key);

            while state.entries.len() >= self.config.max_entries {
                if state.pop_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
            if let Some(max_bytes) = self.config.max_bytes {
                while state.bytes + size > max_bytes {
                    if state.pop_lru().is_none() {
                        break;
                    }
                    evicted += 1;
                }
            }

            state.bytes += size;
            state.entries.put(entry.key.clone(), entry);
        }

        if evicted > 0 {
            tracing::debug!(evicted, "L1 evicted least-recently-used entries");
            self.metrics.record_evictions(evicted);
        }
        true
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(L1Config::default())
    }
}

impl TierStore for MemoryTier {
    fn tier(&self) -> CacheTier {
        CacheTier::L1
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        let tracker = LatencyTracker::start();
        let now = self.clock.now();

        let found = {
            let mut state = self.state.lock();
            let (found, expired) = match state.entries.get_mut(key) {
                Some(entry) if entry.is_expired_at(now) => (None, true),
                Some(entry) => {
                    entry.access_count += 1;
                    (Some(entry.clone()), false)
                }
                None => (None, false),
            };
            if expired {
                state.remove(key);
                self.metrics.record_expirations(1);
            }
            found
        };

        match &found {
            Some(_) => self.metrics.record_hit(),
            None => self.metrics.record_miss(),
        }
        self.metrics.record_read_latency(tracker.elapsed());
        found
    }

    fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    fn set(&self, entry: CacheEntry) -> bool {
        let tracker = LatencyTracker::start();
        let stored = self.insert(entry);
        if stored {
            self.metrics.record_set();
        }
        self.metrics.record_write_latency(tracker.elapsed());
        stored
    }

    fn delete(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key).is_some();
        if removed {
            self.metrics.record_delete();
        }
        removed
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.bytes = 0;
    }

    fn invalidate_category(&self, category: &str) -> usize {
        let removed = self
            .state
            .lock()
            .remove_matching(|entry| entry.category == category);
        self.metrics.record_deletes(removed as u64);
        removed
    }

    fn invalidate_pattern(&self, pattern: &str) -> usize {
        let removed = self
            .state
            .lock()
            .remove_matching(|entry| entry.key.contains(pattern));
        self.metrics.record_deletes(removed as u64);
        removed
    }

    fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = self
            .state
            .lock()
            .remove_matching(|entry| entry.is_expired_at(now));
        self.metrics.record_expirations(removed as u64);
        removed
    }

    fn enforce_capacity(&self) -> usize {
        let mut evicted = 0usize;
        {
            let mut state = self.state.lock();
            loop {
                let over_entries = state.entries.len() > self.config.max_entries;
                let over_bytes = self
                    .config
                    .max_bytes
                    .is_some_and(|max_bytes| state.bytes > max_bytes);
                if !(over_entries || over_bytes) || state.pop_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
        }
        self.metrics.record_evictions(evicted as u64);
        evicted
    }

    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn size_bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    fn stats(&self) -> TierStats {
        let (entries, bytes) = {
            let state = self.state.lock();
            (state.entries.len() as u64, state.bytes)
        };
        self.metrics.snapshot(CacheTier::L1, entries, bytes)
    }

    fn health(&self) -> ComponentHealth {
        ComponentHealth::healthy(CacheTier::L1.name())
    }
}

// =============================================================================
// Tests
// =============================================================================
