//! Tier identity and the storage interface every tier implements

use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;
use super::health::ComponentHealth;
use super::metrics::TierStats;

/// Cache tier enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// L1 - process memory (hot)
    L1,
    /// L2 - embedded SQLite (structured)
    L2,
    /// L3 - compressed blob files (large objects)
    L3,
}

impl CacheTier {
    /// All tiers, fastest first
    pub const ALL: [CacheTier; 3] = [CacheTier::L1, CacheTier::L2, CacheTier::L3];

    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::L3 => "l3",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1 (Memory)"),
            CacheTier::L2 => write!(f, "L2 (SQLite)"),
            CacheTier::L3 => write!(f, "L3 (Blob)"),
        }
    }
}

impl std::str::FromStr for CacheTier {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l1" | "memory" => Ok(CacheTier::L1),
            "l2" | "sqlite" | "structured" => Ok(CacheTier::L2),
            "l3" | "blob" => Ok(CacheTier::L3),
            other => Err(crate::error::Error::Config(format!(
                "unknown cache tier: {}",
                other
            ))),
        }
    }
}

/// Storage interface shared by all tiers
///
/// Nothing here returns an error. Implementations log and count failures,
/// turning failed reads into misses and failed writes into no-ops.
pub trait TierStore: Send + Sync {
    /// Which tier this is
    fn tier(&self) -> CacheTier;

    /// Fetch a live entry; expired entries are removed and reported as a miss
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// True if a live entry exists; does not count as a hit or refresh recency
    fn contains(&self, key: &str) -> bool;

    /// Insert or replace; returns false if the entry was rejected or the write failed
    fn set(&self, entry: CacheEntry) -> bool;

    /// Remove one key
    fn delete(&self, key: &str) -> bool;

    /// Remove everything
    fn clear(&self);

    /// Remove all entries stored under `category`
    fn invalidate_category(&self, category: &str) -> usize;

    /// Remove all entries whose key contains `pattern`
    fn invalidate_pattern(&self, pattern: &str) -> usize;

    /// All stored keys, including ones not yet swept
    fn keys(&self) -> Vec<String>;

    /// Purge expired entries
    fn sweep_expired(&self) -> usize;

    /// Evict until the tier is within its configured budget
    fn enforce_capacity(&self) -> usize;

    /// Number of stored entries
    fn len(&self) -> usize;

    /// Whether the tier is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored bytes
    fn size_bytes(&self) -> u64;

    /// Counter snapshot
    fn stats(&self) -> TierStats;

    /// Health check
    fn health(&self) -> ComponentHealth;

    /// Persist any deferred bookkeeping
    fn flush(&self) {}
}
