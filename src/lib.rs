//! tiercache - Local Multi-Tier Cache
//!
//! A disposable cache that sits between application logic and a slower
//! system of record. Three heterogeneous tiers are coordinated behind one
//! get/set/invalidate API:
//!
//! ```text
//! L1 Memory (LRU)  →  L2 SQLite (structured)  →  L3 Blob files (compressed)
//! ```
//!
//! Each value carries a category; a routing table decides which persistent
//! tier stores it, its default TTL and its size limit. Reads check L1 first
//! and promote hits from slower tiers. Nothing in the runtime API fails:
//! I/O problems and corruption degrade to misses.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::{CacheConfig, CacheManager};
//!
//! # fn main() -> tiercache::Result<()> {
//! let cache = CacheManager::open(CacheConfig::default().with_cache_dir("/tmp/tiercache"))?;
//!
//! cache.set("week:5:tasklist", b"[...]".to_vec(), "task_lists", Some(Duration::from_secs(3600)));
//! assert!(cache.get("week:5:tasklist", "task_lists").is_some());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, routing, janitor and the manager
//! - [`config`] - Configuration loading and duration parsing
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheKey, CacheManager, CacheStatsSnapshot, CacheTier, TierStore};
pub use config::CacheConfig;
pub use error::{Error, Result};
