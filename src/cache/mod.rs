//! Three-Tiered Cache System
//!
//! Local caching with L1 (memory), L2 (SQLite) and L3 (compressed blob file)
//! tiers behind a single manager.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Manager                                   │
//! │                get / set / invalidate / stats / shutdown                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 Cache (Memory)    │ L2 Cache (SQLite)    │ L3 Cache (Blob files)     │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌────────────────────┐    │
//! │  │ LRU map        │   │ │ cache_entries  │   │ │ objects/<sha>.blob │    │
//! │  │ entries/bytes  │   │ │ rows/bytes     │   │ │ + index.json       │    │
//! │  └────────────────┘   │ └────────────────┘   │ └────────────────────┘    │
//! │         ▲             │         │            │           │               │
//! │         └──── promotion ────────┴────────────┴───────────┘               │
//! │                                                                          │
//! │              Routing table: category → tier, TTL, size limit             │
//! │              Janitor: periodic sweep + budget enforcement                │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - The cache is disposable: every failure degrades to a miss
//! - Each tier owns its locks; there is no global lock
//! - Values are opaque bytes; [`codec`] supplies typed helpers
//! - Time comes from an injectable [`Clock`]

pub mod clock;
pub mod codec;
pub mod compression;
pub mod entry;
pub mod health;
pub mod janitor;
pub mod l1;
pub mod l2;
pub mod l3;
pub mod manager;
pub mod metrics;
pub mod routing;
pub mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Codec, JsonCodec};
pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager, Compressor};
pub use entry::{CacheEntry, CacheKey};
pub use health::{ComponentHealth, HealthReport, HealthStatus};
pub use janitor::{Janitor, JanitorConfig, MaintenanceReport};
pub use l1::{L1Config, MemoryTier};
pub use l2::{L2Config, StructuredTier};
pub use l3::{BlobTier, L3Config};
pub use manager::{CacheLookup, CacheManager};
pub use metrics::{AggregateStats, CacheStatsSnapshot, PerformanceGrade, TierStats};
pub use routing::{DefaultRoute, Route, RoutingConfig, RoutingRule, RoutingTable};
pub use tier::{CacheTier, TierStore};

/// Default L1 capacity (entries)
pub const DEFAULT_L1_MAX_ENTRIES: usize = 1000;

/// Default L2 row limit
pub const DEFAULT_L2_MAX_ROWS: u64 = 100_000;

/// Default L2 payload budget (256MB)
pub const DEFAULT_L2_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// Default L3 disk budget (1GB)
pub const DEFAULT_L3_MAX_BYTES: u64 = 1024 * 1024 * 1024;
