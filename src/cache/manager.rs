//! Cache Manager - Unified Three-Tier Cache
//!
//! Coordinates L1 (memory), L2 (SQLite) and L3 (blob files) behind one
//! get/set/invalidate API. Reads always try L1 first, then the tier the
//! category is routed to; hits in a slower tier are promoted into L1.
//!
//! The runtime API never returns errors. A tier that fails degrades to a
//! miss or a no-op and the failure shows up in logs and `stats().errors`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::clock::{Clock, SystemClock};
use super::codec::{decode_json, encode_json};
use super::entry::CacheEntry;
use super::health::{ComponentHealth, HealthReport};
use super::janitor::{self, Janitor, MaintenanceReport};
use super::l1::MemoryTier;
use super::l2::StructuredTier;
use super::l3::BlobTier;
use super::metrics::{CacheStatsSnapshot, LatencyTracker, ManagerMetrics};
use super::routing::{Route, RoutingTable};
use super::tier::{CacheTier, TierStore};
use crate::config::CacheConfig;

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheLookup {
    /// The cached entry
    pub entry: CacheEntry,
    /// Which tier answered
    pub tier: CacheTier,
    /// Lookup latency
    pub latency: Duration,
}

/// Unified cache manager
pub struct CacheManager {
    l1: Arc<MemoryTier>,
    l2: Option<Arc<StructuredTier>>,
    l3: Option<Arc<BlobTier>>,
    routing: RoutingTable,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    metrics: ManagerMetrics,
    janitor: Mutex<Option<Janitor>>,
    closed: AtomicBool,
}

impl CacheManager {
    /// Open the cache described by `config` using the system clock
    pub fn open(config: CacheConfig) -> crate::Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open the cache, reading time from `clock`
    ///
    /// Only an invalid configuration is an error. A persistent tier that
    /// cannot be opened is logged and skipped; its categories are then
    /// served from L1 alone.
    pub fn open_with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> crate::Result<Self> {
        config.validate()?;

        let l1 = Arc::new(MemoryTier::with_clock(config.l1.clone(), clock.clone()));

        let l2 = if config.l2.enabled {
            match StructuredTier::open(config.l2.clone(), config.compression.clone(), clock.clone()) {
                Ok(tier) => Some(Arc::new(tier)),
                Err(e) => {
                    tracing::error!(path = %config.l2.path.display(), "L2 unavailable, continuing without it: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let l3 = if config.l3.enabled {
            match BlobTier::open(config.l3.clone(), config.compression.clone(), clock.clone()) {
                Ok(tier) => Some(Arc::new(tier)),
                Err(e) => {
                    tracing::error!(dir = %config.l3.dir.display(), "L3 unavailable, continuing without it: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let manager = Self {
            l1,
            l2,
            l3,
            routing: RoutingTable::new(&config.routing),
            config,
            clock,
            metrics: ManagerMetrics::new(),
            janitor: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        if manager.config.janitor.enabled {
            let persistent = manager.persistent_tiers();
            if !persistent.is_empty() {
                match Janitor::spawn(persistent, manager.config.janitor.interval) {
                    Some(janitor) => *manager.janitor.lock() = Some(janitor),
                    None => tracing::warn!(
                        "No tokio runtime available, background maintenance disabled; call run_maintenance() instead"
                    ),
                }
            }
        }

        tracing::info!(
            l2 = manager.l2.is_some(),
            l3 = manager.l3.is_some(),
            rules = manager.config.routing.rules.len(),
            "Cache manager opened"
        );
        Ok(manager)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value
    pub fn get(&self, key: &str, category: &str) -> Option<Bytes> {
        self.get_entry(key, category).map(|lookup| lookup.entry.value)
    }

    /// Get a value together with the tier that served it
    pub fn get_entry(&self, key: &str, category: &str) -> Option<CacheLookup> {
        if self.is_closed() {
            return None;
        }
        let tracker = LatencyTracker::start();

        if let Some(entry) = self.l1.get(key) {
            return Some(CacheLookup {
                entry,
                tier: CacheTier::L1,
                latency: tracker.elapsed(),
            });
        }

        let route = self.routing.resolve(category);
        if route.tier != CacheTier::L1 {
            if let Some(entry) = self.store(route.tier).and_then(|store| store.get(key)) {
                self.promote(&entry, &route);
                return Some(CacheLookup {
                    entry,
                    tier: route.tier,
                    latency: tracker.elapsed(),
                });
            }
        }

        self.metrics.record_miss();
        None
    }

    /// True if a live value exists in L1 or the routed tier
    pub fn exists(&self, key: &str, category: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.l1.contains(key) {
            return true;
        }
        let route = self.routing.resolve(category);
        route.tier != CacheTier::L1
            && self
                .store(route.tier)
                .is_some_and(|store| store.contains(key))
    }

    /// Every key held by any tier, sorted and deduplicated
    pub fn keys(&self) -> Vec<String> {
        if self.is_closed() {
            return Vec::new();
        }
        let keys: BTreeSet<String> = self
            .stores()
            .into_iter()
            .flat_map(|store| store.keys())
            .collect();
        keys.into_iter().collect()
    }

    /// Copy a value found in a slower tier into L1
    fn promote(&self, entry: &CacheEntry, route: &Route) {
        let now = self.clock.now();
        let ttl = match (entry.remaining_ttl(now), route.default_ttl) {
            (Some(remaining), Some(default)) => Some(remaining.min(default)),
            (remaining, default) => remaining.or(default),
        };

        let promoted = CacheEntry::new(
            entry.key.clone(),
            entry.value.clone(),
            entry.category.clone(),
            now,
            ttl,
        );
        if self.l1.insert_promoted(promoted) {
            self.metrics.record_promotion();
            tracing::debug!(key = %entry.key, from = %route.tier, ?ttl, "Promoted entry to L1");
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value in L1 and in the tier `category` routes to
    ///
    /// `ttl` overrides the rule's default TTL. Returns false if nothing was
    /// stored: the value exceeded the rule's size limit, every write failed,
    /// or the manager has been shut down.
    pub fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        category: &str,
        ttl: Option<Duration>,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        let value = value.into();
        let route = self.routing.resolve(category);

        if !route.admits(value.len() as u64) {
            self.metrics.record_rejected();
            tracing::warn!(
                key,
                category,
                size = value.len(),
                max_item_size = ?route.max_item_size,
                "Value exceeds routing size limit, not cached"
            );
            return false;
        }

        let entry = CacheEntry::new(key, value, category, self.clock.now(), route.ttl(ttl));
        if route.tier == CacheTier::L1 {
            return self.l1.set(entry);
        }

        let in_l1 = self.l1.set(entry.clone());
        match self.store(route.tier) {
            Some(store) => store.set(entry) || in_l1,
            None => in_l1,
        }
    }

    /// Return the cached value, computing and storing it on a miss
    pub fn get_or_insert_with<F, B>(
        &self,
        key: &str,
        category: &str,
        ttl: Option<Duration>,
        f: F,
    ) -> Bytes
    where
        F: FnOnce() -> B,
        B: Into<Bytes>,
    {
        if let Some(value) = self.get(key, category) {
            return value;
        }
        let value: Bytes = f().into();
        self.set(key, value.clone(), category, ttl);
        value
    }

    /// Like [`CacheManager::get_or_insert_with`] for fallible loaders;
    /// nothing is cached when the loader fails
    pub fn try_get_or_insert_with<F, B, E>(
        &self,
        key: &str,
        category: &str,
        ttl: Option<Duration>,
        f: F,
    ) -> Result<Bytes, E>
    where
        F: FnOnce() -> Result<B, E>,
        B: Into<Bytes>,
    {
        if let Some(value) = self.get(key, category) {
            return Ok(value);
        }
        let value: Bytes = f()?.into();
        self.set(key, value.clone(), category, ttl);
        Ok(value)
    }

    /// Get a JSON-encoded value; one that no longer decodes is dropped
    pub fn get_json<T: DeserializeOwned>(&self, key: &str, category: &str) -> Option<T> {
        let bytes = self.get(key, category)?;
        match decode_json(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, category, "Cached value does not decode, invalidating: {}", e);
                self.invalidate(key);
                None
            }
        }
    }

    /// Store a value as JSON
    pub fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        category: &str,
        ttl: Option<Duration>,
    ) -> bool {
        match encode_json(value) {
            Ok(bytes) => self.set(key, bytes, category, ttl),
            Err(e) => {
                tracing::warn!(key, category, "Failed to encode value for caching: {}", e);
                false
            }
        }
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove `key` from every tier
    pub fn invalidate(&self, key: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        self.stores()
            .into_iter()
            .fold(false, |removed, store| store.delete(key) || removed)
    }

    /// Remove every entry stored under `category` from every tier
    pub fn invalidate_category(&self, category: &str) -> usize {
        if self.is_closed() {
            return 0;
        }
        let removed = self
            .stores()
            .into_iter()
            .map(|store| store.invalidate_category(category))
            .sum();
        tracing::debug!(category, removed, "Invalidated category");
        removed
    }

    /// Remove every entry whose key contains `pattern` from every tier
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        if self.is_closed() {
            return 0;
        }
        let removed = self
            .stores()
            .into_iter()
            .map(|store| store.invalidate_pattern(pattern))
            .sum();
        tracing::debug!(pattern, removed, "Invalidated keys matching pattern");
        removed
    }

    /// Empty every tier
    pub fn clear(&self) {
        if self.is_closed() {
            return;
        }
        for store in self.stores() {
            store.clear();
        }
        tracing::info!("Cache cleared");
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Per-tier and aggregate statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.metrics.aggregate(
            self.l1.stats(),
            self.l2.as_ref().map(|tier| tier.stats()),
            self.l3.as_ref().map(|tier| tier.stats()),
        )
    }

    /// Health of every tier and the janitor
    pub fn health(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(4);

        if self.is_closed() {
            checks.push(ComponentHealth::unhealthy("manager", "shut down"));
        }
        checks.push(self.l1.health());
        checks.push(match (&self.l2, self.config.l2.enabled) {
            (Some(tier), _) => tier.health(),
            (None, true) => ComponentHealth::degraded(CacheTier::L2.name(), "failed to open"),
            (None, false) => ComponentHealth::healthy(CacheTier::L2.name()),
        });
        checks.push(match (&self.l3, self.config.l3.enabled) {
            (Some(tier), _) => tier.health(),
            (None, true) => ComponentHealth::degraded(CacheTier::L3.name(), "failed to open"),
            (None, false) => ComponentHealth::healthy(CacheTier::L3.name()),
        });

        if self.config.janitor.enabled && !self.is_closed() {
            let running = self.janitor.lock().as_ref().is_some_and(Janitor::is_running);
            checks.push(if running {
                ComponentHealth::healthy("janitor")
            } else {
                ComponentHealth::degraded("janitor", "not running")
            });
        }

        HealthReport::new(checks, self.metrics.uptime())
    }

    /// Liveness check
    pub fn ping(&self) -> bool {
        !self.is_closed()
    }

    /// Run one maintenance pass over the persistent tiers now
    pub fn run_maintenance(&self) -> MaintenanceReport {
        if self.is_closed() {
            return MaintenanceReport::default();
        }
        janitor::run_maintenance(&self.persistent_tiers())
    }

    /// Stop the janitor and flush every tier; later calls are no-ops
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            janitor.stop().await;
        }
        for store in self.stores() {
            store.flush();
        }
        tracing::info!("Cache manager shut down");
    }

    /// True once [`CacheManager::shutdown`] has started
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Get L1 tier reference
    pub fn l1(&self) -> &MemoryTier {
        &self.l1
    }

    /// Get L2 tier reference, if it is open
    pub fn l2(&self) -> Option<&StructuredTier> {
        self.l2.as_deref()
    }

    /// Get L3 tier reference, if it is open
    pub fn l3(&self) -> Option<&BlobTier> {
        self.l3.as_deref()
    }

    /// Get configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get routing table
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    fn store(&self, tier: CacheTier) -> Option<&dyn TierStore> {
        match tier {
            CacheTier::L1 => Some(&*self.l1 as &dyn TierStore),
            CacheTier::L2 => self.l2.as_deref().map(|t| t as &dyn TierStore),
            CacheTier::L3 => self.l3.as_deref().map(|t| t as &dyn TierStore),
        }
    }

    fn stores(&self) -> Vec<&dyn TierStore> {
        CacheTier::ALL
            .into_iter()
            .filter_map(|tier| self.store(tier))
            .collect()
    }

    fn persistent_tiers(&self) -> Vec<Arc<dyn TierStore>> {
        let mut tiers: Vec<Arc<dyn TierStore>> = Vec::with_capacity(2);
        if let Some(l2) = &self.l2 {
            tiers.push(l2.clone());
        }
        if let Some(l3) = &self.l3 {
            tiers.push(l3.clone());
        }
        tiers
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if !self.is_closed() {
            for store in self.stores() {
                store.flush();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::health::HealthStatus;
    use crate::cache::routing::RoutingRule;

    fn rule(category: &str, tier: CacheTier, ttl_secs: Option<u64>) -> RoutingRule {
        RoutingRule {
            category: category.into(),
            tier,
            default_ttl: ttl_secs.map(Duration::from_secs),
            max_item_size: None,
        }
    }

    fn test_config(dir: &TempDir) -> CacheConfig {
        let mut config = CacheConfig::default().with_cache_dir(dir.path());
        config.janitor.enabled = false;
        config.routing.rules = vec![
            rule("task_lists", CacheTier::L2, Some(3600)),
            rule("analytics", CacheTier::L3, Some(6 * 3600)),
            rule("session", CacheTier::L1, Some(300)),
        ];
        config
    }

    fn open_manager() -> (TempDir, Arc<ManualClock>, CacheManager) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let manager = CacheManager::open_with_clock(test_config(&dir), clock.clone()).unwrap();
        (dir, clock, manager)
    }

    #[test]
    fn test_week_tasklist_scenario() {
        let (_dir, _clock, manager) = open_manager();
        let payload = br#"{"week":5,"tasks":["audit","report"]}"#.to_vec();

        assert!(manager.set(
            "week:5:tasklist",
            payload.clone(),
            "task_lists",
            Some(Duration::from_secs(3600))
        ));

        let value = manager.get("week:5:tasklist", "task_lists").unwrap();
        assert_eq!(value.as_ref(), payload.as_slice());
        assert!(manager.l2().unwrap().contains("week:5:tasklist"));
    }

    #[test]
    fn test_miss_is_counted_once() {
        let (_dir, _clock, manager) = open_manager();

        assert!(manager.get("absent", "task_lists").is_none());

        let stats = manager.stats();
        assert_eq!(stats.total.misses, 1);
        assert_eq!(stats.total.hits, 0);
    }

    #[test]
    fn test_promotion_from_l2() {
        let (_dir, _clock, manager) = open_manager();
        manager.set("week:6:tasklist", b"tasks".to_vec(), "task_lists", None);

        // Simulate L1 pressure
        manager.l1().clear();

        let first = manager.get_entry("week:6:tasklist", "task_lists").unwrap();
        assert_eq!(first.tier, CacheTier::L2);

        let second = manager.get_entry("week:6:tasklist", "task_lists").unwrap();
        assert_eq!(second.tier, CacheTier::L1);

        let stats = manager.stats();
        assert_eq!(stats.l1.hits, 1);
        assert_eq!(stats.l2.as_ref().unwrap().hits, 1);
        assert_eq!(stats.promotions, 1);

        // Promotion is additive
        assert!(manager.l2().unwrap().contains("week:6:tasklist"));
    }

    #[test]
    fn test_promoted_ttl_never_outlives_source() {
        let (_dir, clock, manager) = open_manager();
        manager.set(
            "chart:q1",
            b"svg".to_vec(),
            "analytics",
            Some(Duration::from_secs(60)),
        );
        manager.l1().clear();

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            manager.get_entry("chart:q1", "analytics").unwrap().tier,
            CacheTier::L3
        );

        let promoted = manager.l1().peek("chart:q1").unwrap();
        assert_eq!(
            promoted.remaining_ttl(clock.now()),
            Some(Duration::from_secs(30))
        );

        clock.advance(Duration::from_secs(31));
        assert!(manager.get("chart:q1", "analytics").is_none());
    }

    #[test]
    fn test_l1_routed_category_writes_once() {
        let (_dir, _clock, manager) = open_manager();
        manager.set("session:abc", b"token".to_vec(), "session", None);

        assert!(manager.l1().contains("session:abc"));
        assert!(manager.l2().unwrap().is_empty());
        assert!(manager.l3().unwrap().is_empty());
        assert_eq!(manager.stats().total.sets, 1);
    }

    #[test]
    fn test_unknown_category_uses_default_route() {
        let (_dir, _clock, manager) = open_manager();
        manager.set("misc", b"value".to_vec(), "uncategorised", None);

        assert!(manager.l2().unwrap().contains("misc"));
        let entry = manager.l1().peek("misc").unwrap();
        assert!(entry.expires_at.is_some());
    }

    #[test]
    fn test_expiry_across_tiers() {
        let (_dir, clock, manager) = open_manager();
        manager.set("temp", b"v".to_vec(), "task_lists", Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(11));
        assert!(manager.get("temp", "task_lists").is_none());
        assert!(!manager.exists("temp", "task_lists"));
    }

    #[test]
    fn test_category_invalidation_spans_tiers() {
        let (_dir, _clock, manager) = open_manager();
        manager.set("week:1:tasklist", b"a".to_vec(), "task_lists", None);
        manager.set("week:2:tasklist", b"b".to_vec(), "task_lists", None);
        manager.set("chart:1", b"c".to_vec(), "analytics", None);

        // L1 copies are removed along with the persistent ones
        assert_eq!(manager.invalidate_category("task_lists"), 4);

        assert!(manager.get("week:1:tasklist", "task_lists").is_none());
        assert!(manager.get("week:2:tasklist", "task_lists").is_none());
        assert!(manager.get("chart:1", "analytics").is_some());
    }

    #[test]
    fn test_invalidate_and_pattern() {
        let (_dir, _clock, manager) = open_manager();
        manager.set("week:1:tasklist", b"a".to_vec(), "task_lists", None);
        manager.set("week:1:chart", b"b".to_vec(), "analytics", None);
        manager.set("week:2:chart", b"c".to_vec(), "analytics", None);

        assert!(manager.invalidate("week:1:tasklist"));
        assert!(!manager.invalidate("week:1:tasklist"));

        assert_eq!(manager.invalidate_pattern("week:1"), 2);
        assert_eq!(manager.keys(), vec!["week:2:chart".to_string()]);
    }

    #[test]
    fn test_rejects_oversized_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.routing.rules.push(RoutingRule {
            category: "thumbnails".into(),
            tier: CacheTier::L3,
            default_ttl: None,
            max_item_size: Some(1024),
        });
        let manager = CacheManager::open(config).unwrap();

        assert!(!manager.set("thumb:big", vec![0u8; 2048], "thumbnails", None));
        assert!(manager.set("thumb:small", vec![0u8; 512], "thumbnails", None));

        assert!(!manager.exists("thumb:big", "thumbnails"));
        let stats = manager.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.l1.sets, 1);
    }

    #[test]
    fn test_keys_are_deduplicated() {
        let (_dir, _clock, manager) = open_manager();
        manager.set("b", b"1".to_vec(), "task_lists", None);
        manager.set("a", b"2".to_vec(), "analytics", None);
        manager.set("c", b"3".to_vec(), "session", None);

        assert_eq!(manager.keys(), vec!["a", "b", "c"]);
        manager.clear();
        assert!(manager.keys().is_empty());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Summary {
        week: u32,
        hours: f64,
    }

    #[test]
    fn test_json_helpers() {
        let (_dir, _clock, manager) = open_manager();
        let summary = Summary { week: 5, hours: 37.5 };

        assert!(manager.set_json("summary:5", &summary, "task_lists", None));
        assert_eq!(manager.get_json::<Summary>("summary:5", "task_lists"), Some(summary));

        // Undecodable values are dropped
        manager.set("summary:6", b"not json".to_vec(), "task_lists", None);
        assert_eq!(manager.get_json::<Summary>("summary:6", "task_lists"), None);
        assert!(!manager.exists("summary:6", "task_lists"));
    }

    #[test]
    fn test_get_or_insert_with() {
        let (_dir, _clock, manager) = open_manager();
        let mut calls = 0;

        let first = manager.get_or_insert_with("report", "analytics", None, || {
            calls += 1;
            b"computed".to_vec()
        });
        let second = manager.get_or_insert_with("report", "analytics", None, || {
            calls += 1;
            b"recomputed".to_vec()
        });

        assert_eq!(first, second);
        assert_eq!(calls, 1);

        let failed: Result<Bytes, &str> =
            manager.try_get_or_insert_with("broken", "analytics", None, || Err::<Vec<u8>, _>("db down"));
        assert_eq!(failed, Err("db down"));
        assert!(!manager.exists("broken", "analytics"));
    }

    #[test]
    fn test_disabled_persistent_tiers_fall_back_to_l1() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.l2.enabled = false;
        config.l3.enabled = false;
        let manager = CacheManager::open(config).unwrap();

        assert!(manager.set("week:7:tasklist", b"x".to_vec(), "task_lists", None));
        assert_eq!(
            manager.get_entry("week:7:tasklist", "task_lists").unwrap().tier,
            CacheTier::L1
        );
        assert!(manager.stats().l2.is_none());
        assert!(manager.health().status.is_healthy());
    }

    #[test]
    fn test_unopenable_l2_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        // A directory where the database file should be
        std::fs::create_dir_all(&config.l2.path).unwrap();
        let manager = CacheManager::open(config).unwrap();

        assert!(manager.l2().is_none());
        assert!(manager.set("week:8:tasklist", b"x".to_vec(), "task_lists", None));
        assert!(manager.get("week:8:tasklist", "task_lists").is_some());
        assert_eq!(manager.health().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_run_maintenance() {
        let (_dir, clock, manager) = open_manager();
        manager.set("t1", b"a".to_vec(), "task_lists", Some(Duration::from_secs(5)));
        manager.set("a1", b"b".to_vec(), "analytics", Some(Duration::from_secs(5)));
        manager.set("keep", b"c".to_vec(), "task_lists", None);

        clock.advance(Duration::from_secs(6));
        let report = manager.run_maintenance();
        assert_eq!(report.expired(), 2);
        assert_eq!(report.tiers.len(), 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = CacheConfig::default();
        config.l1.max_entries = 0;
        assert!(CacheManager::open(config).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_makes_operations_noops() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.janitor.enabled = true;
        config.janitor.interval = Duration::from_secs(60);
        let manager = CacheManager::open(config).unwrap();

        manager.set("k", b"v".to_vec(), "task_lists", None);
        assert!(manager.health().status.is_healthy());
        assert!(manager.ping());

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(!manager.ping());
        assert!(manager.get("k", "task_lists").is_none());
        assert!(!manager.set("k2", b"v".to_vec(), "task_lists", None));
        assert!(manager.keys().is_empty());
        assert_eq!(manager.health().status, HealthStatus::Unhealthy);
    }
}
