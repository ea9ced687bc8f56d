//! Cache Metrics Collection
//!
//! Per-tier counters and the aggregated snapshot returned by
//! [`super::CacheManager::stats`]. Counters only ever increase for the life
//! of the process; entry/size figures are gauges sampled at snapshot time.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::tier::CacheTier;

/// Number of recent read latencies kept for percentile estimates
const LATENCY_WINDOW: usize = 1000;

/// EMA smoothing factor for latency figures
const LATENCY_ALPHA: f64 = 0.1;

/// Counters owned by a single tier
#[derive(Debug, Default)]
pub struct TierMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    errors: AtomicU64,

    read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
    recent_reads_us: Mutex<VecDeque<u64>>,
}

impl TierMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deletes(&self, count: u64) {
        self.deletes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits(), self.hits() + self.misses())
    }

    pub fn record_read_latency(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        update_latency_ema(&self.read_latency_us, us);

        let mut recent = self.recent_reads_us.lock();
        if recent.len() == LATENCY_WINDOW {
            recent.pop_front();
        }
        recent.push_back(us);
    }

    pub fn record_write_latency(&self, duration: Duration) {
        update_latency_ema(&self.write_latency_us, duration.as_micros() as u64);
    }

    pub fn read_latency(&self) -> Duration {
        Duration::from_micros(self.read_latency_us.load(Ordering::Relaxed))
    }

    pub fn write_latency(&self) -> Duration {
        Duration::from_micros(self.write_latency_us.load(Ordering::Relaxed))
    }

    /// 95th percentile of the most recent reads
    pub fn p95_read_latency(&self) -> Duration {
        let mut samples: Vec<u64> = self.recent_reads_us.lock().iter().copied().collect();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.sort_unstable();
        let index = ((samples.len() as f64) * 0.95) as usize;
        Duration::from_micros(samples[index.min(samples.len() - 1)])
    }

    /// Snapshot the counters, adding the tier's current gauges
    pub fn snapshot(&self, tier: CacheTier, entries: u64, size_bytes: u64) -> TierStats {
        let hits = self.hits();
        let misses = self.misses();
        let sets = self.sets();
        let deletes = self.deletes.load(Ordering::Relaxed);
        let operations = hits + misses + sets + deletes;
        let efficiency_score = efficiency_score(
            operations,
            self.hit_ratio(),
            self.read_latency().as_secs_f64() * 1000.0,
        );

        TierStats {
            tier,
            hits,
            misses,
            sets,
            deletes,
            operations,
            evictions: self.evictions(),
            expirations: self.expirations(),
            errors: self.errors(),
            entries,
            size_bytes,
            hit_ratio: self.hit_ratio(),
            read_latency_us: self.read_latency().as_micros() as u64,
            p95_read_latency_us: self.p95_read_latency().as_micros() as u64,
            write_latency_us: self.write_latency().as_micros() as u64,
            efficiency_score,
            grade: PerformanceGrade::from_score(efficiency_score),
        }
    }
}

/// 0-100 blend of hit rate (70%) and read latency (30%, 1ms costs a point)
fn efficiency_score(operations: u64, hit_ratio: f64, read_latency_ms: f64) -> f64 {
    if operations == 0 {
        return 0.0;
    }
    hit_ratio * 100.0 * 0.7 + (100.0 - read_latency_ms).max(0.0) * 0.3
}

/// Letter grade for a tier's efficiency score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PerformanceGrade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
    F,
}

impl PerformanceGrade {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 90.0 => PerformanceGrade::APlus,
            s if s >= 80.0 => PerformanceGrade::A,
            s if s >= 70.0 => PerformanceGrade::B,
            s if s >= 60.0 => PerformanceGrade::C,
            s if s >= 50.0 => PerformanceGrade::D,
            _ => PerformanceGrade::F,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceGrade::APlus => "A+",
            PerformanceGrade::A => "A",
            PerformanceGrade::B => "B",
            PerformanceGrade::C => "C",
            PerformanceGrade::D => "D",
            PerformanceGrade::F => "F",
        }
    }
}

impl fmt::Display for PerformanceGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn update_latency_ema(target: &AtomicU64, new_us: u64) {
    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - LATENCY_ALPHA) * current as f64 + LATENCY_ALPHA * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Statistics for one tier at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub tier: CacheTier,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// hits + misses + sets + deletes
    pub operations: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
    /// Current number of entries
    pub entries: u64,
    /// Current stored bytes
    pub size_bytes: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Smoothed read latency
    pub read_latency_us: u64,
    pub p95_read_latency_us: u64,
    /// Smoothed write latency
    pub write_latency_us: u64,
    /// 0-100, zero before the first operation
    pub efficiency_score: f64,
    pub grade: PerformanceGrade,
}

impl TierStats {
    /// Zeroed stats for a tier that is not running
    pub fn empty(tier: CacheTier) -> Self {
        TierMetrics::new().snapshot(tier, 0, 0)
    }
}

/// Global counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStats {
    /// Lookups answered by any tier
    pub hits: u64,
    /// Lookups no tier could answer
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
    pub entries: u64,
    pub size_bytes: u64,
    /// Overall hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
}

/// Statistics for the whole cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub l1: TierStats,
    pub l2: Option<TierStats>,
    pub l3: Option<TierStats>,
    pub total: AggregateStats,
    /// Values copied from L2/L3 into L1
    pub promotions: u64,
    /// Writes refused because they exceeded the routing rule's size limit
    pub rejected: u64,
    pub uptime_seconds: u64,
}

impl CacheStatsSnapshot {
    /// Stats for a single tier
    pub fn tier(&self, tier: CacheTier) -> Option<&TierStats> {
        match tier {
            CacheTier::L1 => Some(&self.l1),
            CacheTier::L2 => self.l2.as_ref(),
            CacheTier::L3 => self.l3.as_ref(),
        }
    }

    /// Plain-text summary for operators
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Multi-Tier Cache Performance Report ===");
        let _ = writeln!(out, "Uptime: {} seconds", self.uptime_seconds);
        let _ = writeln!(out, "Overall Hit Rate: {:.1}%", self.total.hit_ratio * 100.0);
        let _ = writeln!(out, "Total Memory Usage: {:.1} MB", mebibytes(self.total.size_bytes));
        let _ = writeln!(out, "Cache Promotions: {}", self.promotions);

        for stats in std::iter::once(&self.l1).chain(self.l2.as_ref()).chain(self.l3.as_ref()) {
            let _ = writeln!(out);
            let _ = writeln!(out, "--- {} Cache ---", stats.tier.name().to_uppercase());
            let _ = writeln!(out, "  Hit Rate: {:.1}%", stats.hit_ratio * 100.0);
            let _ = writeln!(out, "  Operations: {}", stats.operations);
            let _ = writeln!(out, "  Avg Response: {:.2}ms", stats.read_latency_us as f64 / 1000.0);
            let _ = writeln!(out, "  Memory: {:.1}MB", mebibytes(stats.size_bytes));
            let _ = writeln!(out, "  Grade: {}", stats.grade);
        }
        out
    }
}

fn mebibytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Manager-level counters that do not belong to one tier
#[derive(Debug)]
pub struct ManagerMetrics {
    misses: AtomicU64,
    promotions: AtomicU64,
    rejected: AtomicU64,
    started: Instant,
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self {
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the manager was opened
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Combine per-tier snapshots into the global view
    pub fn aggregate(
        &self,
        l1: TierStats,
        l2: Option<TierStats>,
        l3: Option<TierStats>,
    ) -> CacheStatsSnapshot {
        let tiers: Vec<&TierStats> = std::iter::once(&l1)
            .chain(l2.as_ref())
            .chain(l3.as_ref())
            .collect();

        let hits = tiers.iter().map(|t| t.hits).sum();
        let misses = self.misses.load(Ordering::Relaxed);
        let total = AggregateStats {
            hits,
            misses,
            sets: tiers.iter().map(|t| t.sets).sum(),
            evictions: tiers.iter().map(|t| t.evictions).sum(),
            expirations: tiers.iter().map(|t| t.expirations).sum(),
            errors: tiers.iter().map(|t| t.errors).sum(),
            entries: tiers.iter().map(|t| t.entries).sum(),
            size_bytes: tiers.iter().map(|t| t.size_bytes).sum(),
            hit_ratio: ratio(hits, hits + misses),
        };

        CacheStatsSnapshot {
            l1,
            l2,
            l3,
            total,
            promotions: self.promotions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            uptime_seconds: self.uptime().as_secs(),
        }
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = TierMetrics::new();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = TierMetrics::new();

        metrics.record_read_latency(Duration::from_micros(100));
        assert_eq!(metrics.read_latency(), Duration::from_micros(100));

        metrics.record_read_latency(Duration::from_micros(200));
        let latency = metrics.read_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_p95_uses_recent_window() {
        let metrics = TierMetrics::new();
        assert_eq!(metrics.p95_read_latency(), Duration::ZERO);

        for us in 1..=100 {
            metrics.record_read_latency(Duration::from_micros(us));
        }
        assert_eq!(metrics.p95_read_latency(), Duration::from_micros(96));

        // Old samples fall out of the window
        for _ in 0..LATENCY_WINDOW {
            metrics.record_read_latency(Duration::from_micros(5));
        }
        assert_eq!(metrics.p95_read_latency(), Duration::from_micros(5));
    }

    #[test]
    fn test_snapshot_includes_gauges() {
        let metrics = TierMetrics::new();
        metrics.record_set();
        metrics.record_evictions(3);
        metrics.record_error();

        let stats = metrics.snapshot(CacheTier::L2, 10, 4096);
        assert_eq!(stats.tier, CacheTier::L2);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.evictions, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.entries, 10);
        assert_eq!(stats.size_bytes, 4096);
    }

    #[test]
    fn test_aggregate_sums_tiers() {
        let l1 = TierMetrics::new();
        l1.record_hit();
        l1.record_miss();
        l1.record_set();
        let l2 = TierMetrics::new();
        l2.record_hit();
        l2.record_set();
        l2.record_error();

        let manager = ManagerMetrics::new();
        manager.record_miss();
        manager.record_promotion();

        let snapshot = manager.aggregate(
            l1.snapshot(CacheTier::L1, 1, 10),
            Some(l2.snapshot(CacheTier::L2, 2, 20)),
            None,
        );

        assert_eq!(snapshot.total.hits, 2);
        assert_eq!(snapshot.total.misses, 1);
        assert_eq!(snapshot.total.sets, 2);
        assert_eq!(snapshot.total.errors, 1);
        assert_eq!(snapshot.total.entries, 3);
        assert_eq!(snapshot.total.size_bytes, 30);
        assert_eq!(snapshot.promotions, 1);
        assert!((snapshot.total.hit_ratio - 0.666).abs() < 0.01);
        assert!(snapshot.tier(CacheTier::L3).is_none());
        assert_eq!(snapshot.tier(CacheTier::L2).map(|s| s.hits), Some(1));
    }

    #[test]
    fn test_efficiency_score_and_grade() {
        assert_eq!(efficiency_score(0, 1.0, 0.0), 0.0);
        assert_eq!(TierStats::empty(CacheTier::L1).grade, PerformanceGrade::F);

        // 90% hits at 2ms: 63 + 29.4
        let score = efficiency_score(10, 0.9, 2.0);
        assert!((score - 92.4).abs() < 1e-9);
        assert_eq!(PerformanceGrade::from_score(score), PerformanceGrade::APlus);

        // Slow reads stop contributing past 100ms
        assert!((efficiency_score(10, 0.5, 250.0) - 35.0).abs() < 1e-9);

        assert_eq!(PerformanceGrade::from_score(80.0), PerformanceGrade::A);
        assert_eq!(PerformanceGrade::from_score(79.9), PerformanceGrade::B);
        assert_eq!(PerformanceGrade::from_score(60.0), PerformanceGrade::C);
        assert_eq!(PerformanceGrade::from_score(50.0), PerformanceGrade::D);
        assert_eq!(PerformanceGrade::from_score(49.9), PerformanceGrade::F);
        assert_eq!(serde_json::to_value(PerformanceGrade::APlus).unwrap(), "A+");
    }

    #[test]
    fn test_snapshot_grades_tier() {
        let metrics = TierMetrics::new();
        for _ in 0..9 {
            metrics.record_hit();
        }
        metrics.record_miss();
        metrics.record_set();
        metrics.record_read_latency(Duration::from_micros(500));

        let stats = metrics.snapshot(CacheTier::L1, 1, 64);
        assert_eq!(stats.operations, 11);
        assert!((stats.efficiency_score - (63.0 + 99.5 * 0.3)).abs() < 1e-6);
        assert_eq!(stats.grade, PerformanceGrade::APlus);
    }

    #[test]
    fn test_report_lists_each_tier() {
        let l1 = TierMetrics::new();
        l1.record_hit();
        l1.record_miss();
        let l3 = TierMetrics::new();
        l3.record_set();

        let manager = ManagerMetrics::new();
        manager.record_promotion();
        let snapshot = manager.aggregate(
            l1.snapshot(CacheTier::L1, 1, 3 * 1024 * 1024),
            None,
            Some(l3.snapshot(CacheTier::L3, 1, 1024 * 1024)),
        );

        let report = snapshot.report();
        assert!(report.starts_with("=== Multi-Tier Cache Performance Report ==="));
        assert!(report.contains("Total Memory Usage: 4.0 MB"));
        assert!(report.contains("Cache Promotions: 1"));
        assert!(report.contains("--- L1 Cache ---"));
        assert!(report.contains("  Hit Rate: 50.0%"));
        assert!(report.contains("  Operations: 2"));
        assert!(report.contains("--- L3 Cache ---"));
        assert!(!report.contains("--- L2 Cache ---"));
        assert!(report.contains("  Memory: 1.0MB"));
        assert!(report.contains("  Grade: F"));
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(tracker.elapsed() >= Duration::from_millis(10));
    }
}
