//! L2 Cache - Embedded SQLite Tier
//!
//! Structured, queryable storage for medium-sized values such as task
//! lists or aggregated reports. Survives restarts on a best-effort basis.
//!
//! # Design
//!
//! - One `WITHOUT ROWID` table keyed by the cache key, indexed on expiry,
//!   category and last access
//! - Pragmas favour throughput over durability: the cache is disposable
//! - Values over the compression threshold are stored LZ4-compressed
//! - A corrupt database file is deleted and recreated

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};
use super::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use super::entry::CacheEntry;
use super::health::ComponentHealth;
use super::metrics::{LatencyTracker, TierMetrics, TierStats};
use super::tier::{CacheTier, TierStore};
use super::{DEFAULT_L2_MAX_BYTES, DEFAULT_L2_MAX_ROWS};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cache_entries (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL,
        category TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER,
        access_count INTEGER NOT NULL DEFAULT 0,
        size_bytes INTEGER NOT NULL,
        compressed INTEGER NOT NULL DEFAULT 0,
        last_accessed INTEGER NOT NULL
    ) WITHOUT ROWID;
    CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
    CREATE INDEX IF NOT EXISTS idx_cache_category ON cache_entries(category);
    CREATE INDEX IF NOT EXISTS idx_cache_last_accessed ON cache_entries(last_accessed);
";

/// L2 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L2Config {
    /// Whether the tier is opened at all
    pub enabled: bool,
    /// Database file path
    pub path: PathBuf,
    /// Maximum number of rows
    pub max_rows: Option<u64>,
    /// Maximum stored payload bytes
    pub max_bytes: Option<u64>,
    /// Rows deleted per statement when sweeping expired entries
    pub sweep_batch_size: usize,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("cache/structured.db"),
            max_rows: Some(DEFAULT_L2_MAX_ROWS),
            max_bytes: Some(DEFAULT_L2_MAX_BYTES),
            sweep_batch_size: 500,
        }
    }
}

struct StoredRow {
    value: Vec<u8>,
    category: String,
    created_at: i64,
    expires_at: Option<i64>,
    access_count: i64,
    size_bytes: i64,
    compressed: bool,
}

/// L2 Cache - SQLite-backed structured tier
pub struct StructuredTier {
    conn: Mutex<Connection>,
    /// `None` for in-memory databases
    path: Option<PathBuf>,
    config: L2Config,
    compression: CompressionManager,
    clock: Arc<dyn Clock>,
    metrics: TierMetrics,
}

impl StructuredTier {
    /// Open (or create) the database at `config.path`
    ///
    /// An unreadable or corrupt file is deleted and recreated once; an error
    /// is returned only if the fresh database cannot be opened either.
    pub fn open(
        config: L2Config,
        compression: CompressionConfig,
        clock: Arc<dyn Clock>,
    ) -> crate::Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match open_connection(&config.path) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(
                    path = %config.path.display(),
                    "Failed to open L2 database, recreating it: {}",
                    e
                );
                remove_database_files(&config.path);
                open_connection(&config.path)?
            }
        };

        tracing::info!(path = %config.path.display(), "L2 cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(config.path.clone()),
            config,
            compression: CompressionManager::with_config(compression),
            clock,
            metrics: TierMetrics::new(),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory(
        config: L2Config,
        compression: CompressionConfig,
        clock: Arc<dyn Clock>,
    ) -> crate::Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            config,
            compression: CompressionManager::with_config(compression),
            clock,
            metrics: TierMetrics::new(),
        })
    }

    /// In-memory database with default settings and the system clock
    pub fn in_memory() -> crate::Result<Self> {
        Self::open_in_memory(
            L2Config::default(),
            CompressionConfig::default(),
            Arc::new(SystemClock),
        )
    }

    /// Configuration
    pub fn config(&self) -> &L2Config {
        &self.config
    }

    /// Distinct categories currently stored
    pub fn categories(&self) -> Vec<String> {
        self.with_conn("categories", |conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT category FROM cache_entries ORDER BY category")?;
            let categories = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>();
            categories
        })
        .unwrap_or_default()
    }

    /// Rebuild the database file to reclaim free pages
    pub fn vacuum(&self) -> bool {
        self.with_conn("vacuum", |conn| conn.execute_batch("VACUUM"))
            .is_some()
    }

    /// Run `op` against the connection, applying the failure policy on error
    fn with_conn<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Option<T> {
        let result = {
            let mut conn = self.conn.lock();
            f(&mut conn)
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.metrics.record_error();
                tracing::warn!(op, "L2 operation failed: {}", e);
                if is_corruption(&e) {
                    self.recreate();
                }
                None
            }
        }
    }

    /// Throw away the database file and start over
    fn recreate(&self) {
        let mut conn = self.conn.lock();
        let Some(path) = &self.path else {
            if let Err(e) = conn.execute("DELETE FROM cache_entries", []) {
                tracing::error!("Failed to reset in-memory L2 database: {}", e);
            }
            return;
        };

        tracing::warn!(path = %path.display(), "L2 database is corrupt, recreating it");
        let fallback = match Connection::open_in_memory().and_then(|c| configure(&c).map(|_| c)) {
            Ok(fallback) => fallback,
            Err(e) => {
                tracing::error!("Failed to allocate replacement L2 connection: {}", e);
                return;
            }
        };
        drop(std::mem::replace(&mut *conn, fallback));
        remove_database_files(path);

        match open_connection(path) {
            Ok(fresh) => *conn = fresh,
            Err(e) => tracing::error!(
                path = %path.display(),
                "Failed to recreate L2 database, continuing in memory: {}",
                e
            ),
        }
    }

    fn usage(&self) -> Option<(u64, u64)> {
        self.with_conn("usage", |conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
        })
        .map(|(rows, bytes)| (rows.max(0) as u64, bytes.max(0) as u64))
    }

    fn over_budget(&self, rows: u64, bytes: u64) -> (u64, u64) {
        let rows_excess = self
            .config
            .max_rows
            .map_or(0, |max| rows.saturating_sub(max));
        let bytes_excess = self
            .config
            .max_bytes
            .map_or(0, |max| bytes.saturating_sub(max));
        (rows_excess, bytes_excess)
    }

    /// Evict least-recently-accessed rows until within budget; `keep` is
    /// never chosen as a victim
    fn enforce_budget(&self, keep: Option<&str>) -> usize {
        let Some((rows, bytes)) = self.usage() else {
            return 0;
        };
        if self.over_budget(rows, bytes) == (0, 0) {
            return 0;
        }

        // Expired rows are the cheapest to give up
        self.sweep_expired();
        let Some((rows, bytes)) = self.usage() else {
            return 0;
        };
        let (rows_excess, bytes_excess) = self.over_budget(rows, bytes);
        if rows_excess == 0 && bytes_excess == 0 {
            return 0;
        }

        let evicted = self
            .with_conn("enforce_capacity", |conn| {
                evict_least_recent(conn, rows_excess, bytes_excess, keep)
            })
            .unwrap_or(0);
        if evicted > 0 {
            tracing::debug!(evicted, "L2 evicted least-recently-accessed rows");
            self.metrics.record_evictions(evicted as u64);
        }
        evicted
    }

    fn decode(&self, key: &str, row: StoredRow) -> crate::Result<CacheEntry> {
        let value = if row.compressed {
            self.compression
                .decompress(&row.value, CompressionAlgorithm::Lz4)?
        } else {
            Bytes::from(row.value)
        };

        let created_at = from_millis(row.created_at)
            .ok_or_else(|| crate::Error::corrupt(key, "invalid created_at"))?;
        let expires_at = match row.expires_at {
            Some(ms) => Some(
                from_millis(ms).ok_or_else(|| crate::Error::corrupt(key, "invalid expires_at"))?,
            ),
            None => None,
        };

        Ok(CacheEntry {
            key: key.to_string(),
            value,
            category: row.category,
            created_at,
            expires_at,
            access_count: row.access_count.max(0) as u64,
            size_bytes: row.size_bytes.max(0) as u64,
            compressed: row.compressed,
        })
    }
}

impl TierStore for StructuredTier {
    fn tier(&self) -> CacheTier {
        CacheTier::L2
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        let tracker = LatencyTracker::start();
        let now_ms = self.clock.now().timestamp_millis();

        let row = self
            .with_conn("get", |conn| {
                let row = conn
                    .query_row(
                        "SELECT value, category, created_at, expires_at, access_count, size_bytes, compressed
                         FROM cache_entries WHERE key = ?1",
                        params![key],
                        |row| {
                            Ok(StoredRow {
                                value: row.get(0)?,
                                category: row.get(1)?,
                                created_at: row.get(2)?,
                                expires_at: row.get(3)?,
                                access_count: row.get(4)?,
                                size_bytes: row.get(5)?,
                                compressed: row.get(6)?,
                            })
                        },
                    )
                    .optional()?;

                let Some(mut row) = row else {
                    return Ok(None);
                };
                if row.expires_at.is_some_and(|expires_at| now_ms > expires_at) {
                    conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                    return Ok(Some(Err(())));
                }

                // Access bookkeeping is best-effort
                match conn.execute(
                    "UPDATE cache_entries SET access_count = access_count + 1, last_accessed = ?2 WHERE key = ?1",
                    params![key, now_ms],
                ) {
                    Ok(_) => row.access_count += 1,
                    Err(e) => tracing::debug!(key, "Failed to record L2 access: {}", e),
                }
                Ok(Some(Ok(row)))
            })
            .flatten();

        let found = match row {
            Some(Ok(row)) => match self.decode(key, row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(key, "Dropping unreadable L2 entry: {}", e);
                    self.metrics.record_error();
                    self.with_conn("purge", |conn| {
                        conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
                    });
                    None
                }
            },
            Some(Err(())) => {
                self.metrics.record_expirations(1);
                None
            }
            None => None,
        };

        match &found {
            Some(_) => self.metrics.record_hit(),
            None => self.metrics.record_miss(),
        }
        self.metrics.record_read_latency(tracker.elapsed());
        found
    }

    fn contains(&self, key: &str) -> bool {
        let now_ms = self.clock.now().timestamp_millis();
        self.with_conn("contains", |conn| {
            conn.query_row(
                "SELECT expires_at FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
        })
        .flatten()
        .is_some_and(|expires_at| expires_at.map_or(true, |expires_at| now_ms <= expires_at))
    }

    fn set(&self, entry: CacheEntry) -> bool {
        let tracker = LatencyTracker::start();
        let (payload, algorithm) = self.compression.compress(&entry.value);
        let compressed = algorithm != CompressionAlgorithm::None;
        let now_ms = self.clock.now().timestamp_millis();

        if self.config.max_rows == Some(0) {
            return false;
        }
        if let Some(max_bytes) = self.config.max_bytes {
            if payload.len() as u64 > max_bytes {
                tracing::debug!(
                    key = %entry.key,
                    stored = payload.len(),
                    max_bytes,
                    "Value larger than L2 budget, skipped"
                );
                return false;
            }
        }

        let stored = self
            .with_conn("set", |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO cache_entries
                     (key, value, category, created_at, expires_at, access_count, size_bytes, compressed, last_accessed)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8)",
                    params![
                        entry.key,
                        &payload[..],
                        entry.category,
                        entry.created_at.timestamp_millis(),
                        entry.expires_at.map(|t| t.timestamp_millis()),
                        payload.len() as i64,
                        compressed,
                        now_ms,
                    ],
                )
            })
            .is_some();
        self.metrics.record_write_latency(tracker.elapsed());

        if !stored {
            return false;
        }
        self.metrics.record_set();
        if compressed {
            tracing::debug!(
                key = %entry.key,
                raw = entry.value.len(),
                stored = payload.len(),
                "L2 stored compressed value"
            );
        }

        if self.config.max_rows.is_some() || self.config.max_bytes.is_some() {
            self.enforce_budget(Some(&entry.key));
        }
        true
    }

    fn delete(&self, key: &str) -> bool {
        let removed = self
            .with_conn("delete", |conn| {
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            })
            .unwrap_or(0);
        if removed > 0 {
            self.metrics.record_delete();
        }
        removed > 0
    }

    fn clear(&self) {
        self.with_conn("clear", |conn| conn.execute("DELETE FROM cache_entries", []));
    }

    fn invalidate_category(&self, category: &str) -> usize {
        let removed = self
            .with_conn("invalidate_category", |conn| {
                conn.execute(
                    "DELETE FROM cache_entries WHERE category = ?1",
                    params![category],
                )
            })
            .unwrap_or(0);
        self.metrics.record_deletes(removed as u64);
        removed
    }

    fn invalidate_pattern(&self, pattern: &str) -> usize {
        let removed = self
            .with_conn("invalidate_pattern", |conn| {
                conn.execute(
                    "DELETE FROM cache_entries WHERE instr(key, ?1) > 0",
                    params![pattern],
                )
            })
            .unwrap_or(0);
        self.metrics.record_deletes(removed as u64);
        removed
    }

    fn keys(&self) -> Vec<String> {
        self.with_conn("keys", |conn| {
            let mut stmt = conn.prepare("SELECT key FROM cache_entries ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>();
            keys
        })
        .unwrap_or_default()
    }

    fn sweep_expired(&self) -> usize {
        let now_ms = self.clock.now().timestamp_millis();
        let batch = self.config.sweep_batch_size.max(1);
        let mut total = 0usize;

        // Lock is released between batches so readers interleave
        loop {
            let removed = self
                .with_conn("sweep_expired", |conn| {
                    conn.execute(
                        "DELETE FROM cache_entries WHERE key IN (
                             SELECT key FROM cache_entries
                             WHERE expires_at IS NOT NULL AND expires_at < ?1
                             LIMIT ?2)",
                        params![now_ms, batch as i64],
                    )
                })
                .unwrap_or(0);
            total += removed;
            if removed < batch {
                break;
            }
        }

        if total > 0 {
            tracing::debug!(removed = total, "L2 swept expired entries");
            self.metrics.record_expirations(total as u64);
        }
        total
    }

    fn enforce_capacity(&self) -> usize {
        self.enforce_budget(None)
    }

    fn len(&self) -> usize {
        self.usage().map_or(0, |(rows, _)| rows as usize)
    }

    fn size_bytes(&self) -> u64 {
        self.usage().map_or(0, |(_, bytes)| bytes)
    }

    fn stats(&self) -> TierStats {
        let (rows, bytes) = self.usage().unwrap_or((0, 0));
        self.metrics.snapshot(CacheTier::L2, rows, bytes)
    }

    fn health(&self) -> ComponentHealth {
        ComponentHealth::timed(|| {
            let check = self
                .conn
                .lock()
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
                    row.get::<_, i64>(0)
                });
            match check {
                Ok(_) => ComponentHealth::healthy(CacheTier::L2.name()),
                Err(e) => ComponentHealth::unhealthy(CacheTier::L2.name(), e.to_string()),
            }
        })
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "MEMORY", |row| {
        row.get::<_, String>(0)
    })?;
    conn.pragma_update(None, "synchronous", "OFF")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -16000)?;
    conn.execute_batch(SCHEMA)?;
    // Fails fast on files that are not SQLite databases
    conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(())
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

fn remove_database_files(path: &Path) {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }

    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %candidate.display(), "Failed to remove database file: {}", e),
        }
    }
}

fn evict_least_recent(
    conn: &mut Connection,
    rows_excess: u64,
    bytes_excess: u64,
    keep: Option<&str>,
) -> rusqlite::Result<usize> {
    let victims = {
        let mut stmt = conn.prepare(
            "SELECT key, size_bytes FROM cache_entries
             WHERE ?1 IS NULL OR key != ?1
             ORDER BY last_accessed ASC, created_at ASC",
        )?;
        let mut rows = stmt.query(params![keep])?;
        let mut victims: Vec<String> = Vec::new();
        let mut freed = 0u64;
        while let Some(row) = rows.next()? {
            if victims.len() as u64 >= rows_excess && freed >= bytes_excess {
                break;
            }
            victims.push(row.get(0)?);
            freed += row.get::<_, i64>(1)?.max(0) as u64;
        }
        victims
    };

    let tx = conn.transaction()?;
    {
        let mut delete = tx.prepare("DELETE FROM cache_entries WHERE key = ?1")?;
        for key in &victims {
            delete.execute(params![key])?;
        }
    }
    tx.commit()?;
    Ok(victims.len())
}

fn is_corruption(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

// =============================================================================
// Tests
// =============================================================================
