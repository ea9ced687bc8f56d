//! L3 Cache - Compressed Blob Files
//!
//! File-per-entry storage for large payloads (reports, exported charts).
//! Each value is framed, optionally LZ4-compressed, and written to
//! `objects/<sha256(key)>.blob`. A JSON index maps keys to file metadata
//! and is rehydrated at startup.
//!
//! # Design
//!
//! - Writes go to a temp file in the objects directory and are renamed into
//!   place under the index lock, so readers never see a partial file
//! - Reads and decompression happen outside the lock
//! - Corrupt or missing files purge the entry; other read errors are a
//!   miss that keeps it
//! - Sweeps and evictions detach index entries in batches and unlink the
//!   files after releasing the lock
//! - Byte budget enforced least-recently-accessed first

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::clock::Clock;
use super::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use super::entry::{file_stem, CacheEntry};
use super::health::ComponentHealth;
use super::metrics::{LatencyTracker, TierMetrics, TierStats};
use super::tier::{CacheTier, TierStore};
use super::DEFAULT_L3_MAX_BYTES;
use crate::error::{Error, Result};

/// Blob file magic
const BLOB_MAGIC: &[u8; 4] = b"TCB1";
/// Blob frame version
const BLOB_VERSION: u8 = 1;
/// magic + version + algorithm + raw length + payload length
const HEADER_LEN: usize = 4 + 1 + 1 + 8 + 8;

const INDEX_FILE: &str = "index.json";
const OBJECTS_DIR: &str = "objects";
const BLOB_EXTENSION: &str = "blob";

/// L3 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L3Config {
    /// Whether the tier is opened at all
    pub enabled: bool,
    /// Root directory holding `objects/` and `index.json`
    pub dir: PathBuf,
    /// Maximum bytes on disk across all blob files
    pub max_bytes: Option<u64>,
    /// Algorithm used for blob payloads
    pub compression: CompressionAlgorithm,
    /// Entries removed per lock acquisition when sweeping or evicting
    pub sweep_batch_size: usize,
}

impl Default for L3Config {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("cache/blobs"),
            max_bytes: Some(DEFAULT_L3_MAX_BYTES),
            compression: CompressionAlgorithm::Lz4,
            sweep_batch_size: 256,
        }
    }
}

/// Index record for one blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// File name inside `objects/`
    pub file_name: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    /// Bytes on disk, header included
    pub size_bytes: u64,
    /// Decoded payload length
    pub raw_size: u64,
    pub compressed: bool,
}

impl BlobMeta {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u8,
    entries: HashMap<String, BlobMeta>,
}

#[derive(Default)]
struct BlobIndex {
    entries: HashMap<String, BlobMeta>,
    bytes: u64,
    /// Access bookkeeping not yet written to disk
    dirty: bool,
}

impl BlobIndex {
    fn from_entries(entries: HashMap<String, BlobMeta>) -> Self {
        let bytes = entries.values().map(|meta| meta.size_bytes).sum();
        Self {
            entries,
            bytes,
            dirty: false,
        }
    }

    fn insert(&mut self, key: String, meta: BlobMeta) {
        self.bytes += meta.size_bytes;
        if let Some(previous) = self.entries.insert(key, meta) {
            self.bytes = self.bytes.saturating_sub(previous.size_bytes);
        }
    }

    fn remove(&mut self, key: &str) -> Option<BlobMeta> {
        let removed = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(removed.size_bytes);
        Some(removed)
    }
}

/// L3 Cache - compressed blob file tier
pub struct BlobTier {
    dir: PathBuf,
    objects_dir: PathBuf,
    index_path: PathBuf,
    index: Mutex<BlobIndex>,
    config: L3Config,
    compression: CompressionManager,
    clock: Arc<dyn Clock>,
    metrics: TierMetrics,
}

impl BlobTier {
    /// Open (or create) the blob store under `config.dir`
    ///
    /// The index is reconciled with the objects directory: entries whose
    /// file is gone are dropped and unreferenced files are deleted.
    pub fn open(
        config: L3Config,
        compression: CompressionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dir = config.dir.clone();
        let objects_dir = dir.join(OBJECTS_DIR);
        let index_path = dir.join(INDEX_FILE);
        std::fs::create_dir_all(&objects_dir)?;

        let loaded = load_index(&index_path);
        let rebuilt = loaded.is_none();
        let mut entries = loaded.unwrap_or_default();

        let before = entries.len();
        entries.retain(|key, meta| {
            let present = objects_dir.join(&meta.file_name).is_file();
            if !present {
                tracing::warn!(key = %key, "L3 index entry has no blob file, dropping it");
            }
            present
        });
        let dropped = before - entries.len();
        let removed_files = remove_unreferenced_files(&objects_dir, &entries)?;

        let tier = Self {
            dir,
            objects_dir,
            index_path,
            index: Mutex::new(BlobIndex::from_entries(entries)),
            compression: CompressionManager::with_config(CompressionConfig {
                algorithm: config.compression,
                ..compression
            }),
            config,
            clock,
            metrics: TierMetrics::new(),
        };

        if rebuilt || dropped > 0 || removed_files > 0 {
            tier.write_index(&tier.index.lock())?;
        }

        let (entries, bytes) = {
            let index = tier.index.lock();
            (index.entries.len(), index.bytes)
        };
        tracing::info!(
            dir = %tier.dir.display(),
            entries,
            bytes,
            dropped,
            removed_files,
            "L3 cache opened"
        );
        Ok(tier)
    }

    /// Configuration
    pub fn config(&self) -> &L3Config {
        &self.config
    }

    /// Path of the file that holds (or would hold) `key`
    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.objects_dir.join(blob_file_name(key))
    }

    fn write_index(&self, index: &BlobIndex) -> Result<()> {
        let snapshot = IndexFile {
            version: BLOB_VERSION,
            entries: index.entries.clone(),
        };
        let json = serde_json::to_vec(&snapshot)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&json)?;
        temp.persist(&self.index_path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Write the index, keeping it dirty if the write fails
    fn persist_index(&self, index: &mut BlobIndex) {
        match self.write_index(index) {
            Ok(()) => index.dirty = false,
            Err(e) => {
                index.dirty = true;
                self.metrics.record_error();
                tracing::warn!(path = %self.index_path.display(), "Failed to write L3 index: {}", e);
            }
        }
    }

    fn remove_blob_file(&self, file_name: &str) {
        let path = self.objects_dir.join(file_name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.metrics.record_error();
                tracing::warn!(path = %path.display(), "Failed to remove blob file: {}", e);
            }
        }
    }

    fn batch_size(&self) -> usize {
        self.config.sweep_batch_size.max(1)
    }

    /// Detach `keys` from the index, returning the files to unlink
    fn detach(index: &mut BlobIndex, keys: &[String]) -> Vec<String> {
        let files: Vec<String> = keys
            .iter()
            .filter_map(|key| index.remove(key))
            .map(|meta| meta.file_name)
            .collect();
        if !files.is_empty() {
            index.dirty = true;
        }
        files
    }

    fn remove_files(&self, files: &[String]) {
        for file_name in files {
            self.remove_blob_file(file_name);
        }
    }

    fn remove_matching(&self, predicate: impl Fn(&str, &BlobMeta) -> bool) -> usize {
        let batch_size = self.batch_size();
        let mut removed = 0;

        loop {
            let files = {
                let mut index = self.index.lock();
                let doomed: Vec<String> = index
                    .entries
                    .iter()
                    .filter(|(key, meta)| predicate(key, meta))
                    .map(|(key, _)| key.clone())
                    .take(batch_size)
                    .collect();
                Self::detach(&mut index, &doomed)
            };

            removed += files.len();
            self.remove_files(&files);
            if files.len() < batch_size {
                break;
            }
        }

        if removed > 0 {
            self.flush();
        }
        removed
    }

    /// Evict least-recently-accessed blobs until within budget; `keep` is
    /// never chosen as a victim
    fn enforce_budget(&self, keep: Option<&str>) -> usize {
        let Some(max_bytes) = self.config.max_bytes else {
            return 0;
        };
        let batch_size = self.batch_size();
        let mut evicted = 0;

        loop {
            let files = {
                let mut index = self.index.lock();
                let excess = index.bytes.saturating_sub(max_bytes);
                if excess == 0 {
                    break;
                }

                let mut candidates: Vec<(&str, DateTime<Utc>, u64)> = index
                    .entries
                    .iter()
                    .filter(|(key, _)| Some(key.as_str()) != keep)
                    .map(|(key, meta)| (key.as_str(), meta.last_accessed, meta.size_bytes))
                    .collect();
                candidates.sort_by_key(|(_, last_accessed, _)| *last_accessed);

                let mut victims = Vec::new();
                let mut freed = 0u64;
                for (key, _, size_bytes) in candidates {
                    if freed >= excess || victims.len() == batch_size {
                        break;
                    }
                    freed += size_bytes;
                    victims.push(key.to_string());
                }
                if victims.is_empty() {
                    break;
                }
                Self::detach(&mut index, &victims)
            };

            evicted += files.len();
            self.remove_files(&files);
        }

        if evicted > 0 {
            self.flush();
            tracing::debug!(evicted, "L3 evicted least-recently-accessed blobs");
            self.metrics.record_evictions(evicted as u64);
        }
        evicted
    }

    /// Drop `key` if the index still describes the write we failed to read
    fn purge(&self, key: &str, seen: &BlobMeta) {
        let mut index = self.index.lock();
        if index.entries.get(key).map(|m| m.created_at) != Some(seen.created_at) {
            return;
        }
        index.remove(key);
        self.remove_blob_file(&seen.file_name);
        self.persist_index(&mut index);
    }

    fn read_blob(&self, key: &str, meta: &BlobMeta) -> Result<Bytes> {
        let data = std::fs::read(self.objects_dir.join(&meta.file_name))?;
        let (algorithm, raw_len, payload) = decode_blob(key, &data)?;
        let value = self.compression.decompress(payload, algorithm)?;
        if value.len() as u64 != raw_len || raw_len != meta.raw_size {
            return Err(Error::corrupt(
                key,
                format!(
                    "decoded {} bytes, header says {}, index says {}",
                    value.len(),
                    raw_len,
                    meta.raw_size
                ),
            ));
        }
        Ok(value)
    }

    fn write_temp(&self, frame: &[u8]) -> Result<NamedTempFile> {
        let mut temp = NamedTempFile::new_in(&self.objects_dir)?;
        temp.write_all(frame)?;
        Ok(temp)
    }
}

impl TierStore for BlobTier {
    fn tier(&self) -> CacheTier {
        CacheTier::L3
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        let tracker = LatencyTracker::start();
        let now = self.clock.now();

        let Some(meta) = self.index.lock().entries.get(key).cloned() else {
            self.metrics.record_miss();
            return None;
        };

        if meta.is_expired_at(now) {
            self.purge(key, &meta);
            self.metrics.record_expirations(1);
            self.metrics.record_miss();
            return None;
        }

        let value = match self.read_blob(key, &meta) {
            Ok(value) => value,
            Err(e) => {
                self.metrics.record_error();
                self.metrics.record_miss();
                let missing = matches!(&e, Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound);
                if e.is_corruption() || missing {
                    tracing::warn!(key, "Dropping unreadable L3 blob: {}", e);
                    self.purge(key, &meta);
                } else {
                    tracing::warn!(key, "Failed to read L3 blob, keeping entry: {}", e);
                }
                return None;
            }
        };

        let access_count = {
            let mut index = self.index.lock();
            match index.entries.get_mut(key) {
                Some(current) if current.created_at == meta.created_at => {
                    current.access_count += 1;
                    current.last_accessed = now;
                    let count = current.access_count;
                    index.dirty = true;
                    count
                }
                _ => meta.access_count + 1,
            }
        };

        self.metrics.record_hit();
        self.metrics.record_read_latency(tracker.elapsed());
        Some(CacheEntry {
            key: key.to_string(),
            value,
            category: meta.category,
            created_at: meta.created_at,
            expires_at: meta.expires_at,
            access_count,
            size_bytes: meta.size_bytes,
            compressed: meta.compressed,
        })
    }

    fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.index
            .lock()
            .entries
            .get(key)
            .is_some_and(|meta| !meta.is_expired_at(now))
    }

    fn set(&self, entry: CacheEntry) -> bool {
        let tracker = LatencyTracker::start();
        let raw_size = entry.raw_len();
        let (payload, algorithm) = self.compression.compress(&entry.value);
        let frame = encode_blob(algorithm, raw_size, &payload);
        let size_bytes = frame.len() as u64;

        if let Some(max_bytes) = self.config.max_bytes {
            if size_bytes > max_bytes {
                tracing::debug!(key = %entry.key, size_bytes, max_bytes, "Blob larger than L3 budget, skipped");
                return false;
            }
        }

        let temp = match self.write_temp(&frame) {
            Ok(temp) => temp,
            Err(e) => {
                self.metrics.record_error();
                tracing::warn!(key = %entry.key, "Failed to write L3 blob: {}", e);
                return false;
            }
        };

        let file_name = blob_file_name(&entry.key);
        let meta = BlobMeta {
            file_name: file_name.clone(),
            category: entry.category,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            last_accessed: self.clock.now(),
            access_count: 0,
            size_bytes,
            raw_size,
            compressed: algorithm != CompressionAlgorithm::None,
        };

        let over_budget = {
            let mut index = self.index.lock();
            if let Err(e) = temp.persist(self.objects_dir.join(&file_name)) {
                self.metrics.record_error();
                tracing::warn!(key = %entry.key, "Failed to move L3 blob into place: {}", e.error);
                return false;
            }
            index.insert(entry.key.clone(), meta);
            self.persist_index(&mut index);
            self.config.max_bytes.is_some_and(|max| index.bytes > max)
        };

        self.metrics.record_set();
        self.metrics.record_write_latency(tracker.elapsed());
        if over_budget {
            self.enforce_budget(Some(&entry.key));
        }
        true
    }

    fn delete(&self, key: &str) -> bool {
        let mut index = self.index.lock();
        let Some(meta) = index.remove(key) else {
            return false;
        };
        self.remove_blob_file(&meta.file_name);
        self.persist_index(&mut index);
        self.metrics.record_delete();
        true
    }

    fn clear(&self) {
        let files: Vec<String> = {
            let mut index = self.index.lock();
            let files = index.entries.drain().map(|(_, meta)| meta.file_name).collect();
            index.bytes = 0;
            self.persist_index(&mut index);
            files
        };
        self.remove_files(&files);
    }

    fn invalidate_category(&self, category: &str) -> usize {
        let removed = self.remove_matching(|_, meta| meta.category == category);
        self.metrics.record_deletes(removed as u64);
        removed
    }

    fn invalidate_pattern(&self, pattern: &str) -> usize {
        let removed = self.remove_matching(|key, _| key.contains(pattern));
        self.metrics.record_deletes(removed as u64);
        removed
    }

    fn keys(&self) -> Vec<String> {
        self.index.lock().entries.keys().cloned().collect()
    }

    fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = self.remove_matching(|_, meta| meta.is_expired_at(now));
        if removed > 0 {
            tracing::debug!(removed, "L3 swept expired blobs");
            self.metrics.record_expirations(removed as u64);
        }
        removed
    }

    fn enforce_capacity(&self) -> usize {
        self.enforce_budget(None)
    }

    fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    fn size_bytes(&self) -> u64 {
        self.index.lock().bytes
    }

    fn stats(&self) -> TierStats {
        let (entries, bytes) = {
            let index = self.index.lock();
            (index.entries.len() as u64, index.bytes)
        };
        self.metrics.snapshot(CacheTier::L3, entries, bytes)
    }

    fn health(&self) -> ComponentHealth {
        ComponentHealth::timed(|| match std::fs::metadata(&self.objects_dir) {
            Ok(meta) if meta.is_dir() => ComponentHealth::healthy(CacheTier::L3.name()),
            Ok(_) => ComponentHealth::unhealthy(
                CacheTier::L3.name(),
                format!("{} is not a directory", self.objects_dir.display()),
            ),
            Err(e) => ComponentHealth::unhealthy(CacheTier::L3.name(), e.to_string()),
        })
    }

    fn flush(&self) {
        let mut index = self.index.lock();
        if index.dirty {
            self.persist_index(&mut index);
        }
    }
}

fn blob_file_name(key: &str) -> String {
    format!("{}.{}", file_stem(key), BLOB_EXTENSION)
}

/// Frame a payload for storage
fn encode_blob(algorithm: CompressionAlgorithm, raw_len: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(BLOB_MAGIC);
    frame.put_u8(BLOB_VERSION);
    frame.put_u8(algorithm.id());
    frame.put_u64_le(raw_len);
    frame.put_u64_le(payload.len() as u64);
    frame.put_slice(payload);
    frame
}

/// Validate a frame and return (algorithm, raw_len, payload)
fn decode_blob<'a>(key: &str, data: &'a [u8]) -> Result<(CompressionAlgorithm, u64, &'a [u8])> {
    if data.len() < HEADER_LEN {
        return Err(Error::corrupt(key, format!("blob is {} bytes, shorter than header", data.len())));
    }
    let (mut header, payload) = data.split_at(HEADER_LEN);

    if &header[..4] != BLOB_MAGIC {
        return Err(Error::corrupt(key, "bad magic"));
    }
    header.advance(4);

    let version = header.get_u8();
    if version != BLOB_VERSION {
        return Err(Error::corrupt(key, format!("unsupported version {}", version)));
    }

    let algorithm_id = header.get_u8();
    let algorithm = CompressionAlgorithm::from_id(algorithm_id)
        .ok_or_else(|| Error::corrupt(key, format!("unknown algorithm {}", algorithm_id)))?;

    let raw_len = header.get_u64_le();
    let payload_len = header.get_u64_le();
    if payload_len != payload.len() as u64 {
        return Err(Error::corrupt(
            key,
            format!("payload is {} bytes, header says {}", payload.len(), payload_len),
        ));
    }
    if algorithm == CompressionAlgorithm::None && raw_len != payload_len {
        return Err(Error::corrupt(key, "uncompressed length mismatch"));
    }

    Ok((algorithm, raw_len, payload))
}

/// Read the index; `None` means it was unreadable and must be rebuilt
fn load_index(path: &Path) -> Option<HashMap<String, BlobMeta>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Some(HashMap::new()),
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to read L3 index, starting empty: {}", e);
            return None;
        }
    };

    match serde_json::from_slice::<IndexFile>(&data) {
        Ok(index) if index.version == BLOB_VERSION => Some(index.entries),
        Ok(index) => {
            tracing::warn!(version = index.version, "Unsupported L3 index version, starting empty");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "Corrupt L3 index, starting empty: {}", e);
            None
        }
    }
}

/// Delete everything in `objects_dir` the index does not reference
fn remove_unreferenced_files(
    objects_dir: &Path,
    entries: &HashMap<String, BlobMeta>,
) -> Result<usize> {
    let referenced: std::collections::HashSet<&str> =
        entries.values().map(|meta| meta.file_name.as_str()).collect();

    let mut removed = 0;
    for dir_entry in std::fs::read_dir(objects_dir)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let keep = name
            .to_str()
            .is_some_and(|name| referenced.contains(name));
        if keep || !dir_entry.file_type()?.is_file() {
            continue;
        }

        match std::fs::remove_file(dir_entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(
                path = %dir_entry.path().display(),
                "Failed to remove stale blob file: {}",
                e
            ),
        }
    }
    Ok(removed)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::cache::clock::{ManualClock, SystemClock};

    fn open_at(dir: &Path, max_bytes: Option<u64>, clock: Arc<dyn Clock>) -> BlobTier {
        let config = L3Config {
            dir: dir.to_path_buf(),
            max_bytes,
            ..L3Config::default()
        };
        BlobTier::open(config, CompressionConfig::default(), clock).unwrap()
    }

    fn open_tier() -> (TempDir, BlobTier) {
        let dir = tempfile::tempdir().unwrap();
        let tier = open_at(dir.path(), None, Arc::new(SystemClock));
        (dir, tier)
    }

    fn entry(clock: &dyn Clock, key: &str, data: &[u8]) -> CacheEntry {
        CacheEntry::new(key, Bytes::copy_from_slice(data), "analytics", clock.now(), None)
    }

    fn compressible(len: usize) -> Vec<u8> {
        b"2024-W05,project-alpha,4.5h,design review;"
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn test_l3_compression_fidelity() {
        let (_dir, tier) = open_tier();
        let data = compressible(256 * 1024);

        assert!(tier.set(entry(&SystemClock, "chart:weekly", &data)));

        let file_len = std::fs::metadata(tier.blob_path("chart:weekly")).unwrap().len();
        assert!(file_len <= data.len() as u64);

        let found = tier.get("chart:weekly").unwrap();
        assert_eq!(found.value.as_ref(), data.as_slice());
        assert!(found.compressed);
        assert_eq!(found.size_bytes, file_len);
        assert_eq!(found.access_count, 1);
    }

    #[test]
    fn test_l3_small_values_stored_plain() {
        let (_dir, tier) = open_tier();
        tier.set(entry(&SystemClock, "tiny", b"abc"));

        let found = tier.get("tiny").unwrap();
        assert_eq!(found.value.as_ref(), b"abc");
        assert!(!found.compressed);
        assert_eq!(found.size_bytes, (HEADER_LEN + 3) as u64);
    }

    #[test]
    fn test_l3_truncated_file_is_a_miss() {
        let (_dir, tier) = open_tier();
        let data = compressible(64 * 1024);
        tier.set(entry(&SystemClock, "report", &data));

        let path = tier.blob_path("report");
        let stored = std::fs::read(&path).unwrap();
        std::fs::write(&path, &stored[..stored.len() / 2]).unwrap();

        assert!(tier.get("report").is_none());
        assert!(!tier.contains("report"));
        assert!(!path.exists());
        assert_eq!(tier.stats().errors, 1);
    }

    #[test]
    fn test_l3_deleted_file_is_a_miss() {
        let (_dir, tier) = open_tier();
        tier.set(entry(&SystemClock, "report", &compressible(8192)));

        std::fs::remove_file(tier.blob_path("report")).unwrap();

        assert!(tier.get("report").is_none());
        assert!(tier.keys().is_empty());
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.size_bytes(), 0);
    }

    #[test]
    fn test_l3_bad_magic_is_corruption() {
        let (_dir, tier) = open_tier();
        tier.set(entry(&SystemClock, "k", b"payload"));

        let path = tier.blob_path("k");
        let mut stored = std::fs::read(&path).unwrap();
        stored[0] = b'X';
        std::fs::write(&path, &stored).unwrap();

        assert!(tier.get("k").is_none());
        assert!(!tier.contains("k"));
    }

    #[test]
    fn test_decode_blob_validates_header() {
        let frame = encode_blob(CompressionAlgorithm::None, 3, b"abc");
        let (algorithm, raw_len, payload) = decode_blob("k", &frame).unwrap();
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(raw_len, 3);
        assert_eq!(payload, b"abc");

        let mut bad_version = frame.clone();
        bad_version[4] = 9;
        assert!(decode_blob("k", &bad_version).unwrap_err().is_corruption());

        let mut bad_algorithm = frame.clone();
        bad_algorithm[5] = 7;
        assert!(decode_blob("k", &bad_algorithm).is_err());

        let mut extended = frame.clone();
        extended.push(0);
        assert!(decode_blob("k", &extended).is_err());

        assert!(decode_blob("k", &frame[..10]).is_err());
    }

    #[test]
    fn test_l3_rehydrates_index() {
        let dir = tempfile::tempdir().unwrap();
        let data = compressible(10_000);

        {
            let tier = open_at(dir.path(), None, Arc::new(SystemClock));
            tier.set(entry(&SystemClock, "kept", &data));
            tier.set(entry(&SystemClock, "lost", b"gone soon"));
            assert!(tier.get("kept").is_some());
            tier.flush();
            std::fs::remove_file(tier.blob_path("lost")).unwrap();
        }

        // A stray temp file and an unreferenced blob left by a crash
        std::fs::write(dir.path().join(OBJECTS_DIR).join(".tmpabc123"), b"partial").unwrap();
        std::fs::write(dir.path().join(OBJECTS_DIR).join("orphan.blob"), b"stale").unwrap();

        let tier = open_at(dir.path(), None, Arc::new(SystemClock));
        assert_eq!(tier.keys(), vec!["kept".to_string()]);

        let found = tier.get("kept").unwrap();
        assert_eq!(found.value.as_ref(), data.as_slice());
        assert_eq!(found.access_count, 2);

        let files: Vec<_> = std::fs::read_dir(dir.path().join(OBJECTS_DIR))
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_l3_corrupt_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tier = open_at(dir.path(), None, Arc::new(SystemClock));
            tier.set(entry(&SystemClock, "k", b"v"));
        }
        std::fs::write(dir.path().join(INDEX_FILE), b"{not json").unwrap();

        let tier = open_at(dir.path(), None, Arc::new(SystemClock));
        assert!(tier.is_empty());
        assert!(!tier.blob_path("k").exists());

        assert!(tier.set(entry(&SystemClock, "k", b"again")));
        assert_eq!(tier.get("k").unwrap().value.as_ref(), b"again");
    }

    #[test]
    fn test_l3_expiry_and_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let tier = open_at(dir.path(), None, clock.clone());

        for key in ["a", "b"] {
            tier.set(CacheEntry::new(
                key,
                Bytes::from_static(b"x"),
                "analytics",
                clock.now(),
                Some(Duration::from_secs(60)),
            ));
        }
        tier.set(entry(clock.as_ref(), "keep", b"y"));

        clock.advance(Duration::from_secs(61));
        assert!(tier.get("a").is_none());
        assert_eq!(tier.sweep_expired(), 1);
        assert_eq!(tier.keys(), vec!["keep".to_string()]);
        assert!(!tier.blob_path("b").exists());
        assert_eq!(tier.stats().expirations, 2);
    }

    #[test]
    fn test_l3_evicts_least_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let blob = vec![7u8; 100];
        let blob_size = (HEADER_LEN + blob.len()) as u64;
        let tier = open_at(dir.path(), Some(blob_size * 3), clock.clone());

        for key in ["a", "b", "c"] {
            tier.set(entry(clock.as_ref(), key, &blob));
            clock.advance(Duration::from_secs(1));
        }
        assert!(tier.get("a").is_some());
        clock.advance(Duration::from_secs(1));

        tier.set(entry(clock.as_ref(), "d", &blob));

        assert_eq!(tier.len(), 3);
        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
        assert!(!tier.blob_path("b").exists());
        assert!(tier.size_bytes() <= blob_size * 3);
        assert_eq!(tier.stats().evictions, 1);

        // Bigger than the whole budget
        assert!(!tier.set(entry(clock.as_ref(), "huge", &vec![1u8; 1000])));
    }

    #[test]
    fn test_l3_new_blob_survives_eviction_with_equal_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let blob = vec![5u8; 100];
        let blob_size = (HEADER_LEN + blob.len()) as u64;
        let tier = open_at(dir.path(), Some(blob_size * 2), clock.clone());

        for key in ["a", "b", "c", "d"] {
            assert!(tier.set(entry(clock.as_ref(), key, &blob)));
            assert!(tier.contains(key), "{} evicted by its own write", key);
        }
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.stats().evictions, 2);
    }

    #[test]
    fn test_l3_sweep_runs_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let config = L3Config {
            dir: dir.path().to_path_buf(),
            sweep_batch_size: 2,
            ..L3Config::default()
        };
        let tier = BlobTier::open(config, CompressionConfig::default(), clock.clone()).unwrap();

        for i in 0..5 {
            tier.set(CacheEntry::new(
                format!("week:{}", i),
                Bytes::from_static(b"[]"),
                "analytics",
                clock.now(),
                Some(Duration::from_secs(60)),
            ));
        }
        tier.set(entry(clock.as_ref(), "keep", b"y"));

        clock.advance(Duration::from_secs(61));
        assert_eq!(tier.sweep_expired(), 5);
        assert_eq!(tier.keys(), vec!["keep".to_string()]);
        assert_eq!(tier.size_bytes(), (HEADER_LEN + 1) as u64);

        let files = std::fs::read_dir(dir.path().join(OBJECTS_DIR)).unwrap().count();
        assert_eq!(files, 1);

        // The index on disk matches
        drop(tier);
        let tier = open_at(dir.path(), None, clock);
        assert_eq!(tier.keys(), vec!["keep".to_string()]);
    }

    #[test]
    fn test_l3_reads_continue_during_large_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let config = L3Config {
            dir: dir.path().to_path_buf(),
            sweep_batch_size: 16,
            ..L3Config::default()
        };
        let tier = BlobTier::open(config, CompressionConfig::default(), clock.clone()).unwrap();

        for i in 0..500 {
            tier.set(CacheEntry::new(
                format!("stale:{}", i),
                Bytes::from_static(b"old"),
                "analytics",
                clock.now(),
                Some(Duration::from_secs(1)),
            ));
        }
        tier.set(entry(clock.as_ref(), "live", b"current report"));
        clock.advance(Duration::from_secs(2));

        let swept = std::thread::scope(|scope| {
            let sweeper = scope.spawn(|| tier.sweep_expired());
            while !sweeper.is_finished() {
                let found = tier.get("live").unwrap();
                assert_eq!(found.value.as_ref(), b"current report");
            }
            sweeper.join().unwrap()
        });

        assert_eq!(swept, 500);
        assert_eq!(tier.keys(), vec!["live".to_string()]);
        assert!(tier.get("live").is_some());
    }

    #[test]
    fn test_l3_transient_read_error_keeps_entry() {
        let (_dir, tier) = open_tier();
        tier.set(entry(&SystemClock, "report", b"weekly totals"));

        // A directory in place of the file fails the read without being corruption
        let path = tier.blob_path("report");
        let stored = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(tier.get("report").is_none());
        assert!(tier.contains("report"));
        assert_eq!(tier.stats().errors, 1);
        assert_eq!(tier.stats().misses, 1);

        std::fs::remove_dir(&path).unwrap();
        std::fs::write(&path, &stored).unwrap();
        assert_eq!(tier.get("report").unwrap().value.as_ref(), b"weekly totals");
    }

    #[test]
    fn test_l3_clear_removes_files() {
        let (dir, tier) = open_tier();
        for key in ["a", "b", "c"] {
            tier.set(entry(&SystemClock, key, b"v"));
        }

        tier.clear();

        assert!(tier.is_empty());
        assert_eq!(tier.size_bytes(), 0);
        let files = std::fs::read_dir(dir.path().join(OBJECTS_DIR)).unwrap().count();
        assert_eq!(files, 0);
    }

    #[test]
    fn test_l3_invalidate_category_removes_files() {
        let (_dir, tier) = open_tier();
        let now = SystemClock.now();
        tier.set(CacheEntry::new("r1", Bytes::from_static(b"1"), "reports", now, None));
        tier.set(CacheEntry::new("r2", Bytes::from_static(b"2"), "reports", now, None));
        tier.set(CacheEntry::new("c1", Bytes::from_static(b"3"), "charts", now, None));

        assert_eq!(tier.invalidate_category("reports"), 2);
        assert!(!tier.blob_path("r1").exists());
        assert!(tier.blob_path("c1").exists());

        assert_eq!(tier.invalidate_pattern("c"), 1);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_l3_overwrite_keeps_single_file() {
        let (dir, tier) = open_tier();
        tier.set(entry(&SystemClock, "k", b"first"));
        tier.set(entry(&SystemClock, "k", b"second version"));

        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size_bytes(), (HEADER_LEN + 14) as u64);
        assert_eq!(tier.get("k").unwrap().value.as_ref(), b"second version");

        let files = std::fs::read_dir(dir.path().join(OBJECTS_DIR)).unwrap().count();
        assert_eq!(files, 1);
        assert!(tier.health().status.is_healthy());
    }
}
