//! Cache Compression Support
//!
//! LZ4 compression with automatic fallback to storing bytes as-is.
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::{CompressionAlgorithm, CompressionManager};
//!
//! let manager = CompressionManager::new();
//!
//! let data = b"Hello, this is test data that should compress well!".repeat(64);
//! let (compressed, algorithm) = manager.compress(&data);
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//!
//! let decompressed = manager.decompress(&compressed, algorithm).unwrap();
//! assert_eq!(decompressed.as_ref(), data.as_slice());
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Stable on-disk identifier
    pub fn id(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    /// Inverse of [`CompressionAlgorithm::id`]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm to use when compression is worthwhile
    pub algorithm: CompressionAlgorithm,
    /// Minimum size to compress (smaller values are stored uncompressed)
    pub min_size_bytes: u64,
    /// Required fractional saving before the compressed form is kept
    pub min_savings: f64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: 1024,
            min_savings: 0.10,
            level: 4,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor (no compression)
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block compressor; the decoded length is prepended to each block
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create new LZ4 compressor with default settings
    pub fn new() -> Self {
        Self { level: 4 }
    }

    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Compression front-end used by the persistent tiers
pub struct CompressionManager {
    config: CompressionConfig,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    /// Create a new compression manager with default config
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            noop: NoopCompressor,
            config,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Compress with the configured algorithm when it pays off
    ///
    /// Returns (stored_bytes, algorithm_used). Values below the size
    /// threshold, values that do not shrink by `min_savings`, and values the
    /// codec rejects are returned unchanged with [`CompressionAlgorithm::None`].
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if (data.len() as u64) < self.config.min_size_bytes {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }
        self.compress_with(data, self.config.algorithm)
    }

    /// Compress with a specific algorithm, still falling back when it does
    /// not save enough
    pub fn compress_with(
        &self,
        data: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> (Bytes, CompressionAlgorithm) {
        if algorithm == CompressionAlgorithm::None {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.compressor(algorithm).compress(data) {
            Ok(compressed) if self.worth_keeping(compressed.len(), data.len()) => {
                (Bytes::from(compressed), algorithm)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!("Compression with {} failed, storing uncompressed: {}", algorithm, e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    fn worth_keeping(&self, compressed_len: usize, raw_len: usize) -> bool {
        let budget = raw_len as f64 * (1.0 - self.config.min_savings);
        compressed_len < raw_len && (compressed_len as f64) <= budget
    }

    /// Decompress data
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}
