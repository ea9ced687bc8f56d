//! Error types for the tiered cache
//!
//! These errors surface only from construction and configuration APIs.
//! The runtime cache API (`get`/`set`/`invalidate`) never returns them:
//! tiers log, count, and degrade to a miss or a no-op instead.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded database error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Stored entry could not be decoded
    #[error("Corrupt cache entry '{key}': {reason}")]
    CorruptEntry { key: String, reason: String },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// Build a corruption error for `key`
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CorruptEntry {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that mean the stored bytes are unusable
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptEntry { .. } | Error::DecompressionFailed { .. }
        )
    }
}
