//! Cache Entry Types
//!
//! The value envelope shared by every tier. Values are opaque bytes; typed
//! data goes through [`super::codec`] first.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::clock::expiry_after;

/// Cache key - an opaque string, unique within a tier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Separator used by [`CacheKey::compose`]
    pub const SEPARATOR: char = ':';

    /// Create a key from any string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Join a logical name with its parameters, e.g. `week:5:tasklist`
    pub fn compose<I, P>(name: &str, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: fmt::Display,
    {
        let mut key = String::from(name);
        for param in params {
            key.push(Self::SEPARATOR);
            key.push_str(&param.to_string());
        }
        Self(key)
    }

    /// Get the key string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic file-system-safe name derived from the key
    pub fn file_stem(&self) -> String {
        file_stem(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase hex SHA-256 of `key`
pub fn file_stem(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache entry containing the decoded value and its bookkeeping
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// Decoded value
    pub value: Bytes,
    /// Category used for routing and bulk invalidation
    pub category: String,
    /// When the value was written
    pub created_at: DateTime<Utc>,
    /// When the value stops being served (`None` = never)
    pub expires_at: Option<DateTime<Utc>>,
    /// Reads served for this entry by the tier that returned it
    pub access_count: u64,
    /// Length of the payload as stored by the producing tier
    pub size_bytes: u64,
    /// Whether the stored payload is compressed
    pub compressed: bool,
}

impl CacheEntry {
    /// Create a fresh, uncompressed entry
    pub fn new(
        key: impl Into<String>,
        value: Bytes,
        category: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Self {
        let size_bytes = value.len() as u64;
        Self {
            key: key.into(),
            value,
            category: category.into(),
            created_at: now,
            expires_at: ttl.map(|ttl| expiry_after(now, ttl)),
            access_count: 0,
            size_bytes,
            compressed: false,
        }
    }

    /// Decoded value length
    #[inline]
    pub fn raw_len(&self) -> u64 {
        self.value.len() as u64
    }

    /// True once `now` is past `expires_at`
    #[inline]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    /// Time left before expiry (`None` = no expiry, zero = expired)
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| (expires_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Copy of this entry re-stamped for storage in a tier that keeps the
    /// decoded value uncompressed
    pub fn as_uncompressed(&self) -> Self {
        Self {
            size_bytes: self.raw_len(),
            compressed: false,
            ..self.clone()
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("category", &self.category)
            .field("size_bytes", &self.size_bytes)
            .field("compressed", &self.compressed)
            .field("access_count", &self.access_count)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_compose() {
        let key = CacheKey::compose("week", [5]);
        assert_eq!(key.as_str(), "week:5");

        let key = CacheKey::compose("report", ["2024", "q1", "hours"]);
        assert_eq!(key.to_string(), "report:2024:q1:hours");

        let key = CacheKey::compose("plain", Vec::<u32>::new());
        assert_eq!(key.as_str(), "plain");
    }

    #[test]
    fn test_file_stem_is_deterministic_hex() {
        let a = CacheKey::new("week:5:tasklist").file_stem();
        let b = file_stem("week:5:tasklist");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, file_stem("week:6:tasklist"));
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let now = Utc::now();
        let entry = CacheEntry::new("k", Bytes::from_static(b"v"), "default", now, None);
        assert!(!entry.is_expired_at(now + chrono::Duration::days(3650)));
        assert_eq!(entry.remaining_ttl(now), None);
    }

    #[test]
    fn test_entry_expiry() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            "k",
            Bytes::from_static(b"v"),
            "default",
            now,
            Some(Duration::from_secs(60)),
        );

        assert!(!entry.is_expired_at(now));
        assert!(!entry.is_expired_at(now + chrono::Duration::seconds(60)));
        assert!(entry.is_expired_at(now + chrono::Duration::seconds(61)));
        assert_eq!(entry.remaining_ttl(now), Some(Duration::from_secs(60)));
        assert_eq!(
            entry.remaining_ttl(now + chrono::Duration::seconds(120)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_entry_size_tracks_payload() {
        let entry = CacheEntry::new(
            "k",
            Bytes::from_static(b"Hello, World!"),
            "default",
            Utc::now(),
            None,
        );
        assert_eq!(entry.size_bytes, 13);
        assert!(!entry.compressed);

        let stored = CacheEntry {
            size_bytes: 7,
            compressed: true,
            ..entry.clone()
        };
        let plain = stored.as_uncompressed();
        assert_eq!(plain.size_bytes, 13);
        assert!(!plain.compressed);
    }

    #[test]
    fn test_entry_debug_omits_value() {
        let entry = CacheEntry::new("k", Bytes::from_static(b"secret"), "c", Utc::now(), None);
        let debug = format!("{:?}", entry);
        assert!(debug.contains("CacheEntry"));
        assert!(debug.contains("size_bytes"));
        assert!(!debug.contains("secret"));
    }
}
