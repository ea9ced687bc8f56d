//! Cache configuration
//!
//! Everything is supplied once at construction and never changes for the
//! life of a [`crate::CacheManager`]. Configuration can be built in code,
//! starting from [`CacheConfig::default`], or loaded from YAML:
//!
//! ```yaml
//! l1: { max_entries: 1000 }
//! l2: { path: cache/structured.db, max_rows: 100000 }
//! l3: { dir: cache/blobs, max_bytes: 1073741824, compression: lz4 }
//! routing:
//!   default: { tier: l2, default_ttl: 1h }
//!   rules:
//!     - { category: analytics, tier: l3, default_ttl: 6h }
//! janitor: { interval: 5m }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::compression::CompressionConfig;
use crate::cache::janitor::JanitorConfig;
use crate::cache::l1::L1Config;
use crate::cache::l2::L2Config;
use crate::cache::l3::L3Config;
use crate::cache::routing::RoutingConfig;
use crate::error::{Error, Result};

/// Complete cache configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1: L1Config,
    pub l2: L2Config,
    pub l3: L3Config,
    pub compression: CompressionConfig,
    pub routing: RoutingConfig,
    pub janitor: JanitorConfig,
}

impl CacheConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Place the L2 database and L3 directory under `dir`
    pub fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.l2.path = dir.join("structured.db");
        self.l3.dir = dir.join("blobs");
        self
    }

    /// Reject configurations the cache cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.l1.max_entries == 0 {
            return Err(Error::Config("l1.max_entries must be at least 1".into()));
        }
        if self.l1.max_bytes == Some(0) {
            return Err(Error::Config("l1.max_bytes must be greater than 0".into()));
        }
        for (field, budget) in [
            ("l2.max_rows", self.l2.max_rows),
            ("l2.max_bytes", self.l2.max_bytes),
            ("l3.max_bytes", self.l3.max_bytes),
        ] {
            if budget == Some(0) {
                return Err(Error::Config(format!("{} must be greater than 0 (omit it for no limit)", field)));
            }
        }
        if self.l3.sweep_batch_size == 0 {
            return Err(Error::Config("l3.sweep_batch_size must be at least 1".into()));
        }
        if self.janitor.interval.is_zero() {
            return Err(Error::Config("janitor.interval must be greater than 0".into()));
        }
        if self.l2.sweep_batch_size == 0 {
            return Err(Error::Config("l2.sweep_batch_size must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.compression.min_savings) {
            return Err(Error::Config(format!(
                "compression.min_savings must be in [0, 1), got {}",
                self.compression.min_savings
            )));
        }

        let mut seen = HashSet::new();
        for rule in &self.routing.rules {
            if rule.category.trim().is_empty() {
                return Err(Error::Config("routing rule with empty category".into()));
            }
            if !seen.insert(rule.category.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate routing rule for category '{}'",
                    rule.category
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration such as "30s", "5m", "1h", "1d", "1h30m" or bare seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'd' | 'D' => 86400,
            'h' | 'H' => 3600,
            'm' | 'M' => 60,
            's' | 'S' => 1,
            _ => return Err(Error::DurationParse(format!("unknown duration unit: {}", c))),
        };
        total_secs = num
            .checked_mul(multiplier)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(|| Error::DurationParse(format!("duration too large: {}", s)))?;
    }

    // Trailing number without a unit is seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs = total_secs
            .checked_add(num)
            .ok_or_else(|| Error::DurationParse(format!("duration too large: {}", s)))?;
    }

    Ok(Duration::from_secs(total_secs))
}

/// Render a duration in the form accepted by [`parse_duration`]
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, size) in [("d", 86400), ("h", 3600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

/// Serde adapter for `Duration` fields written as "5m" or plain seconds
pub mod duration_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional `Duration` fields
pub mod option_duration_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
