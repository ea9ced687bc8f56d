//! Category Routing
//!
//! Maps a value's category to the tier that stores it, its default TTL, and
//! an optional size ceiling. Every category resolves to exactly one rule;
//! unknown categories use the default route.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::tier::CacheTier;
use crate::config::option_duration_serde;

/// Routing rule for one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Category name
    pub category: String,
    /// Tier that stores values of this category
    pub tier: CacheTier,
    /// TTL applied when `set` is called without one
    #[serde(default, with = "option_duration_serde")]
    pub default_ttl: Option<Duration>,
    /// Larger values are rejected before compression
    #[serde(default)]
    pub max_item_size: Option<u64>,
}

/// Route used for categories without a rule of their own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRoute {
    pub tier: CacheTier,
    #[serde(default, with = "option_duration_serde")]
    pub default_ttl: Option<Duration>,
    #[serde(default)]
    pub max_item_size: Option<u64>,
}

impl Default for DefaultRoute {
    fn default() -> Self {
        Self {
            tier: CacheTier::L2,
            default_ttl: Some(Duration::from_secs(3600)),
            max_item_size: None,
        }
    }
}

/// Routing section of the configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default: DefaultRoute,
    pub rules: Vec<RoutingRule>,
}

/// Resolved routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub tier: CacheTier,
    pub default_ttl: Option<Duration>,
    pub max_item_size: Option<u64>,
}

impl Route {
    /// Explicit TTL if given, otherwise the rule's default
    pub fn ttl(&self, explicit: Option<Duration>) -> Option<Duration> {
        explicit.or(self.default_ttl)
    }

    /// True if a value of `len` bytes may be stored under this route
    pub fn admits(&self, len: u64) -> bool {
        self.max_item_size.map_or(true, |max| len <= max)
    }
}

/// Category → route lookup
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: HashMap<String, Route>,
    default: Route,
}

impl RoutingTable {
    /// Build the table; later rules for the same category win
    pub fn new(config: &RoutingConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                (
                    rule.category.clone(),
                    Route {
                        tier: rule.tier,
                        default_ttl: rule.default_ttl,
                        max_item_size: rule.max_item_size,
                    },
                )
            })
            .collect();

        Self {
            rules,
            default: Route {
                tier: config.default.tier,
                default_ttl: config.default.default_ttl,
                max_item_size: config.default.max_item_size,
            },
        }
    }

    /// Route for `category`
    pub fn resolve(&self, category: &str) -> Route {
        self.rules.get(category).copied().unwrap_or(self.default)
    }

    /// Route for categories without a rule
    pub fn default_route(&self) -> Route {
        self.default
    }

    /// Tiers any rule (or the default) sends data to
    pub fn tiers_in_use(&self) -> Vec<CacheTier> {
        let mut tiers: Vec<CacheTier> = self
            .rules
            .values()
            .map(|route| route.tier)
            .chain(std::iter::once(self.default.tier))
            .collect();
        tiers.sort();
        tiers.dedup();
        tiers
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(&RoutingConfig::default())
    }
}
