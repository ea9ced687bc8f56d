//! Tier Health Checks
//!
//! Each tier reports whether it can currently serve reads and writes. A
//! degraded cache still works: callers just see more misses.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Health status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Tier is missing or partially working; the cache still serves
    Degraded,
    /// Tier cannot serve at all
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        *self != HealthStatus::Unhealthy
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

/// Check result for one component (a tier, the janitor, the manager)
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Time spent on the check
    pub check_us: u64,
}

impl ComponentHealth {
    fn with_status(component: impl Into<String>, status: HealthStatus, detail: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            detail,
            check_us: 0,
        }
    }

    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, None)
    }

    pub fn degraded(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, Some(detail.into()))
    }

    pub fn unhealthy(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, Some(detail.into()))
    }

    /// Run `check` and record how long it took
    pub fn timed(check: impl FnOnce() -> ComponentHealth) -> Self {
        let start = Instant::now();
        let mut result = check();
        result.check_us = start.elapsed().as_micros() as u64;
        result
    }
}

/// Health of the whole cache
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status across all components
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub uptime_seconds: u64,
}

impl HealthReport {
    pub fn new(components: Vec<ComponentHealth>, uptime: Duration) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            components,
            uptime_seconds: uptime.as_secs(),
        }
    }

    /// The entry for `component`, if it was checked
    pub fn component(&self, component: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == component)
    }
}
