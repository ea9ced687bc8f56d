//! Background maintenance for the persistent tiers
//!
//! The janitor wakes up on a fixed interval and, on the blocking pool,
//! purges expired entries, trims each tier back under its budget and flushes
//! deferred bookkeeping. L1 needs no sweeping: its expiry is lazy and its
//! capacity is enforced on every insert.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::tier::{CacheTier, TierStore};
use crate::config::duration_serde;

/// Janitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    /// Whether a background task is started
    pub enabled: bool,
    /// Time between maintenance passes
    #[serde(with = "duration_serde")]
    pub interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
        }
    }
}

/// What one maintenance pass did to one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierMaintenance {
    pub tier: CacheTier,
    pub expired: usize,
    pub evicted: usize,
}

/// Result of a maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub tiers: Vec<TierMaintenance>,
    pub duration_ms: u64,
}

impl MaintenanceReport {
    /// Expired entries removed across tiers
    pub fn expired(&self) -> usize {
        self.tiers.iter().map(|t| t.expired).sum()
    }

    /// Entries evicted for capacity across tiers
    pub fn evicted(&self) -> usize {
        self.tiers.iter().map(|t| t.evicted).sum()
    }
}

/// Sweep, trim and flush every tier in `tiers`
pub fn run_maintenance(tiers: &[Arc<dyn TierStore>]) -> MaintenanceReport {
    let start = Instant::now();
    let tiers = tiers
        .iter()
        .map(|tier| {
            let expired = tier.sweep_expired();
            let evicted = tier.enforce_capacity();
            tier.flush();
            TierMaintenance {
                tier: tier.tier(),
                expired,
                evicted,
            }
        })
        .collect();

    MaintenanceReport {
        tiers,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

/// Handle to the background maintenance task
pub struct Janitor {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Janitor {
    /// Start the maintenance loop on the current tokio runtime
    ///
    /// Returns `None` when called outside a runtime.
    pub fn spawn(tiers: Vec<Arc<dyn TierStore>>, period: Duration) -> Option<Self> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let token = CancellationToken::new();
        let handle = runtime.spawn(run_loop(tiers, period, token.clone()));
        Some(Self {
            token,
            handle: Some(handle),
        })
    }

    /// True until the task has exited
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait for any in-flight pass to finish
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("Janitor task failed: {}", e);
            }
        }
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_loop(tiers: Vec<Arc<dyn TierStore>>, period: Duration, token: CancellationToken) {
    let tiers: Arc<[Arc<dyn TierStore>]> = tiers.into();
    let mut tick = interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval = ?period, tiers = tiers.len(), "Janitor started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("Janitor shutting down");
                break;
            }
            _ = tick.tick() => {
                let tiers = Arc::clone(&tiers);
                match tokio::task::spawn_blocking(move || run_maintenance(&tiers)).await {
                    Ok(report) => tracing::debug!(
                        expired = report.expired(),
                        evicted = report.evicted(),
                        duration_ms = report.duration_ms,
                        "Janitor pass complete"
                    ),
                    Err(e) => tracing::error!("Janitor pass failed: {}", e),
                }
            }
        }
    }
}
