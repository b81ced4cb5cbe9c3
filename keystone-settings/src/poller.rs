//! Polling Background Task
//!
//! Drives the cache's differential poll on an interval until the shutdown
//! signal arrives. Poll errors are logged and counted, never fatal: a store
//! that is briefly unreachable just delays convergence until the next tick.
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(polling_task(cache, shutdown_rx));
//!
//! // Later, during graceful shutdown:
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await.unwrap();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::{PollOutcome, SettingsCache};

// ============================================================================
// METRICS
// ============================================================================

/// Counters accumulated over the polling task's lifetime.
#[derive(Debug, Default)]
pub struct PollerMetrics {
    /// Total poll cycles that completed, changes or not.
    pub cycles: AtomicU64,

    /// Total changed rows applied to the cache.
    pub rows_applied: AtomicU64,

    /// Cycles skipped because another poll was already in flight.
    pub cycles_skipped: AtomicU64,

    /// Poll cycles that ended in an error.
    pub errors: AtomicU64,
}

impl PollerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PollerSnapshot {
        PollerSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            rows_applied: self.rows_applied.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the poller counters.
#[derive(Debug, Clone)]
pub struct PollerSnapshot {
    pub cycles: u64,
    pub rows_applied: u64,
    pub cycles_skipped: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run the differential poll on the cache's configured interval until the
/// shutdown signal flips to `true`. Returns the accumulated metrics.
pub async fn polling_task(
    cache: Arc<SettingsCache>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<PollerMetrics> {
    let metrics = Arc::new(PollerMetrics::new());

    let mut poll_interval = interval(cache.config().poll_interval);
    poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        poll_interval_secs = cache.config().poll_interval.as_secs(),
        "Settings polling task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Settings polling task shutting down");
                    break;
                }
            }

            _ = poll_interval.tick() => {
                poll_once(&cache, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        rows_applied = snapshot.rows_applied,
        cycles_skipped = snapshot.cycles_skipped,
        errors = snapshot.errors,
        "Settings polling task completed"
    );

    metrics
}

/// One tick of the polling loop.
async fn poll_once(cache: &SettingsCache, metrics: &PollerMetrics) {
    match cache.poll().await {
        Ok(PollOutcome::Applied(count)) => {
            metrics.cycles.fetch_add(1, Ordering::Relaxed);
            metrics.rows_applied.fetch_add(count as u64, Ordering::Relaxed);
        }
        Ok(PollOutcome::NoChanges) => {
            metrics.cycles.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Settings poll found no changes");
        }
        Ok(PollOutcome::InFlight) => {
            metrics.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Settings poll skipped, another poll in flight");
        }
        Err(e) => {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Settings poll failed");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
