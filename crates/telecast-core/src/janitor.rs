//! Background sweep of stale dynamic feeds
//!
//! The janitor evicts stale dynamic entries on a fixed period so idle feeds
//! do not wait for a reader to notice, and warns about dynamic feeds that
//! have no value at all.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::TelemetryCache;

/// Sweep period
pub const JANITOR_PERIOD: Duration = Duration::from_secs(10);

/// Upper bound a stopper waits for the janitor task to exit
pub const JANITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    pub missing: Vec<String>,
}

/// Periodic stale-entry sweeper for one container's cache
pub struct Janitor {
    container: String,
    cache: Arc<TelemetryCache>,
    period: Duration,
}

impl Janitor {
    pub fn new(container: impl Into<String>, cache: Arc<TelemetryCache>) -> Self {
        Self::with_period(container, cache, JANITOR_PERIOD)
    }

    pub fn with_period(
        container: impl Into<String>,
        cache: Arc<TelemetryCache>,
        period: Duration,
    ) -> Self {
        Self {
            container: container.into(),
            cache,
            period,
        }
    }

    /// Run one sweep
    ///
    /// `checks` is the number of sweeps so far and is used to report how long
    /// a missing feed has been silent.
    pub fn sweep(&self, checks: u64) -> SweepReport {
        let stale = self.cache.sweep_stale();
        for (feed, age) in &stale {
            debug!(
                container = %self.container,
                feed = %feed,
                age_secs = age.as_secs_f64(),
                threshold_secs = self.cache.stale_threshold().as_secs_f64(),
                "cleared stale cache entry"
            );
        }

        let missing = self.cache.missing_dynamic();
        let silent_secs = self.period.as_secs().saturating_mul(checks);
        for feed in &missing {
            warn!(
                container = %self.container,
                feed = %feed,
                "dynamic feed has no cached data (no messages received in {} seconds)",
                silent_secs
            );
        }

        debug!(
            container = %self.container,
            check = checks,
            cached = self.cache.len(),
            configured = self.cache.registry().len(),
            stale_cleared = stale.len(),
            "janitor sweep"
        );

        SweepReport {
            evicted: stale.into_iter().map(|(feed, _)| feed).collect(),
            missing,
        }
    }

    /// Sweep every period until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut checks: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    checks += 1;
                    self.sweep(checks);
                }
                _ = cancel.cancelled() => {
                    debug!(container = %self.container, "janitor cancelled");
                    break;
                }
            }
        }
    }

    /// Spawn the sweep loop on the current runtime
    pub fn spawn(self) -> JanitorHandle {
        let cancel = CancellationToken::new();
        let container = self.container.clone();
        let task = tokio::spawn(self.run(cancel.clone()));
        JanitorHandle {
            container,
            cancel,
            task,
        }
    }
}

/// Handle to a running janitor
pub struct JanitorHandle {
    container: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Signal the janitor to stop and wait at most `wait` for it to exit
    ///
    /// Returns `false` when the task did not exit in time; it is left to
    /// finish on its own.
    pub async fn stop(self, wait: Duration) -> bool {
        self.cancel.cancel();
        match time::timeout(wait, self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(container = %self.container, error = %e, "janitor task failed");
                true
            }
            Err(_) => {
                warn!(container = %self.container, "janitor did not stop in time");
                false
            }
        }
    }
}
