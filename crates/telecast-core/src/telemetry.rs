//! Per-container telemetry context
//!
//! A [`ContainerTelemetry`] owns the cache, the subscriptions, and the
//! janitor for one container. Handlers reach it through the gateway context
//! object; there is no process-wide registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, info, warn};

use crate::cache::{CachedValue, FeedStatus, TelemetryCache};
use crate::feed::{FeedRegistry, FeedSpec, FeedTransport};
use crate::janitor::{JANITOR_JOIN_TIMEOUT, Janitor, JanitorHandle};
use crate::subscription::{StartReport, SubscriptionSet};

/// Default maximum number of updates per second sent to one session
pub const DEFAULT_MAX_SEND_RATE: f64 = 10.0;

/// Telemetry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    /// Feeds were configured but none could be subscribed
    #[error(
        "failed to create any subscriptions for container '{container}' ({configured} feeds configured)"
    )]
    NoSubscriptions { container: String, configured: usize },
}

/// Cache, subscriptions, and janitor for one container
pub struct ContainerTelemetry {
    name: String,
    registry: Arc<FeedRegistry>,
    cache: Arc<TelemetryCache>,
    subscriptions: SubscriptionSet,
    janitor: Mutex<Option<JanitorHandle>>,
    running: AtomicBool,
    max_send_rate: f64,
}

impl ContainerTelemetry {
    pub fn new(name: impl Into<String>, registry: FeedRegistry) -> Self {
        let name = name.into();
        let registry = Arc::new(registry);
        let cache = Arc::new(TelemetryCache::new(name.clone(), Arc::clone(&registry)));

        info!(
            container = %name,
            dynamic = registry.dynamic().count(),
            r#static = registry.static_feeds().count(),
            "initializing container telemetry"
        );

        Self {
            subscriptions: SubscriptionSet::new(name.clone()),
            name,
            registry,
            cache,
            janitor: Mutex::new(None),
            running: AtomicBool::new(false),
            max_send_rate: DEFAULT_MAX_SEND_RATE,
        }
    }

    /// Override the per-session send rate limit (updates per second)
    pub fn with_max_send_rate(mut self, rate: f64) -> Self {
        self.max_send_rate = rate;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<TelemetryCache> {
        &self.cache
    }

    pub fn max_send_rate(&self) -> f64 {
        self.max_send_rate
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to every configured feed and start the janitor
    ///
    /// Must be called from within a tokio runtime. Succeeds with partial
    /// coverage; fails only if feeds are configured and none subscribed.
    pub fn start(&self, transport: &dyn FeedTransport) -> Result<StartReport, TelemetryError> {
        if self.running.load(Ordering::SeqCst) {
            warn!(container = %self.name, "telemetry is already running");
            return Ok(StartReport {
                configured: self.registry.len(),
                active: self.subscriptions.len(),
                failed: Vec::new(),
            });
        }

        info!(container = %self.name, "starting telemetry");

        let report = match self.subscriptions.start(&self.registry, transport, &self.cache) {
            Ok(report) => report,
            Err(e) => {
                error!(container = %self.name, error = %e, "failed to start telemetry");
                self.subscriptions.stop();
                return Err(e);
            }
        };

        let janitor = Janitor::new(self.name.clone(), Arc::clone(&self.cache)).spawn();
        *self.janitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(janitor);
        self.running.store(true, Ordering::SeqCst);

        info!(
            container = %self.name,
            active = report.active,
            configured = report.configured,
            dynamic = self.registry.dynamic().count(),
            r#static = self.registry.static_feeds().count(),
            "telemetry started"
        );
        Ok(report)
    }

    /// Stop the janitor, tear down subscriptions, and clear the cache
    ///
    /// Each step runs even if the previous one failed.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(container = %self.name, "stopping telemetry");

        let janitor = self
            .janitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(janitor) = janitor {
            janitor.stop(JANITOR_JOIN_TIMEOUT).await;
        }

        let failures = self.subscriptions.stop();
        if failures > 0 {
            warn!(container = %self.name, failures, "some subscriptions failed to close");
        }

        self.cache.clear_all();
        info!(container = %self.name, "telemetry stopped");
    }

    /// Latest value of a feed, `None` if absent or stale
    pub fn get(&self, feed: &str) -> Option<CachedValue> {
        self.cache.get(feed)
    }

    pub fn is_available(&self, feed: &str) -> bool {
        self.cache.is_available(feed)
    }

    /// Status of every configured feed
    pub fn status(&self) -> Vec<FeedStatus> {
        self.cache
            .status(|feed| self.subscriptions.is_subscribed(feed))
    }

    /// Names of all configured feeds, dynamic first
    pub fn list_feeds(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Configured feed by name
    pub fn feed(&self, name: &str) -> Option<&FeedSpec> {
        self.registry.get(name)
    }

    /// Names of feeds with a live subscription
    pub fn subscribed(&self) -> Vec<String> {
        self.subscriptions.subscribed()
    }

    pub fn clear(&self, feed: &str) {
        self.cache.clear(feed);
    }

    pub fn clear_all(&self) -> usize {
        self.cache.clear_all()
    }
}
