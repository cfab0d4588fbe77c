//! Subscription management
//!
//! Owns one live subscription per successfully subscribed feed. Creation is
//! best-effort per feed: a feed that fails to subscribe is logged and left
//! out, and only a batch where every configured feed failed is an error.
//! Failed feeds are not retried until the next start.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::cache::TelemetryCache;
use crate::feed::{FeedCallback, FeedMessage, FeedRegistry, FeedTransport, Subscription};
use crate::telemetry::TelemetryError;

/// Outcome of a successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub configured: usize,
    pub active: usize,
    pub failed: Vec<String>,
}

/// Live subscriptions for one container
pub struct SubscriptionSet {
    container: String,
    handles: Mutex<HashMap<String, Box<dyn Subscription>>>,
}

impl SubscriptionSet {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Box<dyn Subscription>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to every feed in the registry, dynamic feeds first
    ///
    /// Each subscription's callback only stores the delivered value in
    /// `cache`.
    pub fn start(
        &self,
        registry: &FeedRegistry,
        transport: &dyn FeedTransport,
        cache: &Arc<TelemetryCache>,
    ) -> Result<StartReport, TelemetryError> {
        let mut created: HashMap<String, Box<dyn Subscription>> = HashMap::new();
        let mut failed = Vec::new();

        for spec in registry.iter() {
            let mode = spec.class.delivery_mode();
            info!(
                container = %self.container,
                feed = %spec.name,
                type_tag = %spec.type_tag,
                mode = ?mode,
                "creating subscription"
            );

            let sink = Arc::clone(cache);
            let feed = spec.name.clone();
            let callback: FeedCallback = Arc::new(move |msg: Arc<dyn FeedMessage>| sink.put(&feed, msg));

            match transport.subscribe(spec, mode, callback) {
                Ok(handle) => {
                    info!(container = %self.container, feed = %spec.name, "subscribed");
                    created.insert(spec.name.clone(), handle);
                }
                Err(e) => {
                    error!(
                        container = %self.container,
                        feed = %spec.name,
                        class = ?spec.class,
                        error = %e,
                        "failed to subscribe"
                    );
                    failed.push(spec.name.clone());
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                container = %self.container,
                count = failed.len(),
                feeds = ?failed,
                "some feeds failed to subscribe"
            );
        }

        let configured = registry.len();
        if configured > 0 && created.is_empty() {
            return Err(TelemetryError::NoSubscriptions {
                container: self.container.clone(),
                configured,
            });
        }

        let active = created.len();
        self.lock().extend(created);

        Ok(StartReport {
            configured,
            active,
            failed,
        })
    }

    /// Close every subscription and forget them
    ///
    /// Individual close failures are logged; the set is always empty
    /// afterwards. Returns the number of close failures.
    pub fn stop(&self) -> usize {
        let handles: Vec<(String, Box<dyn Subscription>)> = self.lock().drain().collect();

        let mut failures = 0;
        for (feed, handle) in handles {
            match handle.close() {
                Ok(()) => debug!(container = %self.container, feed = %feed, "closed subscription"),
                Err(e) => {
                    failures += 1;
                    warn!(
                        container = %self.container,
                        feed = %feed,
                        error = %e,
                        "error closing subscription"
                    );
                }
            }
        }
        failures
    }

    pub fn is_subscribed(&self, feed: &str) -> bool {
        self.lock().contains_key(feed)
    }

    /// Names of subscribed feeds, sorted
    pub fn subscribed(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
