//! Latest-value telemetry cache
//!
//! Maps feed name to the most recent value and the time it was received.
//! Every operation takes the same mutex for its full duration and never
//! holds it across I/O or an await point. Reads of dynamic feeds evict
//! entries older than the staleness threshold, so a reader never observes a
//! stale dynamic value even if the janitor has not run yet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::feed::{FeedClass, FeedMessage, FeedRegistry};

/// Age after which a dynamic feed's cached value is treated as absent
pub const STALE_THRESHOLD: Duration = Duration::from_secs(3);

struct CacheEntry {
    value: Arc<dyn FeedMessage>,
    received_at: Instant,
    received_wall: DateTime<Utc>,
}

/// A value read from the cache, converted to a serializable tree
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub data: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub age: Duration,
}

/// Status of one configured feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedStatus {
    pub feed: String,
    pub type_tag: String,
    pub class: FeedClass,
    pub configured: bool,
    pub available: bool,
    pub subscribed: bool,
    /// RFC 3339 timestamp of the last received value
    pub received_at: Option<String>,
    pub seconds_since_last_message: Option<f64>,
}

/// Shared latest-value cache for one container
pub struct TelemetryCache {
    container: String,
    registry: Arc<FeedRegistry>,
    stale_after: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl TelemetryCache {
    /// Create an empty cache using the default staleness threshold
    pub fn new(container: impl Into<String>, registry: Arc<FeedRegistry>) -> Self {
        Self::with_stale_threshold(container, registry, STALE_THRESHOLD)
    }

    pub fn with_stale_threshold(
        container: impl Into<String>,
        registry: Arc<FeedRegistry>,
        stale_after: Duration,
    ) -> Self {
        Self {
            container: container.into(),
            registry,
            stale_after,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_after
    }

    // A panicking writer cannot leave an entry half-written, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Age of the entry if it belongs to a dynamic feed and is past the threshold
    fn expired_age(&self, feed: &str, entry: &CacheEntry, now: Instant) -> Option<Duration> {
        if !self.registry.is_dynamic(feed) {
            return None;
        }
        let age = now.saturating_duration_since(entry.received_at);
        (age > self.stale_after).then_some(age)
    }

    /// Store the latest value for a feed, replacing any previous one
    ///
    /// Values for unconfigured feeds are stored too; they can be read by
    /// name but never appear in [`status`](Self::status).
    pub fn put(&self, feed: &str, value: Arc<dyn FeedMessage>) {
        let entry = CacheEntry {
            value,
            received_at: Instant::now(),
            received_wall: Utc::now(),
        };
        self.lock().insert(feed.to_string(), entry);
    }

    /// Read the latest value for a feed
    ///
    /// Returns `None` when nothing was received, or when a dynamic feed's
    /// value is stale, in which case the entry is evicted.
    pub fn get(&self, feed: &str) -> Option<CachedValue> {
        let now = Instant::now();
        let (value, received_wall, age) = {
            let mut entries = self.lock();
            let entry = entries.get(feed)?;
            if let Some(age) = self.expired_age(feed, entry, now) {
                entries.remove(feed);
                debug!(
                    container = %self.container,
                    feed = %feed,
                    age_secs = age.as_secs_f64(),
                    "cleared stale cache entry on read"
                );
                return None;
            }
            (
                Arc::clone(&entry.value),
                entry.received_wall,
                now.saturating_duration_since(entry.received_at),
            )
        };

        Some(CachedValue {
            data: value.to_tree(),
            received_at: received_wall,
            age,
        })
    }

    /// Whether [`get`](Self::get) would return a value, without converting it
    pub fn is_available(&self, feed: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();
        let Some(entry) = entries.get(feed) else {
            return false;
        };
        if self.expired_age(feed, entry, now).is_some() {
            entries.remove(feed);
            return false;
        }
        true
    }

    /// Drop the cached value of one feed
    pub fn clear(&self, feed: &str) {
        if self.lock().remove(feed).is_some() {
            info!(container = %self.container, feed = %feed, "cleared cache entry");
        }
    }

    /// Drop every cached value, returning how many were removed
    pub fn clear_all(&self) -> usize {
        let cleared = {
            let mut entries = self.lock();
            let count = entries.len();
            entries.clear();
            count
        };
        if cleared > 0 {
            info!(container = %self.container, count = cleared, "cleared cache");
        }
        cleared
    }

    /// Status of every configured feed, dynamic first
    ///
    /// Stale dynamic entries found during the pass are evicted, so a status
    /// query doubles as a sweep.
    pub fn status(&self, is_subscribed: impl Fn(&str) -> bool) -> Vec<FeedStatus> {
        let now = Instant::now();
        let mut entries = self.lock();

        self.registry
            .iter()
            .map(|spec| {
                let mut available = false;
                let mut received_at = None;
                let mut seconds_since_last_message = None;

                if let Some(entry) = entries.get(&spec.name) {
                    if self.expired_age(&spec.name, entry, now).is_some() {
                        entries.remove(&spec.name);
                    } else {
                        available = true;
                        received_at = Some(entry.received_wall.to_rfc3339());
                        seconds_since_last_message = Some(
                            now.saturating_duration_since(entry.received_at)
                                .as_secs_f64(),
                        );
                    }
                }

                FeedStatus {
                    feed: spec.name.clone(),
                    type_tag: spec.type_tag.clone(),
                    class: spec.class,
                    configured: true,
                    available,
                    subscribed: is_subscribed(&spec.name),
                    received_at,
                    seconds_since_last_message,
                }
            })
            .collect()
    }

    /// Evict every stale dynamic entry, returning the evicted feeds and their ages
    pub fn sweep_stale(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let mut entries = self.lock();

        let stale: Vec<(String, Duration)> = entries
            .iter()
            .filter_map(|(feed, entry)| {
                self.expired_age(feed, entry, now)
                    .map(|age| (feed.clone(), age))
            })
            .collect();

        for (feed, _) in &stale {
            entries.remove(feed);
        }
        stale
    }

    /// Configured dynamic feeds that currently have no entry
    pub fn missing_dynamic(&self) -> Vec<String> {
        let entries = self.lock();
        self.registry
            .dynamic()
            .filter(|spec| !entries.contains_key(&spec.name))
            .map(|spec| spec.name.clone())
            .collect()
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedSpec;
    use serde_json::json;
    use tokio::time::advance;

    fn cache() -> TelemetryCache {
        let registry = FeedRegistry::new(vec![
            FeedSpec::dynamic("/a", "sensor_msgs/msg/JointState"),
            FeedSpec::static_feed("/b", "std_msgs/msg/String"),
        ]);
        TelemetryCache::new("robot", Arc::new(registry))
    }

    fn value(v: serde_json::Value) -> Arc<dyn FeedMessage> {
        Arc::new(v)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_feed_expires_after_threshold() {
        let cache = cache();
        cache.put("/a", value(json!({"position": [1.0]})));

        advance(Duration::from_secs(1)).await;
        let cached = cache.get("/a").expect("value should be fresh at 1s");
        assert_eq!(cached.data, json!({"position": [1.0]}));
        assert_eq!(cached.age, Duration::from_secs(1));

        advance(Duration::from_secs(3)).await;
        assert!(cache.get("/a").is_none());
        assert!(cache.is_empty(), "stale read should evict the entry");

        let status = cache.status(|_| true);
        assert!(!status[0].available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_feed_never_expires() {
        let cache = cache();
        cache.put("/b", value(json!("<robot/>")));

        advance(Duration::from_secs(100)).await;
        let cached = cache.get("/b").expect("static value should persist");
        assert_eq!(cached.data, json!("<robot/>"));
        assert!(cache.is_available("/b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_is_exclusive() {
        let cache = cache();
        cache.put("/a", value(json!(1)));

        advance(STALE_THRESHOLD).await;
        assert!(cache.is_available("/a"));

        advance(Duration::from_millis(1)).await;
        assert!(!cache.is_available("/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_overwrites_and_refreshes() {
        let cache = cache();
        cache.put("/a", value(json!(1)));
        advance(Duration::from_secs(2)).await;
        cache.put("/a", value(json!(2)));
        advance(Duration::from_secs(2)).await;

        let cached = cache.get("/a").unwrap();
        assert_eq!(cached.data, json!(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_feed_addressable_but_not_listed() {
        let cache = cache();
        cache.put("/extra", value(json!({"x": 1})));

        advance(Duration::from_secs(60)).await;
        assert_eq!(cache.get("/extra").unwrap().data, json!({"x": 1}));
        assert!(cache.is_available("/extra"));

        let status = cache.status(|_| false);
        assert!(status.iter().all(|s| s.feed != "/extra"));
    }

    #[test]
    fn test_status_reports_every_configured_feed() {
        let cache = cache();
        cache.put("/b", value(json!("urdf")));

        let status = cache.status(|feed| feed == "/b");
        assert_eq!(status.len(), 2);

        assert_eq!(status[0].feed, "/a");
        assert_eq!(status[0].class, FeedClass::Dynamic);
        assert!(status[0].configured);
        assert!(!status[0].available);
        assert!(!status[0].subscribed);
        assert!(status[0].received_at.is_none());
        assert!(status[0].seconds_since_last_message.is_none());

        assert_eq!(status[1].feed, "/b");
        assert!(status[1].available);
        assert!(status[1].subscribed);
        assert!(status[1].received_at.is_some());
        assert_eq!(status[1].type_tag, "std_msgs/msg/String");
    }

    #[test]
    fn test_status_never_available_without_entry() {
        let cache = cache();
        let status = cache.status(|_| true);
        assert!(status.iter().all(|s| !s.available));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_evicts_stale_dynamic() {
        let cache = cache();
        cache.put("/a", value(json!(1)));
        cache.put("/b", value(json!(2)));

        advance(Duration::from_secs(5)).await;
        let status = cache.status(|_| true);
        assert!(!status[0].available);
        assert!(status[1].available);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_missing_dynamic() {
        let cache = cache();
        assert_eq!(cache.missing_dynamic(), vec!["/a".to_string()]);

        cache.put("/a", value(json!(1)));
        cache.put("/b", value(json!(2)));
        assert!(cache.missing_dynamic().is_empty());
        assert!(cache.sweep_stale().is_empty());

        advance(Duration::from_secs(4)).await;
        let swept = cache.sweep_stale();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, "/a");
        assert_eq!(cache.missing_dynamic(), vec!["/a".to_string()]);
        assert!(cache.is_available("/b"));
    }

    #[test]
    fn test_clear_and_clear_all() {
        let cache = cache();
        cache.put("/a", value(json!(1)));
        cache.put("/b", value(json!(2)));

        cache.clear("/a");
        assert!(!cache.is_available("/a"));
        assert!(cache.is_available("/b"));

        assert_eq!(cache.clear_all(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.clear_all(), 0);
    }

    #[test]
    fn test_concurrent_puts_keep_one_entry_per_feed() {
        let cache = Arc::new(cache());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for n in 0..100 {
                        cache.put("/a", Arc::new(json!({"writer": i, "n": n})));
                        let _ = cache.get("/a");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 1);
    }
}
