//! Throttled, change-only streaming of one feed
//!
//! The session polls the cache, never the transport. It sends a value only
//! when its content differs from the last one sent, at most `max_rate`
//! times per second, and announces unavailability once per transition.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::{self, Instant};
use tracing::{debug, info};

use super::{LOG_POLL_INTERVAL, PollOutcome, SessionSink};
use crate::cache::TelemetryCache;
use crate::feed::FeedSpec;
use crate::protocol::{FeedUpdate, ServerMessage};
use crate::telemetry::DEFAULT_MAX_SEND_RATE;

type ContentHash = [u8; 32];

/// What the client was last told about the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SentState {
    Unset,
    Value(ContentHash),
    Unavailable,
}

fn content_hash(value: &Value) -> ContentHash {
    // Value maps are key-ordered, so this serialization is canonical.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(&bytes));
    hash
}

/// One client's stream of one feed
pub struct FeedPollSession<S> {
    container: String,
    spec: FeedSpec,
    cache: Arc<TelemetryCache>,
    sink: S,
    min_interval: Duration,
    last_send: Option<Instant>,
    last_sent: SentState,
}

impl<S: SessionSink> FeedPollSession<S> {
    pub fn new(
        container: impl Into<String>,
        spec: FeedSpec,
        cache: Arc<TelemetryCache>,
        sink: S,
    ) -> Self {
        Self {
            container: container.into(),
            spec,
            cache,
            sink,
            min_interval: Duration::from_secs_f64(1.0 / DEFAULT_MAX_SEND_RATE),
            last_send: None,
            last_sent: SentState::Unset,
        }
    }

    /// Limit sends to `rate` per second; non-positive rates are ignored
    pub fn with_max_rate(mut self, rate: f64) -> Self {
        if rate.is_finite() && rate > 0.0 {
            self.min_interval = Duration::from_secs_f64(1.0 / rate);
        }
        self
    }

    /// Minimum time between two sends
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleep between polls
    pub fn poll_interval(&self) -> Duration {
        self.min_interval.min(LOG_POLL_INTERVAL)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn update(&self, data: Option<Value>) -> ServerMessage {
        let update = match data {
            Some(data) => FeedUpdate::value(&self.container, &self.spec.name, &self.spec.type_tag, data),
            None => FeedUpdate::unavailable(&self.container, &self.spec.name, &self.spec.type_tag),
        };
        ServerMessage::Data(update)
    }

    /// Send the current value, if there is one
    ///
    /// Returns `false` if the client disconnected.
    pub async fn connect(&mut self) -> bool {
        info!(container = %self.container, feed = %self.spec.name, "feed session connected");

        let Some(cached) = self.cache.get(&self.spec.name) else {
            return true;
        };
        let hash = content_hash(&cached.data);
        let msg = self.update(Some(cached.data));
        if !self.sink.send(&msg).await {
            return false;
        }
        self.last_send = Some(Instant::now());
        self.last_sent = SentState::Value(hash);
        true
    }

    /// Send the value if it changed, or an unavailability notice
    pub async fn poll_once(&mut self) -> PollOutcome {
        let now = Instant::now();
        if let Some(last) = self.last_send {
            if now.duration_since(last) < self.min_interval {
                return PollOutcome::Continue;
            }
        }

        let (msg, state) = match self.cache.get(&self.spec.name) {
            Some(cached) => {
                let hash = content_hash(&cached.data);
                if self.last_sent == SentState::Value(hash) {
                    return PollOutcome::Continue;
                }
                (self.update(Some(cached.data)), SentState::Value(hash))
            }
            None => {
                if self.last_sent == SentState::Unavailable {
                    return PollOutcome::Continue;
                }
                debug!(container = %self.container, feed = %self.spec.name, "feed unavailable");
                (self.update(None), SentState::Unavailable)
            }
        };

        if !self.sink.send(&msg).await {
            return PollOutcome::Disconnected;
        }
        self.last_send = Some(now);
        self.last_sent = state;
        PollOutcome::Continue
    }

    /// Connect, then poll until the client goes away
    pub async fn run(mut self) {
        if self.connect().await {
            let interval = self.poll_interval();
            loop {
                time::sleep(interval).await;
                if !self.sink.is_connected() {
                    break;
                }
                match self.poll_once().await {
                    PollOutcome::Continue => {}
                    PollOutcome::Backoff(delay) => time::sleep(delay).await,
                    PollOutcome::Disconnected => break,
                }
            }
        }

        info!(container = %self.container, feed = %self.spec.name, "feed session disconnected");
        self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedRegistry;
    use crate::session::tests::RecordingSink;
    use serde_json::json;

    fn cache() -> Arc<TelemetryCache> {
        let registry = FeedRegistry::new(vec![
            FeedSpec::dynamic("/odom", "nav_msgs/msg/Odometry"),
            FeedSpec::static_feed("/robot_description", "std_msgs/msg/String"),
        ]);
        Arc::new(TelemetryCache::new("robot", Arc::new(registry)))
    }

    fn session(cache: &Arc<TelemetryCache>, feed: &str, sink: RecordingSink) -> FeedPollSession<RecordingSink> {
        let spec = cache.registry().get(feed).unwrap().clone();
        FeedPollSession::new("robot", spec, Arc::clone(cache), sink)
    }

    fn updates(sink: &RecordingSink) -> Vec<FeedUpdate> {
        sink.messages()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Data(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_current_value() {
        let cache = cache();
        cache.put("/robot_description", Arc::new(json!("<robot/>")));
        let sink = RecordingSink::default();
        let mut session = session(&cache, "/robot_description", sink.clone());

        assert!(session.connect().await);
        let sent = updates(&sink);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].available);
        assert_eq!(sent[0].data, Some(json!("<robot/>")));
        assert_eq!(sent[0].type_tag, "std_msgs/msg/String");

        // Unchanged value is not resent.
        time::advance(Duration::from_secs(1)).await;
        session.poll_once().await;
        assert_eq!(updates(&sink).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_value_sends_nothing() {
        let cache = cache();
        let sink = RecordingSink::default();
        let mut session = session(&cache, "/odom", sink.clone());

        assert!(session.connect().await);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rate_is_bounded() {
        let cache = cache();
        let sink = RecordingSink::default();
        let mut session = session(&cache, "/odom", sink.clone());
        session.connect().await;

        // A new value every 10ms for one second.
        for i in 0..100 {
            time::advance(Duration::from_millis(10)).await;
            cache.put("/odom", Arc::new(json!({"seq": i})));
            session.poll_once().await;
        }

        let sent = updates(&sink);
        assert!(sent.len() <= 10, "sent {} updates", sent.len());
        assert!(sent.len() >= 5, "sent {} updates", sent.len());
        assert!(sent.iter().all(|u| u.available));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_rate() {
        let cache = cache();
        let slow = session(&cache, "/odom", RecordingSink::default()).with_max_rate(2.0);
        assert_eq!(slow.min_interval(), Duration::from_millis(500));
        assert_eq!(slow.poll_interval(), LOG_POLL_INTERVAL);

        let slow = slow.with_max_rate(0.0);
        assert_eq!(slow.min_interval(), Duration::from_millis(500));

        let fast = session(&cache, "/odom", RecordingSink::default()).with_max_rate(50.0);
        assert_eq!(fast.poll_interval(), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_notice_sent_once_per_transition() {
        let cache = cache();
        let sink = RecordingSink::default();
        let mut session = session(&cache, "/odom", sink.clone());
        session.connect().await;

        session.poll_once().await;
        time::advance(Duration::from_millis(200)).await;
        session.poll_once().await;

        let sent = updates(&sink);
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].available);
        assert_eq!(sent[0].data, None);

        cache.put("/odom", Arc::new(json!({"x": 1})));
        time::advance(Duration::from_millis(200)).await;
        session.poll_once().await;

        // Past the staleness threshold the value disappears again.
        time::advance(Duration::from_secs(4)).await;
        session.poll_once().await;
        time::advance(Duration::from_secs(1)).await;
        session.poll_once().await;

        let sent = updates(&sink);
        assert_eq!(sent.len(), 3);
        assert!(sent[1].available);
        assert!(!sent[2].available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ends_on_send_failure() {
        let cache = cache();
        cache.put("/odom", Arc::new(json!(1)));
        let sink = RecordingSink::failing_after(1);
        let task = tokio::spawn(session(&cache, "/odom", sink.clone()).run());

        time::sleep(Duration::from_millis(50)).await;
        cache.put("/odom", Arc::new(json!(2)));
        task.await.unwrap();

        assert_eq!(updates(&sink).len(), 1);
        assert!(!sink.is_connected());
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"a": 1, "b": 3})));
    }
}
