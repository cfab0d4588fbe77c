//! In-process feed bus
//!
//! The concrete transport behind each container's telemetry. Publishers
//! push JSON values in; subscribers receive them through their callback.
//! The bus keeps the last value of every feed and replays it to
//! `RetainLast` subscribers when they subscribe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tracing::debug;

use telecast_core::{
    DeliveryMode, FeedCallback, FeedMessage, FeedSpec, FeedTransport, Subscription,
    TransportError,
};

struct Subscriber {
    id: u64,
    callback: FeedCallback,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    closed: bool,
    subscribers: HashMap<String, Vec<Subscriber>>,
    retained: HashMap<String, Arc<dyn FeedMessage>>,
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process publish/subscribe bus for one container
pub struct LocalBus {
    name: String,
    state: Arc<Mutex<BusState>>,
    // Held while callbacks run so subscribers see values in retained order.
    // Always taken before `state`.
    delivery: Mutex<()>,
}

impl LocalBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(BusState::default())),
            delivery: Mutex::new(()),
        }
    }

    /// Publish a value; returns the number of subscribers it reached
    pub fn publish(&self, feed: &str, value: Value) -> usize {
        let msg: Arc<dyn FeedMessage> = Arc::new(value);
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let callbacks: Vec<FeedCallback> = {
            let mut state = lock(&self.state);
            state.retained.insert(feed.to_string(), Arc::clone(&msg));
            state
                .subscribers
                .get(feed)
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default()
        };

        for callback in &callbacks {
            callback(Arc::clone(&msg));
        }
        debug!(bus = %self.name, feed = %feed, delivered = callbacks.len(), "published");
        callbacks.len()
    }

    /// Refuse new subscriptions and drop existing ones
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn subscriber_count(&self, feed: &str) -> usize {
        lock(&self.state).subscribers.get(feed).map_or(0, Vec::len)
    }
}

impl FeedTransport for LocalBus {
    fn subscribe(
        &self,
        feed: &FeedSpec,
        mode: DeliveryMode,
        callback: FeedCallback,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let (id, replay) = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(TransportError::Unavailable(format!(
                    "bus '{}' is closed",
                    self.name
                )));
            }
            state.next_id += 1;
            let id = state.next_id;
            state
                .subscribers
                .entry(feed.name.clone())
                .or_default()
                .push(Subscriber {
                    id,
                    callback: Arc::clone(&callback),
                });
            let replay = match mode {
                DeliveryMode::RetainLast => state.retained.get(&feed.name).cloned(),
                DeliveryMode::LatestOnly => None,
            };
            (id, replay)
        };

        if let Some(msg) = replay {
            debug!(bus = %self.name, feed = %feed.name, "replaying retained value");
            callback(msg);
        }

        Ok(Box::new(BusSubscription {
            feed: feed.name.clone(),
            id,
            state: Arc::downgrade(&self.state),
        }))
    }
}

struct BusSubscription {
    feed: String,
    id: u64,
    state: Weak<Mutex<BusState>>,
}

impl Subscription for BusSubscription {
    fn feed(&self) -> &str {
        &self.feed
    }

    fn close(self: Box<Self>) -> Result<(), TransportError> {
        let Some(state) = self.state.upgrade() else {
            return Err(TransportError::Close {
                feed: self.feed.clone(),
                reason: "bus dropped".to_string(),
            });
        };
        let mut state = lock(&state);
        let removed = match state.subscribers.get_mut(&self.feed) {
            Some(subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != self.id);
                subs.len() < before
            }
            None => false,
        };
        if !removed {
            return Err(TransportError::Close {
                feed: self.feed.clone(),
                reason: "not subscribed".to_string(),
            });
        }
        Ok(())
    }
}
