//! Feed definitions and the pub/sub transport seam
//!
//! Feeds come in two classes:
//! - Dynamic: expected to publish continuously; a value older than the
//!   staleness threshold is treated as absent
//! - Static: retained or latched data published once or rarely; a value is
//!   kept until explicitly cleared
//!
//! The transport itself (how values reach us) is an external collaborator
//! reached only through [`FeedTransport`] and [`Subscription`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Feed class, which decides staleness and delivery semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedClass {
    /// Continuously published; subject to staleness eviction
    Dynamic,
    /// Retained or occasional; never evicted by age
    Static,
}

impl FeedClass {
    /// Delivery mode to request from the transport for this class
    pub fn delivery_mode(&self) -> DeliveryMode {
        match self {
            FeedClass::Dynamic => DeliveryMode::LatestOnly,
            FeedClass::Static => DeliveryMode::RetainLast,
        }
    }
}

/// Delivery mode requested when subscribing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Ordinary delivery of values published after subscribing
    LatestOnly,
    /// Deliver the last known value immediately on subscribe, then new values
    RetainLast,
}

/// A configured feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    pub name: String,
    pub class: FeedClass,
    /// Declared value type, used only for display
    pub type_tag: String,
}

impl FeedSpec {
    pub fn new(name: impl Into<String>, class: FeedClass, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class,
            type_tag: type_tag.into(),
        }
    }

    pub fn dynamic(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self::new(name, FeedClass::Dynamic, type_tag)
    }

    pub fn static_feed(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self::new(name, FeedClass::Static, type_tag)
    }
}

/// Immutable set of feeds configured for one container
///
/// Iteration order is dynamic feeds first, then static feeds, each group in
/// the order it was given.
#[derive(Debug, Clone, Default)]
pub struct FeedRegistry {
    feeds: Vec<FeedSpec>,
    index: HashMap<String, usize>,
}

impl FeedRegistry {
    /// Build a registry from feed specs
    ///
    /// A name that appears more than once keeps its first definition.
    pub fn new(specs: Vec<FeedSpec>) -> Self {
        let (dynamic, static_feeds): (Vec<FeedSpec>, Vec<FeedSpec>) = specs
            .into_iter()
            .partition(|spec| spec.class == FeedClass::Dynamic);

        let mut feeds = Vec::with_capacity(dynamic.len() + static_feeds.len());
        let mut index = HashMap::new();
        for spec in dynamic.into_iter().chain(static_feeds) {
            if index.contains_key(&spec.name) {
                warn!(feed = %spec.name, "duplicate feed definition ignored");
                continue;
            }
            index.insert(spec.name.clone(), feeds.len());
            feeds.push(spec);
        }

        Self { feeds, index }
    }

    /// Look up a configured feed by name
    pub fn get(&self, name: &str) -> Option<&FeedSpec> {
        self.index.get(name).map(|&i| &self.feeds[i])
    }

    /// Class of a configured feed, `None` when the feed is not configured
    pub fn class_of(&self, name: &str) -> Option<FeedClass> {
        self.get(name).map(|spec| spec.class)
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn is_dynamic(&self, name: &str) -> bool {
        self.class_of(name) == Some(FeedClass::Dynamic)
    }

    /// All feeds, dynamic first
    pub fn iter(&self) -> impl Iterator<Item = &FeedSpec> {
        self.feeds.iter()
    }

    pub fn dynamic(&self) -> impl Iterator<Item = &FeedSpec> {
        self.feeds
            .iter()
            .filter(|spec| spec.class == FeedClass::Dynamic)
    }

    pub fn static_feeds(&self) -> impl Iterator<Item = &FeedSpec> {
        self.feeds
            .iter()
            .filter(|spec| spec.class == FeedClass::Static)
    }

    /// Names of all configured feeds, dynamic first
    pub fn names(&self) -> Vec<String> {
        self.feeds.iter().map(|spec| spec.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}

/// A value delivered by a feed
///
/// The cache stores values opaquely and converts them to a serializable
/// tree only when a reader asks for them. Every `Serialize` type gets this
/// for free.
pub trait FeedMessage: Send + Sync {
    /// Convert the value into a JSON tree
    fn to_tree(&self) -> serde_json::Value;
}

impl<T> FeedMessage for T
where
    T: Serialize + Send + Sync,
{
    fn to_tree(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to convert feed message to a tree");
                serde_json::Value::Null
            }
        }
    }
}

/// Callback invoked by the transport for every delivered value
///
/// May be invoked from any thread, concurrently across feeds.
pub type FeedCallback = Arc<dyn Fn(Arc<dyn FeedMessage>) + Send + Sync>;

/// Errors reported by a pub/sub transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport refused to create a subscription
    #[error("subscription to '{feed}' rejected: {reason}")]
    Rejected { feed: String, reason: String },

    /// The transport is not reachable
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Tearing down a subscription failed
    #[error("failed to close subscription for '{feed}': {reason}")]
    Close { feed: String, reason: String },
}

/// The pub/sub middleware client
pub trait FeedTransport: Send + Sync {
    /// Create a subscription delivering values for `feed` to `callback`
    fn subscribe(
        &self,
        feed: &FeedSpec,
        mode: DeliveryMode,
        callback: FeedCallback,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

/// A live subscription handle
pub trait Subscription: Send {
    /// Name of the subscribed feed
    fn feed(&self) -> &str;

    /// Tear down the subscription
    fn close(self: Box<Self>) -> Result<(), TransportError>;
}
