//! telecast-core: Telemetry cache and streaming sessions for telecast
//!
//! This crate provides the feed registry, the shared latest-value cache,
//! subscription management, the background janitor, and the two streaming
//! session engines used by the telecast gateway.

pub mod cache;
pub mod feed;
pub mod janitor;
pub mod logs;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod telemetry;

pub use cache::{CachedValue, FeedStatus, STALE_THRESHOLD, TelemetryCache};
pub use feed::{
    DeliveryMode, FeedCallback, FeedClass, FeedMessage, FeedRegistry, FeedSpec, FeedTransport,
    Subscription, TransportError,
};
pub use logs::{LogChunk, LogSource, LogSourceError};
pub use protocol::{FeedUpdate, ServerMessage};
pub use session::{SessionSink, feed_poll::FeedPollSession, log_tail::LogTailSession};
pub use subscription::{StartReport, SubscriptionSet};
pub use telemetry::{ContainerTelemetry, TelemetryError};
