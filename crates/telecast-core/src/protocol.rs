//! JSON message protocol for telecast WebSocket sessions
//!
//! Every server-to-client message is a JSON text frame of the form
//! `{"type": <kind>, "data": <payload>}`:
//! - `data`: a [`FeedUpdate`] for feed-polling sessions
//! - `logs`: a chunk of log text for log-tailing sessions
//! - `error`: a human-readable error, usually followed by a close

use serde::{Deserialize, Serialize};

/// A feed value (or unavailability notice) sent to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedUpdate {
    pub container: String,
    pub feed: String,
    pub type_tag: String,
    /// Latest value, `null` when unavailable
    pub data: Option<serde_json::Value>,
    pub available: bool,
}

impl FeedUpdate {
    /// An update carrying a value
    pub fn value(
        container: impl Into<String>,
        feed: impl Into<String>,
        type_tag: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            container: container.into(),
            feed: feed.into(),
            type_tag: type_tag.into(),
            data: Some(data),
            available: true,
        }
    }

    /// A notice that the feed has no current value
    pub fn unavailable(
        container: impl Into<String>,
        feed: impl Into<String>,
        type_tag: impl Into<String>,
    ) -> Self {
        Self {
            container: container.into(),
            feed: feed.into(),
            type_tag: type_tag.into(),
            data: None,
            available: false,
        }
    }
}

/// Server-to-client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Data(FeedUpdate),
    Logs(String),
    Error(String),
}

impl ServerMessage {
    /// Encode as a JSON text payload
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from a JSON text payload
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
