//! Log source seam for the log-tailing session
//!
//! A log source exposes a growing byte resource per service. Offsets are
//! byte positions; a source reports the offset reached after each read so
//! callers can resume without re-reading delivered bytes.

use async_trait::async_trait;

/// Text read from a log source and the offset reached
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogChunk {
    pub text: String,
    /// Byte offset after the read, `None` when the source cannot track offsets
    pub cursor: Option<u64>,
}

impl LogChunk {
    pub fn new(text: impl Into<String>, cursor: Option<u64>) -> Self {
        Self {
            text: text.into(),
            cursor,
        }
    }
}

/// Errors reported by a log source
#[derive(Debug, thiserror::Error)]
pub enum LogSourceError {
    #[error("invalid service name: {0:?}")]
    InvalidService(String),

    #[error("failed to read logs for '{service}': {source}")]
    Io {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("log source unavailable: {0}")]
    Unavailable(String),
}

/// A readable log resource keyed by service name
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Read from `offset` to the end of the resource
    ///
    /// When the resource is smaller than `offset` (truncated or rotated) the
    /// returned cursor is the new, smaller size.
    async fn read_from(&self, service: &str, offset: u64) -> Result<LogChunk, LogSourceError>;

    /// Read the last `lines` lines; the cursor is the size after the read
    async fn read_tail(&self, service: &str, lines: usize) -> Result<LogChunk, LogSourceError>;
}
