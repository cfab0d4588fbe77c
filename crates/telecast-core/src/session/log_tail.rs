//! Cursor-based log tailing
//!
//! On connect the session sends the last [`INITIAL_LOG_TAIL`] lines and
//! remembers the byte offset reached. Each poll then reads only what was
//! appended after that offset, so no byte is delivered twice. When the
//! source cannot report an offset the session falls back to a large tail
//! read to recover one.

use std::sync::Arc;

use tokio::time;
use tracing::{debug, error, info, warn};

use super::{
    ERROR_RETRY_DELAY, FALLBACK_LOG_TAIL, INITIAL_LOG_TAIL, LOG_POLL_INTERVAL, PollOutcome,
    SessionSink,
};
use crate::logs::LogSource;
use crate::protocol::ServerMessage;

/// One client's view of one service log
pub struct LogTailSession<S> {
    container: String,
    service: String,
    source: Arc<dyn LogSource>,
    sink: S,
    cursor: Option<u64>,
    fallback_sent: bool,
}

impl<S: SessionSink> LogTailSession<S> {
    pub fn new(
        container: impl Into<String>,
        service: impl Into<String>,
        source: Arc<dyn LogSource>,
        sink: S,
    ) -> Self {
        Self {
            container: container.into(),
            service: service.into(),
            source,
            sink,
            cursor: None,
            fallback_sent: false,
        }
    }

    /// Byte offset the next poll reads from, `None` when unknown
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Send the initial tail and establish the cursor
    ///
    /// Returns `false` if the client disconnected.
    pub async fn connect(&mut self) -> bool {
        info!(container = %self.container, service = %self.service, "log session connected");

        let chunk = match self.source.read_tail(&self.service, INITIAL_LOG_TAIL).await {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(
                    container = %self.container,
                    service = %self.service,
                    error = %e,
                    "failed to fetch initial logs"
                );
                let msg = ServerMessage::Error(format!("Failed to fetch initial logs: {e}"));
                return self.sink.send(&msg).await;
            }
        };

        self.cursor = match chunk.cursor {
            Some(cursor) => Some(cursor),
            None => {
                warn!(
                    container = %self.container,
                    service = %self.service,
                    "initial log read reported no cursor"
                );
                self.fallback_cursor().await
            }
        };

        if chunk.text.is_empty() {
            return true;
        }
        // The client already has the recent tail; a later fallback only
        // recovers the cursor.
        self.fallback_sent = true;
        self.sink.send(&ServerMessage::Logs(chunk.text)).await
    }

    async fn fallback_cursor(&self) -> Option<u64> {
        match self.source.read_tail(&self.service, FALLBACK_LOG_TAIL).await {
            Ok(chunk) => {
                match chunk.cursor {
                    Some(cursor) => info!(
                        container = %self.container,
                        service = %self.service,
                        cursor,
                        "recovered cursor from fallback read"
                    ),
                    None => error!(
                        container = %self.container,
                        service = %self.service,
                        "cursor still unknown after fallback read"
                    ),
                }
                chunk.cursor
            }
            Err(e) => {
                warn!(
                    container = %self.container,
                    service = %self.service,
                    error = %e,
                    "fallback log read failed"
                );
                None
            }
        }
    }

    /// Deliver anything appended since the last poll
    pub async fn poll_once(&mut self) -> PollOutcome {
        let Some(offset) = self.cursor else {
            return self.poll_fallback().await;
        };

        let chunk = match self.source.read_from(&self.service, offset).await {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(
                    container = %self.container,
                    service = %self.service,
                    error = %e,
                    "failed to fetch logs"
                );
                return PollOutcome::Backoff(ERROR_RETRY_DELAY);
            }
        };

        let Some(next) = chunk.cursor else {
            warn!(
                container = %self.container,
                service = %self.service,
                "log read reported no cursor, switching to tail fallback"
            );
            self.cursor = None;
            return PollOutcome::Continue;
        };

        if !chunk.text.is_empty() {
            if !self.sink.send(&ServerMessage::Logs(chunk.text)).await {
                return PollOutcome::Disconnected;
            }
        } else if next < offset {
            debug!(
                container = %self.container,
                service = %self.service,
                from = offset,
                to = next,
                "log truncated, cursor reset"
            );
        }
        self.cursor = Some(next);
        PollOutcome::Continue
    }

    async fn poll_fallback(&mut self) -> PollOutcome {
        warn!(
            container = %self.container,
            service = %self.service,
            "cursor not available, using tail fallback"
        );

        let chunk = match self.source.read_tail(&self.service, FALLBACK_LOG_TAIL).await {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(
                    container = %self.container,
                    service = %self.service,
                    error = %e,
                    "failed to fetch logs"
                );
                return PollOutcome::Backoff(ERROR_RETRY_DELAY);
            }
        };

        let Some(cursor) = chunk.cursor else {
            error!(
                container = %self.container,
                service = %self.service,
                "failed to get cursor from fallback read"
            );
            return PollOutcome::Backoff(ERROR_RETRY_DELAY * 2);
        };

        info!(
            container = %self.container,
            service = %self.service,
            cursor,
            "switching to cursor-based reads"
        );
        self.cursor = Some(cursor);

        if !self.fallback_sent {
            self.fallback_sent = true;
            if !chunk.text.is_empty() && !self.sink.send(&ServerMessage::Logs(chunk.text)).await {
                return PollOutcome::Disconnected;
            }
        }
        PollOutcome::Continue
    }

    /// Connect, then poll until the client goes away
    pub async fn run(mut self) {
        if self.connect().await {
            loop {
                time::sleep(LOG_POLL_INTERVAL).await;
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

        info!(container = %self.container, service = %self.service, "log session disconnected");
        self.sink.close().await;
    }
}
