//! Streaming sessions
//!
//! A session owns its own state and talks to the client only through a
//! [`SessionSink`]. A failed send ends the session; there is no other
//! cancellation signal.

pub mod feed_poll;
pub mod log_tail;

use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::ServerMessage;

/// Sleep between polls of a log source
pub const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backoff after a failed fetch
pub const ERROR_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Lines sent when a log session connects
pub const INITIAL_LOG_TAIL: usize = 100;

/// Lines requested when a log session has no cursor
pub const FALLBACK_LOG_TAIL: usize = 10_000;

/// Outbound half of a client connection
#[async_trait]
pub trait SessionSink: Send {
    /// Send one message; `false` means the client is gone
    async fn send(&mut self, msg: &ServerMessage) -> bool;

    fn is_connected(&self) -> bool;

    /// Close the connection, ignoring errors
    async fn close(&mut self);
}

/// What a session loop should do after one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Sleep the normal interval and poll again
    Continue,
    /// Sleep the given delay before the next poll
    Backoff(Duration),
    /// The client is gone
    Disconnected,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that records messages and can drop the connection after N sends
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub sent: Arc<Mutex<Vec<ServerMessage>>>,
        pub fail_after: Option<usize>,
        pub closed: Arc<Mutex<bool>>,
    }

    impl RecordingSink {
        pub(crate) fn failing_after(sends: usize) -> Self {
            Self {
                fail_after: Some(sends),
                ..Self::default()
            }
        }

        pub(crate) fn messages(&self) -> Vec<ServerMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionSink for RecordingSink {
        async fn send(&mut self, msg: &ServerMessage) -> bool {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|limit| sent.len() >= limit) {
                return false;
            }
            sent.push(msg.clone());
            true
        }

        fn is_connected(&self) -> bool {
            !*self.closed.lock().unwrap()
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[test]
    fn test_session_sink_is_object_safe() {
        fn _assert_object_safe(_: Box<dyn SessionSink>) {}
    }

    #[tokio::test]
    async fn test_recording_sink_fails_after_limit() {
        let mut sink = RecordingSink::failing_after(1);
        assert!(sink.send(&ServerMessage::Logs("a".into())).await);
        assert!(!sink.send(&ServerMessage::Logs("b".into())).await);
        assert_eq!(sink.messages().len(), 1);
    }
}
