//! REST and WebSocket handlers
//!
//! REST endpoints expose container and feed state. Each WebSocket
//! connection runs one streaming session: a feed session for
//! `/ws/containers/{c}/feeds/{*feed}` and a log session for
//! `/ws/containers/{c}/services/{service}/logs`. A request for an unknown
//! container or feed gets one `error` message and is closed.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use telecast_core::{
    FeedClass, FeedPollSession, LogTailSession, ServerMessage, SessionSink,
};

use crate::gateway::{Gateway, LookupError};

/// Error body for REST responses
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for LookupError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Latest value of one feed
#[derive(Debug, Serialize)]
pub struct FeedValueResponse {
    pub container: String,
    pub feed: String,
    pub type_tag: String,
    pub class: FeedClass,
    pub data: Option<Value>,
    pub available: bool,
    pub received_at: Option<String>,
    pub seconds_since_last_message: Option<f64>,
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    delivered: usize,
}

/// GET /containers
pub async fn list_containers(State(gateway): State<Gateway>) -> Json<Vec<String>> {
    Json(gateway.names())
}

/// GET /containers/{container}/feeds
pub async fn list_feeds(
    State(gateway): State<Gateway>,
    Path(container): Path<String>,
) -> Response {
    match gateway.telemetry(&container) {
        Ok(telemetry) => Json(telemetry.status()).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /containers/{container}/feeds/{*feed}
pub async fn get_feed(
    State(gateway): State<Gateway>,
    Path((container, feed)): Path<(String, String)>,
) -> Response {
    let (telemetry, spec) = match gateway.resolve_feed(&container, &feed) {
        Ok(found) => found,
        Err(e) => return e.into_response(),
    };

    let cached = telemetry.get(&spec.name);
    let response = FeedValueResponse {
        container,
        type_tag: spec.type_tag,
        class: spec.class,
        available: cached.is_some(),
        received_at: cached.as_ref().map(|c| c.received_at.to_rfc3339()),
        seconds_since_last_message: cached.as_ref().map(|c| c.age.as_secs_f64()),
        data: cached.map(|c| c.data),
        feed: spec.name,
    };
    Json(response).into_response()
}

/// POST /containers/{container}/feeds/{*feed}
///
/// Publishes the JSON body on the container's bus.
pub async fn publish_feed(
    State(gateway): State<Gateway>,
    Path((container, feed)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Response {
    let spec = match gateway.resolve_feed(&container, &feed) {
        Ok((_, spec)) => spec,
        Err(e) => return e.into_response(),
    };
    let entry = match gateway.container(&container) {
        Ok(entry) => entry,
        Err(e) => return e.into_response(),
    };

    let delivered = entry.bus().publish(&spec.name, value);
    (StatusCode::ACCEPTED, Json(PublishResponse { delivered })).into_response()
}

/// WebSocket half of a session
///
/// A background task drains incoming frames so client close frames and
/// pings are processed; it marks the sink disconnected when the client goes
/// away or the gateway shuts down.
pub struct WsSink {
    tx: SplitSink<WebSocket, Message>,
    disconnected: CancellationToken,
}

impl WsSink {
    pub fn new(socket: WebSocket, shutdown: CancellationToken) -> Self {
        let (tx, mut rx) = socket.split();
        let disconnected = CancellationToken::new();
        let token = disconnected.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    msg = rx.next() => match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "websocket receive error");
                            break;
                        }
                    },
                }
            }
            token.cancel();
        });

        Self { tx, disconnected }
    }
}

#[async_trait]
impl SessionSink for WsSink {
    async fn send(&mut self, msg: &ServerMessage) -> bool {
        if self.disconnected.is_cancelled() {
            return false;
        }
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to encode message");
                return false;
            }
        };
        if let Err(e) = self.tx.send(Message::Text(text.into())).await {
            debug!(error = %e, "websocket send failed");
            self.disconnected.cancel();
            return false;
        }
        true
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.is_cancelled()
    }

    async fn close(&mut self) {
        self.disconnected.cancel();
        let _ = self.tx.send(Message::Close(None)).await;
        let _ = self.tx.close().await;
    }
}

async fn reject(mut sink: WsSink, error: LookupError) {
    warn!(error = %error, "rejecting websocket session");
    sink.send(&ServerMessage::Error(error.to_string())).await;
    sink.close().await;
}

/// GET /ws/containers/{container}/feeds/{*feed}
pub async fn feed_ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Gateway>,
    Path((container, feed)): Path<(String, String)>,
) -> Response {
    ws.on_upgrade(move |socket| handle_feed_socket(socket, gateway, container, feed))
}

async fn handle_feed_socket(socket: WebSocket, gateway: Gateway, container: String, feed: String) {
    let sink = WsSink::new(socket, gateway.shutdown_token());
    let (telemetry, spec) = match gateway.resolve_feed(&container, &feed) {
        Ok(found) => found,
        Err(e) => return reject(sink, e).await,
    };
    info!(container = %container, feed = %spec.name, "feed websocket accepted");

    FeedPollSession::new(container, spec, Arc::clone(telemetry.cache()), sink)
        .with_max_rate(telemetry.max_send_rate())
        .run()
        .await;
}

/// GET /ws/containers/{container}/services/{service}/logs
pub async fn logs_ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Gateway>,
    Path((container, service)): Path<(String, String)>,
) -> Response {
    ws.on_upgrade(move |socket| handle_logs_socket(socket, gateway, container, service))
}

async fn handle_logs_socket(
    socket: WebSocket,
    gateway: Gateway,
    container: String,
    service: String,
) {
    let sink = WsSink::new(socket, gateway.shutdown_token());
    let source = match gateway.container(&container) {
        Ok(entry) => Arc::clone(entry.logs()),
        Err(e) => return reject(sink, e).await,
    };
    info!(container = %container, service = %service, "log websocket accepted");

    LogTailSession::new(container, service, source, sink)
        .run()
        .await;
}
