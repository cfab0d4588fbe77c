//! HTTP server
//!
//! Wires the REST and WebSocket routes onto the gateway state.

use std::future::Future;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;

use crate::gateway::Gateway;
use crate::router;

/// Build the axum application router
///
/// Separated from `run_server` to enable testing without TCP binding.
pub(crate) fn build_app(gateway: Gateway) -> Router {
    Router::new()
        .route("/containers", get(router::list_containers))
        .route("/containers/{container}/feeds", get(router::list_feeds))
        .route(
            "/containers/{container}/feeds/{*feed}",
            get(router::get_feed).post(router::publish_feed),
        )
        .route(
            "/ws/containers/{container}/feeds/{*feed}",
            get(router::feed_ws_handler),
        )
        .route(
            "/ws/containers/{container}/services/{service}/logs",
            get(router::logs_ws_handler),
        )
        .with_state(gateway)
}

/// Run the HTTP server until `shutdown` resolves
pub async fn run_server(
    listener: TcpListener,
    gateway: Gateway,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = build_app(gateway);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
