mod bus;
mod cli;
mod config;
mod gateway;
mod logs;
mod router;
mod server;


use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::gateway::Gateway;

fn init_tracing(json: bool) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();
}

/// Resolves on Ctrl-C or SIGTERM, then ends open sessions
async fn shutdown_signal(sessions: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown requested");
    sessions.cancel();
}

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = cli::Cli::parse();

    init_tracing(cli.log_json);

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("telecast: error: {}", e);
            std::process::exit(1);
        }
    };
    let port = cli.port.unwrap_or(config.server.port);

    info!(
        config = ?cli.config,
        port,
        containers = config.containers.len(),
        "telecast starting"
    );

    // Start telemetry; a container that fails is skipped
    let gateway = Gateway::from_config(&config);
    let started = gateway.start();
    info!(
        started,
        configured = config
            .containers
            .values()
            .filter(|c| c.telemetry.is_some())
            .count(),
        "telemetry contexts started"
    );

    // Bind TCP listener
    let addr = format!("{}:{}", config.server.host, port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("telecast: error: failed to bind to {}: {}", addr, e);
            gateway.shutdown().await;
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "telecast server listening");

    let result = server::run_server(
        listener,
        gateway.clone(),
        shutdown_signal(gateway.shutdown_token()),
    )
    .await;

    // Stop janitors, tear down subscriptions, clear caches
    gateway.shutdown().await;

    match result {
        Ok(()) => info!("telecast shut down"),
        Err(e) => {
            eprintln!("telecast: error: server error: {}", e);
            std::process::exit(1);
        }
    }
}
