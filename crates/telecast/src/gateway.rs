//! Gateway context
//!
//! One [`ContainerEntry`] per configured container, shared with every
//! handler as axum state. Telemetry start-up is isolated per container: a
//! container that fails to start is logged and left without live data while
//! the others keep running.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use telecast_core::{ContainerTelemetry, FeedSpec, LogSource};

use crate::bus::LocalBus;
use crate::config::Config;
use crate::logs::FileLogSource;

/// Why a container, feed, or service could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("Container '{0}' not found")]
    ContainerNotFound(String),

    #[error("Telemetry for container '{0}' is not available")]
    NoTelemetry(String),

    #[error("Feed '{feed}' is not configured for container '{container}'")]
    FeedNotConfigured { container: String, feed: String },
}

impl LookupError {
    pub fn status(&self) -> StatusCode {
        match self {
            LookupError::ContainerNotFound(_) | LookupError::FeedNotConfigured { .. } => {
                StatusCode::NOT_FOUND
            }
            LookupError::NoTelemetry(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Everything the gateway knows about one container
pub struct ContainerEntry {
    name: String,
    telemetry: Option<Arc<ContainerTelemetry>>,
    logs: Arc<dyn LogSource>,
    bus: Arc<LocalBus>,
}

impl ContainerEntry {
    pub fn new(name: impl Into<String>, logs: Arc<dyn LogSource>) -> Self {
        let name = name.into();
        Self {
            bus: Arc::new(LocalBus::new(name.clone())),
            name,
            telemetry: None,
            logs,
        }
    }

    pub fn with_telemetry(mut self, telemetry: ContainerTelemetry) -> Self {
        self.telemetry = Some(Arc::new(telemetry));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn telemetry(&self) -> Option<&Arc<ContainerTelemetry>> {
        self.telemetry.as_ref()
    }

    pub fn logs(&self) -> &Arc<dyn LogSource> {
        &self.logs
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }
}

/// Shared gateway state
#[derive(Clone)]
pub struct Gateway {
    containers: Arc<BTreeMap<String, ContainerEntry>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(entries: Vec<ContainerEntry>) -> Self {
        let containers = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        Self {
            containers: Arc::new(containers),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build one entry per configured container
    pub fn from_config(config: &Config) -> Self {
        let entries = config
            .containers
            .iter()
            .map(|(name, container)| {
                let logs: Arc<dyn LogSource> =
                    Arc::new(FileLogSource::new(container.log_root.clone()));
                let entry = ContainerEntry::new(name.clone(), logs);
                match &container.telemetry {
                    Some(telemetry) => entry.with_telemetry(
                        ContainerTelemetry::new(name.clone(), telemetry.registry())
                            .with_max_send_rate(telemetry.max_send_rate),
                    ),
                    None => entry,
                }
            })
            .collect();
        Self::new(entries)
    }

    pub fn container(&self, name: &str) -> Result<&ContainerEntry, LookupError> {
        self.containers
            .get(name)
            .ok_or_else(|| LookupError::ContainerNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    /// Telemetry context of a container
    pub fn telemetry(&self, container: &str) -> Result<&Arc<ContainerTelemetry>, LookupError> {
        self.container(container)?
            .telemetry()
            .ok_or_else(|| LookupError::NoTelemetry(container.to_string()))
    }

    /// Resolve a feed named in a request path
    ///
    /// Path wildcards drop the leading `/` of feed names, so `odom` also
    /// matches a feed configured as `/odom`.
    pub fn resolve_feed(
        &self,
        container: &str,
        feed: &str,
    ) -> Result<(&Arc<ContainerTelemetry>, FeedSpec), LookupError> {
        let telemetry = self.telemetry(container)?;
        let spec = telemetry
            .feed(feed)
            .or_else(|| telemetry.feed(&format!("/{feed}")))
            .cloned()
            .ok_or_else(|| LookupError::FeedNotConfigured {
                container: container.to_string(),
                feed: feed.to_string(),
            })?;
        Ok((telemetry, spec))
    }

    /// Token cancelled when the gateway begins shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start telemetry for every container that has it
    ///
    /// Returns the number of containers whose telemetry started.
    pub fn start(&self) -> usize {
        let mut started = 0;
        for entry in self.containers.values() {
            let Some(telemetry) = &entry.telemetry else {
                info!(container = %entry.name, "no telemetry configured");
                continue;
            };
            match telemetry.start(entry.bus.as_ref()) {
                Ok(report) => {
                    started += 1;
                    if !report.failed.is_empty() {
                        warn!(
                            container = %entry.name,
                            failed = ?report.failed,
                            "telemetry started with missing feeds"
                        );
                    }
                }
                Err(e) => {
                    error!(
                        container = %entry.name,
                        error = %e,
                        "failed to start telemetry, container has no live data"
                    );
                }
            }
        }
        started
    }

    /// End open sessions, then stop telemetry for every container
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.containers.values() {
            if let Some(telemetry) = &entry.telemetry {
                telemetry.stop().await;
            }
            entry.bus.close();
        }
        info!("gateway shut down");
    }
}
