//! Configuration handling for telecast

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use telecast_core::telemetry::DEFAULT_MAX_SEND_RATE;
use telecast_core::{FeedRegistry, FeedSpec};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("container '{container}': max_send_rate must be positive, got {rate}")]
    InvalidRate { container: String, rate: f64 },

    #[error("container '{container}': feed '{feed}' is configured as both dynamic and static")]
    DuplicateFeed { container: String, feed: String },

    #[error("container '{container}': feed names must not be empty")]
    EmptyFeedName { container: String },
}

/// telecast configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Containers by name
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerConfig>,
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// One container
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    /// Directory holding `{service}/current` log files
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,

    /// Telemetry feeds; absent means the container has no telemetry
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}

/// Feeds of one container
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Per-session send limit (updates per second)
    #[serde(default = "default_max_send_rate")]
    pub max_send_rate: f64,

    /// Dynamic feeds: name to type tag
    #[serde(default)]
    pub dynamic: BTreeMap<String, String>,

    /// Static feeds: name to type tag
    #[serde(default, rename = "static")]
    pub static_feeds: BTreeMap<String, String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8740
}

fn default_log_root() -> PathBuf {
    PathBuf::from("/var/log")
}

fn default_max_send_rate() -> f64 {
    DEFAULT_MAX_SEND_RATE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl TelemetryConfig {
    /// Feed registry for this container, dynamic feeds first
    pub fn registry(&self) -> FeedRegistry {
        let dynamic = self
            .dynamic
            .iter()
            .map(|(name, tag)| FeedSpec::dynamic(name.clone(), tag.clone()));
        let static_feeds = self
            .static_feeds
            .iter()
            .map(|(name, tag)| FeedSpec::static_feed(name.clone(), tag.clone()));
        FeedRegistry::new(dynamic.chain(static_feeds).collect())
    }

    fn validate(&self, container: &str) -> Result<(), ConfigError> {
        if !(self.max_send_rate.is_finite() && self.max_send_rate > 0.0) {
            return Err(ConfigError::InvalidRate {
                container: container.to_string(),
                rate: self.max_send_rate,
            });
        }
        if self
            .dynamic
            .keys()
            .chain(self.static_feeds.keys())
            .any(|name| name.is_empty())
        {
            return Err(ConfigError::EmptyFeedName {
                container: container.to_string(),
            });
        }
        if let Some(feed) = self
            .dynamic
            .keys()
            .find(|name| self.static_feeds.contains_key(*name))
        {
            return Err(ConfigError::DuplicateFeed {
                container: container.to_string(),
                feed: feed.clone(),
            });
        }
        Ok(())
    }
}

impl Config {
    /// Load and validate configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate configuration text; `path` is used in errors
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, container) in &self.containers {
            if let Some(telemetry) = &container.telemetry {
                telemetry.validate(name)?;
            }
        }
        Ok(())
    }
}
