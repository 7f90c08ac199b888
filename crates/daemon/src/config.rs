//! Configuration management for the fencelink daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/fencelink/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::GatewayLocalState;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::gateways::DiscoverySettings;
use crate::monitoring::MonitoringConfig;
use crate::retry::DEFAULT_BACKOFF_SECS;
use crate::transport::local::DEFAULT_PROBE_PATH;
use crate::transport::CloudSettings;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("api_server must be an http:// or https:// URL, got {0}")]
    InvalidApiServer(String),

    #[error("client_id must not be empty")]
    MissingClientId,

    #[error("request_timeout_secs must be between 1 and 300, got {0}")]
    InvalidRequestTimeout(u64),

    #[error("probe_timeout_ms must be between 100 and 30000, got {0}")]
    InvalidProbeTimeout(u64),

    #[error("{field} must start with '/', got {value}")]
    InvalidPath { field: &'static str, value: String },

    #[error("backoff_secs must list 1 to 10 positive delays, got {0:?}")]
    InvalidBackoff(Vec<u64>),

    #[error("maintenance_interval_secs must be at least 10, got {0}")]
    InvalidMaintenanceInterval(u64),

    #[error("invalid monitoring settings: {0}")]
    InvalidMonitoring(String),

    #[error("gateway id {0} is listed more than once")]
    DuplicateGateway(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the fencelink daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Cloud API connection.
    pub cloud: CloudConfig,

    /// Gateway local-control settings.
    pub local: LocalConfig,

    /// Retry backoff for failed actions.
    pub retry: RetryConfig,

    /// LAN discovery of gateways.
    pub discovery: DiscoveryConfig,

    /// Geofence monitoring options.
    pub monitoring: MonitoringConfig,

    /// Gateways known ahead of discovery.
    pub gateways: Vec<GatewayEntry>,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (account store, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Seconds between rediscovery and reachability sweeps.
    pub maintenance_interval_secs: u64,
}

/// Cloud API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudConfig {
    /// Base URL of the API; requests go to `{api_server}/oauth2{path}`.
    pub api_server: String,

    pub client_id: String,

    pub client_secret: String,

    pub request_timeout_secs: u64,

    /// Endpoint that issues gateway local-control tokens.
    pub local_token_path: String,

    /// Account whose credentials renew gateway local tokens.
    pub account: String,
}

/// Local-control configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalConfig {
    /// Hard deadline of a LAN probe in milliseconds.
    pub probe_timeout_ms: u64,

    /// Path requested by the reachability probe.
    pub probe_path: String,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before each retry attempt; its length is the retry bound.
    pub backoff_secs: Vec<u64>,
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,

    /// Broadcast address the probe is sent to.
    pub target: SocketAddr,

    /// Local address of the discovery socket.
    pub bind: SocketAddr,
}

/// A gateway listed in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayEntry {
    pub id: u64,

    /// Identifier reported in discovery replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Known LAN address, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            maintenance_interval_secs: 300,
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_server: "https://api3.telldus.com".to_string(),
            client_id: "fencelink".to_string(),
            client_secret: String::new(),
            request_timeout_secs: 30,
            local_token_path: "/client/localControlToken".to_string(),
            account: String::new(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3000,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_secs: DEFAULT_BACKOFF_SECS.to_vec(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let settings = DiscoverySettings::default();
        Self {
            enabled: true,
            target: settings.target,
            bind: settings.bind,
        }
    }
}

impl CloudConfig {
    /// Settings for the cloud client. Call after [`Config::validate`].
    pub fn settings(&self) -> Result<CloudSettings> {
        let api_server = Url::parse(&self.api_server)
            .with_context(|| format!("Invalid api_server: {}", self.api_server))?;
        Ok(CloudSettings {
            api_server,
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }
}

impl LocalConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

impl DiscoveryConfig {
    pub fn settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            target: self.target,
            bind: self.bind,
        }
    }
}

impl GatewayEntry {
    pub fn to_state(&self) -> GatewayLocalState {
        GatewayLocalState {
            uuid: self.uuid.clone(),
            address: self.address.clone(),
            ..GatewayLocalState::new(self.id)
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fencelink")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fencelink")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FENCELINK_API_SERVER: Override the cloud API base URL
    /// - FENCELINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FENCELINK_API_SERVER") {
            if !url.is_empty() {
                tracing::info!("Overriding api_server from environment: {}", url);
                self.cloud.api_server = url;
            }
        }

        if let Ok(level) = std::env::var("FENCELINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let api_server = &self.cloud.api_server;
        match Url::parse(api_server) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            _ => return Err(ConfigError::InvalidApiServer(api_server.clone())),
        }

        if self.cloud.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }

        let timeout = self.cloud.request_timeout_secs;
        if !(1..=300).contains(&timeout) {
            return Err(ConfigError::InvalidRequestTimeout(timeout));
        }

        validate_path("local_token_path", &self.cloud.local_token_path)?;
        validate_path("probe_path", &self.local.probe_path)?;

        let probe = self.local.probe_timeout_ms;
        if !(100..=30_000).contains(&probe) {
            return Err(ConfigError::InvalidProbeTimeout(probe));
        }

        let backoff = &self.retry.backoff_secs;
        if backoff.is_empty() || backoff.len() > 10 || backoff.contains(&0) {
            return Err(ConfigError::InvalidBackoff(backoff.clone()));
        }

        if self.daemon.maintenance_interval_secs < 10 {
            return Err(ConfigError::InvalidMaintenanceInterval(
                self.daemon.maintenance_interval_secs,
            ));
        }

        self.monitoring
            .validate()
            .map_err(|e| ConfigError::InvalidMonitoring(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        for gateway in &self.gateways {
            if !seen.insert(gateway.id) {
                return Err(ConfigError::DuplicateGateway(gateway.id));
            }
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Location of the persisted account store.
    pub fn account_store_path(&self) -> PathBuf {
        self.daemon.data_dir.join("accounts.json")
    }
}

fn validate_path(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with('/') {
        Ok(())
    } else {
        Err(ConfigError::InvalidPath {
            field,
            value: value.to_string(),
        })
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
