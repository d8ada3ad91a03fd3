//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides.
//!
//! structure:
//!     - ServerConfig: where the dashboard api listens.
//!     - ApiConfig: sensor rest backend (snapshot + crud) and request timeout.
//!     - ChannelConfig: push service url, transport order, reconnect policy.
//!     - MapConfig: basemap style / key. only the map views need it.
//!     - SyncConfig: grouping threshold, delta journal size, periodic re-sync.
//!
//! environment:
//!     SENSOR_API_BASE_URL, SENSOR_SOCKET_URL, MAP_STYLE_URL, MAPTILER_KEY,
//!     REQUEST_TIMEOUT_MS, HUB_LISTEN_ADDR
//!
//! ==============================================================================

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::channel::{ReconnectPolicy, TransportKind};
use crate::error::ConfigurationError;
use crate::proximity::DEFAULT_THRESHOLD_KM;
use crate::sync::DEFAULT_MAX_PENDING_DELTAS;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            timeout_ms: 5000,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChannelConfig {
    pub url: String,
    /// preference order
    pub transports: Vec<TransportKind>,
    pub poll_interval_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000".to_string(),
            transports: vec![TransportKind::Streaming, TransportKind::Polling],
            poll_interval_ms: 2000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            max_attempts: None,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(c: &ReconnectConfig) -> Self {
        Self {
            enabled: c.enabled,
            initial_delay: Duration::from_millis(c.initial_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms.max(c.initial_delay_ms)),
            max_attempts: c.max_attempts,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MapConfig {
    /// full style url; wins over `api_key` when set
    #[serde(default)]
    pub style_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl MapConfig {
    /// basemap style for the map views. a missing credential only breaks
    /// the map, never the synchronizer.
    pub fn style_url(&self) -> Result<String, ConfigurationError> {
        if let Some(url) = self.style_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.to_string());
        }
        match self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(key) => Ok(format!(
                "https://api.maptiler.com/maps/streets/style.json?key={key}"
            )),
            None => Err(ConfigurationError::Missing("map.api_key (MAPTILER_KEY)")),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub threshold_km: f64,
    pub max_pending_deltas: usize,
    /// periodic snapshot re-load; off when absent
    pub resync_interval_seconds: Option<u64>,
    /// re-load after the push channel comes back from a drop
    pub resync_on_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            threshold_km: DEFAULT_THRESHOLD_KM,
            max_pending_deltas: DEFAULT_MAX_PENDING_DELTAS,
            resync_interval_seconds: None,
            resync_on_reconnect: true,
        }
    }
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigurationError::Read(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        let config: HubConfig =
            toml::from_str(content).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback, then apply the environment.
    ///
    /// a missing or broken file falls back to defaults; an environment
    /// override that leaves the config invalid is an error.
    pub fn load_or_default() -> Result<Self, ConfigurationError> {
        let paths = [
            std::path::PathBuf::from("config").join("hub.toml"),
            std::path::PathBuf::from("..").join("config").join("hub.toml"),
        ];

        let mut config = None;
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(loaded) => {
                        tracing::info!(path = %path.display(), "config loaded");
                        config = Some(loaded);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to load config");
                    }
                }
            }
        }

        let config = config.unwrap_or_else(|| {
            tracing::warn!("no config file found, using defaults");
            Self::default()
        });
        config.with_env(|key| std::env::var(key).ok())
    }

    /// `apply_env` followed by the same checks a config file gets
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.apply_env(lookup);
        self.validate()?;
        Ok(self)
    }

    /// overrides from the environment; `lookup` is injectable for tests
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SENSOR_API_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = lookup("SENSOR_SOCKET_URL") {
            self.channel.url = v;
        }
        if let Some(v) = lookup("MAP_STYLE_URL") {
            self.map.style_url = Some(v);
        }
        if let Some(v) = lookup("MAPTILER_KEY") {
            self.map.api_key = Some(v);
        }
        if let Some(v) = lookup("HUB_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT_MS") {
            match v.parse() {
                Ok(ms) => self.api.timeout_ms = ms,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid REQUEST_TIMEOUT_MS"),
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigurationError::Missing("api.base_url"));
        }
        if self.channel.url.trim().is_empty() {
            return Err(ConfigurationError::Missing("channel.url"));
        }
        if self.channel.transports.is_empty() {
            return Err(ConfigurationError::Invalid {
                key: "channel.transports",
                reason: "at least one transport is required".to_string(),
            });
        }
        if !(self.sync.threshold_km.is_finite() && self.sync.threshold_km >= 0.0) {
            return Err(ConfigurationError::Invalid {
                key: "sync.threshold_km",
                reason: format!("{} is not a non-negative distance", self.sync.threshold_km),
            });
        }
        Ok(())
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            listen = %self.server.listen_addr,
            api = %self.api.base_url,
            timeout_ms = self.api.timeout_ms,
            channel = %self.channel.url,
            transports = ?self.channel.transports,
            map_configured = self.map.style_url().is_ok(),
            threshold_km = self.sync.threshold_km,
            "hub configuration"
        );
    }
}
