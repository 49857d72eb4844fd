// src/config.rs - Feed configuration with YAML support and validation

use crate::error::{FeedError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main alarmfeed configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream API access
    #[serde(default)]
    pub api: ApiConfig,

    /// Live feed sizing
    #[serde(default)]
    pub feed: FeedConfig,

    /// Push channel health detection
    #[serde(default)]
    pub health: HealthConfig,

    /// Polling fallback
    #[serde(default)]
    pub polling: PollingConfig,

    /// Historical search
    #[serde(default)]
    pub search: SearchConfig,

    /// Export of the displayed rows
    #[serde(default)]
    pub export: ExportConfig,
}

impl Config {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate YAML configuration text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill secrets left out of the file from the environment
    fn apply_env(&mut self) {
        if self.api.token.is_none() {
            self.api.token = std::env::var("ALARMFEED_TOKEN").ok().filter(|t| !t.is_empty());
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.feed.capacity == 0 {
            return Err(FeedError::Config("feed.capacity must be greater than zero".into()));
        }
        if self.feed.view_limit == 0 || self.feed.view_limit > self.feed.capacity {
            return Err(FeedError::Config(format!(
                "feed.view_limit must be between 1 and feed.capacity ({})",
                self.feed.capacity
            )));
        }
        if self.health.subscribe_timeout_secs == 0 {
            return Err(FeedError::Config("health.subscribe_timeout_secs must be greater than zero".into()));
        }
        if self.health.idle_timeout_secs == Some(0) {
            return Err(FeedError::Config("health.idle_timeout_secs must be greater than zero when set".into()));
        }
        if self.polling.interval_ms == 0 {
            return Err(FeedError::Config("polling.interval_ms must be greater than zero".into()));
        }
        if self.search.limit == 0 {
            return Err(FeedError::Config("search.limit must be greater than zero".into()));
        }
        if !self.export.delimiter.is_ascii() || self.export.delimiter.is_ascii_alphanumeric() {
            return Err(FeedError::Config(format!(
                "export.delimiter '{}' is not a usable separator",
                self.export.delimiter
            )));
        }
        if let Some(url) = &self.api.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(FeedError::Config(format!("api.base_url '{}' must be http(s)", url)));
            }
        }
        Ok(())
    }

    /// Events requested per pull
    pub fn pull_limit(&self) -> usize {
        self.polling.pull_limit.unwrap_or(self.feed.capacity)
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Upstream API access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the monitoring backend; `None` runs against the
    /// in-memory replay archive
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token (falls back to `ALARMFEED_TOKEN`)
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Push topic to follow
    #[serde(default = "default_topic")]
    pub topic: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            request_timeout_secs: default_request_timeout(),
            topic: default_topic(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Live feed sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Maximum events tracked in the live store
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Rows shown to the viewer
    #[serde(default = "default_view_limit")]
    pub view_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            view_limit: default_view_limit(),
        }
    }
}

/// Push channel health detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Bounded wait for subscription confirmation
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_secs: u64,

    /// Pause before resubscribing after an error or close
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Silence window after which a subscribed channel counts as degraded
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout_secs: default_subscribe_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            idle_timeout_secs: None,
        }
    }
}

impl HealthConfig {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Polling fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval between full refreshes while the channel is unhealthy
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,

    /// Events per pull (defaults to `feed.capacity`)
    #[serde(default)]
    pub pull_limit: Option<usize>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            pull_limit: None,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Historical search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Result rows requested per search
    #[serde(default = "default_search_limit")]
    pub limit: usize,

    /// Apply the viewer's station scope to search results
    #[serde(default = "default_true")]
    pub apply_scope: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: default_search_limit(),
            apply_scope: default_true(),
        }
    }
}

/// Export of the displayed rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
        }
    }
}

// ============================================================================
// DEFAULTS
// ============================================================================

fn default_request_timeout() -> u64 { 30 }
fn default_topic() -> String { "alarms".to_string() }
fn default_capacity() -> usize { 100 }
fn default_view_limit() -> usize { 30 }
fn default_subscribe_timeout() -> u64 { 60 }
fn default_reconnect_delay() -> u64 { 5000 }
fn default_poll_interval() -> u64 { 10_000 }
fn default_search_limit() -> usize { 30 }
fn default_true() -> bool { true }
fn default_delimiter() -> char { ',' }
