//! Application settings and configuration

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::client::{BACKOFF_BASE_SECS, MIN_POLL_INTERVAL_SECS};

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Upstream marketplace configuration
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseSettings,
    /// Collector configuration
    #[serde(default)]
    pub collector: CollectorSettings,
}

/// Upstream marketplace API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key for bearer authentication
    #[serde(default)]
    pub api_key: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Include unverified/deverified offers in polling
    #[serde(default = "default_true")]
    pub include_unverified: bool,
    /// Extra query filters merged into every search (overrides win)
    #[serde(default)]
    pub extra_filters: Option<Map<String, Value>>,
}

fn default_base_url() -> String {
    "https://cloud.vast.ai/api/v0".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            include_unverified: true,
            extra_filters: None,
        }
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://offerwatch.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Collector settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// Poll interval in seconds; clamped to the rate-limit cushion below.
    pub poll_interval_secs: Option<u64>,
}

impl CollectorSettings {
    /// Effective inter-cycle sleep: never below six times the upstream's
    /// minimum poll interval.
    pub fn effective_poll_interval(&self) -> Duration {
        let floor = MIN_POLL_INTERVAL_SECS * 6;
        let configured = self.poll_interval_secs.filter(|secs| *secs > 0);
        Duration::from_secs(configured.unwrap_or(BACKOFF_BASE_SECS).max(floor))
    }
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("OFFERWATCH")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config_dir = Self::config_dir();

        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // Environment variables (e.g. OFFERWATCH__UPSTREAM__API_KEY)
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    fn config_dir() -> String {
        std::env::var("OFFERWATCH_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Startup validation: a missing credential is fatal before any polling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.api_key.trim().is_empty() {
            return Err(ConfigError::Message(
                "upstream.api_key is not set (OFFERWATCH__UPSTREAM__API_KEY)".to_string(),
            ));
        }
        Ok(())
    }
}
