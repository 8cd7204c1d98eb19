//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! Every section is optional; missing keys fall back to the defaults below.

use anyhow::{ensure, Context};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Short identifier used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
    /// Human readable facility name
    #[serde(default = "default_site_name")]
    pub name: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id(), name: default_site_name() }
    }
}

fn default_site_id() -> String {
    "cmcsc".to_string()
}

fn default_site_name() -> String {
    "Sports Center".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    /// Upstream room key to room name (e.g. "swim" = "swimming_pool")
    #[serde(default = "default_room_aliases")]
    pub rooms: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_ms: default_upstream_timeout_ms(),
            rooms: default_room_aliases(),
        }
    }
}

fn default_upstream_url() -> String {
    "https://cmcsc.cyc.org.tw/api".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

fn default_room_aliases() -> HashMap<String, String> {
    HashMap::from([
        ("swim".to_string(), "swimming_pool".to_string()),
        ("gym".to_string(), "gym".to_string()),
    ])
}

#[derive(Debug, Clone, Deserialize)]
pub struct HoursConfig {
    #[serde(default = "default_opens_at")]
    pub opens_at: u32,
    #[serde(default = "default_closes_at")]
    pub closes_at: u32,
}

impl Default for HoursConfig {
    fn default() -> Self {
        Self { opens_at: default_opens_at(), closes_at: default_closes_at() }
    }
}

fn default_opens_at() -> u32 {
    6
}

fn default_closes_at() -> u32 {
    22
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_fetch_period_secs")]
    pub fetch_period_secs: u64,
    /// Retry delay after a failed fetch; must be shorter than the fetch period
    #[serde(default = "default_error_delay_secs")]
    pub error_delay_secs: u64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fetch_period_secs: default_fetch_period_secs(),
            error_delay_secs: default_error_delay_secs(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

fn default_fetch_period_secs() -> u64 {
    5
}

fn default_error_delay_secs() -> u64 {
    3
}

fn default_flush_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_storage_path() }
    }
}

fn default_storage_path() -> String {
    "data.sqlite".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_bind_address")]
    pub bind_address: String,
    /// HTTP port (0 to disable)
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { bind_address: default_dashboard_bind_address(), port: default_dashboard_port() }
    }
}

fn default_dashboard_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_dashboard_port() -> u16 {
    8888
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub hours: HoursConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    site_name: String,
    upstream_url: String,
    upstream_timeout_ms: u64,
    room_aliases: HashMap<String, String>,
    opens_at: u32,
    closes_at: u32,
    fetch_period_secs: u64,
    error_delay_secs: u64,
    flush_interval_secs: u64,
    storage_path: String,
    dashboard_bind_address: String,
    dashboard_port: u16,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            site_name: toml_config.site.name,
            upstream_url: toml_config.upstream.url,
            upstream_timeout_ms: toml_config.upstream.timeout_ms,
            room_aliases: toml_config.upstream.rooms,
            opens_at: toml_config.hours.opens_at,
            closes_at: toml_config.hours.closes_at,
            fetch_period_secs: toml_config.polling.fetch_period_secs,
            error_delay_secs: toml_config.polling.error_delay_secs,
            flush_interval_secs: toml_config.polling.flush_interval_secs,
            storage_path: toml_config.storage.path,
            dashboard_bind_address: toml_config.dashboard.bind_address,
            dashboard_port: toml_config.dashboard.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.opens_at <= 23, "hours.opens_at must be 0..=23, got {}", self.opens_at);
        ensure!(self.closes_at <= 23, "hours.closes_at must be 0..=23, got {}", self.closes_at);
        ensure!(self.fetch_period_secs > 0, "polling.fetch_period_secs must be positive");
        ensure!(self.error_delay_secs > 0, "polling.error_delay_secs must be positive");
        ensure!(
            self.error_delay_secs < self.fetch_period_secs,
            "polling.error_delay_secs ({}) must be shorter than fetch_period_secs ({})",
            self.error_delay_secs,
            self.fetch_period_secs
        );
        ensure!(self.flush_interval_secs > 0, "polling.flush_interval_secs must be positive");
        ensure!(self.metrics_interval_secs > 0, "metrics.interval_secs must be positive");
        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }

    pub fn upstream_timeout_ms(&self) -> u64 {
        self.upstream_timeout_ms
    }

    pub fn room_aliases(&self) -> &HashMap<String, String> {
        &self.room_aliases
    }

    pub fn opens_at(&self) -> u32 {
        self.opens_at
    }

    pub fn closes_at(&self) -> u32 {
        self.closes_at
    }

    pub fn fetch_period_secs(&self) -> u64 {
        self.fetch_period_secs
    }

    pub fn error_delay_secs(&self) -> u64 {
        self.error_delay_secs
    }

    pub fn flush_interval_secs(&self) -> u64 {
        self.flush_interval_secs
    }

    pub fn storage_path(&self) -> &str {
        &self.storage_path
    }

    pub fn dashboard_bind_address(&self) -> &str {
        &self.dashboard_bind_address
    }

    pub fn dashboard_port(&self) -> u16 {
        self.dashboard_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to override the polling cadence
    #[cfg(test)]
    pub fn with_polling(mut self, fetch_period_secs: u64, error_delay_secs: u64, flush_secs: u64) -> Self {
        self.fetch_period_secs = fetch_period_secs;
        self.error_delay_secs = error_delay_secs;
        self.flush_interval_secs = flush_secs;
        self
    }
}
