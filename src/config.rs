use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport::{ReconnectPolicy, SocketOptions};
use crate::view::ViewOptions;

pub const URL_ENV: &str = "FRAMESCOPE_URL";
pub const CAPACITY_ENV: &str = "FRAMESCOPE_CAPACITY";

/// Default config directory: ~/.framescope/
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".framescope")
}

/// Default config file path: ~/.framescope/settings.json
pub fn default_config_path() -> PathBuf {
    config_dir().join("settings.json")
}

/// Log directory: ~/.framescope/logs/
pub fn log_dir() -> PathBuf {
    config_dir().join("logs")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub view: ViewConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Frames kept in memory per view.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Frames shown after filtering.
    #[serde(default = "default_display_limit")]
    pub display_limit: usize,
    #[serde(default = "default_true")]
    pub request_history: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_true")]
    pub send_filters: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub policy: BackoffKind,
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Ceiling for the exponential policy; ignored by the fixed one.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ViewConfig {
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: u32,
    #[serde(default = "default_filter_debounce_ms")]
    pub filter_debounce_ms: u64,
}

fn default_version() -> u32 {
    1
}
fn default_url() -> String {
    "ws://localhost:8000/ws/live".to_string()
}
fn default_capacity() -> usize {
    1000
}
fn default_display_limit() -> usize {
    300
}
fn default_history_limit() -> usize {
    200
}
fn default_true() -> bool {
    true
}
fn default_initial_ms() -> u64 {
    1000
}
fn default_max_ms() -> u64 {
    30_000
}
fn default_refresh_hz() -> u32 {
    30
}
fn default_filter_debounce_ms() -> u64 {
    150
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            stream: StreamConfig::default(),
            reconnect: ReconnectConfig::default(),
            view: ViewConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            capacity: default_capacity(),
            display_limit: default_display_limit(),
            request_history: true,
            history_limit: default_history_limit(),
            send_filters: true,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            policy: BackoffKind::default(),
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
        }
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            refresh_hz: default_refresh_hz(),
            filter_debounce_ms: default_filter_debounce_ms(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `FRAMESCOPE_URL` / `FRAMESCOPE_CAPACITY`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup(URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.stream.url = url.trim().to_string();
        }
        if let Some(raw) = lookup(CAPACITY_ENV).filter(|v| !v.trim().is_empty()) {
            self.stream.capacity = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{CAPACITY_ENV}={raw}: {e}"))?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.stream.url)
            .map_err(|e| anyhow::anyhow!("stream.url `{}`: {e}", self.stream.url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("stream.url must use ws:// or wss://, got `{}`", self.stream.url);
        }
        if self.stream.capacity == 0 {
            bail!("stream.capacity must be at least 1");
        }
        if self.stream.display_limit == 0 {
            bail!("stream.display_limit must be at least 1");
        }
        if !(1..=240).contains(&self.view.refresh_hz) {
            bail!("view.refresh_hz must be within 1..=240, got {}", self.view.refresh_hz);
        }
        if self.reconnect.initial_ms == 0 {
            bail!("reconnect.initial_ms must be positive");
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial = Duration::from_millis(self.reconnect.initial_ms);
        match self.reconnect.policy {
            BackoffKind::Fixed => ReconnectPolicy::Fixed(initial),
            BackoffKind::Exponential => ReconnectPolicy::Exponential {
                initial,
                max: Duration::from_millis(self.reconnect.max_ms),
            },
        }
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            policy: self.reconnect_policy(),
            history_limit: self
                .stream
                .request_history
                .then_some(self.stream.history_limit),
        }
    }

    pub fn view_options(&self) -> ViewOptions {
        ViewOptions {
            capacity: self.stream.capacity,
            display_limit: self.stream.display_limit,
            clear_on_history: self.stream.request_history,
            send_filters: self.stream.send_filters,
            filter_debounce: Duration::from_millis(self.view.filter_debounce_ms),
        }
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.view.refresh_hz.clamp(1, 240)))
    }
}
