//! Configuration management for sysmon
//!
//! Default config location: ./sysmon.toml

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Maximum request body size in bytes (default: 1MB)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors: CorsConfig::default(),
            max_body_size: default_max_body_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Allowed origins. Use "*" for any origin, or list specific origins.
    #[serde(default = "default_cors_origins")]
    pub origins: Vec<String>,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: default_cors_origins(),
        }
    }
}

/// What happens when a producer enqueues into a full session outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutboxFullPolicy {
    /// Report `ChannelFull` back to the producer
    #[default]
    Error,
    /// Drop the message and report success
    Drop,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Idle time after which the sweeper removes a session
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_capacity")]
    pub event_log_capacity: usize,
    /// Create sessions for clients that skip the `initialize` handshake
    #[serde(default = "default_true")]
    pub auto_provision: bool,
    #[serde(default)]
    pub outbox_full_policy: OutboxFullPolicy,
}

fn default_max_age_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_capacity() -> usize {
    100
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            outbox_capacity: default_capacity(),
            event_log_capacity: default_capacity(),
            auto_provision: true,
            outbox_full_policy: OutboxFullPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// SSE comment heartbeat interval
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Close a stream that delivered nothing for this long
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    5 * 60
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl StreamConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SecurityConfig {
    /// Shared secret expected in the `X-API-Key` header. Auth is off when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    /// User-Agent prefixes that bypass the API key check (e.g. "Cursor/")
    #[serde(default)]
    pub allowed_user_agents: Vec<String>,
}

impl SecurityConfig {
    pub fn enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log output format: "pretty" or "json"
    /// Override with LOG_FORMAT env var
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter string
    /// Override with RUST_LOG env var
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Append logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable Prometheus metrics at GET /metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info,sysmon=debug".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_level: default_log_level(),
            log_file: None,
            metrics_enabled: true,
        }
    }
}

/// Expand ~ to home directory in path
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
        Ok(home.join(rest))
    } else if s == "~" {
        dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))
    } else {
        Ok(path.to_path_buf())
    }
}

impl Config {
    /// Parse config from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from file path, or create default
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            Self::from_toml(&content)
        } else {
            let config = Config::default();
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Err(e) = config.save(config_path) {
                tracing::warn!(path = %config_path.display(), error = %e, "Could not write default config");
            }
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn expand_paths(&mut self) -> Result<()> {
        if let Some(ref f) = self.observability.log_file {
            self.observability.log_file = Some(expand_tilde(f)?);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.session.outbox_capacity == 0 {
            return Err(anyhow!("session.outbox_capacity must be greater than zero"));
        }
        if self.session.event_log_capacity == 0 {
            return Err(anyhow!("session.event_log_capacity must be greater than zero"));
        }
        if self.stream.idle_timeout_secs == 0 {
            return Err(anyhow!("stream.idle_timeout_secs must be greater than zero"));
        }
        Ok(())
    }
}
