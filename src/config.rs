use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::realtime::RealtimeConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Realtime connection layer configuration
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Stats sink configuration
    #[serde(default)]
    pub stats_sink: StatsSinkConfig,

    /// Connection authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());

        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(&config_path).required(false))
            // Override with environment variables (prefix: EVENT_RT_)
            .add_source(
                config::Environment::with_prefix("EVENT_RT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Address the HTTP server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Identifies this process in shared stats keys
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            instance_id: default_instance_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StatsSinkBackend {
    #[default]
    None,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSinkConfig {
    /// Sink backend type
    #[serde(default)]
    pub backend: StatsSinkBackend,

    /// Redis connection string
    pub redis_url: Option<String>,

    /// Prefix for keys and channels
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Snapshot expiry (seconds)
    #[serde(default = "default_stats_ttl")]
    pub ttl_secs: u64,
}

impl Default for StatsSinkConfig {
    fn default() -> Self {
        Self {
            backend: StatsSinkBackend::None,
            redis_url: None,
            key_prefix: default_key_prefix(),
            ttl_secs: default_stats_ttl(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Static `token -> user_id` table
    #[serde(default)]
    pub tokens: HashMap<String, String>,

    /// Bearer key for the `/internal` publish routes
    #[serde(default)]
    pub internal_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            prometheus_enabled: true,
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_instance_id() -> String {
    "event-realtime-0".to_string()
}

fn default_key_prefix() -> String {
    "event-realtime".to_string()
}

fn default_stats_ttl() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
