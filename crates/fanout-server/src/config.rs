//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file: `$FANOUT_CONFIG`, `fanout.toml`, `/etc/fanout/fanout.toml`
//!   or `~/.config/fanout/fanout.toml`, whichever exists first
//! - Environment variables (`FANOUT__<SECTION>__<KEY>`, e.g.
//!   `FANOUT__LIMITS__MAX_CONNECTIONS=500`), which override the file

use anyhow::{Context, Result};
use fanout_core::{RedisConfig, RegistryConfig, RetryPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FANOUT_CONFIG";

const CONFIG_PATHS: [&str; 3] = [
    "fanout.toml",
    "/etc/fanout/fanout.toml",
    "~/.config/fanout/fanout.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Upstream bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Retry policy for upstream subscribe/unsubscribe.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Diagnostics endpoints.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Which upstream bus to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Redis pub/sub.
    Redis,
    /// In-process bus, for development.
    Memory,
}

/// Upstream bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Adapter to use.
    #[serde(default = "default_bus_kind")]
    pub kind: BusKind,

    /// Bus host.
    #[serde(default = "default_bus_host")]
    pub host: String,

    /// Bus port.
    #[serde(default = "default_bus_port")]
    pub port: u16,

    /// Password, if the bus requires one.
    #[serde(default)]
    pub password: Option<String>,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Command round-trip timeout in milliseconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// First reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_first")]
    pub reconnect_first_ms: u64,

    /// Maximum reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Capacity of the bus event stream.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Frames queued per connection before a slow client is dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Retry configuration for upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total tries per call.
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    /// First retry delay in milliseconds.
    #[serde(default = "default_retry_first")]
    pub first_ms: u64,

    /// Maximum retry delay in milliseconds.
    #[serde(default = "default_retry_max")]
    pub max_ms: u64,

    /// Delay growth factor.
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Diagnostics endpoints configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Serve `/admin/connections` and `/admin/channels`.
    #[serde(default)]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_bus_kind() -> BusKind {
    BusKind::Redis
}

fn default_bus_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bus_port() -> u16 {
    6379
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_command_timeout() -> u64 {
    5_000
}

fn default_reconnect_first() -> u64 {
    100
}

fn default_reconnect_max() -> u64 {
    10_000
}

fn default_event_buffer() -> usize {
    4096
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_first() -> u64 {
    50
}

fn default_retry_max() -> u64 {
    1_000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            bus: BusConfig::default(),
            limits: LimitsConfig::default(),
            retry: RetryConfig::default(),
            metrics: MetricsConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: default_bus_kind(),
            host: default_bus_host(),
            port: default_bus_port(),
            password: None,
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
            reconnect_first_ms: default_reconnect_first(),
            reconnect_max_ms: default_reconnect_max(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            first_ms: default_retry_first(),
            max_ms: default_retry_max(),
            factor: default_retry_factor(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = Self::find_file() {
            tracing::info!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                ::config::File::from(path.as_path()).format(::config::FileFormat::Toml),
            );
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("FANOUT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file, without overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(shellexpand::tilde(&explicit).as_ref()));
        }
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Retry policy for upstream subscribe/unsubscribe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts.max(1),
            first: Duration::from_millis(self.retry.first_ms),
            max: Duration::from_millis(self.retry.max_ms),
            factor: self.retry.factor,
        }
    }

    /// Registry settings.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_subscriptions_per_connection: self.limits.max_subscriptions_per_connection,
            retry: self.retry_policy(),
        }
    }

    /// Per-session settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            outbound_buffer: self.limits.outbound_buffer,
            max_message_size: self.limits.max_message_size,
        }
    }

    /// Redis adapter settings.
    #[must_use]
    pub fn redis_config(&self) -> RedisConfig {
        let defaults = RedisConfig::default();
        RedisConfig {
            host: self.bus.host.clone(),
            port: self.bus.port,
            password: self.bus.password.clone(),
            connect_timeout: Duration::from_millis(self.bus.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.bus.command_timeout_ms),
            reconnect: RetryPolicy {
                first: Duration::from_millis(self.bus.reconnect_first_ms),
                max: Duration::from_millis(self.bus.reconnect_max_ms),
                ..defaults.reconnect
            },
            event_buffer: self.bus.event_buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.bus.kind, BusKind::Redis);
        assert!(!config.admin.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [bus]
            kind = "memory"

            [limits]
            max_connections = 50000
            outbound_buffer = 16

            [retry]
            attempts = 5
            first_ms = 10
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.bus.kind, BusKind::Memory);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_subscriptions_per_connection, 100);
        assert_eq!(config.session_config().outbound_buffer, 16);

        let retry = config.retry_policy();
        assert_eq!(retry.attempts, 5);
        assert_eq!(retry.first, Duration::from_millis(10));
        assert_eq!(retry.max, Duration::from_secs(1));
    }

    #[test]
    fn test_redis_config_mapping() {
        let mut config = Config::default();
        config.bus.host = "redis.internal".into();
        config.bus.password = Some("secret".into());
        config.bus.reconnect_first_ms = 250;

        let redis = config.redis_config();
        assert_eq!(redis.host, "redis.internal");
        assert_eq!(redis.port, 6379);
        assert_eq!(redis.password.as_deref(), Some("secret"));
        assert_eq!(redis.reconnect.first, Duration::from_millis(250));
        assert_eq!(redis.reconnect.attempts, u32::MAX);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("fanout-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7000\n[admin]\nenabled = true\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert!(config.admin.enabled);

        std::fs::remove_file(&path).unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
