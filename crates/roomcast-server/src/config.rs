//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`ROOMCAST_CONFIG`, or the first of the default paths)
//! - Environment variables (`ROOMCAST_*`, nested keys joined with `__`)

use anyhow::{Context, Result};
use roomcast_core::{HeartbeatConfig as CoreHeartbeatConfig, Identity, ServiceConfig, StaticIdentityProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, in search order.
const CONFIG_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
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

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub rooms: RoomsConfig,

    /// Static credential table.
    #[serde(default)]
    pub users: Vec<UserEntry>,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the push (WebSocket) endpoint.
    #[serde(default = "default_push_path")]
    pub push_path: String,

    /// Prefix of the bridge routes.
    #[serde(default = "default_bridge_prefix")]
    pub bridge_prefix: String,

    /// Outbound queue depth per push client and bridge subscription.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Time a push client has to send `Connect`.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Heartbeat configuration.
///
/// The timeout window is always twice the probe interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
}

/// Room defaults and startup rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    #[serde(default = "default_capacity")]
    pub default_capacity: usize,

    /// Default page size for message history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Rooms created at startup.
    #[serde(default)]
    pub seed: Vec<SeedRoom>,
}

/// A room created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRoom {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// One entry of the static credential table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub token: String,
    pub user_id: String,
    pub username: String,
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

fn default_push_path() -> String {
    "/ws".to_string()
}

fn default_bridge_prefix() -> String {
    "/bridge".to_string()
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_probe_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_capacity() -> usize {
    10
}

fn default_history_limit() -> usize {
    50
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
            heartbeat: HeartbeatConfig::default(),
            rooms: RoomsConfig::default(),
            users: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            push_path: default_push_path(),
            bridge_prefix: default_bridge_prefix(),
            outbound_buffer: default_outbound_buffer(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            default_capacity: default_capacity(),
            history_limit: default_history_limit(),
            seed: Vec::new(),
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
    /// Load configuration from the first config file found, layered with
    /// `ROOMCAST_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = std::env::var("ROOMCAST_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(find_config_file);
        Self::layered(path.as_deref(), None)
    }

    /// Build from an optional file plus environment overrides. `env` replaces
    /// the process environment when given.
    fn layered(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ROOMCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config = builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(config)
    }

    /// Load configuration from a specific file.
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

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.probe_interval_ms.max(1))
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.handshake_timeout_ms)
    }

    /// Core service configuration.
    #[must_use]
    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            default_capacity: self.rooms.default_capacity,
            history_limit: self.rooms.history_limit,
            heartbeat: CoreHeartbeatConfig::new(self.probe_interval()),
        }
    }

    /// Identity provider backed by the `[[users]]` table.
    #[must_use]
    pub fn identity_provider(&self) -> StaticIdentityProvider {
        self.users
            .iter()
            .fold(StaticIdentityProvider::new(), |provider, user| {
                provider.with_user(
                    user.token.clone(),
                    Identity::new(user.user_id.clone(), user.username.clone()),
                )
            })
    }
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        host = "0.0.0.0"
        port = 9000

        [heartbeat]
        probe_interval_ms = 5000

        [rooms]
        default_capacity = 4

        [[rooms.seed]]
        name = "General"
        description = "Anything goes"

        [[users]]
        token = "alice-token"
        user_id = "u-alice"
        username = "alice"
    "#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.push_path, "/ws");
        assert_eq!(config.transport.bridge_prefix, "/bridge");
        assert_eq!(config.probe_interval(), Duration::from_secs(10));
        assert_eq!(config.service().heartbeat.timeout_window(), Duration::from_secs(20));
        assert_eq!(config.rooms.default_capacity, 10);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.rooms.default_capacity, 4);
        assert_eq!(config.rooms.history_limit, 50);
        assert_eq!(config.rooms.seed.len(), 1);
        assert_eq!(config.rooms.seed[0].capacity, None);
        assert_eq!(config.users[0].username, "alice");
        assert_eq!(config.service().heartbeat.probe_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = std::env::temp_dir().join(format!("roomcast-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roomcast.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let env = HashMap::from([
            ("ROOMCAST_PORT".to_string(), "9100".to_string()),
            (
                "ROOMCAST_TRANSPORT__PUSH_PATH".to_string(),
                "/push".to_string(),
            ),
        ]);
        let config = Config::layered(Some(&path), Some(env)).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.transport.push_path, "/push");
        assert_eq!(config.heartbeat.probe_interval_ms, 5000);

        let from_file = Config::from_file(&path).unwrap();
        assert_eq!(from_file.port, 9000);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_identity_provider_from_users() {
        use roomcast_core::IdentityProvider;

        let config: Config = toml::from_str(SAMPLE).unwrap();
        let provider = config.identity_provider();
        assert_eq!(provider.len(), 1);
        let identity = provider.verify("alice-token").await.unwrap();
        assert_eq!(identity.user_id, "u-alice");
    }
}
