//! # Configuration Management
//!
//! Centralized configuration for servers, clients and the replication layer.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - TOML strings via [`NetworkConfig::from_toml`]
//! - Environment variables (`SYNCLINK_*`) via [`NetworkConfig::from_env`]
//! - Defaults with closures via [`NetworkConfig::default_with_overrides`]
//!
//! Durations are written as integer milliseconds and log levels as lowercase
//! strings.
//!
//! ```rust
//! use synclink::config::{EncryptionPolicy, NetworkConfig};
//!
//! let config = NetworkConfig::from_toml(
//!     r#"
//!     [server]
//!     address = "0.0.0.0:7777"
//!     encryption = "required"
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.server.encryption, EncryptionPolicy::Required);
//! assert!(config.validate().is_empty());
//! ```

use crate::error::{ProtocolError, Result};
use crate::replication::object::OwnershipMode;
use crate::utils::compression::CompressionKind;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Current protocol version advertised in the client handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Default protocol name advertised in the client handshake
pub const DEFAULT_PROTOCOL_NAME: &str = "synclink";

/// Max allowed packet body size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Per-message ceiling for stream chunks
pub const DEFAULT_STREAM_CHUNK: usize = 62 * 1024;

/// Receive capacity a stream advertises unless overridden on open
pub const DEFAULT_STREAM_CAPACITY: usize = 1024 * 1024;

/// Whether a side refuses, tolerates or demands the encryption upgrade
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    Disabled,
    #[default]
    Optional,
    Required,
}

impl EncryptionPolicy {
    pub fn to_wire(self) -> u8 {
        match self {
            EncryptionPolicy::Disabled => 0,
            EncryptionPolicy::Optional => 1,
            EncryptionPolicy::Required => 2,
        }
    }

    pub fn from_wire(code: u8) -> Result<Self> {
        match code {
            0 => Ok(EncryptionPolicy::Disabled),
            1 => Ok(EncryptionPolicy::Optional),
            2 => Ok(EncryptionPolicy::Required),
            other => Err(ProtocolError::Deserialization(format!(
                "invalid encryption policy {other}"
            ))),
        }
    }

    /// Decide whether a connection between `client` and `server` upgrades.
    ///
    /// Returns `None` when one side requires encryption the other refuses.
    pub fn negotiate(client: Self, server: Self) -> Option<bool> {
        use EncryptionPolicy::*;
        match (client, server) {
            (Required, Disabled) | (Disabled, Required) => None,
            (Required, _) | (_, Required) => Some(true),
            (Optional, Optional) => Some(true),
            _ => Some(false),
        }
    }
}

impl FromStr for EncryptionPolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(EncryptionPolicy::Disabled),
            "optional" => Ok(EncryptionPolicy::Optional),
            "required" => Ok(EncryptionPolicy::Required),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown encryption policy: '{other}'"
            ))),
        }
    }
}

/// What a stream receiver does when a peer sends more than it can buffer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Senders wait for `WindowUpdate` credit; overrunning the window closes the stream
    #[default]
    Credit,
    /// Drop the oldest buffered bytes to make room
    EvictOldest,
}

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub streams: StreamConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `SYNCLINK_*` environment variables.
    ///
    /// Unparseable values are ignored, except for the encryption policy which
    /// is rejected so a typo cannot silently disable encryption.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SYNCLINK_SERVER_ADDRESS") {
            config.server.address = addr;
        }
        if let Ok(addr) = std::env::var("SYNCLINK_CLIENT_ADDRESS") {
            config.client.address = addr;
        }
        if let Some(workers) = env_parse("SYNCLINK_WORKERS") {
            config.server.workers = workers;
        }
        if let Some(per_worker) = env_parse("SYNCLINK_CONNECTIONS_PER_WORKER") {
            config.server.connections_per_worker = per_worker;
        }
        if let Some(max) = env_parse("SYNCLINK_MAX_CONNECTIONS") {
            config.server.max_connections = max;
        }
        if let Some(timeout) = env_millis("SYNCLINK_HANDSHAKE_TIMEOUT_MS") {
            config.protocol.handshake_timeout = timeout;
        }
        if let Some(interval) = env_millis("SYNCLINK_KEEPALIVE_INTERVAL_MS") {
            config.protocol.keepalive_interval = interval;
        }
        if let Some(timeout) = env_millis("SYNCLINK_KEEPALIVE_TIMEOUT_MS") {
            config.protocol.keepalive_timeout = timeout;
        }
        if let Ok(name) = std::env::var("SYNCLINK_PROTOCOL_NAME") {
            config.protocol.name = name;
        }
        if let Ok(policy) = std::env::var("SYNCLINK_ENCRYPTION") {
            let policy = policy.parse::<EncryptionPolicy>()?;
            config.server.encryption = policy;
            config.client.encryption = policy;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.protocol.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.streams.validate(self.transport.max_payload_size));
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn check_address(label: &str, address: &str, errors: &mut Vec<String>) {
    if address.is_empty() {
        errors.push(format!("{label} address cannot be empty"));
    } else if address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(format!(
            "Invalid {label} address format: '{address}' (expected format: '0.0.0.0:7777')"
        ));
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:7777")
    pub address: String,

    /// Hard cap on concurrent connections
    pub max_connections: usize,

    /// Number of scheduler workers
    pub workers: usize,

    /// Connections a single worker services
    pub connections_per_worker: usize,

    /// Frames processed per connection before the worker moves on
    pub read_budget: usize,

    /// How often idle workers wake to run timers
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    pub encryption: EncryptionPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            address: String::from("127.0.0.1:7777"),
            max_connections: 1000,
            workers,
            connections_per_worker: 256,
            read_budget: 32,
            tick_interval: Duration::from_millis(100),
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            encryption: EncryptionPolicy::Optional,
        }
    }
}

impl ServerConfig {
    /// Total slots the scheduler offers, bounded by `max_connections`
    pub fn capacity(&self) -> usize {
        (self.workers * self.connections_per_worker).min(self.max_connections)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_address("server", &self.address, &mut errors);

        if self.workers == 0 {
            errors.push("Worker count must be greater than 0".to_string());
        } else if self.workers > 1024 {
            errors.push(format!("Worker count too large: {} (maximum: 1024)", self.workers));
        }

        if self.connections_per_worker == 0 {
            errors.push("Connections per worker must be greater than 0".to_string());
        }

        if self.read_budget == 0 {
            errors.push("Read budget must be greater than 0".to_string());
        }

        if self.tick_interval.as_millis() < 1 {
            errors.push("Tick interval too short (minimum: 1ms)".to_string());
        } else if self.tick_interval.as_secs() > 10 {
            errors.push("Tick interval too long (maximum: 10s)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for the transport connect
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Default wait for RPC results
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    pub encryption: EncryptionPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7777"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: Duration::from_secs(30),
            encryption: EncryptionPolicy::Optional,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_address("client", &self.address, &mut errors);

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.response_timeout.as_millis() < 100 {
            errors.push("Response timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Handshake and liveness settings shared by both sides
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Protocol name both peers must agree on
    pub name: String,

    pub version: u32,

    /// Signal readiness as soon as authentication completes
    pub auto_ready: bool,

    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    /// Silence longer than this closes the connection
    #[serde(with = "duration_serde")]
    pub keepalive_timeout: Duration,

    /// Maximum age of the timestamp in an encryption upgrade request
    #[serde(with = "duration_serde")]
    pub upgrade_max_age: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
            auto_ready: true,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            keepalive_interval: timeout::KEEPALIVE_INTERVAL,
            keepalive_timeout: timeout::KEEPALIVE_TIMEOUT,
            upgrade_max_age: Duration::from_secs(30),
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("Protocol name cannot be empty".to_string());
        } else if self.name.len() > 64 {
            errors.push(format!(
                "Protocol name too long: {} characters (maximum: 64)",
                self.name.len()
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.keepalive_interval.as_millis() < 100 {
            errors.push("Keep-alive interval too short (minimum: 100ms)".to_string());
        } else if self.keepalive_interval.as_secs() > 3600 {
            errors.push("Keep-alive interval too long (maximum: 1 hour)".to_string());
        }

        if self.keepalive_timeout <= self.keepalive_interval {
            errors.push("Keep-alive timeout must be longer than the keep-alive interval".to_string());
        }

        if self.upgrade_max_age.as_secs() < 1 {
            errors.push("Upgrade max age too short (minimum: 1s)".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub compression_enabled: bool,

    pub compression_kind: CompressionKind,

    /// Bodies smaller than this bypass compression
    pub compression_threshold_bytes: usize,

    /// Maximum allowed body size in bytes
    pub max_payload_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            compression_enabled: false,
            compression_kind: CompressionKind::Lz4,
            compression_threshold_bytes: 512,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > MAX_PAYLOAD_SIZE {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum: {MAX_PAYLOAD_SIZE})",
                self.max_payload_size
            ));
        }

        if self.compression_enabled && self.compression_threshold_bytes > self.max_payload_size {
            errors.push("Compression threshold cannot be larger than max payload size".to_string());
        }

        errors
    }
}

/// Object replication settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Ownership applied to objects whose owning connection drops
    pub owner_fallback: OwnershipMode,

    /// Send every visible object to a client once it is connected
    pub snapshot_on_connect: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            owner_fallback: OwnershipMode::Server,
            snapshot_on_connect: true,
        }
    }
}

/// Stream multiplexer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Largest payload carried by a single `DataSend`
    pub chunk_size: usize,

    /// Receive capacity advertised when the opener does not choose one
    pub default_capacity: usize,

    pub overflow_policy: OverflowPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_STREAM_CHUNK,
            default_capacity: DEFAULT_STREAM_CAPACITY,
            overflow_policy: OverflowPolicy::Credit,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self, max_payload_size: usize) -> Vec<String> {
        let mut errors = Vec::new();

        if self.chunk_size == 0 {
            errors.push("Stream chunk size must be greater than 0".to_string());
        } else if self.chunk_size + 1024 > max_payload_size {
            errors.push(format!(
                "Stream chunk size {} leaves no room for headers within max payload {}",
                self.chunk_size, max_payload_size
            ));
        }

        if self.default_capacity == 0 {
            errors.push("Stream capacity must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("synclink"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn test_negotiation_table() {
        use EncryptionPolicy::*;
        assert_eq!(EncryptionPolicy::negotiate(Required, Disabled), None);
        assert_eq!(EncryptionPolicy::negotiate(Disabled, Required), None);
        assert_eq!(EncryptionPolicy::negotiate(Required, Optional), Some(true));
        assert_eq!(EncryptionPolicy::negotiate(Optional, Required), Some(true));
        assert_eq!(EncryptionPolicy::negotiate(Required, Required), Some(true));
        assert_eq!(EncryptionPolicy::negotiate(Optional, Optional), Some(true));
        assert_eq!(EncryptionPolicy::negotiate(Optional, Disabled), Some(false));
        assert_eq!(EncryptionPolicy::negotiate(Disabled, Optional), Some(false));
        assert_eq!(EncryptionPolicy::negotiate(Disabled, Disabled), Some(false));
    }

    #[test]
    fn test_policy_wire_codes() {
        for policy in [
            EncryptionPolicy::Disabled,
            EncryptionPolicy::Optional,
            EncryptionPolicy::Required,
        ] {
            assert_eq!(EncryptionPolicy::from_wire(policy.to_wire()).unwrap(), policy);
        }
        assert!(EncryptionPolicy::from_wire(9).is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [streams]
            overflow_policy = "evict_oldest"

            [protocol]
            keepalive_interval = 1000
            keepalive_timeout = 4000
            "#,
        )
        .unwrap();
        assert_eq!(config.streams.overflow_policy, OverflowPolicy::EvictOldest);
        assert_eq!(config.streams.chunk_size, DEFAULT_STREAM_CHUNK);
        assert_eq!(config.protocol.keepalive_interval, Duration::from_secs(1));
        assert_eq!(config.protocol.name, DEFAULT_PROTOCOL_NAME);
    }

    #[test]
    fn test_keepalive_ordering_checked() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.protocol.keepalive_timeout = c.protocol.keepalive_interval;
        });
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let server = ServerConfig {
            workers: 4,
            connections_per_worker: 10,
            max_connections: 25,
            ..ServerConfig::default()
        };
        assert_eq!(server.capacity(), 25);
    }
}
