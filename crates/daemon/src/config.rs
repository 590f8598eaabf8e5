//! Configuration management for the meshgate daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/meshgate/config.toml`.
//! Relative paths in the `[paths]` section are resolved against `paths.data_dir`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{ClientConfig, WireConfig, REAL_USER_LENGTH, SIGNED_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("max_buffer_size must be greater than 0, got {0}")]
    InvalidBufferSize(usize),

    #[error("headers_length must be between 1 and max_buffer_size ({max}), got {got}")]
    InvalidHeadersLength { got: usize, max: usize },

    #[error("user_length must be {expected}, got {got}")]
    InvalidUserLength { got: usize, expected: usize },

    #[error("public_key_length must be {expected}, got {got}")]
    InvalidPublicKeyLength { got: usize, expected: usize },

    #[error("read_chunk_size must be greater than 0")]
    InvalidChunkSize,

    #[error("delimiter must not be empty")]
    EmptyDelimiter,

    #[error("{field} must be a non-empty name without '/', got {value:?}")]
    InvalidServiceName { field: &'static str, value: String },

    #[error("store backend must be one of: sqlite, memory; got {0}")]
    InvalidStoreBackend(String),

    #[error("pool_size must be between 1 and 64, got {0}")]
    InvalidPoolSize(usize),

    #[error("connect_retry must be at least 1")]
    InvalidConnectRetry,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Supported store backends.
const VALID_STORE_BACKENDS: &[&str] = &["sqlite", "memory"];

/// Main configuration structure for the meshgate daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and wire limits.
    pub server: ServerConfig,

    /// Filesystem layout.
    pub paths: PathsConfig,

    /// Outbound connections made when forwarding.
    pub client: ClientSection,

    /// Crypto worker pool.
    pub crypto: CryptoConfig,

    /// Authorization policy knobs.
    pub security: SecurityConfig,

    /// User and token database.
    pub store: StoreConfig,

    /// Session log lines.
    pub templates: TemplatesConfig,

    /// Logging.
    pub logging: LoggingConfig,
}

/// Listener and wire limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    /// Seconds to wait for each frame; 0 disables the timeout.
    pub recv_timeout: u64,
    /// Largest body envelope accepted, in bytes.
    pub max_buffer_size: usize,
    /// Largest header envelope accepted, in bytes.
    pub headers_length: usize,
    pub user_length: usize,
    pub public_key_length: usize,
    pub read_chunk_size: usize,
    pub delimiter: String,
    /// Service answering the `/` path.
    pub index_name: String,
    /// Administrative service; never directly addressable.
    pub admin_service: String,
}

/// Filesystem layout. Relative entries live under `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    /// Root of the key directories.
    pub init_path: PathBuf,
    /// User verification keys, under `init_path`.
    pub user_data: String,
    /// Peer node verification keys, under `init_path`.
    pub server_data: String,
    pub public_key: PathBuf,
    pub private_key: PathBuf,
}

/// Outbound connection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSection {
    /// Name this node presents to peer nodes when forwarding.
    pub username: String,
    /// Seconds between connection attempts.
    pub connect_timewait: u64,
    pub connect_retry: u32,
    /// Seconds allowed for a single attempt.
    pub connect_timeout: u64,
    pub max_buffer_size: usize,
}

/// Crypto worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CryptoConfig {
    /// Worker count; 0 uses every core.
    pub workers: usize,
}

/// Authorization policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Deny non-guest users whose token scope does not match, like guests.
    pub strict_token_scope: bool,
}

/// Store backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: String,
    pub database: PathBuf,
    pub pool_size: usize,
}

/// Session log templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemplatesConfig {
    pub preface: String,
    pub intro: String,
    pub end: String,
    pub null_data: String,
    pub true_data: String,
    pub false_data: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 17000,
            recv_timeout: 120,
            max_buffer_size: 100 * 1024 * 1024, // 100MB
            headers_length: 64 * 1024,
            user_length: REAL_USER_LENGTH,
            public_key_length: SIGNED_KEY_LENGTH,
            read_chunk_size: 64 * 1024,
            delimiter: "\r\n\r\n".to_string(),
            index_name: "index".to_string(),
            admin_service: "admin".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            init_path: PathBuf::from("data"),
            user_data: "pubkeys".to_string(),
            server_data: "servkeys".to_string(),
            public_key: PathBuf::from("keys/key.pub"),
            private_key: PathBuf::from("keys/key.priv"),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            username: "meshgate".to_string(),
            connect_timewait: 30,
            connect_retry: 3,
            connect_timeout: 10,
            max_buffer_size: 100 * 1024 * 1024,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            database: PathBuf::from("meshgate.db"),
            pool_size: 4,
        }
    }
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            preface: "session started [%Y-%m-%d %H:%M] for {address}:{port}".to_string(),
            intro: "{address}:{port} - [%Y-%m-%d %H:%M] {path} {action} ({username}:{userid})"
                .to_string(),
            end: concat!(
                "session ended after [{weeks}w/{days}d - {hours}:{minutes}:{seconds}] ",
                "for {address}:{port} ({username})",
            )
            .to_string(),
            null_data: "null".to_string(),
            true_data: "true".to_string(),
            false_data: "false".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshgate")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshgate")
}

fn valid_service_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - MESHGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - MESHGATE_LISTEN_ADDRESS: Override the listen address
    /// - MESHGATE_LISTEN_PORT: Override the listen port
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("MESHGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }

        if let Ok(address) = std::env::var("MESHGATE_LISTEN_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding listen_address from environment: {}", address);
                self.server.listen_address = address;
            }
        }

        if let Ok(port) = std::env::var("MESHGATE_LISTEN_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding listen_port from environment: {}", port);
                    self.server.listen_port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => tracing::warn!("Ignoring MESHGATE_LISTEN_PORT={:?}: {}", port, e),
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.listen_port == 0 {
            return Err(ConfigError::InvalidPort(server.listen_port));
        }
        if server.max_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(server.max_buffer_size));
        }
        if server.headers_length == 0 || server.headers_length > server.max_buffer_size {
            return Err(ConfigError::InvalidHeadersLength {
                got: server.headers_length,
                max: server.max_buffer_size,
            });
        }
        if server.user_length != REAL_USER_LENGTH {
            return Err(ConfigError::InvalidUserLength {
                got: server.user_length,
                expected: REAL_USER_LENGTH,
            });
        }
        if server.public_key_length != SIGNED_KEY_LENGTH {
            return Err(ConfigError::InvalidPublicKeyLength {
                got: server.public_key_length,
                expected: SIGNED_KEY_LENGTH,
            });
        }
        if server.read_chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        if server.delimiter.is_empty() {
            return Err(ConfigError::EmptyDelimiter);
        }
        for (field, value) in [
            ("index_name", &server.index_name),
            ("admin_service", &server.admin_service),
        ] {
            if !valid_service_name(value) {
                return Err(ConfigError::InvalidServiceName {
                    field,
                    value: value.clone(),
                });
            }
        }

        if !VALID_STORE_BACKENDS.contains(&self.store.backend.as_str()) {
            return Err(ConfigError::InvalidStoreBackend(self.store.backend.clone()));
        }
        if self.store.pool_size == 0 || self.store.pool_size > 64 {
            return Err(ConfigError::InvalidPoolSize(self.store.pool_size));
        }

        if self.client.connect_retry == 0 {
            return Err(ConfigError::InvalidConnectRetry);
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Resolves a configured path against the data directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths.data_dir.join(path)
        }
    }

    /// Directory holding user verification keys.
    pub fn user_keys_dir(&self) -> PathBuf {
        self.resolve(&self.paths.init_path).join(&self.paths.user_data)
    }

    /// Directory holding peer node verification keys.
    pub fn server_keys_dir(&self) -> PathBuf {
        self.resolve(&self.paths.init_path).join(&self.paths.server_data)
    }

    /// Wire limits used by accepted connections.
    pub fn wire_config(&self) -> WireConfig {
        WireConfig {
            delimiter: self.server.delimiter.as_bytes().to_vec(),
            read_chunk_size: self.server.read_chunk_size,
            headers_max: self.server.headers_length,
            body_max: self.server.max_buffer_size,
            user_length: self.server.user_length,
            public_key_length: self.server.public_key_length,
            recv_timeout: match self.server.recv_timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// Policy for outbound connections made while forwarding.
    pub fn client_config(&self) -> ClientConfig {
        let mut wire = self.wire_config();
        wire.body_max = self.client.max_buffer_size;
        ClientConfig {
            connect_timeout: Duration::from_secs(self.client.connect_timeout),
            connect_retry: self.client.connect_retry,
            connect_wait: Duration::from_secs(self.client.connect_timewait),
            wire,
        }
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.listen_address, self.server.listen_port)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
