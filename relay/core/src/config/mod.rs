//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, with a TOML file at
//! `~/.config/chat-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/chat-relay/relay.toml` (typically `~/.config/chat-relay/relay.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! listen_addr = "127.0.0.1:11435"
//!
//! [backend]
//! host = "localhost"
//! port = 11434
//! connect_timeout_secs = 10
//! read_timeout_secs = 600
//!
//! [registry]
//! max_entries = 100
//! retention_secs = 86400
//! sweep_interval_secs = 3600
//!
//! [stream]
//! subscriber_queue_capacity = 256
//! max_line_bytes = 1048576
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::multiplexer::MultiplexerConfig;
use crate::registry::RegistryConfig;
use crate::subscription::MIN_QUEUE_CAPACITY;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Address the HTTP server listens on
    pub listen_addr: Option<String>,
}

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama host
    pub host: Option<String>,

    /// Ollama port
    pub port: Option<u16>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: Option<u64>,

    /// Longest silence between two reads of a backend response, in seconds
    pub read_timeout_secs: Option<u64>,
}

/// Registry section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryToml {
    /// Most responses kept in the registry
    pub max_entries: Option<usize>,

    /// How long finished responses are kept, in seconds
    pub retention_secs: Option<u64>,

    /// Interval between sweeps, in seconds
    pub sweep_interval_secs: Option<u64>,
}

/// Stream section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Per-subscriber queue capacity
    pub subscriber_queue_capacity: Option<usize>,

    /// Longest upstream line accepted, in bytes
    pub max_line_bytes: Option<usize>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Server settings
    pub server: ServerToml,

    /// Backend settings
    pub backend: BackendToml,

    /// Registry settings
    pub registry: RegistryToml,

    /// Stream settings
    pub stream: StreamToml,
}

// =============================================================================
// Unified Configuration
// =============================================================================

/// Complete relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Address the HTTP server listens on
    pub listen_addr: String,

    /// Ollama host
    pub backend_host: String,

    /// Ollama port
    pub backend_port: u16,

    /// Timeout for connecting to the backend
    pub connect_timeout: Duration,

    /// Idle timeout between reads of a backend response
    ///
    /// Generation may run for any length of time as long as the backend
    /// keeps producing.
    pub read_timeout: Duration,

    /// Registry retention settings
    pub registry: RegistryConfig,

    /// Multiplexer settings
    pub multiplexer: MultiplexerConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:11435".to_string(),
            backend_host: "localhost".to_string(),
            backend_port: 11434,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(600),
            registry: RegistryConfig::default(),
            multiplexer: MultiplexerConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check that the values can be used
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "registry.max_entries must be at least 1".to_string(),
            ));
        }
        if self.registry.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "registry.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.multiplexer.subscriber_queue_capacity < MIN_QUEUE_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "stream.subscriber_queue_capacity must be at least {MIN_QUEUE_CAPACITY}"
            )));
        }
        if self.multiplexer.max_line_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "stream.max_line_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-relay/relay.toml` or
/// `~/.config/chat-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values fail validation. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

fn load_with_env<F>(path: Option<PathBuf>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    if let Some(ref addr) = toml.server.listen_addr {
        config.listen_addr.clone_from(addr);
    }

    if let Some(ref host) = toml.backend.host {
        config.backend_host.clone_from(host);
    }
    if let Some(port) = toml.backend.port {
        config.backend_port = port;
    }
    if let Some(timeout) = toml.backend.connect_timeout_secs {
        config.connect_timeout = Duration::from_secs(timeout);
    }
    if let Some(timeout) = toml.backend.read_timeout_secs {
        config.read_timeout = Duration::from_secs(timeout);
    }

    if let Some(max) = toml.registry.max_entries {
        config.registry.max_entries = max;
    }
    if let Some(retention) = toml.registry.retention_secs {
        config.registry.retention = Duration::from_secs(retention);
    }
    if let Some(interval) = toml.registry.sweep_interval_secs {
        config.registry.sweep_interval = Duration::from_secs(interval);
    }

    if let Some(capacity) = toml.stream.subscriber_queue_capacity {
        config.multiplexer.subscriber_queue_capacity = capacity;
    }
    if let Some(limit) = toml.stream.max_line_bytes {
        config.multiplexer.max_line_bytes = limit;
    }
}

/// Apply environment variable overrides to the config
///
/// Values that do not parse are ignored.
fn apply_env_config<F>(config: &mut RelayConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
        value.and_then(|v| v.trim().parse().ok())
    }

    if let Some(addr) = env("RELAY_LISTEN_ADDR") {
        config.listen_addr = addr;
        config.source = ConfigSource::Env;
    }
    if let Some(host) = env("OLLAMA_HOST") {
        config.backend_host = host;
        config.source = ConfigSource::Env;
    }
    if let Some(port) = parsed::<u16>(env("OLLAMA_PORT")) {
        config.backend_port = port;
        config.source = ConfigSource::Env;
    }
    if let Some(max) = parsed::<usize>(env("RELAY_REGISTRY_MAX")) {
        config.registry.max_entries = max;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed::<u64>(env("RELAY_RETENTION_SECS")) {
        config.registry.retention = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed::<u64>(env("RELAY_SWEEP_INTERVAL_SECS")) {
        config.registry.sweep_interval = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(capacity) = parsed::<usize>(env("RELAY_QUEUE_CAPACITY")) {
        config.multiplexer.subscriber_queue_capacity = capacity;
        config.source = ConfigSource::Env;
    }
    if let Some(limit) = parsed::<usize>(env("RELAY_MAX_LINE_BYTES")) {
        config.multiplexer.max_line_bytes = limit;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub listen_addr: Option<String>,

    /// Backend host override
    pub backend_host: Option<String>,

    /// Backend port override
    pub backend_port: Option<u16>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_listen_addr(mut self, addr: String) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set backend host override
    #[must_use]
    pub fn with_backend_host(mut self, host: String) -> Self {
        self.backend_host = Some(host);
        self
    }

    /// Set backend port override
    #[must_use]
    pub fn with_backend_port(mut self, port: u16) -> Self {
        self.backend_port = Some(port);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.listen_addr.is_some() || self.backend_host.is_some() || self.backend_port.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref addr) = self.listen_addr {
            config.listen_addr.clone_from(addr);
        }
        if let Some(ref host) = self.backend_host {
            config.backend_host.clone_from(host);
        }
        if let Some(port) = self.backend_port {
            config.backend_port = port;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
