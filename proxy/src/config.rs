//! Proxy configuration.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use protocol_memcache::MAX_VALUE_SIZE;

/// Main proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Client-facing listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Remote (authoritative) cache tier.
    pub l2: BackendConfig,

    /// Local cache tier. Defaults to the L2 endpoint for single-tier
    /// deployments.
    #[serde(default)]
    pub l1: Option<BackendConfig>,

    /// Chunked storage configuration.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive"));
        }
        if self.chunking.chunk_size > MAX_VALUE_SIZE {
            return Err(ConfigError::Invalid("chunk_size exceeds the item limit"));
        }
        Ok(())
    }

    /// Endpoint for the L1 tier; single-tier deployments point both slots
    /// at the same backend.
    pub fn l1_address(&self) -> SocketAddr {
        self.l1.as_ref().map(|b| b.address).unwrap_or(self.l2.address)
    }
}

/// Client-facing listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ListenerConfig {
    /// TCP listener on all interfaces.
    Tcp {
        #[serde(default = "ListenerConfig::default_port")]
        port: u16,
    },
    /// UNIX-domain socket listener.
    Unix { path: PathBuf },
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::Tcp {
            port: Self::default_port(),
        }
    }
}

impl ListenerConfig {
    fn default_port() -> u16 {
        11211
    }
}

/// One backend tier endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend memcached address.
    pub address: SocketAddr,
}

/// Chunked storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    /// Payload bytes per stored chunk, excluding the token prefix. Part of
    /// the persisted format: values written with one size remain readable
    /// after a change because the size is recorded per item.
    #[serde(default = "ChunkingConfig::default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: Self::default_chunk_size(),
        }
    }
}

impl ChunkingConfig {
    fn default_chunk_size() -> usize {
        1024
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Log output format. Unknown names are rejected when the config is
/// parsed, not at subscriber setup.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output (default).
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
    /// Condensed single-line output.
    Compact,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [l2]
            address = "127.0.0.1:11212"
            "#,
        )
        .unwrap();
        assert!(matches!(config.listener, ListenerConfig::Tcp { port: 11211 }));
        assert_eq!(config.chunking.chunk_size, 1024);
        assert_eq!(config.l1_address(), config.l2.address);
    }

    #[test]
    fn two_tier_config() {
        let config: Config = toml::from_str(
            r#"
            [listener]
            type = "tcp"
            port = 11300

            [l1]
            address = "127.0.0.1:11213"

            [l2]
            address = "10.0.0.1:11212"

            [chunking]
            chunk_size = 4096
            "#,
        )
        .unwrap();
        assert!(matches!(config.listener, ListenerConfig::Tcp { port: 11300 }));
        assert_eq!(config.l1_address(), "127.0.0.1:11213".parse().unwrap());
        assert_eq!(config.chunking.chunk_size, 4096);
    }

    #[test]
    fn unix_listener_config() {
        let config: Config = toml::from_str(
            r#"
            [listener]
            type = "unix"
            path = "/tmp/memproxy.sock"

            [l2]
            address = "127.0.0.1:11212"
            "#,
        )
        .unwrap();
        assert!(matches!(config.listener, ListenerConfig::Unix { .. }));
    }

    #[test]
    fn logging_format_variants() {
        let config: Config = toml::from_str(
            r#"
            [l2]
            address = "127.0.0.1:11212"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert!(matches!(config.logging.format, LogFormat::Json));

        let bad: Result<Config, _> = toml::from_str(
            r#"
            [l2]
            address = "127.0.0.1:11212"

            [logging]
            format = "yaml"
            "#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let config: Config = toml::from_str(
            r#"
            [l2]
            address = "127.0.0.1:11212"

            [chunking]
            chunk_size = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
