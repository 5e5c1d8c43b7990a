//! Declarative configuration loading from YAML, TOML, and environment variables.
//!
//! File configuration is deserialized into serde mirror structs and then
//! converted into [`ClientConfig`](crate::config::ClientConfig) through the
//! builder API, so the same validation applies to every source.
//!
//! # Supported Formats
//!
//! - **YAML** (requires `config-file` feature): `ClientConfig::from_yaml("hotrod-client.yaml")`
//! - **TOML** (requires `config-file` feature): `ClientConfig::from_toml("hotrod-client.toml")`
//! - **Environment Variables** (always available): `ClientConfig::from_env()`
//!
//! # Example YAML
//!
//! ```yaml
//! protocol-version: "3.1"
//! intelligence: hash-distribution-aware
//! default-cache: books
//! event-capacity: 4096
//! network:
//!   addresses:
//!     - "10.0.0.1:11222"
//!     - "10.0.0.2:11222"
//!   connection-timeout-ms: 10000
//!   socket-timeout-ms: 30000
//!   tcp-nodelay: true
//! streaming:
//!   chunk-size: 16384
//!   chunks-in-flight: 4
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use hotrod_core::protocol::{ClientIntelligence, ProtocolVersion};
use serde::{Deserialize, Serialize};

use crate::config::{ClientConfig, ClientConfigBuilder, ConfigError};

/// Top-level file-based configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    /// Highest protocol version, as `"major.minor"`.
    pub protocol_version: Option<String>,
    /// Client intelligence: `basic`, `topology-aware` or
    /// `hash-distribution-aware`.
    pub intelligence: Option<String>,
    /// Cache used when none is named.
    pub default_cache: Option<String>,
    /// Capacity of each connection's event channel.
    pub event_capacity: Option<usize>,
    /// Network configuration.
    pub network: Option<FileNetworkConfig>,
    /// Chunked streaming configuration.
    pub streaming: Option<FileStreamingConfig>,
}

/// File-based network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileNetworkConfig {
    /// Server addresses.
    pub addresses: Option<Vec<String>>,
    /// Connection timeout in milliseconds.
    pub connection_timeout_ms: Option<u64>,
    /// Response timeout in milliseconds.
    pub socket_timeout_ms: Option<u64>,
    /// Enable TCP_NODELAY.
    pub tcp_nodelay: Option<bool>,
}

/// File-based streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileStreamingConfig {
    /// Chunk payload size in bytes.
    pub chunk_size: Option<usize>,
    /// Chunks written concurrently.
    pub chunks_in_flight: Option<usize>,
}

impl TryFrom<FileConfig> for ClientConfig {
    type Error = ConfigError;

    fn try_from(fc: FileConfig) -> Result<Self, Self::Error> {
        let mut builder = ClientConfigBuilder::new();

        if let Some(version) = fc.protocol_version {
            let version = version
                .parse::<ProtocolVersion>()
                .map_err(|e| ConfigError::new(format!("protocol-version: {e}")))?;
            builder = builder.max_protocol_version(version);
        }

        if let Some(intelligence) = fc.intelligence {
            let intelligence = intelligence
                .parse::<ClientIntelligence>()
                .map_err(|e| ConfigError::new(format!("intelligence: {e}")))?;
            builder = builder.intelligence(intelligence);
        }

        if let Some(cache) = fc.default_cache {
            builder = builder.default_cache(cache);
        }

        if let Some(capacity) = fc.event_capacity {
            builder = builder.event_capacity(capacity);
        }

        if let Some(net) = fc.network {
            if let Some(addrs) = net.addresses {
                let parsed: Result<Vec<SocketAddr>, _> = addrs
                    .iter()
                    .map(|a| {
                        a.parse::<SocketAddr>()
                            .map_err(|e| ConfigError::new(format!("invalid address '{a}': {e}")))
                    })
                    .collect();
                builder = builder.addresses(parsed?);
            }
            if let Some(ms) = net.connection_timeout_ms {
                builder = builder.connection_timeout(Duration::from_millis(ms));
            }
            if let Some(ms) = net.socket_timeout_ms {
                builder = builder.socket_timeout(Duration::from_millis(ms));
            }
            if let Some(nodelay) = net.tcp_nodelay {
                builder = builder.network(|n| n.tcp_nodelay(nodelay));
            }
        }

        if let Some(streaming) = fc.streaming {
            builder = builder.streaming(|mut s| {
                if let Some(size) = streaming.chunk_size {
                    s = s.chunk_size(size);
                }
                if let Some(count) = streaming.chunks_in_flight {
                    s = s.chunks_in_flight(count);
                }
                s
            });
        }

        builder.build()
    }
}

impl FileConfig {
    /// Overlays `HOTROD_*` values returned by `lookup` onto this config.
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("HOTROD_PROTOCOL_VERSION") {
            self.protocol_version = Some(val);
        }

        if let Some(val) = lookup("HOTROD_INTELLIGENCE") {
            self.intelligence = Some(val);
        }

        if let Some(val) = lookup("HOTROD_DEFAULT_CACHE") {
            self.default_cache = Some(val);
        }

        if let Some(n) = lookup("HOTROD_EVENT_CAPACITY").and_then(|v| v.parse().ok()) {
            self.event_capacity = Some(n);
        }

        if let Some(val) = lookup("HOTROD_ADDRESSES") {
            self.network.get_or_insert_with(Default::default).addresses =
                Some(val.split(',').map(|s| s.trim().to_string()).collect());
        }

        if let Some(ms) = lookup("HOTROD_CONNECTION_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.network
                .get_or_insert_with(Default::default)
                .connection_timeout_ms = Some(ms);
        }

        if let Some(ms) = lookup("HOTROD_SOCKET_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.network
                .get_or_insert_with(Default::default)
                .socket_timeout_ms = Some(ms);
        }

        if let Some(val) = lookup("HOTROD_TCP_NODELAY") {
            self.network.get_or_insert_with(Default::default).tcp_nodelay =
                Some(val.eq_ignore_ascii_case("true"));
        }

        if let Some(n) = lookup("HOTROD_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.streaming.get_or_insert_with(Default::default).chunk_size = Some(n);
        }

        if let Some(n) = lookup("HOTROD_CHUNKS_IN_FLIGHT").and_then(|v| v.parse().ok()) {
            self.streaming
                .get_or_insert_with(Default::default)
                .chunks_in_flight = Some(n);
        }
    }
}

impl ClientConfig {
    /// Loads configuration from a YAML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_yaml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read YAML config file: {e}")))?;
        let file_config: FileConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::new(format!("failed to parse YAML config: {e}")))?;
        file_config.try_into()
    }

    /// Loads configuration from a TOML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read TOML config file: {e}")))?;
        let file_config: FileConfig = toml_crate::from_str(&content)
            .map_err(|e| ConfigError::new(format!("failed to parse TOML config: {e}")))?;
        file_config.try_into()
    }

    /// Loads configuration from environment variables.
    ///
    /// Supported variables:
    /// - `HOTROD_PROTOCOL_VERSION`: highest protocol version, e.g. `3.1`
    /// - `HOTROD_INTELLIGENCE`: `basic`, `topology-aware` or `hash-distribution-aware`
    /// - `HOTROD_DEFAULT_CACHE`: cache used when none is named
    /// - `HOTROD_EVENT_CAPACITY`: event channel capacity
    /// - `HOTROD_ADDRESSES`: comma-separated list of server addresses
    /// - `HOTROD_CONNECTION_TIMEOUT_MS`: connection timeout in milliseconds
    /// - `HOTROD_SOCKET_TIMEOUT_MS`: response timeout in milliseconds
    /// - `HOTROD_TCP_NODELAY`: `true` or `false`
    /// - `HOTROD_CHUNK_SIZE`: streaming chunk size in bytes
    /// - `HOTROD_CHUNKS_IN_FLIGHT`: streaming chunks written concurrently
    ///
    /// Unset variables fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut file_config = FileConfig::default();
        file_config.apply_env(|key| std::env::var(key).ok());
        file_config.try_into()
    }
}

/// Loads a configuration file, choosing the format by extension.
///
/// Supports `.yaml`, `.yml`, and `.toml` extensions.
/// Requires the `config-file` feature.
#[cfg(feature = "config-file")]
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> Result<ClientConfig, ConfigError> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => ClientConfig::from_yaml(path),
        Some("toml") => ClientConfig::from_toml(path),
        Some(ext) => Err(ConfigError::new(format!(
            "unsupported config file extension: .{ext} (expected .yaml, .yml, or .toml)"
        ))),
        None => Err(ConfigError::new(
            "config file has no extension; expected .yaml, .yml, or .toml",
        )),
    }
}
