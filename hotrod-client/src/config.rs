//! Client configuration types and builders.

use std::net::SocketAddr;
use std::time::Duration;

use hotrod_core::protocol::{ClientIntelligence, ProtocolVersion};
use hotrod_core::HotRodError;

/// Default Hot Rod server port.
pub const DEFAULT_PORT: u16 = 11222;
/// Default connection timeout.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
/// Default time to wait for a response.
const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
/// Default streaming chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;
/// Largest accepted streaming chunk size.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
/// Default number of streaming chunks written concurrently.
pub const DEFAULT_CHUNKS_IN_FLIGHT: usize = 2;
/// Default per-connection event channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for HotRodError {
    fn from(err: ConfigError) -> Self {
        HotRodError::Configuration(err.message)
    }
}

fn default_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))
}

/// Network configuration for server connections.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    addresses: Vec<SocketAddr>,
    connection_timeout: Duration,
    socket_timeout: Duration,
    tcp_nodelay: bool,
}

impl NetworkConfig {
    /// Returns the configured server addresses.
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// Returns the connection timeout duration.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Returns how long a request waits for its response.
    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    /// Returns whether Nagle's algorithm is disabled on new sockets.
    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            addresses: vec![default_address()],
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            tcp_nodelay: true,
        }
    }
}

/// Builder for `NetworkConfig`.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigBuilder {
    addresses: Vec<SocketAddr>,
    connection_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    tcp_nodelay: Option<bool>,
}

impl NetworkConfigBuilder {
    /// Creates a new network configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a server address.
    pub fn add_address(mut self, address: SocketAddr) -> Self {
        self.addresses.push(address);
        self
    }

    /// Sets the server addresses, replacing any previously configured.
    pub fn addresses(mut self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }

    /// Sets the connection timeout duration.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets how long a request waits for its response.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Enables or disables `TCP_NODELAY`.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = Some(enabled);
        self
    }

    /// Builds the network configuration.
    ///
    /// Returns an error if a timeout is zero.
    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        let connection_timeout = self.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        if connection_timeout.is_zero() {
            return Err(ConfigError::new("connection_timeout must be greater than zero"));
        }
        let socket_timeout = self.socket_timeout.unwrap_or(DEFAULT_SOCKET_TIMEOUT);
        if socket_timeout.is_zero() {
            return Err(ConfigError::new("socket_timeout must be greater than zero"));
        }

        let addresses = if self.addresses.is_empty() {
            vec![default_address()]
        } else {
            self.addresses
        };

        Ok(NetworkConfig {
            addresses,
            connection_timeout,
            socket_timeout,
            tcp_nodelay: self.tcp_nodelay.unwrap_or(true),
        })
    }
}

/// Chunked streaming configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingConfig {
    chunk_size: usize,
    chunks_in_flight: usize,
}

impl StreamingConfig {
    /// Returns the payload size of one written chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns how many chunks may be written concurrently.
    pub fn chunks_in_flight(&self) -> usize {
        self.chunks_in_flight
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_in_flight: DEFAULT_CHUNKS_IN_FLIGHT,
        }
    }
}

/// Builder for `StreamingConfig`.
#[derive(Debug, Clone, Default)]
pub struct StreamingConfigBuilder {
    chunk_size: Option<usize>,
    chunks_in_flight: Option<usize>,
}

impl StreamingConfigBuilder {
    /// Creates a new streaming configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the payload size of one written chunk.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// Sets how many chunks may be written concurrently.
    pub fn chunks_in_flight(mut self, count: usize) -> Self {
        self.chunks_in_flight = Some(count);
        self
    }

    /// Builds the streaming configuration.
    ///
    /// Returns an error if the chunk size is zero or above 16 MiB, or if no
    /// chunk may be in flight.
    pub fn build(self) -> Result<StreamingConfig, ConfigError> {
        let chunk_size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(ConfigError::new("chunk_size must be greater than zero"));
        }
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::new(format!(
                "chunk_size must not exceed {} bytes",
                MAX_CHUNK_SIZE
            )));
        }

        let chunks_in_flight = self.chunks_in_flight.unwrap_or(DEFAULT_CHUNKS_IN_FLIGHT);
        if chunks_in_flight == 0 {
            return Err(ConfigError::new("chunks_in_flight must be at least 1"));
        }

        Ok(StreamingConfig {
            chunk_size,
            chunks_in_flight,
        })
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    network: NetworkConfig,
    streaming: StreamingConfig,
    max_protocol_version: ProtocolVersion,
    intelligence: ClientIntelligence,
    event_capacity: usize,
    default_cache: String,
}

impl ClientConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns the network configuration.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Returns the streaming configuration.
    pub fn streaming(&self) -> &StreamingConfig {
        &self.streaming
    }

    /// Returns the highest protocol version the client will speak.
    pub fn max_protocol_version(&self) -> ProtocolVersion {
        self.max_protocol_version
    }

    /// Returns the declared client intelligence.
    pub fn intelligence(&self) -> ClientIntelligence {
        self.intelligence
    }

    /// Returns the capacity of each connection's event channel.
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    /// Returns the cache used when none is named. Empty selects the
    /// server's default cache.
    pub fn default_cache(&self) -> &str {
        &self.default_cache
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            streaming: StreamingConfig::default(),
            max_protocol_version: ProtocolVersion::LATEST,
            intelligence: ClientIntelligence::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_cache: String::new(),
        }
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    network: NetworkConfigBuilder,
    streaming: StreamingConfigBuilder,
    max_protocol_version: Option<ProtocolVersion>,
    intelligence: Option<ClientIntelligence>,
    event_capacity: Option<usize>,
    default_cache: Option<String>,
}

impl ClientConfigBuilder {
    /// Creates a new client configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures network settings using a builder function.
    pub fn network<F>(mut self, f: F) -> Self
    where
        F: FnOnce(NetworkConfigBuilder) -> NetworkConfigBuilder,
    {
        self.network = f(self.network);
        self
    }

    /// Configures streaming settings using a builder function.
    pub fn streaming<F>(mut self, f: F) -> Self
    where
        F: FnOnce(StreamingConfigBuilder) -> StreamingConfigBuilder,
    {
        self.streaming = f(self.streaming);
        self
    }

    /// Adds a server address.
    pub fn add_address(mut self, address: SocketAddr) -> Self {
        self.network = self.network.add_address(address);
        self
    }

    /// Sets the server addresses.
    pub fn addresses(mut self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.network = self.network.addresses(addresses);
        self
    }

    /// Sets the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.connection_timeout(timeout);
        self
    }

    /// Sets how long a request waits for its response.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.socket_timeout(timeout);
        self
    }

    /// Sets the highest protocol version the client will speak.
    pub fn max_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.max_protocol_version = Some(version);
        self
    }

    /// Sets the declared client intelligence.
    pub fn intelligence(mut self, intelligence: ClientIntelligence) -> Self {
        self.intelligence = Some(intelligence);
        self
    }

    /// Sets the capacity of each connection's event channel.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Sets the cache used when none is named.
    pub fn default_cache(mut self, name: impl Into<String>) -> Self {
        self.default_cache = Some(name.into());
        self
    }

    /// Builds the client configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let event_capacity = self.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY);
        if event_capacity == 0 {
            return Err(ConfigError::new("event_capacity must be greater than zero"));
        }

        Ok(ClientConfig {
            network: self.network.build()?,
            streaming: self.streaming.build()?,
            max_protocol_version: self.max_protocol_version.unwrap_or(ProtocolVersion::LATEST),
            intelligence: self.intelligence.unwrap_or_default(),
            event_capacity,
            default_cache: self.default_cache.unwrap_or_default(),
        })
    }
}
