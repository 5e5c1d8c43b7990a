//! Async client engine for the [Hot Rod](https://infinispan.org/docs/stable/titles/hotrod_java/hotrod_java.html)
//! binary protocol.
//!
//! This crate layers the Tokio runtime pieces on top of [`hotrod_core`]'s
//! versioned codec: multiplexed connections with a single decode loop per
//! socket, a per-cache routing table fed by server-pushed topology updates,
//! client listener dispatch and chunked streaming of large values.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hotrod_client::protocol::wire::write_array;
//! use hotrod_client::protocol::{OpCode, Status};
//! use hotrod_client::{ClientConfig, ConnectionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .add_address("127.0.0.1:11222".parse()?)
//!         .build()?;
//!     let manager = ConnectionManager::new(config);
//!     manager.start().await?;
//!
//!     let connection = manager.connection_for(b"books", None).await?;
//!     let header = connection.request(OpCode::Get, b"books");
//!     let value = connection
//!         .execute(
//!             header,
//!             |_, buf| {
//!                 write_array(buf, b"isbn-0001");
//!                 Ok(())
//!             },
//!             |_, status, reader| {
//!                 if status == Status::KeyDoesNotExist {
//!                     Ok(None)
//!                 } else {
//!                     Ok(Some(reader.read_bytes_owned()?))
//!                 }
//!             },
//!         )
//!         .await?;
//!     println!("{:?}", value);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use [`ClientConfig::builder()`](ClientConfig::builder), or load a YAML
//! or TOML file with `load_config` (needs the `config-file` feature).
//! `HOTROD_*` environment variables are read by
//! [`ClientConfig::from_env`].
//!
//! # Feature Flags
//!
//! | Flag | Purpose |
//! |------|---------|
//! | `config-file` | YAML and TOML configuration files |

#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod config_file;
pub mod connection;
pub mod listener;
pub mod stream;

pub use cluster::{CacheTopology, RoutingTable, TopologyEvent};
pub use config::{
    ClientConfig, ClientConfigBuilder, ConfigError, NetworkConfig, NetworkConfigBuilder,
    StreamingConfig, StreamingConfigBuilder,
};
pub use config_file::FileConfig;
#[cfg(feature = "config-file")]
pub use config_file::load_config;
pub use connection::{
    CodecHolder, Connection, ConnectionEvent, ConnectionId, ConnectionManager, PutStream,
    StreamedValue,
};
pub use listener::{ListenerHandle, ListenerId, ListenerRegistry, ListenerStats};
pub use stream::{ChunkSink, ChunkSource, ChunkedReader, ChunkedWriter, ReceiverSource};

pub use hotrod_core::protocol;
pub use hotrod_core::{HotRodError, Result};
