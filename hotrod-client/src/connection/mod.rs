//! Connections to Hot Rod servers.
//!
//! A [`Connection`] multiplexes concurrent requests over one socket. The
//! [`ConnectionManager`] keeps one connection per server and follows the
//! server set published by the routing table.

mod connection;
mod decoder;
mod holder;
mod manager;
mod pending;

pub use connection::{Connection, ConnectionId, PutStream};
pub use holder::CodecHolder;
pub use manager::{ConnectionEvent, ConnectionManager};
pub use pending::StreamedValue;
