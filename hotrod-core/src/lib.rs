//! Core types and protocol engine for Hot Rod clients.

#![warn(missing_docs)]

pub mod error;
pub mod protocol;

pub use error::{HotRodError, Result};
pub use protocol::{Codec, DecodeProgress, ProtocolVersion, RequestHeader, Status};
