//! Error types for Hot Rod operations.

use std::io;
use thiserror::Error;

use crate::protocol::Status;

/// The main error type for Hot Rod operations.
#[derive(Debug, Error)]
pub enum HotRodError {
    /// Not enough bytes are buffered to finish decoding.
    ///
    /// This is never surfaced to callers; the decode loop waits for more
    /// data and retries from the start of the frame.
    #[error("incomplete data")]
    Incomplete,

    /// The response did not start with the response magic byte.
    #[error("invalid magic number: expected {expected:#04x}, got {actual:#04x}")]
    InvalidMagic {
        /// The magic byte the decoder expected.
        expected: u8,
        /// The magic byte found on the wire.
        actual: u8,
    },

    /// A variable-length integer ran past its maximum encodable length.
    #[error("malformed variable-length integer: more than {max_bytes} bytes")]
    MalformedVarint {
        /// The maximum number of bytes for the integer width being read.
        max_bytes: usize,
    },

    /// The response did not match the request (message id or opcode).
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A request was built for an opcode missing from the opcode table.
    #[error("unknown operation code: {0:#04x}")]
    UnknownOpcode(u8),

    /// The server answered with an error status.
    #[error("server error (message id {message_id}, status {status:#04x}): {message}")]
    Server {
        /// The message id of the failed request.
        message_id: u64,
        /// The status byte reported by the server.
        status: u8,
        /// The diagnostic text sent by the server.
        message: String,
    },

    /// A cluster member was suspected while the server executed the request.
    #[error("node suspected (message id {message_id}, status {status:#04x}): {message}")]
    NodeSuspected {
        /// The message id of the failed request.
        message_id: u64,
        /// The status byte reported by the server.
        status: u8,
        /// The diagnostic text sent by the server.
        message: String,
    },

    /// The target cache or server was stopping or not yet started.
    #[error("illegal lifecycle state on {address} (message id {message_id}, status {status:#04x}): {message}")]
    IllegalLifecycleState {
        /// The message id of the failed request.
        message_id: u64,
        /// The status byte reported by the server.
        status: u8,
        /// The diagnostic text sent by the server.
        message: String,
        /// The address of the server that reported the error.
        address: String,
    },

    /// A status byte outside the protocol's status table.
    #[error("unknown status: {0:#04x}")]
    UnknownStatus(u8),

    /// An event arrived for a listener this client did not register.
    #[error("unexpected listener id: {0}")]
    UnexpectedListenerId(String),

    /// An event opcode this codec cannot decode.
    #[error("unknown event: {0:#04x}")]
    UnknownEvent(u8),

    /// The negotiated protocol version does not support a feature.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A latched failure on a chunked stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// Connection-related errors (network failures, disconnections).
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation timeout errors.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Configuration errors (invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HotRodError {
    /// Returns true if this error only means more bytes are needed.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, HotRodError::Incomplete)
    }

    /// Returns true if the connection that produced this error can no longer
    /// be trusted and must be closed and replaced.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            HotRodError::InvalidMagic { .. }
            | HotRodError::MalformedVarint { .. }
            | HotRodError::InvalidResponse(_)
            | HotRodError::UnknownStatus(_)
            | HotRodError::UnknownEvent(_)
            | HotRodError::Connection(_)
            | HotRodError::Io(_) => true,
            HotRodError::Server { status, .. } => Status::from_code(*status)
                .map(|s| s.invalidates_connection())
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Returns true if the operation may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HotRodError::NodeSuspected { .. })
    }

    /// Returns the message id carried by a server-reported error.
    pub fn message_id(&self) -> Option<u64> {
        match self {
            HotRodError::Server { message_id, .. }
            | HotRodError::NodeSuspected { message_id, .. }
            | HotRodError::IllegalLifecycleState { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }

    /// Returns the status byte carried by a server-reported error.
    pub fn status(&self) -> Option<u8> {
        match self {
            HotRodError::Server { status, .. }
            | HotRodError::NodeSuspected { status, .. }
            | HotRodError::IllegalLifecycleState { status, .. } => Some(*status),
            HotRodError::UnknownStatus(status) => Some(*status),
            _ => None,
        }
    }
}

/// A specialized `Result` type for Hot Rod operations.
pub type Result<T> = std::result::Result<T, HotRodError>;
