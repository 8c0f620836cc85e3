//! Error types for simpleservice.

use thiserror::Error;

use crate::protocol::{HEADER_SIZE, SERVICE_SIZE, TOKEN_SIZE};

/// Main error type for all simpleservice operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (payload content).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Incoming packet does not start with the protocol magic.
    #[error("Incoming packet has invalid magic")]
    InvalidMagic,

    /// Header buffer shorter than the fixed wire width.
    #[error("Truncated header: {0} of {size} bytes", size = HEADER_SIZE)]
    TruncatedHeader(usize),

    /// Incoming packet carries an opcode outside the protocol set.
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// Payload length field is negative or exceeds the configured maximum.
    #[error("Payload length {0} out of range")]
    PayloadLength(i64),

    /// Authentication token exceeds its fixed wire width.
    #[error("The token cannot be longer than {max} characters", max = TOKEN_SIZE)]
    TokenTooLong(usize),

    /// Service name exceeds its fixed wire width.
    #[error("The service cannot be longer than {max} characters", max = SERVICE_SIZE)]
    ServiceNameTooLong(usize),

    /// Token or service name contains non-ASCII characters.
    #[error("The {0} must be ASCII")]
    NotAscii(&'static str),

    /// Service name collides with a reserved control service.
    #[error("The service name {0:?} is reserved for protocol control")]
    ReservedService(String),

    /// A handler is already bound under this name.
    #[error("A service named {0:?} is already bound")]
    AlreadyBound(String),

    /// No handler is bound under this name.
    #[error("No service named {0:?} is bound")]
    NotBound(String),

    /// The connection is no longer usable.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using ServiceError.
pub type Result<T> = std::result::Result<T, ServiceError>;
