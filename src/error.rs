//! Error types for the meshmate library.

use thiserror::Error;

/// The main error type for meshmate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error from the underlying link.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The device answered a command with an error response.
    #[error("device error{}", code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    Device { code: Option<u8> },

    /// A reply arrived but did not have the expected shape.
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// Command timed out waiting for its response.
    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The operation was cancelled by the caller or by a disconnect.
    #[error("cancelled")]
    Cancelled,

    /// The connect-time handshake did not complete.
    #[error("handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// Session is not connected.
    #[error("not connected")]
    NotConnected,

    /// The device's contact table has no free slots.
    #[error("contact table full")]
    ContactTableFull,

    /// No such contact on the device or in the store.
    #[error("contact not found")]
    ContactNotFound,

    /// A subscriber fell too far behind and was dropped.
    #[error("subscriber overflow")]
    SubscriberOverflow,

    /// Invalid public key format.
    #[error("invalid public key: {reason}")]
    InvalidPublicKey { reason: String },

    /// A value failed validation before it reached the wire.
    #[error("bad argument: {reason}")]
    BadArgument { reason: String },

    /// Persistence layer failure.
    #[error("store error: {reason}")]
    Store { reason: String },
}

/// Result type alias for meshmate operations.
pub type Result<T> = std::result::Result<T, Error>;
