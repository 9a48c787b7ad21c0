//! Error types for the fan-out engine.
//!
//! [`SubcastError`] is the primary error type returned by engine operations.
//! It keeps the surface small enough for exhaustive matching at the protocol
//! dispatch boundary, where each variant maps to a client-visible outcome.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the push-delivery transport.
///
/// `Gone` is a terminal signal that the peer no longer exists; callers treat
/// it as a cleanup trigger, not a failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target connection no longer exists at the transport level.
    #[error("connection gone")]
    Gone,

    /// Any other delivery failure.
    #[error("transport failure: {0}")]
    Failed(String),
}

impl TransportError {
    /// Whether this error means the peer is permanently gone.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone)
    }
}

/// Errors that can occur in the subscription fan-out engine.
#[derive(Debug, Error)]
pub enum SubcastError {
    /// No live connection record was found after hydration retries.
    #[error("connection {0} not found")]
    ConnectionNotFound(String),

    /// Client sent a message that could not be parsed into an operation.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    /// Client sent a well-formed message of an unrecognized or unexpected type.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An application hook rejected the connection.
    #[error("prohibited connection: {0}")]
    Prohibited(String),

    /// Durable store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Push transport failure (other than "gone", which is handled in place).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Executor failure while running an operation.
    #[error("executor error: {0}")]
    Executor(String),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A bounded operation (usually an application hook) ran out of time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl SubcastError {
    /// Whether this error is a protocol violation attributable to the client.
    ///
    /// Violations map to a 401-equivalent response at the dispatch boundary;
    /// everything else maps to a 500-equivalent.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::MalformedOperation(_) | Self::InvalidOperation(_) | Self::Prohibited(_)
        )
    }
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, SubcastError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
