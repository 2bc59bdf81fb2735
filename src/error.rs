//! Error types for the SSR engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during tunnel operations.
///
/// The taxonomy is split along subsystem lines so callers can react per
/// failure class: crypto construction errors abort session setup, framing
/// errors force a reconnect, connection errors may be retried with bounded
/// attempts. Mapping cases to user-facing messages is the host's job.
#[derive(Error, Debug)]
pub enum Error {
    /// A cipher parameter failed validation (empty password, short key/IV)
    #[error("invalid cipher parameter: {0}")]
    InvalidParameter(String),

    /// The requested cipher method is not implemented
    #[error("unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    /// A cryptographic primitive failed mid-operation
    #[error("cipher operation failed: {0}")]
    OperationFailed(String),

    /// A cipher operation exceeded its configured time budget
    #[error("cipher operation timed out")]
    OperationTimeout,

    /// Obfuscation framing was absent, truncated, or corrupted
    #[error("invalid obfuscation framing: {0}")]
    InvalidProtocol(String),

    /// The requested obfuscation mode is not implemented
    #[error("unsupported obfuscation mode: {0}")]
    UnsupportedObfs(String),

    /// Upstream connection establishment failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation exceeded its deadline
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The endpoint could not be parsed or resolved
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The session configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The server address is empty or malformed
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// A port number is out of the usable range
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    /// The concurrent session limit was reached
    #[error("too many connections")]
    TooManyConnections,

    /// No network route is currently available
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The remote server reported an error
    #[error("server error: {0}")]
    ServerError(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Catch-all for failures with no better classification
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Create a new invalid-parameter error.
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Create a new operation-failed error.
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Error::OperationFailed(msg.into())
    }

    /// Create a new framing error.
    pub fn invalid_protocol(msg: impl Into<String>) -> Self {
        Error::InvalidProtocol(msg.into())
    }

    /// Create a new connection error.
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Error::ConnectionFailed(msg.into())
    }

    /// Check if this error may clear on retry (bounded by `max_retries`).
    ///
    /// Everything else is either a configuration problem or protocol
    /// corruption, and retrying locally would only repeat the failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NetworkUnavailable
                | Error::Network(_)
        )
    }

    /// Check if this error means the peer stream can no longer be trusted.
    ///
    /// Framing corruption and mid-stream cipher failures leave the running
    /// keystream in an unknown position; the session must be torn down and
    /// re-established, never repaired in place.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            Error::InvalidProtocol(_) | Error::OperationFailed(_) | Error::OperationTimeout
        )
    }
}
