//! Client error types.

use rthrift_protocol::{ApplicationException, MessageType, ProtocolError};
use std::net::SocketAddr;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("sequence id mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: i32, actual: i32 },

    #[error("wrong method name: expected {expected}, got {actual}")]
    WrongMethodName { expected: String, actual: String },

    #[error("unexpected message type: {0:?}")]
    InvalidMessageType(MessageType),

    #[error("application exception: {0}")]
    Application(ApplicationException),

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("too many connections to {0}")]
    TooManyConnections(SocketAddr),

    #[error("request timeout")]
    Timeout,

    #[error("call cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("call task failed: {0}")]
    TaskFailed(String),

    #[error("connection pool is closed")]
    PoolClosed,
}

impl ClientError {
    /// Returns whether this error is retryable.
    ///
    /// Only a peer close noticed before the request reached the wire is
    /// safe to retry; anything later may have been processed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::PeerClosed)
    }

    /// Returns whether the connection is still usable after this error.
    pub fn keeps_connection(&self) -> bool {
        matches!(self, ClientError::Application(_))
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Application(exception) => ClientError::Application(exception),
            err if err.is_timeout() => ClientError::Timeout,
            err => ClientError::Protocol(err),
        }
    }
}
