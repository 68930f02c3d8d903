//! Server error types.

use crate::config::ConfigError;
use rthrift_protocol::ProtocolError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Whether the error only means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::Protocol(e) => e.is_eof() || e.is_peer_closed(),
            ServerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Whether the error is an expired idle read.
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, ServerError::Protocol(e) if e.is_timeout())
    }
}
