//! Protocol and transport error types.

use crate::exception::ApplicationException;
use crate::types::ProtocolId;
use std::io;
use thiserror::Error;

/// Errors raised by the framing layers (framed and header transports).
///
/// These travel through `std::io::Read`/`Write` wrapped in an `io::Error` of
/// kind `InvalidData` and are recovered by `ProtocolError::from`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("invalid header magic: {0:#06x}")]
    BadHeaderMagic(u16),

    #[error("unsupported header transform: {0}")]
    UnsupportedTransform(u32),

    #[error("corrupt header envelope: {0}")]
    CorruptHeader(&'static str),
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Errors that can occur while encoding or decoding a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("bad protocol version: {0}")]
    BadVersion(String),

    #[error("unsupported protocol: {0:?}")]
    UnsupportedProtocol(ProtocolId),

    #[error("size limit exceeded: {size} (max {max})")]
    SizeLimit { size: u64, max: u64 },

    #[error("negative size: {0}")]
    NegativeSize(i64),

    #[error("maximum skip depth exceeded")]
    DepthLimit,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("application exception: {0}")]
    Application(ApplicationException),
}

impl ProtocolError {
    /// Returns whether the error is a clean end of stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// Returns whether the error means the remote end has gone away.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// Returns whether the error is a timeout on the underlying socket.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        if let Some(transport) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<TransportError>())
        {
            return ProtocolError::Transport(transport.clone());
        }
        ProtocolError::Io(err)
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        ProtocolError::InvalidUtf8
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
