//! Transports that sit between the buffered channel and the socket.
//!
//! - **Raw**: bytes go straight to the stream.
//! - **Framed**: each flush becomes one length-prefixed frame.
//! - **Header**: each flush becomes one envelope carrying the protocol id,
//!   sequence id and key/value headers alongside the payload.

mod framed;
mod header;

pub use framed::FramedTransport;
pub use header::{HeaderTransport, HEADER_MAGIC, ID_VERSION, IDENTITY_HEADER, ID_VERSION_HEADER};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Which transport wraps a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Raw,
    #[default]
    Framed,
    Header,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Raw => write!(f, "raw"),
            TransportKind::Framed => write!(f, "framed"),
            TransportKind::Header => write!(f, "header"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "buffered" => Ok(TransportKind::Raw),
            "framed" => Ok(TransportKind::Framed),
            "header" => Ok(TransportKind::Header),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// A stream wrapped in one of the supported transports.
pub enum Transport<S> {
    Raw(S),
    Framed(FramedTransport<S>),
    Header(HeaderTransport<S>),
}

impl<S> Transport<S> {
    pub fn new(kind: TransportKind, inner: S, max_frame_size: u32) -> Self {
        match kind {
            TransportKind::Raw => Transport::Raw(inner),
            TransportKind::Framed => Transport::Framed(FramedTransport::new(inner, max_frame_size)),
            TransportKind::Header => Transport::Header(HeaderTransport::new(inner, max_frame_size)),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Raw(_) => TransportKind::Raw,
            Transport::Framed(_) => TransportKind::Framed,
            Transport::Header(_) => TransportKind::Header,
        }
    }

    pub fn header(&self) -> Option<&HeaderTransport<S>> {
        match self {
            Transport::Header(header) => Some(header),
            _ => None,
        }
    }

    pub fn header_mut(&mut self) -> Option<&mut HeaderTransport<S>> {
        match self {
            Transport::Header(header) => Some(header),
            _ => None,
        }
    }

    /// Drops per-frame state; the stream itself is untouched.
    pub fn reset(&mut self) {
        match self {
            Transport::Raw(_) => {}
            Transport::Framed(framed) => framed.reset(),
            Transport::Header(header) => header.reset(),
        }
    }

    pub fn get_ref(&self) -> &S {
        match self {
            Transport::Raw(inner) => inner,
            Transport::Framed(framed) => framed.get_ref(),
            Transport::Header(header) => header.get_ref(),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        match self {
            Transport::Raw(inner) => inner,
            Transport::Framed(framed) => framed.get_mut(),
            Transport::Header(header) => header.get_mut(),
        }
    }

    pub fn into_inner(self) -> S {
        match self {
            Transport::Raw(inner) => inner,
            Transport::Framed(framed) => framed.into_inner(),
            Transport::Header(header) => header.into_inner(),
        }
    }
}

impl<S: Read> Read for Transport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Raw(inner) => inner.read(buf),
            Transport::Framed(framed) => framed.read(buf),
            Transport::Header(header) => header.read(buf),
        }
    }
}

impl<S: Write> Write for Transport<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Raw(inner) => inner.write(buf),
            Transport::Framed(framed) => framed.write(buf),
            Transport::Header(header) => header.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Raw(inner) => inner.flush(),
            Transport::Framed(framed) => framed.flush(),
            Transport::Header(header) => header.flush(),
        }
    }
}

/// Reads a 4-byte big-endian frame length.
///
/// Returns `None` on a clean end of stream before the first byte.
pub(crate) fn read_frame_len<S: Read>(inner: &mut S) -> io::Result<Option<u32>> {
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < len.len() {
        match inner.read(&mut len[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame length",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(u32::from_be_bytes(len)))
}
