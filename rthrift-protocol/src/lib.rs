//! # rthrift-protocol
//!
//! Thrift wire protocols for rthrift.
//!
//! This crate provides:
//! - Binary and compact codecs over a buffered byte channel
//! - Raw, framed and header transports
//! - A protocol façade that picks the codec per message
//! - Structural skip and raw value capture
//! - The `Reader`/`Writer` contract implemented by generated types

pub mod binary;
pub mod channel;
pub mod codec;
pub mod compact;
pub mod error;
pub mod exception;
pub mod protocol;
pub mod skip;
pub mod transport;
pub mod types;

pub use binary::BinaryCodec;
pub use channel::{BufferedChannel, ChannelBuffers, MemoryStream};
pub use codec::{Readable, Reader, Void, Writable, Writer};
pub use compact::{CompactCodec, CompactVersion};
pub use error::{ProtocolError, TransportError};
pub use exception::{ApplicationException, ApplicationExceptionKind};
pub use protocol::{ActiveCodec, Protocol, ProtocolConfig};
pub use skip::DEFAULT_RECURSION_LIMIT;
pub use transport::{FramedTransport, HeaderTransport, Transport, TransportKind};
pub use types::{
    FieldHeader, ListHeader, MapHeader, MessageHeader, MessageType, ProtocolId, SetHeader, TType,
};

/// Default maximum frame size for framed and header transports (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Default port for rthrift servers.
pub const DEFAULT_PORT: u16 = 9090;
