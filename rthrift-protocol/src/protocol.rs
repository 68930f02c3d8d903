//! Protocol façade: one codec bound to one transport, chosen per message.
//!
//! Before every incoming message header the façade re-resolves which codec
//! to use: the header transport says so explicitly, otherwise the first two
//! bytes are inspected when auto-detection is on. Replies are written with
//! whichever codec read the request.

use crate::binary::BinaryCodec;
use crate::channel::{BufferedChannel, ChannelBuffers};
use crate::codec::{Readable, Reader, Writer};
use crate::compact::{CompactCodec, CompactVersion, COMPACT_PROTOCOL_ID, VERSION_MASK};
use crate::error::{ProtocolError, Result};
use crate::exception::ApplicationException;
use crate::skip::{skip, DEFAULT_RECURSION_LIMIT};
use crate::transport::{HeaderTransport, Transport, TransportKind};
use crate::types::{
    FieldHeader, ListHeader, MapHeader, MessageHeader, MessageType, ProtocolId, SetHeader, TType,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Protocol and transport settings for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub transport: TransportKind,
    /// Protocol used for writing first and for reading when not detected.
    pub protocol: ProtocolId,
    /// Pick binary or compact from the first bytes of each message.
    pub auto_detect: bool,
    pub compact_version: CompactVersion,
    /// Reject binary messages without a version word.
    pub strict_read: bool,
    pub recursion_limit: usize,
    /// Maximum string/binary length; 0 means unlimited. Defaults to the
    /// maximum frame size.
    pub string_limit: usize,
    /// Maximum container element count; 0 means unlimited.
    pub container_limit: usize,
    pub max_frame_size: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            protocol: ProtocolId::Binary,
            auto_detect: true,
            compact_version: CompactVersion::default(),
            strict_read: false,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            string_limit: crate::DEFAULT_MAX_FRAME_SIZE as usize,
            container_limit: 0,
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ProtocolConfig {
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolId) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_auto_detect(mut self, auto_detect: bool) -> Self {
        self.auto_detect = auto_detect;
        self
    }

    pub fn with_compact_version(mut self, version: CompactVersion) -> Self {
        self.compact_version = version;
        self
    }

    pub fn with_strict_read(mut self, strict_read: bool) -> Self {
        self.strict_read = strict_read;
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_string_limit(mut self, limit: usize) -> Self {
        self.string_limit = limit;
        self
    }

    pub fn with_container_limit(mut self, limit: usize) -> Self {
        self.container_limit = limit;
        self
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }
}

/// The codec currently bound to a connection.
#[derive(Debug, Clone)]
pub enum ActiveCodec {
    Binary(BinaryCodec),
    Compact(CompactCodec),
}

impl ActiveCodec {
    pub fn for_protocol(id: ProtocolId, config: &ProtocolConfig) -> Result<Self> {
        match id {
            ProtocolId::Binary => Ok(ActiveCodec::Binary(BinaryCodec::new(
                config.strict_read,
                config.string_limit,
                config.container_limit,
            ))),
            ProtocolId::Compact => Ok(ActiveCodec::Compact(CompactCodec::new(
                config.compact_version,
                config.string_limit,
                config.container_limit,
            ))),
            other => Err(ProtocolError::UnsupportedProtocol(other)),
        }
    }

    pub fn protocol_id(&self) -> ProtocolId {
        match self {
            ActiveCodec::Binary(_) => ProtocolId::Binary,
            ActiveCodec::Compact(_) => ProtocolId::Compact,
        }
    }

    fn reset(&mut self) {
        match self {
            ActiveCodec::Binary(codec) => codec.reset(),
            ActiveCodec::Compact(codec) => codec.reset(),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match &mut $self.codec {
            ActiveCodec::Binary(codec) => codec.$method(&mut $self.channel $(, $arg)*),
            ActiveCodec::Compact(codec) => codec.$method(&mut $self.channel $(, $arg)*),
        }
    };
}

pub struct Protocol<S> {
    channel: BufferedChannel<Transport<S>>,
    codec: ActiveCodec,
    config: ProtocolConfig,
}

impl<S: Read + Write> Protocol<S> {
    pub fn new(stream: S, config: ProtocolConfig) -> Result<Self> {
        Self::with_buffers(stream, config, ChannelBuffers::new())
    }

    /// Builds a façade over previously allocated channel buffers.
    pub fn with_buffers(stream: S, config: ProtocolConfig, buffers: ChannelBuffers) -> Result<Self> {
        let codec = ActiveCodec::for_protocol(config.protocol, &config)?;
        let transport = Transport::new(config.transport, stream, config.max_frame_size);
        Ok(Self {
            channel: BufferedChannel::with_buffers(transport, buffers),
            codec,
            config,
        })
    }

    /// Returns the stream and the channel buffers for reuse.
    pub fn into_parts(self) -> (S, ChannelBuffers) {
        let (transport, buffers) = self.channel.into_parts();
        (transport.into_inner(), buffers)
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.codec.protocol_id()
    }

    /// Compact sub-version in use, if the compact codec is active.
    pub fn compact_version(&self) -> Option<CompactVersion> {
        match &self.codec {
            ActiveCodec::Compact(codec) => Some(codec.version()),
            ActiveCodec::Binary(_) => None,
        }
    }

    pub fn transport(&self) -> &Transport<S> {
        self.channel.get_ref()
    }

    pub fn transport_mut(&mut self) -> &mut Transport<S> {
        self.channel.get_mut()
    }

    pub fn header_transport(&self) -> Option<&HeaderTransport<S>> {
        self.channel.get_ref().header()
    }

    pub fn header_transport_mut(&mut self) -> Option<&mut HeaderTransport<S>> {
        self.channel.get_mut().header_mut()
    }

    pub fn get_ref(&self) -> &S {
        self.channel.get_ref().get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.channel.get_mut().get_mut()
    }

    /// Bytes read ahead from the stream but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.channel.buffered()
    }

    /// Makes `id` the active codec. Keeps the current codec when it already
    /// speaks `id`, so a negotiated compact sub-version survives.
    pub fn switch_to(&mut self, id: ProtocolId) -> Result<()> {
        if self.codec.protocol_id() == id {
            return Ok(());
        }
        self.codec = ActiveCodec::for_protocol(id, &self.config)?;
        debug!(protocol = %id, "switched protocol");
        Ok(())
    }

    /// Resolves the codec for the next incoming message.
    pub fn negotiate_read(&mut self) -> Result<()> {
        let id = if self.channel.get_ref().kind() == TransportKind::Header {
            // Loads the envelope, which carries the protocol id.
            self.channel.peek(1)?;
            match self.channel.get_ref().header() {
                Some(header) => header.protocol_id(),
                None => self.config.protocol,
            }
        } else if self.config.auto_detect {
            let first = self.channel.peek(2)?;
            if first[0] == COMPACT_PROTOCOL_ID {
                let version = first[1] & VERSION_MASK;
                if CompactVersion::from_wire(version).is_none() {
                    return Err(ProtocolError::BadVersion(format!(
                        "compact version {version}"
                    )));
                }
                ProtocolId::Compact
            } else {
                ProtocolId::Binary
            }
        } else {
            self.config.protocol
        };
        self.switch_to(id)
    }

    /// Returns to the configured protocol and drops all per-message state.
    pub fn reset(&mut self) -> Result<()> {
        self.codec = ActiveCodec::for_protocol(self.config.protocol, &self.config)?;
        self.channel.discard_write();
        self.channel.get_mut().reset();
        Ok(())
    }
}

impl<S: Read + Write> Reader for Protocol<S> {
    fn read_message_begin(&mut self) -> Result<MessageHeader> {
        self.negotiate_read()?;
        self.codec.reset();
        let header = dispatch!(self, read_message_begin)?;
        if header.kind == MessageType::Exception {
            let exception = ApplicationException::read(self)?;
            self.read_message_end()?;
            return Err(ProtocolError::Application(exception));
        }
        Ok(header)
    }

    fn read_message_end(&mut self) -> Result<()> {
        dispatch!(self, read_message_end)
    }

    fn read_struct_begin(&mut self) -> Result<()> {
        dispatch!(self, read_struct_begin)
    }

    fn read_struct_end(&mut self) -> Result<()> {
        dispatch!(self, read_struct_end)
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader> {
        dispatch!(self, read_field_begin)
    }

    fn read_field_end(&mut self) -> Result<()> {
        dispatch!(self, read_field_end)
    }

    fn read_map_begin(&mut self) -> Result<MapHeader> {
        dispatch!(self, read_map_begin)
    }

    fn read_map_end(&mut self) -> Result<()> {
        dispatch!(self, read_map_end)
    }

    fn read_list_begin(&mut self) -> Result<ListHeader> {
        dispatch!(self, read_list_begin)
    }

    fn read_list_end(&mut self) -> Result<()> {
        dispatch!(self, read_list_end)
    }

    fn read_set_begin(&mut self) -> Result<SetHeader> {
        dispatch!(self, read_set_begin)
    }

    fn read_set_end(&mut self) -> Result<()> {
        dispatch!(self, read_set_end)
    }

    fn read_bool(&mut self) -> Result<bool> {
        dispatch!(self, read_bool)
    }

    fn read_byte(&mut self) -> Result<i8> {
        dispatch!(self, read_byte)
    }

    fn read_i16(&mut self) -> Result<i16> {
        dispatch!(self, read_i16)
    }

    fn read_i32(&mut self) -> Result<i32> {
        dispatch!(self, read_i32)
    }

    fn read_i64(&mut self) -> Result<i64> {
        dispatch!(self, read_i64)
    }

    fn read_double(&mut self) -> Result<f64> {
        dispatch!(self, read_double)
    }

    fn read_float(&mut self) -> Result<f32> {
        dispatch!(self, read_float)
    }

    fn read_string(&mut self) -> Result<String> {
        dispatch!(self, read_string)
    }

    fn read_binary(&mut self) -> Result<Bytes> {
        dispatch!(self, read_binary)
    }

    fn skip(&mut self, ttype: TType) -> Result<()> {
        let depth = self.config.recursion_limit;
        skip(self, ttype, depth)
    }

    /// A compact bool field keeps its value in the field header, so its raw
    /// form is empty.
    fn read_raw(&mut self, ttype: TType) -> Result<Bytes> {
        let depth = self.config.recursion_limit;
        self.channel.start_capture();
        let result = skip(self, ttype, depth);
        let raw = self.channel.stop_capture();
        result.map(|()| raw)
    }
}

impl<S: Read + Write> Writer for Protocol<S> {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<()> {
        self.codec.reset();
        let protocol_id = self.codec.protocol_id();
        if let Some(transport) = self.channel.get_mut().header_mut() {
            transport.set_protocol_id(protocol_id);
            if header.kind.is_request() {
                transport.set_seq_id(header.seq_id as u32);
            }
        }
        dispatch!(self, write_message_begin, header)
    }

    fn write_message_end(&mut self) -> Result<()> {
        dispatch!(self, write_message_end)
    }

    fn write_struct_begin(&mut self, name: &str) -> Result<()> {
        dispatch!(self, write_struct_begin, name)
    }

    fn write_struct_end(&mut self) -> Result<()> {
        dispatch!(self, write_struct_end)
    }

    fn write_field_begin(&mut self, name: &str, ttype: TType, id: i16) -> Result<()> {
        dispatch!(self, write_field_begin, name, ttype, id)
    }

    fn write_field_end(&mut self) -> Result<()> {
        dispatch!(self, write_field_end)
    }

    fn write_field_stop(&mut self) -> Result<()> {
        dispatch!(self, write_field_stop)
    }

    fn write_map_begin(&mut self, header: MapHeader) -> Result<()> {
        dispatch!(self, write_map_begin, header)
    }

    fn write_map_end(&mut self) -> Result<()> {
        dispatch!(self, write_map_end)
    }

    fn write_list_begin(&mut self, header: ListHeader) -> Result<()> {
        dispatch!(self, write_list_begin, header)
    }

    fn write_list_end(&mut self) -> Result<()> {
        dispatch!(self, write_list_end)
    }

    fn write_set_begin(&mut self, header: SetHeader) -> Result<()> {
        dispatch!(self, write_set_begin, header)
    }

    fn write_set_end(&mut self) -> Result<()> {
        dispatch!(self, write_set_end)
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        dispatch!(self, write_bool, value)
    }

    fn write_byte(&mut self, value: i8) -> Result<()> {
        dispatch!(self, write_byte, value)
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        dispatch!(self, write_i16, value)
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        dispatch!(self, write_i32, value)
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        dispatch!(self, write_i64, value)
    }

    fn write_double(&mut self, value: f64) -> Result<()> {
        dispatch!(self, write_double, value)
    }

    fn write_float(&mut self, value: f32) -> Result<()> {
        dispatch!(self, write_float, value)
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        dispatch!(self, write_string, value)
    }

    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        dispatch!(self, write_binary, value)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.channel.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryStream;
    use crate::codec::Writable;
    use crate::exception::ApplicationExceptionKind;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct SearchRequest {
        query: String,
        page_number: i32,
        result_per_page: i32,
    }

    impl Writable for SearchRequest {
        fn write<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
            w.write_struct_begin("SearchRequest")?;
            w.write_field_begin("query", TType::String, 1)?;
            w.write_string(&self.query)?;
            w.write_field_end()?;
            w.write_field_begin("pageNumber", TType::I32, 2)?;
            w.write_i32(self.page_number)?;
            w.write_field_end()?;
            w.write_field_begin("resultPerPage", TType::I32, 3)?;
            w.write_i32(self.result_per_page)?;
            w.write_field_end()?;
            w.write_field_stop()?;
            w.write_struct_end()
        }
    }

    impl Readable for SearchRequest {
        fn read<R: Reader + ?Sized>(r: &mut R) -> Result<Self> {
            let mut out = SearchRequest::default();
            r.read_struct_begin()?;
            loop {
                let field = r.read_field_begin()?;
                if field.is_stop() {
                    break;
                }
                match (field.id, field.ttype) {
                    (1, TType::String) => out.query = r.read_string()?,
                    (2, TType::I32) => out.page_number = r.read_i32()?,
                    (3, TType::I32) => out.result_per_page = r.read_i32()?,
                    (_, ttype) => r.skip(ttype)?,
                }
                r.read_field_end()?;
            }
            r.read_struct_end()?;
            Ok(out)
        }
    }

    fn sample() -> SearchRequest {
        SearchRequest {
            query: "dummy query".to_string(),
            page_number: 2,
            result_per_page: 20,
        }
    }

    fn config(transport: TransportKind, protocol: ProtocolId) -> ProtocolConfig {
        ProtocolConfig::default()
            .with_transport(transport)
            .with_protocol(protocol)
    }

    fn write_call(
        config: ProtocolConfig,
        name: &str,
        seq_id: i32,
        body: &impl Writable,
    ) -> Vec<u8> {
        let mut proto = Protocol::new(MemoryStream::new(), config).unwrap();
        proto
            .write_message_begin(&MessageHeader::new(name, MessageType::Call, seq_id))
            .unwrap();
        body.write(&mut proto).unwrap();
        proto.write_message_end().unwrap();
        proto.flush().unwrap();
        proto.get_mut().take_output()
    }

    fn reader(config: ProtocolConfig, bytes: Vec<u8>) -> Protocol<MemoryStream> {
        Protocol::new(MemoryStream::with_input(bytes), config).unwrap()
    }

    #[test]
    fn test_search_over_compact() {
        let bytes = write_call(
            config(TransportKind::Framed, ProtocolId::Compact),
            "Search",
            1,
            &sample(),
        );

        let mut proto = reader(config(TransportKind::Framed, ProtocolId::Binary), bytes);
        let header = proto.read_message_begin().unwrap();
        assert_eq!(header, MessageHeader::new("Search", MessageType::Call, 1));
        assert_eq!(proto.protocol_id(), ProtocolId::Compact);
        assert_eq!(SearchRequest::read(&mut proto).unwrap(), sample());
        proto.read_message_end().unwrap();
    }

    #[test]
    fn test_auto_detect_per_message() {
        let mut bytes = write_call(config(TransportKind::Raw, ProtocolId::Binary), "a", 1, &sample());
        bytes.extend(write_call(config(TransportKind::Raw, ProtocolId::Compact), "b", 2, &sample()));

        let mut proto = reader(config(TransportKind::Raw, ProtocolId::Binary), bytes);
        assert_eq!(proto.read_message_begin().unwrap().name, "a");
        assert_eq!(proto.protocol_id(), ProtocolId::Binary);
        SearchRequest::read(&mut proto).unwrap();
        proto.read_message_end().unwrap();

        assert_eq!(proto.read_message_begin().unwrap().name, "b");
        assert_eq!(proto.protocol_id(), ProtocolId::Compact);
        assert_eq!(SearchRequest::read(&mut proto).unwrap(), sample());
    }

    #[test]
    fn test_detection_off_uses_configured_protocol() {
        let bytes = write_call(config(TransportKind::Raw, ProtocolId::Compact), "a", 1, &sample());
        let mut proto = reader(
            config(TransportKind::Raw, ProtocolId::Binary).with_auto_detect(false),
            bytes,
        );
        assert!(proto.read_message_begin().is_err());
    }

    #[test]
    fn test_detection_rejects_unknown_compact_version() {
        let bytes = vec![0x82, 0x27, 0x01, 0x00];
        let mut proto = reader(config(TransportKind::Raw, ProtocolId::Binary), bytes);
        assert!(matches!(
            proto.read_message_begin(),
            Err(ProtocolError::BadVersion(_))
        ));
    }

    #[test]
    fn test_unsupported_protocol() {
        let result = Protocol::new(
            MemoryStream::new(),
            config(TransportKind::Raw, ProtocolId::Json),
        );
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedProtocol(ProtocolId::Json))
        ));
    }

    #[test]
    fn test_header_transport_negotiates_and_echoes() {
        let client_config = config(TransportKind::Header, ProtocolId::Compact);
        let bytes = write_call(client_config, "Search", 9, &sample());

        let mut server = reader(
            config(TransportKind::Header, ProtocolId::Binary).with_auto_detect(false),
            bytes,
        );
        let header = server.read_message_begin().unwrap();
        assert_eq!(header.seq_id, 9);
        assert_eq!(server.protocol_id(), ProtocolId::Compact);
        assert_eq!(server.header_transport().unwrap().seq_id(), 9);
        SearchRequest::read(&mut server).unwrap();
        server.read_message_end().unwrap();

        server
            .write_message_begin(&MessageHeader::new("Search", MessageType::Reply, 9))
            .unwrap();
        crate::codec::Void.write(&mut server).unwrap();
        server.write_message_end().unwrap();
        server.flush().unwrap();

        let reply = server.get_mut().take_output();
        let mut client = reader(config(TransportKind::Header, ProtocolId::Binary), reply);
        let header = client.read_message_begin().unwrap();
        assert_eq!(header, MessageHeader::new("Search", MessageType::Reply, 9));
        assert_eq!(client.protocol_id(), ProtocolId::Compact);
        assert_eq!(client.header_transport().unwrap().seq_id(), 9);
    }

    #[test]
    fn test_compact_version_is_kept_for_reply() {
        let bytes = write_call(
            config(TransportKind::Framed, ProtocolId::Compact)
                .with_compact_version(CompactVersion::BigEndian),
            "f",
            1,
            &crate::codec::Void,
        );

        let mut server = reader(config(TransportKind::Framed, ProtocolId::Binary), bytes);
        server.read_message_begin().unwrap();
        assert_eq!(server.compact_version(), Some(CompactVersion::BigEndian));
        crate::codec::Void::read(&mut server).unwrap();
        server.read_message_end().unwrap();

        server
            .write_message_begin(&MessageHeader::new("f", MessageType::Reply, 1))
            .unwrap();
        server.write_double(1.5).unwrap();
        server.flush().unwrap();

        let out = server.get_mut().take_output();
        // length prefix, 0x82, kind/version byte
        assert_eq!(out[5], (2 << 5) | 2);
        assert_eq!(&out[out.len() - 8..], &1.5f64.to_be_bytes());
    }

    #[test]
    fn test_exception_message_becomes_error() {
        let exception = ApplicationException::new(ApplicationExceptionKind::UnknownMethod, "nope");
        let mut proto = Protocol::new(
            MemoryStream::new(),
            config(TransportKind::Framed, ProtocolId::Binary),
        )
        .unwrap();
        proto
            .write_message_begin(&MessageHeader::new("x", MessageType::Exception, 3))
            .unwrap();
        exception.write(&mut proto).unwrap();
        proto.write_message_end().unwrap();
        proto.flush().unwrap();
        let bytes = proto.get_mut().take_output();

        let mut proto = reader(config(TransportKind::Framed, ProtocolId::Binary), bytes);
        match proto.read_message_begin() {
            Err(ProtocolError::Application(received)) => assert_eq!(received, exception),
            other => panic!("expected application exception, got {other:?}"),
        }
        assert_eq!(proto.buffered(), 0);
    }

    fn nested_then_sibling(w: &mut impl Writer) {
        w.write_struct_begin("outer").unwrap();
        w.write_field_begin("nested", TType::Struct, 1).unwrap();
        w.write_struct_begin("inner").unwrap();
        w.write_field_begin("list", TType::List, 4).unwrap();
        w.write_list_begin(ListHeader::new(TType::Map, 2)).unwrap();
        for i in 0..2 {
            w.write_map_begin(MapHeader::new(TType::String, TType::Bool, 1))
                .unwrap();
            w.write_string(&format!("k{i}")).unwrap();
            w.write_bool(i % 2 == 0).unwrap();
            w.write_map_end().unwrap();
        }
        w.write_list_end().unwrap();
        w.write_field_end().unwrap();
        w.write_field_begin("flag", TType::Bool, 5).unwrap();
        w.write_bool(true).unwrap();
        w.write_field_end().unwrap();
        w.write_field_stop().unwrap();
        w.write_struct_end().unwrap();
        w.write_field_end().unwrap();
        w.write_field_begin("sibling", TType::I64, 2).unwrap();
        w.write_i64(-77).unwrap();
        w.write_field_end().unwrap();
        w.write_field_stop().unwrap();
        w.write_struct_end().unwrap();
    }

    #[test]
    fn test_skip_lands_on_sibling_field() {
        for protocol in [ProtocolId::Binary, ProtocolId::Compact] {
            let cfg = config(TransportKind::Raw, protocol).with_auto_detect(false);
            let mut proto = Protocol::new(MemoryStream::new(), cfg.clone()).unwrap();
            nested_then_sibling(&mut proto);
            proto.flush().unwrap();
            let bytes = proto.get_mut().take_output();

            let mut proto = reader(cfg, bytes);
            proto.read_struct_begin().unwrap();
            let nested = proto.read_field_begin().unwrap();
            assert_eq!(nested, FieldHeader::new(TType::Struct, 1));
            proto.skip(nested.ttype).unwrap();
            proto.read_field_end().unwrap();

            let sibling = proto.read_field_begin().unwrap();
            assert_eq!(sibling, FieldHeader::new(TType::I64, 2), "{protocol}");
            assert_eq!(proto.read_i64().unwrap(), -77);
            assert!(proto.read_field_begin().unwrap().is_stop());
            proto.read_struct_end().unwrap();
        }
    }

    #[test]
    fn test_skip_depth_limit() {
        let cfg = config(TransportKind::Raw, ProtocolId::Binary)
            .with_auto_detect(false)
            .with_recursion_limit(2);
        let mut proto = Protocol::new(MemoryStream::new(), cfg.clone()).unwrap();
        nested_then_sibling(&mut proto);
        proto.flush().unwrap();
        let bytes = proto.get_mut().take_output();

        // outer struct -> inner struct -> list -> map exceeds two levels
        let mut proto = reader(cfg, bytes);
        assert!(matches!(
            proto.skip(TType::Struct),
            Err(ProtocolError::DepthLimit)
        ));
    }

    #[test]
    fn test_read_raw_returns_encoded_value() {
        let cfg = config(TransportKind::Raw, ProtocolId::Binary).with_auto_detect(false);
        let mut proto = Protocol::new(MemoryStream::new(), cfg.clone()).unwrap();
        sample().write(&mut proto).unwrap();
        proto.write_i32(99).unwrap();
        proto.flush().unwrap();
        let bytes = proto.get_mut().take_output();

        let mut encoded = Protocol::new(MemoryStream::new(), cfg.clone()).unwrap();
        sample().write(&mut encoded).unwrap();
        encoded.flush().unwrap();
        let expected = encoded.get_mut().take_output();

        let mut proto = reader(cfg, bytes);
        let raw = proto.read_raw(TType::Struct).unwrap();
        assert_eq!(raw.as_ref(), expected.as_slice());
        assert_eq!(proto.read_i32().unwrap(), 99);
    }

    #[test]
    fn test_default_string_limit_is_frame_size() {
        let mut proto = reader(
            config(TransportKind::Raw, ProtocolId::Binary),
            vec![0x3f, 0xff, 0xff, 0xff, b'a'],
        );
        match proto.read_string() {
            Err(ProtocolError::SizeLimit { size, max }) => {
                assert_eq!(size, 0x3fff_ffff);
                assert_eq!(max, u64::from(crate::DEFAULT_MAX_FRAME_SIZE));
            }
            other => panic!("expected SizeLimit, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_restores_configured_codec() {
        let bytes = write_call(config(TransportKind::Raw, ProtocolId::Compact), "a", 1, &sample());
        let mut proto = reader(config(TransportKind::Raw, ProtocolId::Binary), bytes);
        proto.read_message_begin().unwrap();
        assert_eq!(proto.protocol_id(), ProtocolId::Compact);
        proto.reset().unwrap();
        assert_eq!(proto.protocol_id(), ProtocolId::Binary);
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Scalars {
        flag: bool,
        byte: i8,
        small: i16,
        medium: i32,
        large: i64,
        double: f64,
        float: f32,
        text: String,
        blob: Vec<u8>,
        items: Vec<i64>,
    }

    fn scalars() -> impl Strategy<Value = Scalars> {
        (
            any::<bool>(),
            any::<i8>(),
            any::<i16>(),
            any::<i32>(),
            any::<i64>(),
            any::<f64>().prop_filter("NaN never compares equal", |d| !d.is_nan()),
            any::<f32>().prop_filter("NaN never compares equal", |f| !f.is_nan()),
            ".{0,40}",
            proptest::collection::vec(any::<u8>(), 0..64),
            proptest::collection::vec(any::<i64>(), 0..20),
        )
            .prop_map(
                |(flag, byte, small, medium, large, double, float, text, blob, items)| Scalars {
                    flag,
                    byte,
                    small,
                    medium,
                    large,
                    double,
                    float,
                    text,
                    blob,
                    items,
                },
            )
    }

    impl Writable for Scalars {
        fn write<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
            w.write_struct_begin("Scalars")?;
            w.write_field_begin("flag", TType::Bool, 1)?;
            w.write_bool(self.flag)?;
            w.write_field_begin("byte", TType::Byte, 2)?;
            w.write_byte(self.byte)?;
            w.write_field_begin("small", TType::I16, 3)?;
            w.write_i16(self.small)?;
            w.write_field_begin("medium", TType::I32, 4)?;
            w.write_i32(self.medium)?;
            w.write_field_begin("large", TType::I64, 40)?;
            w.write_i64(self.large)?;
            w.write_field_begin("double", TType::Double, 41)?;
            w.write_double(self.double)?;
            w.write_field_begin("float", TType::Float, 42)?;
            w.write_float(self.float)?;
            w.write_field_begin("text", TType::String, 7)?;
            w.write_string(&self.text)?;
            w.write_field_begin("blob", TType::String, 8)?;
            w.write_binary(&self.blob)?;
            w.write_field_begin("items", TType::List, 9)?;
            w.write_list_begin(ListHeader::new(TType::I64, self.items.len()))?;
            for item in &self.items {
                w.write_i64(*item)?;
            }
            w.write_list_end()?;
            w.write_field_stop()?;
            w.write_struct_end()
        }
    }

    impl Readable for Scalars {
        fn read<R: Reader + ?Sized>(r: &mut R) -> Result<Self> {
            r.read_struct_begin()?;
            let next = |r: &mut R| r.read_field_begin().map(|f| f.id);
            assert_eq!(next(r)?, 1);
            let flag = r.read_bool()?;
            assert_eq!(next(r)?, 2);
            let byte = r.read_byte()?;
            assert_eq!(next(r)?, 3);
            let small = r.read_i16()?;
            assert_eq!(next(r)?, 4);
            let medium = r.read_i32()?;
            assert_eq!(next(r)?, 40);
            let large = r.read_i64()?;
            assert_eq!(next(r)?, 41);
            let double = r.read_double()?;
            assert_eq!(next(r)?, 42);
            let float = r.read_float()?;
            assert_eq!(next(r)?, 7);
            let text = r.read_string()?;
            assert_eq!(next(r)?, 8);
            let blob = r.read_binary()?.to_vec();
            assert_eq!(next(r)?, 9);
            let header = r.read_list_begin()?;
            let mut items = Vec::with_capacity(header.size);
            for _ in 0..header.size {
                items.push(r.read_i64()?);
            }
            r.read_list_end()?;
            assert!(r.read_field_begin()?.is_stop());
            r.read_struct_end()?;
            Ok(Scalars {
                flag,
                byte,
                small,
                medium,
                large,
                double,
                float,
                text,
                blob,
                items,
            })
        }
    }

    proptest! {
        #[test]
        fn prop_scalars_round_trip(
            value in scalars(),
            compact in any::<bool>(),
            big_endian in any::<bool>(),
        ) {
            let protocol = if compact { ProtocolId::Compact } else { ProtocolId::Binary };
            let version = if big_endian { CompactVersion::BigEndian } else { CompactVersion::LittleEndian };
            let cfg = config(TransportKind::Framed, protocol).with_compact_version(version);

            let bytes = write_call(cfg.clone(), "roundtrip", 5, &value);
            let mut proto = reader(cfg, bytes);
            let header = proto.read_message_begin().unwrap();
            prop_assert_eq!(header.seq_id, 5);
            prop_assert_eq!(Scalars::read(&mut proto).unwrap(), value);
        }
    }
}
