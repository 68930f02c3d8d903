//! Header transport: an envelope carrying protocol id, sequence id and
//! key/value headers around each message.
//!
//! ```text
//! +-----------+-------+-------+--------+-------------+---------+---------+
//! | length    | magic | flags | seq id | header size | header  | payload |
//! | u32       | 0x0FFF| u16   | u32    | u16 (words) | size*4  |         |
//! +-----------+-------+-------+--------+-------------+---------+---------+
//! ```
//!
//! The header block holds varints: protocol id, transform count, then info
//! blocks (`kind`, `count`, `count` key/value string pairs), zero padded to a
//! multiple of four bytes.

use super::read_frame_len;
use crate::error::TransportError;
use crate::types::ProtocolId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use tracing::trace;

pub const HEADER_MAGIC: u16 = 0x0fff;
pub const IDENTITY_HEADER: &str = "identity";
pub const ID_VERSION_HEADER: &str = "id_version";
pub const ID_VERSION: &str = "1";

const INFO_PADDING: u32 = 0;
const INFO_KEYVALUE: u32 = 1;
const INFO_PKEYVALUE: u32 = 2;

/// Fixed part of the envelope after the length: magic, flags, seq id, size.
const ENVELOPE_FIXED: usize = 2 + 2 + 4 + 2;
const MAX_HEADER_WORDS: usize = u16::MAX as usize;

pub struct HeaderTransport<S> {
    inner: S,
    max_frame_size: u32,

    protocol_id: ProtocolId,
    seq_id: u32,
    flags: u16,

    identity: Option<String>,
    peer_identity: Option<String>,

    write_headers: BTreeMap<String, String>,
    write_persistent: BTreeMap<String, String>,
    read_headers: BTreeMap<String, String>,
    read_persistent: BTreeMap<String, String>,

    payload: Bytes,
    wbuf: BytesMut,
    frame: BytesMut,
}

impl<S> HeaderTransport<S> {
    pub fn new(inner: S, max_frame_size: u32) -> Self {
        Self {
            inner,
            max_frame_size,
            protocol_id: ProtocolId::Binary,
            seq_id: 0,
            flags: 0,
            identity: None,
            peer_identity: None,
            write_headers: BTreeMap::new(),
            write_persistent: BTreeMap::new(),
            read_headers: BTreeMap::new(),
            read_persistent: BTreeMap::new(),
            payload: Bytes::new(),
            wbuf: BytesMut::new(),
            frame: BytesMut::new(),
        }
    }

    /// Protocol id of the last envelope read, or the one set for writing.
    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn set_protocol_id(&mut self, id: ProtocolId) {
        self.protocol_id = id;
    }

    pub fn seq_id(&self) -> u32 {
        self.seq_id
    }

    pub fn set_seq_id(&mut self, seq_id: u32) {
        self.seq_id = seq_id;
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    /// Sets a header sent with the next frame only.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.write_headers.insert(key.into(), value.into());
    }

    /// Sets a header sent with every frame.
    pub fn set_persistent_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.write_persistent.insert(key.into(), value.into());
    }

    pub fn clear_headers(&mut self) {
        self.write_headers.clear();
    }

    pub fn clear_persistent_headers(&mut self) {
        self.write_persistent.clear();
    }

    pub fn write_headers(&self) -> &BTreeMap<String, String> {
        &self.write_headers
    }

    pub fn write_persistent_headers(&self) -> &BTreeMap<String, String> {
        &self.write_persistent
    }

    /// Per-call headers of the last frame read.
    pub fn read_headers(&self) -> &BTreeMap<String, String> {
        &self.read_headers
    }

    /// Persistent headers accumulated over every frame read.
    pub fn read_persistent_headers(&self) -> &BTreeMap<String, String> {
        &self.read_persistent
    }

    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn peer_identity(&self) -> Option<&str> {
        self.peer_identity.as_deref()
    }

    /// Clears per-call state; persistent headers and identity are kept.
    pub fn reset(&mut self) {
        self.seq_id = 0;
        self.flags = 0;
        self.write_headers.clear();
        self.read_headers.clear();
        self.peer_identity = None;
        self.payload.clear();
        self.wbuf.clear();
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn encode_header(&self) -> BytesMut {
        let mut header = BytesMut::new();
        put_varint(&mut header, self.protocol_id.to_wire());
        put_varint(&mut header, 0); // transforms

        let mut per_call: Vec<(&str, &str)> = self
            .write_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if let Some(identity) = self.identity.as_deref() {
            per_call.push((IDENTITY_HEADER, identity));
            per_call.push((ID_VERSION_HEADER, ID_VERSION));
        }
        if !per_call.is_empty() {
            put_info(&mut header, INFO_KEYVALUE, per_call.into_iter());
        }
        if !self.write_persistent.is_empty() {
            let persistent = self
                .write_persistent
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()));
            put_info(&mut header, INFO_PKEYVALUE, persistent);
        }

        while header.len() % 4 != 0 {
            header.put_u8(0);
        }
        header
    }

    fn decode_header(&mut self, mut header: Bytes) -> Result<(), TransportError> {
        self.protocol_id = ProtocolId::from_wire(get_varint(&mut header)?);

        let transforms = get_varint(&mut header)?;
        if transforms > 0 {
            let first = get_varint(&mut header)?;
            return Err(TransportError::UnsupportedTransform(first));
        }

        self.read_headers.clear();
        while header.has_remaining() {
            match get_varint(&mut header)? {
                INFO_PADDING => break,
                kind @ (INFO_KEYVALUE | INFO_PKEYVALUE) => {
                    let count = get_varint(&mut header)?;
                    for _ in 0..count {
                        let key = get_string(&mut header)?;
                        let value = get_string(&mut header)?;
                        if kind == INFO_KEYVALUE {
                            self.read_headers.insert(key, value);
                        } else {
                            self.read_persistent.insert(key, value);
                        }
                    }
                }
                // Unknown info kinds cannot be skipped without their layout.
                _ => break,
            }
        }

        self.peer_identity = self.read_headers.get(IDENTITY_HEADER).cloned();
        Ok(())
    }
}

impl<S: Read> HeaderTransport<S> {
    /// Loads the next envelope. Returns `false` on a clean end of stream.
    fn read_frame(&mut self) -> io::Result<bool> {
        let Some(len) = read_frame_len(&mut self.inner)? else {
            return Ok(false);
        };
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: u64::from(len),
                max: self.max_frame_size,
            }
            .into());
        }
        let len = len as usize;
        if len < ENVELOPE_FIXED {
            return Err(TransportError::CorruptHeader("envelope shorter than its fixed part").into());
        }

        let mut frame = BytesMut::zeroed(len);
        self.inner.read_exact(&mut frame)?;
        let mut frame = frame.freeze();

        let magic = frame.get_u16();
        if magic != HEADER_MAGIC {
            return Err(TransportError::BadHeaderMagic(magic).into());
        }
        self.flags = frame.get_u16();
        self.seq_id = frame.get_u32();
        let header_len = frame.get_u16() as usize * 4;
        if header_len > frame.remaining() {
            return Err(TransportError::CorruptHeader("header size exceeds envelope").into());
        }

        let header = frame.split_to(header_len);
        self.decode_header(header)?;
        trace!(
            protocol = %self.protocol_id,
            seq_id = self.seq_id,
            payload = frame.len(),
            "read header envelope"
        );
        self.payload = frame;
        Ok(true)
    }
}

impl<S: Read> Read for HeaderTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.payload.is_empty() {
            if !self.read_frame()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.payload.len());
        buf[..n].copy_from_slice(&self.payload[..n]);
        self.payload.advance(n);
        Ok(n)
    }
}

impl<S: Write> Write for HeaderTransport<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wbuf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.wbuf.is_empty() {
            return self.inner.flush();
        }

        let header = self.encode_header();
        let words = header.len() / 4;
        if words > MAX_HEADER_WORDS {
            self.wbuf.clear();
            return Err(TransportError::CorruptHeader("headers do not fit the envelope").into());
        }
        let len = (ENVELOPE_FIXED + header.len() + self.wbuf.len()) as u64;
        if len > u64::from(self.max_frame_size) {
            self.wbuf.clear();
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            }
            .into());
        }

        self.frame.clear();
        self.frame.reserve(4 + len as usize);
        self.frame.put_u32(len as u32);
        self.frame.put_u16(HEADER_MAGIC);
        self.frame.put_u16(self.flags);
        self.frame.put_u32(self.seq_id);
        self.frame.put_u16(words as u16);
        self.frame.extend_from_slice(&header);
        self.frame.extend_from_slice(&self.wbuf);
        self.wbuf.clear();
        self.write_headers.clear();

        self.inner.write_all(&self.frame)?;
        self.inner.flush()
    }
}

fn put_varint(buf: &mut BytesMut, mut n: u32) {
    while n >= 0x80 {
        buf.put_u8((n as u8) | 0x80);
        n >>= 7;
    }
    buf.put_u8(n as u8);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_varint(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn put_info<'a>(buf: &mut BytesMut, kind: u32, pairs: impl ExactSizeIterator<Item = (&'a str, &'a str)>) {
    put_varint(buf, kind);
    put_varint(buf, pairs.len() as u32);
    for (key, value) in pairs {
        put_string(buf, key);
        put_string(buf, value);
    }
}

fn get_varint(buf: &mut Bytes) -> Result<u32, TransportError> {
    let mut result = 0u32;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(TransportError::CorruptHeader("truncated varint"));
        }
        let byte = buf.get_u8();
        result |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 28 {
            return Err(TransportError::CorruptHeader("varint too long"));
        }
    }
}

fn get_string(buf: &mut Bytes) -> Result<String, TransportError> {
    let len = get_varint(buf)? as usize;
    if len > buf.remaining() {
        return Err(TransportError::CorruptHeader("truncated header string"));
    }
    String::from_utf8(buf.split_to(len).to_vec())
        .map_err(|_| TransportError::CorruptHeader("header string is not UTF-8"))
}
