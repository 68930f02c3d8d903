//! Compact protocol: zigzag varints, field-id deltas and packed headers.
//!
//! Message header layout:
//!
//! ```text
//! +----------+------------------------+----------------+-----------------+
//! | 0x82     | kind << 5 | version    | seq id (varint)| name (string)   |
//! | 1 byte   | 1 byte                 | 1-5 bytes      | varint len+data |
//! +----------+------------------------+----------------+-----------------+
//! ```
//!
//! Two sub-versions exist and differ only in the byte order of doubles;
//! the one seen on an incoming message is kept for the reply.

use crate::channel::BufferedChannel;
use crate::error::{ProtocolError, Result};
use crate::types::{FieldHeader, ListHeader, MapHeader, MessageHeader, MessageType, TType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// First byte of every compact message.
pub const COMPACT_PROTOCOL_ID: u8 = 0x82;
pub const VERSION_MASK: u8 = 0x1f;
const TYPE_MASK: u8 = 0xe0;
const TYPE_SHIFT: u8 = 5;
const TYPE_BITS: u8 = 0x07;

const CT_STOP: u8 = 0x00;
const CT_BOOLEAN_TRUE: u8 = 0x01;
const CT_BOOLEAN_FALSE: u8 = 0x02;
const CT_BYTE: u8 = 0x03;
const CT_I16: u8 = 0x04;
const CT_I32: u8 = 0x05;
const CT_I64: u8 = 0x06;
const CT_DOUBLE: u8 = 0x07;
const CT_BINARY: u8 = 0x08;
const CT_LIST: u8 = 0x09;
const CT_SET: u8 = 0x0a;
const CT_MAP: u8 = 0x0b;
const CT_STRUCT: u8 = 0x0c;
const CT_FLOAT: u8 = 0x0d;

/// Compact sub-version; selects the byte order of doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactVersion {
    /// Version 1: doubles are little-endian.
    #[default]
    LittleEndian,
    /// Version 2: doubles are big-endian.
    BigEndian,
}

impl CompactVersion {
    pub fn from_wire(version: u8) -> Option<Self> {
        match version {
            1 => Some(CompactVersion::LittleEndian),
            2 => Some(CompactVersion::BigEndian),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            CompactVersion::LittleEndian => 1,
            CompactVersion::BigEndian => 2,
        }
    }
}

fn compact_type(ttype: TType) -> Result<u8> {
    let ct = match ttype {
        TType::Stop => CT_STOP,
        TType::Bool => CT_BOOLEAN_TRUE,
        TType::Byte => CT_BYTE,
        TType::I16 => CT_I16,
        TType::I32 => CT_I32,
        TType::I64 => CT_I64,
        TType::Double => CT_DOUBLE,
        TType::String => CT_BINARY,
        TType::List => CT_LIST,
        TType::Set => CT_SET,
        TType::Map => CT_MAP,
        TType::Struct => CT_STRUCT,
        TType::Float => CT_FLOAT,
        TType::Void => {
            return Err(ProtocolError::InvalidData(
                "void has no compact encoding".to_string(),
            ))
        }
    };
    Ok(ct)
}

fn ttype_from_compact(ct: u8) -> Result<TType> {
    let ttype = match ct {
        CT_STOP => TType::Stop,
        CT_BOOLEAN_TRUE | CT_BOOLEAN_FALSE => TType::Bool,
        CT_BYTE => TType::Byte,
        CT_I16 => TType::I16,
        CT_I32 => TType::I32,
        CT_I64 => TType::I64,
        CT_DOUBLE => TType::Double,
        CT_BINARY => TType::String,
        CT_LIST => TType::List,
        CT_SET => TType::Set,
        CT_MAP => TType::Map,
        CT_STRUCT => TType::Struct,
        CT_FLOAT => TType::Float,
        other => {
            return Err(ProtocolError::InvalidData(format!(
                "unknown compact type {other:#x}"
            )))
        }
    };
    Ok(ttype)
}

pub fn zigzag_i32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

pub fn unzigzag_i32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

pub fn zigzag_i64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

pub fn unzigzag_i64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Compact codec with its per-message field-id state.
#[derive(Debug, Clone)]
pub struct CompactCodec {
    version: CompactVersion,
    last_field_id: i16,
    field_stack: Vec<i16>,
    /// Field id of a bool field whose header is written with its value.
    pending_write_bool: Option<i16>,
    /// Value of a bool field that arrived in its field header.
    pending_read_bool: Option<bool>,
    string_limit: usize,
    container_limit: usize,
}

impl CompactCodec {
    pub fn new(version: CompactVersion, string_limit: usize, container_limit: usize) -> Self {
        Self {
            version,
            last_field_id: 0,
            field_stack: Vec::new(),
            pending_write_bool: None,
            pending_read_bool: None,
            string_limit,
            container_limit,
        }
    }

    pub fn version(&self) -> CompactVersion {
        self.version
    }

    pub fn set_version(&mut self, version: CompactVersion) {
        self.version = version;
    }

    /// Current struct nesting depth.
    pub fn depth(&self) -> usize {
        self.field_stack.len()
    }

    /// Clears field-id tracking; called at every message boundary.
    pub fn reset(&mut self) {
        self.last_field_id = 0;
        self.field_stack.clear();
        self.pending_write_bool = None;
        self.pending_read_bool = None;
    }

    fn push_struct(&mut self) {
        self.field_stack.push(self.last_field_id);
        self.last_field_id = 0;
    }

    fn pop_struct(&mut self) -> Result<()> {
        self.last_field_id = self.field_stack.pop().ok_or_else(|| {
            ProtocolError::InvalidData("struct end without matching begin".to_string())
        })?;
        Ok(())
    }

    fn write_varint32<T: Read + Write>(&self, ch: &mut BufferedChannel<T>, mut n: u32) {
        let mut buf = [0u8; 5];
        let mut i = 0;
        while n >= 0x80 {
            buf[i] = (n as u8) | 0x80;
            n >>= 7;
            i += 1;
        }
        buf[i] = n as u8;
        ch.write_all(&buf[..=i]);
    }

    fn write_varint64<T: Read + Write>(&self, ch: &mut BufferedChannel<T>, mut n: u64) {
        let mut buf = [0u8; 10];
        let mut i = 0;
        while n >= 0x80 {
            buf[i] = (n as u8) | 0x80;
            n >>= 7;
            i += 1;
        }
        buf[i] = n as u8;
        ch.write_all(&buf[..=i]);
    }

    fn read_varint64<T: Read + Write>(
        &self,
        ch: &mut BufferedChannel<T>,
        max_bytes: usize,
    ) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        for _ in 0..max_bytes {
            let byte = ch.read_u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(ProtocolError::InvalidData(format!(
            "varint longer than {max_bytes} bytes"
        )))
    }

    fn read_varint32<T: Read + Write>(&self, ch: &mut BufferedChannel<T>) -> Result<u32> {
        let value = self.read_varint64(ch, 5)?;
        u32::try_from(value)
            .map_err(|_| ProtocolError::InvalidData(format!("varint {value} overflows 32 bits")))
    }

    fn read_size<T: Read + Write>(&self, ch: &mut BufferedChannel<T>, limit: usize) -> Result<usize> {
        let size = self.read_varint32(ch)?;
        if size > i32::MAX as u32 {
            return Err(ProtocolError::NegativeSize(size as i32 as i64));
        }
        let size = size as usize;
        if limit > 0 && size > limit {
            return Err(ProtocolError::SizeLimit {
                size: size as u64,
                max: limit as u64,
            });
        }
        Ok(size)
    }

    fn write_size<T: Read + Write>(&self, ch: &mut BufferedChannel<T>, size: usize) -> Result<()> {
        if size > i32::MAX as usize {
            return Err(ProtocolError::SizeLimit {
                size: size as u64,
                max: i32::MAX as u64,
            });
        }
        self.write_varint32(ch, size as u32);
        Ok(())
    }

    fn write_field_header<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>, ct: u8, id: i16) {
        let delta = i32::from(id) - i32::from(self.last_field_id);
        if (1..=15).contains(&delta) {
            ch.write_u8(((delta as u8) << 4) | ct);
        } else {
            ch.write_u8(ct);
            self.write_varint32(ch, zigzag_i32(i32::from(id)));
        }
        self.last_field_id = id;
    }

    fn write_collection_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        elem: TType,
        size: usize,
    ) -> Result<()> {
        let ct = compact_type(elem)?;
        if size <= 14 {
            ch.write_u8(((size as u8) << 4) | ct);
            Ok(())
        } else {
            ch.write_u8(0xf0 | ct);
            self.write_size(ch, size)
        }
    }

    fn read_collection_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<ListHeader> {
        let byte = ch.read_u8()?;
        let elem = ttype_from_compact(byte & 0x0f)?;
        let short_size = (byte >> 4) as usize;
        let size = if short_size == 15 {
            self.read_size(ch, self.container_limit)?
        } else {
            if self.container_limit > 0 && short_size > self.container_limit {
                return Err(ProtocolError::SizeLimit {
                    size: short_size as u64,
                    max: self.container_limit as u64,
                });
            }
            short_size
        };
        Ok(ListHeader::new(elem, size))
    }

    pub fn read_message_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<MessageHeader> {
        let protocol_id = ch.read_u8()?;
        if protocol_id != COMPACT_PROTOCOL_ID {
            return Err(ProtocolError::BadVersion(format!(
                "expected compact protocol id {COMPACT_PROTOCOL_ID:#04x}, got {protocol_id:#04x}"
            )));
        }
        let version_and_type = ch.read_u8()?;
        let version = version_and_type & VERSION_MASK;
        self.version = CompactVersion::from_wire(version).ok_or_else(|| {
            ProtocolError::BadVersion(format!("compact version {version}"))
        })?;
        let kind = MessageType::try_from((version_and_type >> TYPE_SHIFT) & TYPE_BITS)?;
        let seq_id = self.read_varint32(ch)? as i32;
        let name = self.read_string(ch)?;
        Ok(MessageHeader::new(name, kind, seq_id))
    }

    pub fn read_message_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_struct_begin<T: Read + Write>(
        &mut self,
        _ch: &mut BufferedChannel<T>,
    ) -> Result<()> {
        self.push_struct();
        Ok(())
    }

    pub fn read_struct_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        self.pop_struct()
    }

    pub fn read_field_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<FieldHeader> {
        let byte = ch.read_u8()?;
        let ct = byte & 0x0f;
        if ct == CT_STOP {
            return Ok(FieldHeader::stop());
        }

        let delta = (byte >> 4) as i16;
        let id = if delta == 0 {
            self.read_i16(ch)?
        } else {
            self.last_field_id.wrapping_add(delta)
        };
        let ttype = ttype_from_compact(ct)?;
        if ttype == TType::Bool {
            self.pending_read_bool = Some(ct == CT_BOOLEAN_TRUE);
        }
        self.last_field_id = id;
        Ok(FieldHeader::new(ttype, id))
    }

    pub fn read_field_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_map_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<MapHeader> {
        let size = self.read_size(ch, self.container_limit)?;
        if size == 0 {
            return Ok(MapHeader::new(TType::Stop, TType::Stop, 0));
        }
        let types = ch.read_u8()?;
        let key = ttype_from_compact(types >> 4)?;
        let value = ttype_from_compact(types & 0x0f)?;
        Ok(MapHeader::new(key, value, size))
    }

    pub fn read_map_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_list_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<ListHeader> {
        self.read_collection_begin(ch)
    }

    pub fn read_list_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_set_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<ListHeader> {
        self.read_collection_begin(ch)
    }

    pub fn read_set_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_bool<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<bool> {
        match self.pending_read_bool.take() {
            Some(value) => Ok(value),
            None => Ok(ch.read_u8()? == CT_BOOLEAN_TRUE),
        }
    }

    pub fn read_byte<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<i8> {
        Ok(ch.read_u8()? as i8)
    }

    pub fn read_i16<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<i16> {
        let value = unzigzag_i32(self.read_varint32(ch)?);
        i16::try_from(value)
            .map_err(|_| ProtocolError::InvalidData(format!("{value} does not fit in i16")))
    }

    pub fn read_i32<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<i32> {
        Ok(unzigzag_i32(self.read_varint32(ch)?))
    }

    pub fn read_i64<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<i64> {
        Ok(unzigzag_i64(self.read_varint64(ch, 10)?))
    }

    pub fn read_double<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<f64> {
        let bytes = ch.read_array::<8>()?;
        let bits = match self.version {
            CompactVersion::LittleEndian => u64::from_le_bytes(bytes),
            CompactVersion::BigEndian => u64::from_be_bytes(bytes),
        };
        Ok(f64::from_bits(bits))
    }

    pub fn read_float<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<f32> {
        Ok(f32::from_bits(u32::from_be_bytes(ch.read_array()?)))
    }

    pub fn read_string<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<String> {
        let bytes = self.read_binary(ch)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn read_binary<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<Bytes> {
        let len = self.read_size(ch, self.string_limit)?;
        Ok(ch.read_bytes(len)?)
    }

    pub fn write_message_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        header: &MessageHeader,
    ) -> Result<()> {
        ch.write_u8(COMPACT_PROTOCOL_ID);
        ch.write_u8(
            (self.version.to_wire() & VERSION_MASK)
                | (((header.kind as u8) << TYPE_SHIFT) & TYPE_MASK),
        );
        self.write_varint32(ch, header.seq_id as u32);
        self.write_string(ch, &header.name)
    }

    pub fn write_message_end<T: Read + Write>(
        &mut self,
        _ch: &mut BufferedChannel<T>,
    ) -> Result<()> {
        Ok(())
    }

    pub fn write_struct_begin<T: Read + Write>(
        &mut self,
        _ch: &mut BufferedChannel<T>,
        _name: &str,
    ) -> Result<()> {
        self.push_struct();
        Ok(())
    }

    pub fn write_struct_end<T: Read + Write>(
        &mut self,
        _ch: &mut BufferedChannel<T>,
    ) -> Result<()> {
        self.pop_struct()
    }

    pub fn write_field_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        _name: &str,
        ttype: TType,
        id: i16,
    ) -> Result<()> {
        if ttype == TType::Bool {
            self.pending_write_bool = Some(id);
            return Ok(());
        }
        let ct = compact_type(ttype)?;
        self.write_field_header(ch, ct, id);
        Ok(())
    }

    pub fn write_field_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn write_field_stop<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<()> {
        ch.write_u8(CT_STOP);
        Ok(())
    }

    pub fn write_map_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        header: MapHeader,
    ) -> Result<()> {
        if header.size == 0 {
            ch.write_u8(0);
            return Ok(());
        }
        let types = (compact_type(header.key)? << 4) | compact_type(header.value)?;
        self.write_size(ch, header.size)?;
        ch.write_u8(types);
        Ok(())
    }

    pub fn write_map_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn write_list_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        header: ListHeader,
    ) -> Result<()> {
        self.write_collection_begin(ch, header.elem, header.size)
    }

    pub fn write_list_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn write_set_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        header: ListHeader,
    ) -> Result<()> {
        self.write_collection_begin(ch, header.elem, header.size)
    }

    pub fn write_set_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn write_bool<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: bool,
    ) -> Result<()> {
        let ct = if value {
            CT_BOOLEAN_TRUE
        } else {
            CT_BOOLEAN_FALSE
        };
        match self.pending_write_bool.take() {
            Some(id) => self.write_field_header(ch, ct, id),
            None => ch.write_u8(ct),
        }
        Ok(())
    }

    pub fn write_byte<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: i8,
    ) -> Result<()> {
        ch.write_u8(value as u8);
        Ok(())
    }

    pub fn write_i16<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: i16,
    ) -> Result<()> {
        self.write_varint32(ch, zigzag_i32(i32::from(value)));
        Ok(())
    }

    pub fn write_i32<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: i32,
    ) -> Result<()> {
        self.write_varint32(ch, zigzag_i32(value));
        Ok(())
    }

    pub fn write_i64<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: i64,
    ) -> Result<()> {
        self.write_varint64(ch, zigzag_i64(value));
        Ok(())
    }

    pub fn write_double<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: f64,
    ) -> Result<()> {
        let bytes = match self.version {
            CompactVersion::LittleEndian => value.to_bits().to_le_bytes(),
            CompactVersion::BigEndian => value.to_bits().to_be_bytes(),
        };
        ch.write_all(&bytes);
        Ok(())
    }

    pub fn write_float<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: f32,
    ) -> Result<()> {
        ch.write_all(&value.to_bits().to_be_bytes());
        Ok(())
    }

    pub fn write_string<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: &str,
    ) -> Result<()> {
        self.write_binary(ch, value.as_bytes())
    }

    pub fn write_binary<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: &[u8],
    ) -> Result<()> {
        self.write_size(ch, value.len())?;
        ch.write_all(value);
        Ok(())
    }
}

impl Default for CompactCodec {
    fn default() -> Self {
        Self::new(CompactVersion::default(), 0, 0)
    }
}
