//! Wire-level types shared by every codec.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape tag of an encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Void = 1,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
    Float = 19,
}

impl TryFrom<u8> for TType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        let ttype = match value {
            0 => TType::Stop,
            1 => TType::Void,
            2 => TType::Bool,
            3 => TType::Byte,
            4 => TType::Double,
            6 => TType::I16,
            8 => TType::I32,
            10 => TType::I64,
            11 => TType::String,
            12 => TType::Struct,
            13 => TType::Map,
            14 => TType::Set,
            15 => TType::List,
            19 => TType::Float,
            other => {
                return Err(ProtocolError::InvalidData(format!(
                    "unknown type tag {other}"
                )))
            }
        };
        Ok(ttype)
    }
}

/// Kind of an RPC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl MessageType {
    /// Returns whether the message is sent by a caller.
    pub fn is_request(&self) -> bool {
        matches!(self, MessageType::Call | MessageType::Oneway)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Call),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Exception),
            4 => Ok(MessageType::Oneway),
            other => Err(ProtocolError::InvalidData(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

/// Encoding carried by a connection.
///
/// The id values are the ones the header transport puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolId {
    Binary,
    Json,
    Compact,
    #[serde(skip)]
    Reserved(u32),
}

impl ProtocolId {
    pub fn from_wire(id: u32) -> Self {
        match id {
            0 => ProtocolId::Binary,
            1 => ProtocolId::Json,
            2 => ProtocolId::Compact,
            other => ProtocolId::Reserved(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            ProtocolId::Binary => 0,
            ProtocolId::Json => 1,
            ProtocolId::Compact => 2,
            ProtocolId::Reserved(id) => id,
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolId::Binary => write!(f, "binary"),
            ProtocolId::Json => write!(f, "json"),
            ProtocolId::Compact => write!(f, "compact"),
            ProtocolId::Reserved(id) => write!(f, "reserved({id})"),
        }
    }
}

impl std::str::FromStr for ProtocolId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(ProtocolId::Binary),
            "json" => Ok(ProtocolId::Json),
            "compact" => Ok(ProtocolId::Compact),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Message envelope: name, kind and sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub kind: MessageType,
    pub seq_id: i32,
}

impl MessageHeader {
    pub fn new(name: impl Into<String>, kind: MessageType, seq_id: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            seq_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub ttype: TType,
    pub id: i16,
}

impl FieldHeader {
    pub fn new(ttype: TType, id: i16) -> Self {
        Self { ttype, id }
    }

    pub fn stop() -> Self {
        Self {
            ttype: TType::Stop,
            id: 0,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.ttype == TType::Stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHeader {
    pub key: TType,
    pub value: TType,
    pub size: usize,
}

impl MapHeader {
    pub fn new(key: TType, value: TType, size: usize) -> Self {
        Self { key, value, size }
    }
}

/// Header shared by lists and sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHeader {
    pub elem: TType,
    pub size: usize,
}

impl ListHeader {
    pub fn new(elem: TType, size: usize) -> Self {
        Self { elem, size }
    }
}

pub type SetHeader = ListHeader;
