//! The standard application exception carried by `Exception` messages.

use crate::codec::{Readable, Reader, Writable, Writer};
use crate::error::Result;
use crate::types::TType;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationExceptionKind {
    Unknown,
    UnknownMethod,
    InvalidMessageType,
    WrongMethodName,
    BadSequenceId,
    MissingResult,
    InternalError,
    ProtocolError,
    InvalidTransform,
    InvalidProtocol,
    UnsupportedClientType,
}

impl ApplicationExceptionKind {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::UnknownMethod,
            2 => Self::InvalidMessageType,
            3 => Self::WrongMethodName,
            4 => Self::BadSequenceId,
            5 => Self::MissingResult,
            6 => Self::InternalError,
            7 => Self::ProtocolError,
            8 => Self::InvalidTransform,
            9 => Self::InvalidProtocol,
            10 => Self::UnsupportedClientType,
            _ => Self::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::UnknownMethod => 1,
            Self::InvalidMessageType => 2,
            Self::WrongMethodName => 3,
            Self::BadSequenceId => 4,
            Self::MissingResult => 5,
            Self::InternalError => 6,
            Self::ProtocolError => 7,
            Self::InvalidTransform => 8,
            Self::InvalidProtocol => 9,
            Self::UnsupportedClientType => 10,
        }
    }
}

impl fmt::Display for ApplicationExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::UnknownMethod => "UNKNOWN_METHOD",
            Self::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            Self::WrongMethodName => "WRONG_METHOD_NAME",
            Self::BadSequenceId => "BAD_SEQUENCE_ID",
            Self::MissingResult => "MISSING_RESULT",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InvalidTransform => "INVALID_TRANSFORM",
            Self::InvalidProtocol => "INVALID_PROTOCOL",
            Self::UnsupportedClientType => "UNSUPPORTED_CLIENT_TYPE",
        };
        f.write_str(name)
    }
}

/// Error returned by a remote processor instead of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationException {
    pub kind: ApplicationExceptionKind,
    pub message: String,
}

impl ApplicationException {
    pub fn new(kind: ApplicationExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApplicationException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApplicationException {}

impl Writable for ApplicationException {
    fn write<W: Writer + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_struct_begin("TApplicationException")?;
        writer.write_field_begin("message", TType::String, 1)?;
        writer.write_string(&self.message)?;
        writer.write_field_end()?;
        writer.write_field_begin("type", TType::I32, 2)?;
        writer.write_i32(self.kind.as_i32())?;
        writer.write_field_end()?;
        writer.write_field_stop()?;
        writer.write_struct_end()
    }
}

impl Readable for ApplicationException {
    fn read<R: Reader + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut exception = ApplicationException::new(ApplicationExceptionKind::Unknown, "");
        reader.read_struct_begin()?;
        loop {
            let field = reader.read_field_begin()?;
            if field.is_stop() {
                break;
            }
            match (field.id, field.ttype) {
                (1, TType::String) => exception.message = reader.read_string()?,
                (2, TType::I32) => {
                    exception.kind = ApplicationExceptionKind::from_i32(reader.read_i32()?)
                }
                (_, ttype) => reader.skip(ttype)?,
            }
            reader.read_field_end()?;
        }
        reader.read_struct_end()?;
        Ok(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_values() {
        for value in 0..=10 {
            assert_eq!(ApplicationExceptionKind::from_i32(value).as_i32(), value);
        }
        assert_eq!(
            ApplicationExceptionKind::from_i32(99),
            ApplicationExceptionKind::Unknown
        );
    }

    #[test]
    fn test_display() {
        let exc = ApplicationException::new(ApplicationExceptionKind::UnknownMethod, "no such: foo");
        assert_eq!(exc.to_string(), "UNKNOWN_METHOD: no such: foo");
    }
}
