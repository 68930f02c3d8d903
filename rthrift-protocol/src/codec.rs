//! The Reader/Writer contract that generated code is written against.
//!
//! Every structured value implements [`Writable`] ("write self given a
//! Writer") and [`Readable`] ("populate self given a Reader"). Both codecs
//! and the protocol façade implement [`Reader`] and [`Writer`].

use crate::error::Result;
use crate::types::{FieldHeader, ListHeader, MapHeader, MessageHeader, SetHeader, TType};
use bytes::Bytes;

pub trait Reader {
    fn read_message_begin(&mut self) -> Result<MessageHeader>;
    fn read_message_end(&mut self) -> Result<()>;

    fn read_struct_begin(&mut self) -> Result<()>;
    fn read_struct_end(&mut self) -> Result<()>;

    /// Reads a field header; a header with [`TType::Stop`] ends the struct.
    fn read_field_begin(&mut self) -> Result<FieldHeader>;
    fn read_field_end(&mut self) -> Result<()>;

    fn read_map_begin(&mut self) -> Result<MapHeader>;
    fn read_map_end(&mut self) -> Result<()>;
    fn read_list_begin(&mut self) -> Result<ListHeader>;
    fn read_list_end(&mut self) -> Result<()>;
    fn read_set_begin(&mut self) -> Result<SetHeader>;
    fn read_set_end(&mut self) -> Result<()>;

    fn read_bool(&mut self) -> Result<bool>;
    fn read_byte(&mut self) -> Result<i8>;
    fn read_i16(&mut self) -> Result<i16>;
    fn read_i32(&mut self) -> Result<i32>;
    fn read_i64(&mut self) -> Result<i64>;
    fn read_double(&mut self) -> Result<f64>;
    fn read_float(&mut self) -> Result<f32>;
    fn read_string(&mut self) -> Result<String>;
    fn read_binary(&mut self) -> Result<Bytes>;

    /// Consumes and discards one value of the given type.
    fn skip(&mut self, ttype: TType) -> Result<()>;

    /// Consumes one value of the given type and returns its encoded bytes.
    fn read_raw(&mut self, ttype: TType) -> Result<Bytes>;
}

pub trait Writer {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<()>;
    fn write_message_end(&mut self) -> Result<()>;

    fn write_struct_begin(&mut self, name: &str) -> Result<()>;
    fn write_struct_end(&mut self) -> Result<()>;

    fn write_field_begin(&mut self, name: &str, ttype: TType, id: i16) -> Result<()>;
    fn write_field_end(&mut self) -> Result<()>;
    fn write_field_stop(&mut self) -> Result<()>;

    fn write_map_begin(&mut self, header: MapHeader) -> Result<()>;
    fn write_map_end(&mut self) -> Result<()>;
    fn write_list_begin(&mut self, header: ListHeader) -> Result<()>;
    fn write_list_end(&mut self) -> Result<()>;
    fn write_set_begin(&mut self, header: SetHeader) -> Result<()>;
    fn write_set_end(&mut self) -> Result<()>;

    fn write_bool(&mut self, value: bool) -> Result<()>;
    fn write_byte(&mut self, value: i8) -> Result<()>;
    fn write_i16(&mut self, value: i16) -> Result<()>;
    fn write_i32(&mut self, value: i32) -> Result<()>;
    fn write_i64(&mut self, value: i64) -> Result<()>;
    fn write_double(&mut self, value: f64) -> Result<()>;
    fn write_float(&mut self, value: f32) -> Result<()>;
    fn write_string(&mut self, value: &str) -> Result<()>;
    fn write_binary(&mut self, value: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// A value that can encode itself.
pub trait Writable {
    fn write<W: Writer + ?Sized>(&self, writer: &mut W) -> Result<()>;
}

/// A value that can decode itself.
pub trait Readable: Sized {
    fn read<R: Reader + ?Sized>(reader: &mut R) -> Result<Self>;
}

/// The empty struct, used for calls without arguments or results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Void;

impl Writable for Void {
    fn write<W: Writer + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_struct_begin("void")?;
        writer.write_field_stop()?;
        writer.write_struct_end()
    }
}

impl Readable for Void {
    fn read<R: Reader + ?Sized>(reader: &mut R) -> Result<Self> {
        reader.read_struct_begin()?;
        loop {
            let field = reader.read_field_begin()?;
            if field.is_stop() {
                break;
            }
            reader.skip(field.ttype)?;
            reader.read_field_end()?;
        }
        reader.read_struct_end()?;
        Ok(Void)
    }
}
