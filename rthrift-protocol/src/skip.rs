//! Structural skip of unknown values.

use crate::codec::Reader;
use crate::error::{ProtocolError, Result};
use crate::types::TType;

/// Default nesting limit for skip and raw capture.
pub const DEFAULT_RECURSION_LIMIT: usize = 64;

/// Consumes exactly one value of type `ttype` without materializing it.
///
/// `depth` is the number of nesting levels still allowed, the value itself
/// included; each struct/container level uses one.
pub fn skip<R: Reader + ?Sized>(reader: &mut R, ttype: TType, depth: usize) -> Result<()> {
    if depth == 0 {
        return Err(ProtocolError::DepthLimit);
    }

    match ttype {
        TType::Bool => {
            reader.read_bool()?;
        }
        TType::Byte => {
            reader.read_byte()?;
        }
        TType::I16 => {
            reader.read_i16()?;
        }
        TType::I32 => {
            reader.read_i32()?;
        }
        TType::I64 => {
            reader.read_i64()?;
        }
        TType::Double => {
            reader.read_double()?;
        }
        TType::Float => {
            reader.read_float()?;
        }
        TType::String => {
            reader.read_binary()?;
        }
        TType::Struct => {
            reader.read_struct_begin()?;
            loop {
                let field = reader.read_field_begin()?;
                if field.is_stop() {
                    break;
                }
                skip(reader, field.ttype, depth - 1)?;
                reader.read_field_end()?;
            }
            reader.read_struct_end()?;
        }
        TType::Map => {
            let header = reader.read_map_begin()?;
            for _ in 0..header.size {
                skip(reader, header.key, depth - 1)?;
                skip(reader, header.value, depth - 1)?;
            }
            reader.read_map_end()?;
        }
        TType::Set => {
            let header = reader.read_set_begin()?;
            for _ in 0..header.size {
                skip(reader, header.elem, depth - 1)?;
            }
            reader.read_set_end()?;
        }
        TType::List => {
            let header = reader.read_list_begin()?;
            for _ in 0..header.size {
                skip(reader, header.elem, depth - 1)?;
            }
            reader.read_list_end()?;
        }
        TType::Stop | TType::Void => {
            return Err(ProtocolError::InvalidData(format!(
                "cannot skip value of type {ttype:?}"
            )))
        }
    }
    Ok(())
}
