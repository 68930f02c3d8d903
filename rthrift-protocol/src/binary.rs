//! Binary protocol: fixed-width big-endian encoding.

use crate::channel::BufferedChannel;
use crate::error::{ProtocolError, Result};
use crate::types::{FieldHeader, ListHeader, MapHeader, MessageHeader, MessageType, TType};
use bytes::Bytes;
use std::io::{Read, Write};

/// High 16 bits of the first word of a strict binary message.
pub const VERSION_1: u32 = 0x8001_0000;
pub const VERSION_MASK: u32 = 0xffff_0000;

/// Binary codec. Holds no per-message state.
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    strict_read: bool,
    string_limit: usize,
    container_limit: usize,
}

impl BinaryCodec {
    pub fn new(strict_read: bool, string_limit: usize, container_limit: usize) -> Self {
        Self {
            strict_read,
            string_limit,
            container_limit,
        }
    }

    pub fn reset(&mut self) {}

    fn read_size<T: Read + Write>(
        &self,
        ch: &mut BufferedChannel<T>,
        limit: usize,
    ) -> Result<usize> {
        let size = self.read_i32(ch)?;
        if size < 0 {
            return Err(ProtocolError::NegativeSize(size as i64));
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
        let size = i32::try_from(size).map_err(|_| ProtocolError::SizeLimit {
            size: size as u64,
            max: i32::MAX as u64,
        })?;
        self.write_i32(ch, size)
    }

    pub fn read_message_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<MessageHeader> {
        let word = self.read_i32(ch)?;
        if word < 0 {
            let version = word as u32 & VERSION_MASK;
            if version != VERSION_1 {
                return Err(ProtocolError::BadVersion(format!(
                    "binary version {version:#010x}"
                )));
            }
            let kind = MessageType::try_from((word & 0xff) as u8)?;
            let name = self.read_string(ch)?;
            let seq_id = self.read_i32(ch)?;
            Ok(MessageHeader::new(name, kind, seq_id))
        } else {
            if self.strict_read {
                return Err(ProtocolError::BadVersion(
                    "missing version in binary message header".to_string(),
                ));
            }
            let len = word as usize;
            if self.string_limit > 0 && len > self.string_limit {
                return Err(ProtocolError::SizeLimit {
                    size: len as u64,
                    max: self.string_limit as u64,
                });
            }
            let name = String::from_utf8(ch.read_bytes(len)?.to_vec())?;
            let kind = MessageType::try_from(ch.read_u8()?)?;
            let seq_id = self.read_i32(ch)?;
            Ok(MessageHeader::new(name, kind, seq_id))
        }
    }

    pub fn read_message_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_struct_begin<T: Read + Write>(
        &mut self,
        _ch: &mut BufferedChannel<T>,
    ) -> Result<()> {
        Ok(())
    }

    pub fn read_struct_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_field_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<FieldHeader> {
        let ttype = TType::try_from(ch.read_u8()?)?;
        if ttype == TType::Stop {
            return Ok(FieldHeader::stop());
        }
        let id = self.read_i16(ch)?;
        Ok(FieldHeader::new(ttype, id))
    }

    pub fn read_field_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_map_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<MapHeader> {
        let key = TType::try_from(ch.read_u8()?)?;
        let value = TType::try_from(ch.read_u8()?)?;
        let size = self.read_size(ch, self.container_limit)?;
        Ok(MapHeader::new(key, value, size))
    }

    pub fn read_map_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_list_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<ListHeader> {
        let elem = TType::try_from(ch.read_u8()?)?;
        let size = self.read_size(ch, self.container_limit)?;
        Ok(ListHeader::new(elem, size))
    }

    pub fn read_list_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_set_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
    ) -> Result<ListHeader> {
        self.read_list_begin(ch)
    }

    pub fn read_set_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_bool<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<bool> {
        Ok(ch.read_u8()? != 0)
    }

    pub fn read_byte<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<i8> {
        Ok(ch.read_u8()? as i8)
    }

    pub fn read_i16<T: Read + Write>(&self, ch: &mut BufferedChannel<T>) -> Result<i16> {
        Ok(i16::from_be_bytes(ch.read_array()?))
    }

    pub fn read_i32<T: Read + Write>(&self, ch: &mut BufferedChannel<T>) -> Result<i32> {
        Ok(i32::from_be_bytes(ch.read_array()?))
    }

    pub fn read_i64<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<i64> {
        Ok(i64::from_be_bytes(ch.read_array()?))
    }

    pub fn read_double<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<f64> {
        Ok(f64::from_bits(u64::from_be_bytes(ch.read_array()?)))
    }

    pub fn read_float<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<f32> {
        Ok(f32::from_bits(u32::from_be_bytes(ch.read_array()?)))
    }

    pub fn read_string<T: Read + Write>(&self, ch: &mut BufferedChannel<T>) -> Result<String> {
        let len = self.read_size(ch, self.string_limit)?;
        Ok(String::from_utf8(ch.read_bytes(len)?.to_vec())?)
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
        let word = VERSION_1 | header.kind as u32;
        self.write_i32(ch, word as i32)?;
        self.write_string(ch, &header.name)?;
        self.write_i32(ch, header.seq_id)
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
        Ok(())
    }

    pub fn write_struct_end<T: Read + Write>(
        &mut self,
        _ch: &mut BufferedChannel<T>,
    ) -> Result<()> {
        Ok(())
    }

    pub fn write_field_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        _name: &str,
        ttype: TType,
        id: i16,
    ) -> Result<()> {
        ch.write_u8(ttype as u8);
        self.write_i16(ch, id)
    }

    pub fn write_field_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn write_field_stop<T: Read + Write>(&mut self, ch: &mut BufferedChannel<T>) -> Result<()> {
        ch.write_u8(TType::Stop as u8);
        Ok(())
    }

    pub fn write_map_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        header: MapHeader,
    ) -> Result<()> {
        ch.write_u8(header.key as u8);
        ch.write_u8(header.value as u8);
        self.write_size(ch, header.size)
    }

    pub fn write_map_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn write_list_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        header: ListHeader,
    ) -> Result<()> {
        ch.write_u8(header.elem as u8);
        self.write_size(ch, header.size)
    }

    pub fn write_list_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn write_set_begin<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        header: ListHeader,
    ) -> Result<()> {
        self.write_list_begin(ch, header)
    }

    pub fn write_set_end<T: Read + Write>(&mut self, _ch: &mut BufferedChannel<T>) -> Result<()> {
        Ok(())
    }

    pub fn write_bool<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: bool,
    ) -> Result<()> {
        ch.write_u8(value as u8);
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

    pub fn write_i16<T: Read + Write>(&self, ch: &mut BufferedChannel<T>, value: i16) -> Result<()> {
        ch.write_all(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_i32<T: Read + Write>(&self, ch: &mut BufferedChannel<T>, value: i32) -> Result<()> {
        ch.write_all(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_i64<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: i64,
    ) -> Result<()> {
        ch.write_all(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_double<T: Read + Write>(
        &mut self,
        ch: &mut BufferedChannel<T>,
        value: f64,
    ) -> Result<()> {
        ch.write_all(&value.to_bits().to_be_bytes());
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
        &self,
        ch: &mut BufferedChannel<T>,
        value: &str,
    ) -> Result<()> {
        self.write_size(ch, value.len())?;
        ch.write_all(value.as_bytes());
        Ok(())
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

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new(false, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryStream;

    fn channel(input: &[u8]) -> BufferedChannel<MemoryStream> {
        BufferedChannel::new(MemoryStream::with_input(input.to_vec()))
    }

    fn written(ch: &mut BufferedChannel<MemoryStream>) -> Vec<u8> {
        ch.flush().unwrap();
        ch.get_mut().take_output()
    }

    #[test]
    fn test_message_header_layout() {
        let mut codec = BinaryCodec::default();
        let mut ch = channel(&[]);
        codec
            .write_message_begin(&mut ch, &MessageHeader::new("ping", MessageType::Call, 7))
            .unwrap();

        let bytes = written(&mut ch);
        assert_eq!(
            bytes,
            [
                0x80, 0x01, 0x00, 0x01, // version | call
                0x00, 0x00, 0x00, 0x04, b'p', b'i', b'n', b'g', // name
                0x00, 0x00, 0x00, 0x07, // seq id
            ]
        );

        let mut ch = channel(&bytes);
        let header = codec.read_message_begin(&mut ch).unwrap();
        assert_eq!(header, MessageHeader::new("ping", MessageType::Call, 7));
    }

    #[test]
    fn test_bad_version_is_rejected() {
        let mut codec = BinaryCodec::default();
        let mut ch = channel(&[0x80, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1]);
        let err = codec.read_message_begin(&mut ch).unwrap_err();
        assert!(matches!(err, ProtocolError::BadVersion(_)));
    }

    #[test]
    fn test_non_strict_header() {
        let bytes = [0, 0, 0, 2, b'h', b'i', 2, 0, 0, 0, 9];

        let mut codec = BinaryCodec::default();
        let header = codec.read_message_begin(&mut channel(&bytes)).unwrap();
        assert_eq!(header, MessageHeader::new("hi", MessageType::Reply, 9));

        let mut strict = BinaryCodec::new(true, 0, 0);
        let err = strict.read_message_begin(&mut channel(&bytes)).unwrap_err();
        assert!(matches!(err, ProtocolError::BadVersion(_)));
    }

    #[test]
    fn test_field_headers_and_stop() {
        let mut codec = BinaryCodec::default();
        let mut ch = channel(&[]);
        codec.write_field_begin(&mut ch, "f", TType::I64, 300).unwrap();
        codec.write_field_stop(&mut ch).unwrap();

        let bytes = written(&mut ch);
        assert_eq!(bytes, [10, 0x01, 0x2c, 0]);

        let mut ch = channel(&bytes);
        assert_eq!(
            codec.read_field_begin(&mut ch).unwrap(),
            FieldHeader::new(TType::I64, 300)
        );
        assert!(codec.read_field_begin(&mut ch).unwrap().is_stop());
    }

    #[test]
    fn test_negative_and_oversized_lengths() {
        let mut codec = BinaryCodec::default();
        let err = codec
            .read_string(&mut channel(&[0xff, 0xff, 0xff, 0xfe]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NegativeSize(-2)));

        let mut limited = BinaryCodec::new(false, 4, 2);
        let err = limited
            .read_binary(&mut channel(&[0, 0, 0, 5, 1, 2, 3, 4, 5]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SizeLimit { size: 5, max: 4 }));

        let err = limited
            .read_list_begin(&mut channel(&[8, 0, 0, 0, 3]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SizeLimit { size: 3, max: 2 }));
    }

    #[test]
    fn test_binary_is_zero_copy_slice() {
        let mut codec = BinaryCodec::default();
        let mut ch = channel(&[0, 0, 0, 3, 9, 8, 7, 0xaa]);
        assert_eq!(codec.read_binary(&mut ch).unwrap().as_ref(), &[9, 8, 7]);
        assert_eq!(ch.read_u8().unwrap(), 0xaa);
    }
}
