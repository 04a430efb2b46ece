//! Field-level readers and writers shared by the payload codecs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    opcodes::Opcode,
};

/// Cursor over a payload that slices rather than copies.
pub(crate) struct Reader {
    buf: Bytes,
}

impl Reader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<Bytes> {
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated { needed: len, available: self.buf.len() });
        }
        Ok(self.buf.split_to(len))
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(self.take(2)?.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(self.take(4)?.get_u32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(self.take(8)?.get_u64())
    }

    /// String with a one-byte length prefix.
    pub(crate) fn string1(&mut self, field: &'static str) -> Result<String> {
        let len = usize::from(self.u8()?);
        self.string(len, field)
    }

    /// String with a two-byte length prefix.
    pub(crate) fn string2(&mut self, field: &'static str) -> Result<String> {
        let len = usize::from(self.u16()?);
        self.string(len, field)
    }

    fn string(&mut self, len: usize, field: &'static str) -> Result<String> {
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidString { field })
    }

    /// Everything not yet consumed.
    pub(crate) fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }

    pub(crate) fn finish(&self, opcode: Opcode) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes { opcode, len: self.buf.len() })
        }
    }
}

pub(crate) fn put_string1(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: value.len(),
        max: usize::from(u8::MAX),
    })?;
    dst.put_u8(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_string2(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: value.len(),
        max: usize::from(u16::MAX),
    })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_read_reports_sizes() {
        let mut reader = Reader::new(Bytes::from_static(&[1, 2]));
        assert_eq!(reader.u32().unwrap_err(), ProtocolError::Truncated { needed: 4, available: 2 });
    }

    #[test]
    fn strings_with_both_prefixes() {
        let mut buf = BytesMut::new();
        put_string1(&mut buf, "service", "echo").unwrap();
        put_string2(&mut buf, "message", "oops").unwrap();

        let mut reader = Reader::new(buf.freeze());
        assert_eq!(reader.string1("service").unwrap(), "echo");
        assert_eq!(reader.string2("message").unwrap(), "oops");
        assert!(reader.finish(Opcode::Error).is_ok());
    }

    #[test]
    fn long_string_rejected() {
        let mut buf = BytesMut::new();
        let err = put_string1(&mut buf, "service", &"x".repeat(256)).unwrap_err();
        assert_eq!(err, ProtocolError::FieldTooLong { field: "service", len: 256, max: 255 });
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut reader = Reader::new(Bytes::from_static(&[2, 0xc3, 0x28]));
        assert_eq!(
            reader.string1("header key").unwrap_err(),
            ProtocolError::InvalidString { field: "header key" }
        );
    }
}
