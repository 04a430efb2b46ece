//! Call request, call response and continuation payloads.
//!
//! ```text
//! call req:      flags:1 ttl:4 tracing:25 service~1 nh:1 (k~1 v~1){nh} body
//! call res:      flags:1 code:1 tracing:25 nh:1 (k~1 v~1){nh} body
//! continuation:  flags:1 body
//! body:          csumtype:1 (len:2 bytes){*} [csum:4]
//! ```
//!
//! The checksum value appears only on the final frame of a message (the one
//! without `MORE_FRAGMENTS`) and only when the checksum type is not `None`.
//! It occupies the last four bytes of the payload.

use bytes::{BufMut, Bytes, BytesMut};

use super::Headers;
use crate::{
    checksum::ChecksumType,
    codec::{Reader, put_string1},
    errors::{ProtocolError, Result},
    flags::CallFlags,
    trace::TraceContext,
};

/// Length prefix in front of every argument chunk.
pub const CHUNK_PREFIX: usize = 2;

/// Outcome byte of a call response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    /// Handler succeeded.
    #[default]
    Ok = 0x00,
    /// Handler reported an application-level failure; arguments carry
    /// the details.
    Error = 0x01,
}

impl ResponseCode {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::Error),
            _ => Err(ProtocolError::UnknownCode { field: "response code", value }),
        }
    }
}

/// Fields of a call request that precede the argument chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequestHead {
    /// Time budget granted to the callee, in milliseconds.
    pub ttl_ms: u32,
    /// Tracing context.
    pub tracing: TraceContext,
    /// Target service name.
    pub service: String,
    /// Transport headers.
    pub headers: Headers,
}

impl CallRequestHead {
    /// Bytes this head occupies between the flags and the checksum type.
    pub fn encoded_len(&self) -> usize {
        4 + TraceContext::SIZE + 1 + self.service.len() + headers_len(&self.headers)
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u32(self.ttl_ms);
        self.tracing.encode(dst);
        put_string1(dst, "service", &self.service)?;
        put_headers(dst, &self.headers)
    }

    fn decode(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            ttl_ms: reader.u32()?,
            tracing: TraceContext::decode(reader)?,
            service: reader.string1("service")?,
            headers: read_headers(reader)?,
        })
    }
}

/// Fields of a call response that precede the argument chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallResponseHead {
    /// Outcome.
    pub code: ResponseCode,
    /// Tracing context echoed from the request.
    pub tracing: TraceContext,
    /// Transport headers.
    pub headers: Headers,
}

impl CallResponseHead {
    /// Bytes this head occupies between the flags and the checksum type.
    pub fn encoded_len(&self) -> usize {
        1 + TraceContext::SIZE + headers_len(&self.headers)
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.code as u8);
        self.tracing.encode(dst);
        put_headers(dst, &self.headers)
    }

    fn decode(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            code: ResponseCode::from_u8(reader.u8()?)?,
            tracing: TraceContext::decode(reader)?,
            headers: read_headers(reader)?,
        })
    }
}

/// Argument-carrying part shared by all four call frame types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallBody {
    /// Frame flags.
    pub flags: CallFlags,
    /// Checksum algorithm; must match across all frames of one message.
    pub checksum_type: ChecksumType,
    /// Argument chunks in order.
    pub chunks: Vec<Bytes>,
    /// Checksum over all argument bytes; present only on the final frame.
    pub checksum: Option<u32>,
}

impl CallBody {
    /// True when no more frames follow for this message.
    pub fn is_final(&self) -> bool {
        self.flags.is_final()
    }

    fn has_trailer(&self) -> bool {
        self.is_final() && self.checksum_type != ChecksumType::None
    }

    fn encode_tail(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.checksum_type.to_u8());
        for chunk in &self.chunks {
            let len = u16::try_from(chunk.len()).map_err(|_| ProtocolError::FieldTooLong {
                field: "argument chunk",
                len: chunk.len(),
                max: usize::from(u16::MAX),
            })?;
            dst.put_u16(len);
            dst.put_slice(chunk);
        }
        if self.has_trailer() {
            dst.put_u32(self.checksum.ok_or(ProtocolError::MissingChecksum)?);
        }
        Ok(())
    }

    fn decode_tail(flags: CallFlags, reader: &mut Reader) -> Result<Self> {
        let checksum_type = ChecksumType::from_u8(reader.u8()?)?;
        let mut body = Self { flags, checksum_type, chunks: Vec::new(), checksum: None };

        let mut rest = reader.rest();
        if body.has_trailer() {
            let trailer_at = rest.len().checked_sub(4).ok_or(ProtocolError::MissingChecksum)?;
            let trailer = rest.split_off(trailer_at);
            body.checksum = Some(u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]));
        }

        let mut chunks = Reader::new(rest);
        while chunks.remaining() > 0 {
            if chunks.remaining() < CHUNK_PREFIX {
                return Err(ProtocolError::MalformedArgument {
                    len: CHUNK_PREFIX,
                    available: chunks.remaining(),
                });
            }
            let len = usize::from(chunks.u16()?);
            if len > chunks.remaining() {
                return Err(ProtocolError::MalformedArgument { len, available: chunks.remaining() });
            }
            body.chunks.push(chunks.take(len)?);
        }
        Ok(body)
    }

    pub(crate) fn encode_flags(&self, dst: &mut BytesMut) {
        dst.put_u8(self.flags.bits());
    }
}

pub(crate) fn encode_request(head: &CallRequestHead, body: &CallBody, dst: &mut BytesMut) -> Result<()> {
    body.encode_flags(dst);
    head.encode(dst)?;
    body.encode_tail(dst)
}

pub(crate) fn decode_request(reader: &mut Reader) -> Result<(CallRequestHead, CallBody)> {
    let flags = CallFlags::from_wire(reader.u8()?);
    let head = CallRequestHead::decode(reader)?;
    let body = CallBody::decode_tail(flags, reader)?;
    Ok((head, body))
}

pub(crate) fn encode_response(head: &CallResponseHead, body: &CallBody, dst: &mut BytesMut) -> Result<()> {
    body.encode_flags(dst);
    head.encode(dst)?;
    body.encode_tail(dst)
}

pub(crate) fn decode_response(reader: &mut Reader) -> Result<(CallResponseHead, CallBody)> {
    let flags = CallFlags::from_wire(reader.u8()?);
    let head = CallResponseHead::decode(reader)?;
    let body = CallBody::decode_tail(flags, reader)?;
    Ok((head, body))
}

pub(crate) fn encode_continuation(body: &CallBody, dst: &mut BytesMut) -> Result<()> {
    body.encode_flags(dst);
    body.encode_tail(dst)
}

pub(crate) fn decode_continuation(reader: &mut Reader) -> Result<CallBody> {
    let flags = CallFlags::from_wire(reader.u8()?);
    CallBody::decode_tail(flags, reader)
}

fn headers_len(headers: &Headers) -> usize {
    1 + headers.iter().map(|(k, v)| 2 + k.len() + v.len()).sum::<usize>()
}

fn put_headers(dst: &mut BytesMut, headers: &Headers) -> Result<()> {
    let count = u8::try_from(headers.len()).map_err(|_| ProtocolError::FieldTooLong {
        field: "call headers",
        len: headers.len(),
        max: usize::from(u8::MAX),
    })?;
    dst.put_u8(count);
    for (key, value) in headers {
        put_string1(dst, "header key", key)?;
        put_string1(dst, "header value", value)?;
    }
    Ok(())
}

fn read_headers(reader: &mut Reader) -> Result<Headers> {
    let count = reader.u8()?;
    let mut headers = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let key = reader.string1("header key")?;
        let value = reader.string1("header value")?;
        headers.push((key, value));
    }
    Ok(headers)
}
