//! Cancel, claim and error payloads.
//!
//! ```text
//! cancel:  ttl:4 tracing:25 why~2
//! claim:   ttl:4 tracing:25
//! error:   code:1 tracing:25 message~2
//! ```

use bytes::{BufMut, BytesMut};

use crate::{
    codec::{Reader, put_string2},
    errors::{ProtocolError, Result},
    trace::TraceContext,
};

/// Caller abandons an outstanding call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cancel {
    /// Remaining time budget at the moment of cancellation.
    pub ttl_ms: u32,
    /// Tracing context of the call.
    pub tracing: TraceContext,
    /// Human-readable reason.
    pub why: String,
}

impl Cancel {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u32(self.ttl_ms);
        self.tracing.encode(dst);
        put_string2(dst, "cancel reason", &self.why)
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            ttl_ms: reader.u32()?,
            tracing: TraceContext::decode(reader)?,
            why: reader.string2("cancel reason")?,
        })
    }
}

/// Another responder took the call. Received claims are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claim {
    /// Remaining time budget.
    pub ttl_ms: u32,
    /// Tracing context of the call.
    pub tracing: TraceContext,
}

impl Claim {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.ttl_ms);
        self.tracing.encode(dst);
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self> {
        Ok(Self { ttl_ms: reader.u32()?, tracing: TraceContext::decode(reader)? })
    }
}

/// Error classes carried by error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Deadline passed before a response.
    Timeout = 0x01,
    /// Call was cancelled.
    Cancelled = 0x02,
    /// Responder is overloaded.
    Busy = 0x03,
    /// Responder refused the call.
    Declined = 0x04,
    /// Handler failed unexpectedly.
    UnexpectedError = 0x05,
    /// Request was malformed, including checksum failures and unknown
    /// endpoints.
    BadRequest = 0x06,
    /// Transport failure while serving the call.
    NetworkError = 0x07,
    /// Responder considers itself unhealthy.
    Unhealthy = 0x08,
    /// Protocol violation; the connection will be closed.
    FatalProtocol = 0xff,
}

impl ErrorCode {
    /// Parse the wire byte.
    ///
    /// # Errors
    ///
    /// `UnknownCode` for unassigned values.
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0x01 => Self::Timeout,
            0x02 => Self::Cancelled,
            0x03 => Self::Busy,
            0x04 => Self::Declined,
            0x05 => Self::UnexpectedError,
            0x06 => Self::BadRequest,
            0x07 => Self::NetworkError,
            0x08 => Self::Unhealthy,
            0xff => Self::FatalProtocol,
            _ => return Err(ProtocolError::UnknownCode { field: "error code", value }),
        })
    }

    /// Wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether the error tears down the connection.
    pub fn is_fatal(self) -> bool {
        self == Self::FatalProtocol
    }
}

/// Error frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Error class.
    pub code: ErrorCode,
    /// Tracing context of the failed call, zeroed for connection errors.
    pub tracing: TraceContext,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorMessage {
    /// Error with an empty tracing context.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, tracing: TraceContext::default(), message: message.into() }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.code.to_u8());
        self.tracing.encode(dst);
        put_string2(dst, "error message", &self.message)
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            code: ErrorCode::from_u8(reader.u8()?)?,
            tracing: TraceContext::decode(reader)?,
            message: reader.string2("error message")?,
        })
    }
}
