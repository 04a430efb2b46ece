//! Distributed-tracing context carried by call and control frames.

use bytes::{BufMut, BytesMut};

use crate::{codec::Reader, errors::Result};

/// Span identifiers propagated with a call. Opaque to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TraceContext {
    /// Trace the call belongs to.
    pub trace_id: u64,
    /// Span of this call.
    pub span_id: u64,
    /// Span of the caller.
    pub parent_id: u64,
    /// Sampling flags.
    pub flags: u8,
}

impl TraceContext {
    /// Encoded length.
    pub const SIZE: usize = 25;

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.trace_id);
        dst.put_u64(self.span_id);
        dst.put_u64(self.parent_id);
        dst.put_u8(self.flags);
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            trace_id: reader.u64()?,
            span_id: reader.u64()?,
            parent_id: reader.u64()?,
            flags: reader.u8()?,
        })
    }
}
