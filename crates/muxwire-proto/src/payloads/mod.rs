//! Typed message bodies.
//!
//! [`Payload`] is the closed set of messages. Conversion to and from a
//! [`Frame`] is the only place payload bytes are interpreted.

mod call;
mod control;
mod init;

use bytes::BytesMut;
pub use call::{CHUNK_PREFIX, CallBody, CallRequestHead, CallResponseHead, ResponseCode};
pub use control::{Cancel, Claim, ErrorCode, ErrorMessage};
pub use init::{HOST_PORT, Init, PROCESS_NAME, PROTOCOL_VERSION};

use crate::{
    codec::Reader,
    errors::Result,
    frame::Frame,
    header::MessageId,
    opcodes::Opcode,
};

/// Ordered key/value pairs. Order is preserved on the wire.
pub type Headers = Vec<(String, String)>;

/// Decoded body of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Handshake request.
    InitRequest(Init),
    /// Handshake response.
    InitResponse(Init),
    /// First frame of a call.
    CallRequest {
        /// Routing and budget fields.
        head: CallRequestHead,
        /// Argument chunks.
        body: CallBody,
    },
    /// First frame of a response.
    CallResponse {
        /// Outcome fields.
        head: CallResponseHead,
        /// Argument chunks.
        body: CallBody,
    },
    /// Further request chunks.
    CallRequestContinue(CallBody),
    /// Further response chunks.
    CallResponseContinue(CallBody),
    /// Call abandoned by the caller.
    Cancel(Cancel),
    /// Call taken by another responder.
    Claim(Claim),
    /// Liveness probe.
    PingRequest,
    /// Liveness probe reply.
    PingResponse,
    /// Failure report.
    Error(ErrorMessage),
}

impl Payload {
    /// Message type this payload is sent as.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::InitRequest(_) => Opcode::InitRequest,
            Self::InitResponse(_) => Opcode::InitResponse,
            Self::CallRequest { .. } => Opcode::CallRequest,
            Self::CallResponse { .. } => Opcode::CallResponse,
            Self::CallRequestContinue(_) => Opcode::CallRequestContinue,
            Self::CallResponseContinue(_) => Opcode::CallResponseContinue,
            Self::Cancel(_) => Opcode::Cancel,
            Self::Claim(_) => Opcode::Claim,
            Self::PingRequest => Opcode::PingRequest,
            Self::PingResponse => Opcode::PingResponse,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Interpret a frame's payload according to its type.
    ///
    /// # Errors
    ///
    /// Any field-level decode failure. These are scoped to the message, not
    /// the stream: the frame boundary is already known.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame.opcode();
        let mut reader = Reader::new(frame.payload().clone());

        let payload = match opcode {
            Opcode::InitRequest => Self::InitRequest(Init::decode(&mut reader, opcode)?),
            Opcode::InitResponse => Self::InitResponse(Init::decode(&mut reader, opcode)?),
            Opcode::CallRequest => {
                let (head, body) = call::decode_request(&mut reader)?;
                Self::CallRequest { head, body }
            },
            Opcode::CallResponse => {
                let (head, body) = call::decode_response(&mut reader)?;
                Self::CallResponse { head, body }
            },
            Opcode::CallRequestContinue => {
                Self::CallRequestContinue(call::decode_continuation(&mut reader)?)
            },
            Opcode::CallResponseContinue => {
                Self::CallResponseContinue(call::decode_continuation(&mut reader)?)
            },
            Opcode::Cancel => {
                let cancel = Cancel::decode(&mut reader)?;
                reader.finish(opcode)?;
                Self::Cancel(cancel)
            },
            Opcode::Claim => {
                let claim = Claim::decode(&mut reader)?;
                reader.finish(opcode)?;
                Self::Claim(claim)
            },
            Opcode::PingRequest => {
                reader.finish(opcode)?;
                Self::PingRequest
            },
            Opcode::PingResponse => {
                reader.finish(opcode)?;
                Self::PingResponse
            },
            Opcode::Error => {
                let error = ErrorMessage::decode(&mut reader)?;
                reader.finish(opcode)?;
                Self::Error(error)
            },
        };
        Ok(payload)
    }

    /// Encode into a frame with the given id.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` if the encoding exceeds one frame, or a field-level
    /// length overflow.
    pub fn into_frame(self, id: MessageId) -> Result<Frame> {
        let mut buf = BytesMut::new();
        match &self {
            Self::InitRequest(init) | Self::InitResponse(init) => init.encode(&mut buf)?,
            Self::CallRequest { head, body } => call::encode_request(head, body, &mut buf)?,
            Self::CallResponse { head, body } => call::encode_response(head, body, &mut buf)?,
            Self::CallRequestContinue(body) | Self::CallResponseContinue(body) => {
                call::encode_continuation(body, &mut buf)?;
            },
            Self::Cancel(cancel) => cancel.encode(&mut buf)?,
            Self::Claim(claim) => claim.encode(&mut buf),
            Self::PingRequest | Self::PingResponse => {},
            Self::Error(error) => error.encode(&mut buf)?,
        }
        Frame::new(self.opcode(), id, buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::{ChecksumType, CallFlags, ProtocolError, TraceContext};

    fn arb_tracing() -> impl Strategy<Value = TraceContext> {
        (any::<u64>(), any::<u64>(), any::<u64>(), any::<u8>()).prop_map(
            |(trace_id, span_id, parent_id, flags)| TraceContext { trace_id, span_id, parent_id, flags },
        )
    }

    fn arb_headers() -> impl Strategy<Value = Headers> {
        prop::collection::vec(("[a-z]{1,8}", "[ -~]{0,16}"), 0..4)
    }

    fn arb_body() -> impl Strategy<Value = CallBody> {
        (
            any::<bool>(),
            prop_oneof![Just(ChecksumType::None), Just(ChecksumType::Crc32C), Just(ChecksumType::Xxh32)],
            prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..4),
            any::<u32>(),
        )
            .prop_map(|(more, checksum_type, chunks, value)| {
                let flags = if more { CallFlags::MORE_FRAGMENTS } else { CallFlags::empty() };
                let checksum = (!more && checksum_type != ChecksumType::None).then_some(value);
                CallBody {
                    flags,
                    checksum_type,
                    chunks: chunks.into_iter().map(Bytes::from).collect(),
                    checksum,
                }
            })
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            arb_headers().prop_map(|headers| Payload::InitRequest(Init { version: 2, headers })),
            (any::<u32>(), arb_tracing(), "[a-z]{0,12}", arb_headers(), arb_body()).prop_map(
                |(ttl_ms, tracing, service, headers, body)| Payload::CallRequest {
                    head: CallRequestHead { ttl_ms, tracing, service, headers },
                    body,
                }
            ),
            (any::<bool>(), arb_tracing(), arb_headers(), arb_body()).prop_map(
                |(failed, tracing, headers, body)| Payload::CallResponse {
                    head: CallResponseHead {
                        code: if failed { ResponseCode::Error } else { ResponseCode::Ok },
                        tracing,
                        headers,
                    },
                    body,
                }
            ),
            arb_body().prop_map(Payload::CallRequestContinue),
            arb_body().prop_map(Payload::CallResponseContinue),
            (any::<u32>(), arb_tracing(), ".{0,20}")
                .prop_map(|(ttl_ms, tracing, why)| Payload::Cancel(Cancel { ttl_ms, tracing, why })),
            (any::<u32>(), arb_tracing())
                .prop_map(|(ttl_ms, tracing)| Payload::Claim(Claim { ttl_ms, tracing })),
            Just(Payload::PingRequest),
            Just(Payload::PingResponse),
            ".{0,40}".prop_map(|m| Payload::Error(ErrorMessage::new(ErrorCode::Declined, m))),
        ]
    }

    proptest! {
        #[test]
        fn payload_survives_frame_encoding(payload in arb_payload(), id in any::<u32>()) {
            let frame = payload.clone().into_frame(id)?;
            let bytes = frame.to_bytes();
            let decoded = match crate::Frame::decode(&bytes)? {
                crate::Decoded::Frame { frame, .. } => frame,
                crate::Decoded::NeedMoreBytes { .. } => panic!("whole frame supplied"),
            };
            prop_assert_eq!(decoded.id(), id);
            prop_assert_eq!(Payload::from_frame(&decoded)?, payload);
        }
    }

    #[test]
    fn ping_has_empty_payload() {
        let frame = Payload::PingRequest.into_frame(7).unwrap();
        insta::assert_snapshot!(hex::encode(frame.to_bytes()), @"0008d00000000007");
    }

    #[test]
    fn ping_with_payload_rejected() {
        let frame = Frame::new(Opcode::PingRequest, 1, vec![0]).unwrap();
        assert!(matches!(
            Payload::from_frame(&frame),
            Err(ProtocolError::TrailingBytes { opcode: Opcode::PingRequest, len: 1 })
        ));
    }

    #[test]
    fn oversized_error_message_rejected() {
        let error = ErrorMessage::new(ErrorCode::UnexpectedError, "x".repeat(65_500));
        assert!(matches!(
            Payload::Error(error).into_frame(3),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_call_request() {
        let frame = Frame::new(Opcode::CallRequest, 1, vec![0x00, 0x00, 0x00]).unwrap();
        assert!(matches!(Payload::from_frame(&frame), Err(ProtocolError::Truncated { .. })));
    }
}
