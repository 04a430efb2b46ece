//! A complete frame: header fields plus raw payload bytes.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::IntoBytes;

use crate::{
    errors::{ProtocolError, Result},
    header::{FrameHeader, MessageId},
    opcodes::Opcode,
};

/// One protocol frame.
///
/// The payload is kept opaque here; [`crate::Payload::from_frame`] interprets
/// it. Frames are validated on construction, so encoding cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: Opcode,
    id: MessageId,
    payload: Bytes,
}

/// Outcome of decoding from the front of a byte slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A whole frame was available.
    Frame {
        /// The decoded frame.
        frame: Frame,
        /// Bytes consumed from the input.
        consumed: usize,
    },
    /// The input ends mid-frame.
    NeedMoreBytes {
        /// Minimum total input length to make progress.
        needed: usize,
    },
}

impl Frame {
    /// Build a frame.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` if the payload exceeds [`FrameHeader::MAX_PAYLOAD_SIZE`].
    pub fn new(opcode: Opcode, id: MessageId, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > FrameHeader::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: FrameHeader::SIZE + payload.len(),
                max: FrameHeader::MAX_FRAME_SIZE,
            });
        }
        Ok(Self { opcode, id, payload })
    }

    /// Message type.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Message id.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size on the wire, header included.
    pub fn encoded_len(&self) -> usize {
        FrameHeader::SIZE + self.payload.len()
    }

    fn header(&self) -> FrameHeader {
        FrameHeader::for_payload(self.opcode, self.id, self.payload.len())
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(self.header().as_bytes());
        dst.put_slice(&self.payload);
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one frame from the front of `src`.
    ///
    /// # Errors
    ///
    /// Corrupt-frame errors from [`FrameHeader::parse`].
    pub fn decode(src: &[u8]) -> Result<Decoded> {
        let Some(header) = FrameHeader::parse(src)? else {
            return Ok(Decoded::NeedMoreBytes { needed: FrameHeader::SIZE });
        };

        let size = usize::from(header.size());
        if src.len() < size {
            return Ok(Decoded::NeedMoreBytes { needed: size });
        }

        let frame = Self {
            opcode: header.opcode()?,
            id: header.id(),
            payload: Bytes::copy_from_slice(&src[FrameHeader::SIZE..size]),
        };
        Ok(Decoded::Frame { frame, consumed: size })
    }

    /// Split a frame off the front of `buf` without copying the payload.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when it holds less than a
    /// whole frame.
    pub(crate) fn split_from(buf: &mut BytesMut) -> Result<Option<Self>> {
        let (opcode, id, size) = match FrameHeader::parse(buf)? {
            Some(header) => (header.opcode()?, header.id(), usize::from(header.size())),
            None => return Ok(None),
        };
        if buf.len() < size {
            return Ok(None);
        }

        let payload = buf.split_to(size).freeze().slice(FrameHeader::SIZE..);
        Ok(Some(Self { opcode, id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_hex(frame: &Frame) -> String {
        hex::encode(frame.to_bytes())
    }

    #[test]
    fn ping_request_bytes() {
        let frame = Frame::new(Opcode::PingRequest, 7, Bytes::new()).unwrap();
        insta::assert_snapshot!(encode_hex(&frame), @"0008d00000000007");
    }

    #[test]
    fn decode_complete_frame() {
        let bytes = hex_literal::hex!("000bff000000002a010203 ffff");
        let Decoded::Frame { frame, consumed } = Frame::decode(&bytes).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(consumed, 11);
        assert_eq!(frame.opcode(), Opcode::Error);
        assert_eq!(frame.id(), 42);
        assert_eq!(frame.payload().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn decode_partial_header() {
        assert_eq!(Frame::decode(&[0x00]).unwrap(), Decoded::NeedMoreBytes { needed: 8 });
    }

    #[test]
    fn decode_partial_payload() {
        let bytes = hex_literal::hex!("0010030000000001 0000");
        assert_eq!(Frame::decode(&bytes).unwrap(), Decoded::NeedMoreBytes { needed: 16 });
    }

    #[test]
    fn max_payload_accepted() {
        let payload = vec![0u8; FrameHeader::MAX_PAYLOAD_SIZE];
        let frame = Frame::new(Opcode::CallRequestContinue, 1, payload).unwrap();
        assert_eq!(frame.encoded_len(), 65535);
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; FrameHeader::MAX_PAYLOAD_SIZE + 1];
        assert!(Frame::new(Opcode::CallRequestContinue, 1, payload).is_err());
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let frame = Frame::new(Opcode::Cancel, 0xdead_beef, vec![9u8; 40]).unwrap();
        let bytes = frame.to_bytes();
        let Decoded::Frame { frame: decoded, consumed } = Frame::decode(&bytes).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }
}
