//! Fixed 8-byte frame header.
//!
//! ```text
//! 0        2      3          4           8
//! ┌────────┬──────┬──────────┬───────────┐
//! │ size:2 │ type │ reserved │   id:4    │
//! └────────┴──────┴──────────┴───────────┘
//! ```
//!
//! `size` counts the whole frame including the header, big-endian. The
//! reserved byte is written as zero and ignored on read.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::network_endian::{U16, U32},
};

use crate::{
    errors::{CorruptFrame, ProtocolError, Result},
    opcodes::Opcode,
};

/// Identifier correlating every frame of one call or ping exchange.
pub type MessageId = u32;

/// Id used by the handshake and by connection-level errors. Never allocated
/// to calls.
pub const RESERVED_ID: MessageId = 0xFFFF_FFFF;

/// Wire layout of the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    size: U16,
    message_type: u8,
    reserved: u8,
    id: U32,
}

impl FrameHeader {
    /// Encoded header length.
    pub const SIZE: usize = 8;

    /// Largest frame the 16-bit size field can describe.
    pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

    /// Largest payload that fits in one frame.
    pub const MAX_PAYLOAD_SIZE: usize = Self::MAX_FRAME_SIZE - Self::SIZE;

    /// Build a header for a payload of `payload_len` bytes.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` if the frame would exceed [`Self::MAX_FRAME_SIZE`].
    pub fn new(opcode: Opcode, id: MessageId, payload_len: usize) -> Result<Self> {
        if payload_len > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: Self::SIZE + payload_len,
                max: Self::MAX_FRAME_SIZE,
            });
        }
        Ok(Self::for_payload(opcode, id, payload_len))
    }

    /// Header for a payload already known to fit.
    pub(crate) fn for_payload(opcode: Opcode, id: MessageId, payload_len: usize) -> Self {
        debug_assert!(payload_len <= Self::MAX_PAYLOAD_SIZE);
        Self {
            size: U16::new((Self::SIZE + payload_len) as u16),
            message_type: opcode.to_u8(),
            reserved: 0,
            id: U32::new(id),
        }
    }

    /// Borrow a header from the front of `bytes` and validate it.
    ///
    /// Returns `Ok(None)` when fewer than [`Self::SIZE`] bytes are available.
    ///
    /// # Errors
    ///
    /// `CorruptFrame`, fatal for the stream.
    pub fn parse(bytes: &[u8]) -> Result<Option<&Self>> {
        let Ok((header, _)) = Self::ref_from_prefix(bytes) else {
            return Ok(None);
        };

        if usize::from(header.size()) < Self::SIZE {
            return Err(ProtocolError::CorruptFrame(CorruptFrame::SizeBelowHeader {
                size: header.size(),
                min: Self::SIZE,
            }));
        }
        header.opcode()?;

        Ok(Some(header))
    }

    /// Total frame size in bytes, header included.
    pub fn size(&self) -> u16 {
        self.size.get()
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        usize::from(self.size()).saturating_sub(Self::SIZE)
    }

    /// Raw type byte.
    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    /// Decoded message type.
    ///
    /// # Errors
    ///
    /// `CorruptFrame` if the byte names no message.
    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::from_u8(self.message_type)
            .ok_or(ProtocolError::CorruptFrame(CorruptFrame::UnknownType(self.message_type)))
    }

    /// Message id.
    pub fn id(&self) -> MessageId {
        self.id.get()
    }
}
