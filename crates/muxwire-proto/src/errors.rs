//! Protocol-level errors.

use crate::opcodes::Opcode;

/// Errors raised while encoding or decoding frames and payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Header cannot be trusted; frame boundaries are lost.
    #[error("corrupt frame: {0}")]
    CorruptFrame(CorruptFrame),

    /// Encoded frame would not fit the 16-bit size field.
    #[error("frame of {size} bytes exceeds the {max}-byte maximum")]
    FrameTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Largest permitted frame.
        max: usize,
    },

    /// Payload ended before a fixed-size field could be read.
    #[error("truncated payload: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the field.
        needed: usize,
        /// Bytes left in the payload.
        available: usize,
    },

    /// Argument chunk length prefix runs past the end of the payload.
    #[error("malformed argument chunk: length {len} with {available} bytes remaining")]
    MalformedArgument {
        /// Length claimed by the prefix.
        len: usize,
        /// Bytes actually left.
        available: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidString {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A field does not fit its length prefix.
    #[error("{field} is {len} bytes, over the {max}-byte limit")]
    FieldTooLong {
        /// Name of the offending field.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum the prefix can express.
        max: usize,
    },

    /// Enumerated byte has no known meaning.
    #[error("unknown {field} {value:#04x}")]
    UnknownCode {
        /// Name of the field.
        field: &'static str,
        /// Raw value.
        value: u8,
    },

    /// Bytes left over after a fixed-layout payload.
    #[error("{len} trailing bytes after {opcode:?} payload")]
    TrailingBytes {
        /// Message type being decoded.
        opcode: Opcode,
        /// Unconsumed byte count.
        len: usize,
    },

    /// Final fragment with a checksum type but no checksum value.
    #[error("final fragment is missing its checksum")]
    MissingChecksum,

    /// Call head alone leaves no room for argument chunks.
    #[error("call head of {head} bytes leaves no room for arguments in a {max_frame}-byte frame")]
    HeadTooLarge {
        /// Encoded head length.
        head: usize,
        /// Frame size limit in use.
        max_frame: usize,
    },
}

/// What made a header unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CorruptFrame {
    /// Declared frame size is smaller than the fixed header.
    #[error("declared size {size} is below the {min}-byte header")]
    SizeBelowHeader {
        /// Size field read from the header.
        size: u16,
        /// Header length.
        min: usize,
    },

    /// Message type byte does not name any known message.
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
}

impl ProtocolError {
    /// True for errors that make the byte stream unrecoverable.
    ///
    /// After a bad header the position of the next frame is unknown, so the
    /// connection has to be torn down.
    pub fn is_corrupt_frame(&self) -> bool {
        matches!(self, Self::CorruptFrame(_))
    }
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
