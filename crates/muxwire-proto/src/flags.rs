//! Call frame flags.

use bitflags::bitflags;

bitflags! {
    /// First byte of every call, response and continuation payload.
    ///
    /// Receivers ignore bits they do not know.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallFlags: u8 {
        /// More frames with this message id follow.
        const MORE_FRAGMENTS = 0x01;
    }
}

impl CallFlags {
    /// Keep unknown bits so they survive a decode/encode cycle.
    pub fn from_wire(raw: u8) -> Self {
        Self::from_bits_retain(raw)
    }

    /// True when this is the last frame of the message.
    pub fn is_final(self) -> bool {
        !self.contains(Self::MORE_FRAGMENTS)
    }
}
