//! Message type codes.

/// Message type carried in byte 2 of every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Connection handshake, sent by the initiator.
    InitRequest = 0x01,
    /// Connection handshake reply.
    InitResponse = 0x02,
    /// First frame of an outbound call.
    CallRequest = 0x03,
    /// First frame of a call's response.
    CallResponse = 0x04,
    /// Further argument bytes of a call request.
    CallRequestContinue = 0x13,
    /// Further argument bytes of a call response.
    CallResponseContinue = 0x14,
    /// Caller abandons a call.
    Cancel = 0xc0,
    /// Another responder has taken the call.
    Claim = 0xc1,
    /// Liveness probe.
    PingRequest = 0xd0,
    /// Liveness probe reply.
    PingResponse = 0xd1,
    /// Failure for a call, or for the connection when sent on the reserved id.
    Error = 0xff,
}

impl Opcode {
    /// Parse a raw type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::InitRequest,
            0x02 => Self::InitResponse,
            0x03 => Self::CallRequest,
            0x04 => Self::CallResponse,
            0x13 => Self::CallRequestContinue,
            0x14 => Self::CallResponseContinue,
            0xc0 => Self::Cancel,
            0xc1 => Self::Claim,
            0xd0 => Self::PingRequest,
            0xd1 => Self::PingResponse,
            0xff => Self::Error,
            _ => return None,
        })
    }

    /// Raw type byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Frames that carry argument chunks.
    pub fn carries_arguments(self) -> bool {
        matches!(
            self,
            Self::CallRequest
                | Self::CallResponse
                | Self::CallRequestContinue
                | Self::CallResponseContinue
        )
    }
}
