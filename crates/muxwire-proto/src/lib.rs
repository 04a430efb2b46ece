//! Wire format for the muxwire RPC protocol.
//!
//! Every unit on the socket is a frame: a fixed 8-byte header (total size,
//! message type, reserved byte, message id) followed by a type-specific
//! payload. Calls carry three opaque arguments which may be larger than a
//! single frame, so they are cut into length-prefixed chunks and spread over a
//! call frame plus any number of continuation frames.
//!
//! This crate is pure data handling with no I/O:
//!
//! - [`frame`] and [`header`]: the framing layer, streaming decode
//! - [`payloads`]: the closed set of message bodies
//! - [`checksum`]: argument checksums (CRC32, xxHash32, CRC32C)
//! - [`fragment`] and [`reassembly`]: splitting and rebuilding arguments
//!
//! # Security
//!
//! Header parsing goes through `zerocopy` layouts. Declared sizes are checked
//! against the header length before anything is buffered, and the 16-bit size
//! field caps memory per frame at 64 KiB. A corrupt frame cannot be skipped
//! (there is no resynchronisation marker), so callers must treat
//! [`ProtocolError::is_corrupt_frame`] as fatal for the byte stream.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;

pub mod checksum;
pub mod errors;
pub mod flags;
pub mod fragment;
pub mod frame;
pub mod frame_buffer;
pub mod header;
pub mod opcodes;
pub mod payloads;
pub mod reassembly;
pub mod trace;

pub use checksum::{Checksum, ChecksumType};
pub use errors::{CorruptFrame, ProtocolError, Result};
pub use flags::CallFlags;
pub use fragment::{ARG_COUNT, Fragmenter};
pub use frame::{Decoded, Frame};
pub use frame_buffer::FrameBuffer;
pub use header::{FrameHeader, MessageId, RESERVED_ID};
pub use opcodes::Opcode;
pub use payloads::{
    CallBody, CallRequestHead, CallResponseHead, Cancel, Claim, ErrorCode, ErrorMessage, Headers,
    Init, PROTOCOL_VERSION, Payload, ResponseCode,
};
pub use reassembly::{Argument, ReassemblyError, Reassembler};
pub use trace::TraceContext;
