//! Accumulates socket reads and yields complete frames.
//!
//! Reads land at arbitrary byte boundaries. `FrameBuffer` keeps the unparsed
//! tail in a single `BytesMut` and hands out frames whose payloads are slices
//! of that buffer, so no per-frame copy is made.

use bytes::BytesMut;

use crate::{errors::Result, frame::Frame, header::FrameHeader};

/// Streaming frame decoder.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    /// Empty buffer sized for one maximum frame.
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(FrameHeader::MAX_FRAME_SIZE) }
    }

    /// Append `data` and extract every complete frame now available.
    ///
    /// A trailing partial frame stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Any corrupt header. The buffer is unusable afterwards because frame
    /// boundaries can no longer be found.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = Frame::split_from(&mut self.buffer)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes};

    use super::*;
    use crate::opcodes::Opcode;

    fn ping(id: u32) -> Frame {
        Frame::new(Opcode::PingRequest, id, Bytes::new()).unwrap()
    }

    #[test]
    fn two_frames_and_a_fragment() {
        let mut wire = BytesMut::new();
        ping(1).encode(&mut wire);
        Frame::new(Opcode::Error, 2, vec![0xff; 10]).unwrap().encode(&mut wire);
        wire.put_slice(&[0x00, 0x08, 0xd0]);

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&wire).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id(), 1);
        assert_eq!(frames[1].payload().len(), 10);
        assert_eq!(buffer.buffered(), 3);

        let frames = buffer.push(&[0, 0, 0, 0, 3]).unwrap();
        assert_eq!(frames, vec![ping(3)]);
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time() {
        let frame = Frame::new(Opcode::CallRequestContinue, 9, vec![1, 2, 3, 4, 5]).unwrap();
        let wire = frame.to_bytes();

        let mut buffer = FrameBuffer::new();
        let mut out = Vec::new();
        for byte in wire.iter() {
            out.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn corrupt_header_surfaces() {
        let mut buffer = FrameBuffer::new();
        let err = buffer.push(&[0x00, 0x08, 0x77, 0, 0, 0, 0, 1]).unwrap_err();
        assert!(err.is_corrupt_frame());
    }
}
