//! Splitting call arguments across frames.
//!
//! A call or response carries exactly [`ARG_COUNT`] arguments. They are
//! written in order as length-prefixed chunks, packed greedily into the first
//! frame after the head and then into continuation frames.
//!
//! # Chunk boundaries
//!
//! Within a frame every chunk except the last ends its argument. The last
//! chunk of a non-final frame leaves its argument open, and the first chunk
//! of the next frame continues it. The last chunk of the final frame closes
//! its argument. An argument that happens to end exactly at a frame boundary
//! is therefore closed by an empty chunk at the start of the next frame.

use bytes::Bytes;

use crate::{
    checksum::{Checksum, ChecksumType},
    errors::{ProtocolError, Result},
    flags::CallFlags,
    header::FrameHeader,
    payloads::{CHUNK_PREFIX, CallBody, CallRequestHead, CallResponseHead, Payload},
};

/// Arguments per call: method name, application headers, body.
pub const ARG_COUNT: usize = 3;

/// Smallest frame size a [`Fragmenter`] will use.
pub const MIN_FRAME_SIZE: usize = 64;

/// Flags byte plus checksum type byte, present in every call frame.
const BODY_OVERHEAD: usize = 2;

/// Cuts argument triples into [`CallBody`] sequences.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    checksum_type: ChecksumType,
    max_frame_size: usize,
}

impl Fragmenter {
    /// Fragmenter producing maximum-size frames.
    pub fn new(checksum_type: ChecksumType) -> Self {
        Self { checksum_type, max_frame_size: FrameHeader::MAX_FRAME_SIZE }
    }

    /// Limit frames to `size` bytes, clamped to
    /// [`MIN_FRAME_SIZE`]..=[`FrameHeader::MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.clamp(MIN_FRAME_SIZE, FrameHeader::MAX_FRAME_SIZE);
        self
    }

    /// Chunk bytes available in a frame whose head takes `head_len` bytes.
    fn budget(&self, head_len: usize) -> Option<usize> {
        self.max_frame_size
            .checked_sub(FrameHeader::SIZE + BODY_OVERHEAD + head_len + self.checksum_type.trailer_len())
            .filter(|budget| *budget > CHUNK_PREFIX)
    }

    /// Split `args` into frame bodies. The first body travels with a head of
    /// `head_len` encoded bytes, the rest in continuation frames.
    ///
    /// # Errors
    ///
    /// `HeadTooLarge` if the head leaves no room for a single argument byte.
    pub fn fragment(&self, head_len: usize, args: &[Bytes; ARG_COUNT]) -> Result<Vec<CallBody>> {
        let first_budget = self.budget(head_len).ok_or(ProtocolError::HeadTooLarge {
            head: head_len,
            max_frame: self.max_frame_size,
        })?;
        let next_budget = self.budget(0).unwrap_or(first_budget);

        let mut checksum = Checksum::new(self.checksum_type);
        let mut bodies = Vec::new();
        let mut arg = 0;
        let mut offset = 0;

        loop {
            let mut remaining = if bodies.is_empty() { first_budget } else { next_budget };
            let mut chunks = Vec::new();
            let mut last = false;

            while remaining >= CHUNK_PREFIX {
                let data = &args[arg];
                let left = data.len() - offset;
                let take = left.min(remaining - CHUNK_PREFIX);
                if take == 0 && left > 0 {
                    break;
                }

                let chunk = data.slice(offset..offset + take);
                checksum.update(&chunk);
                chunks.push(chunk);
                remaining -= CHUNK_PREFIX + take;
                offset += take;

                if offset < data.len() {
                    break;
                }
                if arg == ARG_COUNT - 1 {
                    last = true;
                    break;
                }
                // Starting the next argument here must make progress, or its
                // empty first chunk would be mistaken for a continuation.
                let next_fits = if args[arg + 1].is_empty() {
                    remaining >= CHUNK_PREFIX
                } else {
                    remaining > CHUNK_PREFIX
                };
                if !next_fits {
                    break;
                }
                arg += 1;
                offset = 0;
            }

            if last {
                bodies.push(CallBody {
                    flags: CallFlags::empty(),
                    checksum_type: self.checksum_type,
                    chunks,
                    checksum: (self.checksum_type != ChecksumType::None).then(|| checksum.finalize()),
                });
                return Ok(bodies);
            }
            bodies.push(CallBody {
                flags: CallFlags::MORE_FRAGMENTS,
                checksum_type: self.checksum_type,
                chunks,
                checksum: None,
            });
        }
    }

    /// Payload sequence for a call request.
    ///
    /// # Errors
    ///
    /// `HeadTooLarge` as for [`Self::fragment`].
    pub fn request(&self, head: CallRequestHead, args: &[Bytes; ARG_COUNT]) -> Result<Vec<Payload>> {
        let mut bodies = self.fragment(head.encoded_len(), args)?.into_iter();
        let mut payloads = Vec::with_capacity(bodies.len());
        if let Some(body) = bodies.next() {
            payloads.push(Payload::CallRequest { head, body });
        }
        payloads.extend(bodies.map(Payload::CallRequestContinue));
        Ok(payloads)
    }

    /// Payload sequence for a call response.
    ///
    /// # Errors
    ///
    /// `HeadTooLarge` as for [`Self::fragment`].
    pub fn response(&self, head: CallResponseHead, args: &[Bytes; ARG_COUNT]) -> Result<Vec<Payload>> {
        let mut bodies = self.fragment(head.encoded_len(), args)?.into_iter();
        let mut payloads = Vec::with_capacity(bodies.len());
        if let Some(body) = bodies.next() {
            payloads.push(Payload::CallResponse { head, body });
        }
        payloads.extend(bodies.map(Payload::CallResponseContinue));
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::reassembly::Reassembler;

    fn args(a: &[u8], b: &[u8], c: &[u8]) -> [Bytes; ARG_COUNT] {
        [Bytes::copy_from_slice(a), Bytes::copy_from_slice(b), Bytes::copy_from_slice(c)]
    }

    fn reassemble(kind: ChecksumType, bodies: &[CallBody]) -> Vec<Bytes> {
        let mut reassembler = Reassembler::new(kind);
        let mut out = Vec::new();
        for body in bodies {
            out.extend(reassembler.push(body).unwrap().into_iter().map(|arg| arg.bytes));
        }
        assert!(reassembler.is_complete());
        out
    }

    #[test]
    fn small_call_fits_one_frame() {
        let bodies = Fragmenter::new(ChecksumType::Crc32C)
            .fragment(40, &args(b"echo", b"", b"hello"))
            .unwrap();

        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].is_final());
        assert_eq!(bodies[0].chunks, vec![&b"echo"[..], &b""[..], &b"hello"[..]]);
        assert_eq!(bodies[0].checksum, Some(ChecksumType::Crc32C.compute(b"echohello")));
    }

    #[test]
    fn large_body_spans_frames() {
        let body = vec![0x5a; 200_000];
        let bodies = Fragmenter::new(ChecksumType::Crc32)
            .fragment(40, &args(b"m", b"", &body))
            .unwrap();

        assert_eq!(bodies.len(), 4);
        for body in &bodies[..3] {
            assert!(!body.is_final());
            assert_eq!(body.checksum, None);
        }
        assert!(bodies[3].is_final());

        let out = reassemble(ChecksumType::Crc32, &bodies);
        assert_eq!(out[2].len(), 200_000);
    }

    #[test]
    fn every_frame_fits_the_size_limit() {
        let fragmenter = Fragmenter::new(ChecksumType::Xxh32).with_max_frame_size(100);
        let head = CallRequestHead { service: "svc".into(), ..CallRequestHead::default() };
        let payloads = fragmenter.request(head, &args(&[1; 150], &[2; 7], &[3; 300])).unwrap();

        assert!(payloads.len() > 1);
        for payload in payloads {
            let frame = payload.into_frame(1).unwrap();
            assert!(frame.encoded_len() <= 100, "frame of {} bytes", frame.encoded_len());
        }
    }

    #[test]
    fn head_too_large_rejected() {
        let err = Fragmenter::new(ChecksumType::None)
            .with_max_frame_size(64)
            .fragment(60, &args(b"", b"", b""))
            .unwrap_err();
        assert_eq!(err, ProtocolError::HeadTooLarge { head: 60, max_frame: 64 });
    }

    #[test]
    fn frame_sizes_are_clamped() {
        let fragmenter = Fragmenter::new(ChecksumType::None).with_max_frame_size(1);
        assert_eq!(fragmenter.max_frame_size, MIN_FRAME_SIZE);
    }

    proptest! {
        #[test]
        fn fragments_reassemble_to_original(
            a in prop::collection::vec(any::<u8>(), 0..300),
            b in prop::collection::vec(any::<u8>(), 0..300),
            c in prop::collection::vec(any::<u8>(), 0..300),
            frame_size in MIN_FRAME_SIZE..400usize,
            head_len in 0..20usize,
            kind in prop_oneof![Just(ChecksumType::None), Just(ChecksumType::Crc32C)],
        ) {
            let bodies = Fragmenter::new(kind)
                .with_max_frame_size(frame_size)
                .fragment(head_len, &args(&a, &b, &c))?;

            let (last, rest) = bodies.split_last().unwrap();
            prop_assert!(last.is_final());
            prop_assert!(rest.iter().all(|body| !body.is_final()));

            let out = reassemble(kind, &bodies);
            prop_assert_eq!(out, vec![Bytes::from(a), Bytes::from(b), Bytes::from(c)]);
        }
    }
}
