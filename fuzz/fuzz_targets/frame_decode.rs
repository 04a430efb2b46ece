//! Arbitrary bytes through the frame decoder and the streaming buffer.
//!
//! Both must agree on every frame they both produce, and any frame they produce must re-encode to the bytes
//! it was decoded from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use muxwire_proto::{Decoded, Frame, FrameBuffer};

fuzz_target!(|data: &[u8]| {
    let mut direct = Vec::new();
    let mut rest = data;
    while let Ok(Decoded::Frame { frame, consumed }) = Frame::decode(rest) {
        assert_eq!(frame.to_bytes().as_ref(), &rest[..consumed]);
        direct.push(frame);
        rest = &rest[consumed..];
    }

    // Feed in uneven slices to exercise partial headers and payloads.
    let mut buffer = FrameBuffer::new();
    let mut streamed = Vec::new();
    for chunk in data.chunks(7) {
        match buffer.push(chunk) {
            Ok(frames) => streamed.extend(frames),
            Err(_) => break,
        }
    }

    for (a, b) in direct.iter().zip(&streamed) {
        assert_eq!(a, b);
    }
});
