//! Arbitrary payload bytes under every message type.
//!
//! Decoding must never panic, and anything that decodes must survive a
//! second encode and decode unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use muxwire_proto::{Frame, Opcode, Payload};

fuzz_target!(|data: &[u8]| {
    let Some((&opcode, rest)) = data.split_first() else { return };
    let Some(opcode) = Opcode::from_u8(opcode) else { return };
    let Ok(frame) = Frame::new(opcode, 1, rest.to_vec()) else { return };

    if let Ok(payload) = Payload::from_frame(&frame) {
        let Ok(encoded) = payload.clone().into_frame(1) else { return };
        let decoded = Payload::from_frame(&encoded).expect("re-encoded payload decodes");
        assert_eq!(decoded, payload);
    }
});
