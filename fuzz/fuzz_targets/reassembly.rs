//! Arbitrary call bodies through the reassembler.
//!
//! Each input is split into chunk bodies; the reassembler must either
//! reject them or produce at most three arguments in order.

#![no_main]

use libfuzzer_sys::fuzz_target;
use muxwire_proto::{ChecksumType, Frame, Opcode, Payload, Reassembler};

fuzz_target!(|data: &[u8]| {
    let Some((&kind, rest)) = data.split_first() else { return };
    let Ok(kind) = ChecksumType::from_u8(kind % 4) else { return };
    let mut reassembler = Reassembler::new(kind);

    let mut next_index = 0;
    for chunk in rest.chunks(64) {
        let Ok(frame) = Frame::new(Opcode::CallRequestContinue, 1, chunk.to_vec()) else { return };
        let Ok(Payload::CallRequestContinue(body)) = Payload::from_frame(&frame) else { return };
        match reassembler.push(&body) {
            Ok(arguments) => {
                for argument in arguments {
                    assert_eq!(argument.index, next_index);
                    next_index += 1;
                }
                assert!(next_index <= 3);
            },
            Err(_) => return,
        }
        if reassembler.is_complete() {
            return;
        }
    }
});
