//! Arbitrary frames fed to an established connection.
//!
//! The state machine must never panic, and after any input it must either
//! still be usable or have closed cleanly.

#![no_main]

use std::time::{Duration, Instant};

use libfuzzer_sys::fuzz_target;
use muxwire_core::{Connection, ConnectionAction, ConnectionConfig, OutboundCall, Role};
use muxwire_proto::FrameBuffer;

fuzz_target!(|data: &[u8]| {
    let now = Instant::now();
    let mut client = Connection::new(ConnectionConfig::default(), Role::Initiator);
    let mut server = Connection::new(ConnectionConfig::default(), Role::Responder);

    let Ok(mut to_server) = client.start(now) else { return };
    server.start(now).ok();
    while let Some(ConnectionAction::SendFrame(frame)) = to_server.pop() {
        let Ok(replies) = server.handle_frame(&frame, now) else { return };
        for reply in replies {
            if let ConnectionAction::SendFrame(frame) = reply {
                client.handle_frame(&frame, now).ok();
            }
        }
    }

    let call = OutboundCall::new("svc", "method", "", "body", Duration::from_secs(1));
    client.send_call(call, now).ok();

    let mut buffer = FrameBuffer::new();
    let Ok(frames) = buffer.push(data) else { return };
    for frame in frames {
        if client.handle_frame(&frame, now).is_err() {
            break;
        }
    }
    client.tick(now + Duration::from_secs(2));
    assert_eq!(client.pending_calls(), 0);
});
