//! Fuzz target for the Engine.IO and Socket.IO packet decoders.
//!
//! Any input must decode to a packet or an error without panicking, and a
//! decoded Socket.IO packet must survive re-encoding.
//!
//! Run with: cargo +nightly fuzz run packet_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use ship_client::socketio::packet::decode_payload;
use ship_client::socketio::{EnginePacket, SocketPacket};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    let _ = EnginePacket::decode(input);
    for packet in decode_payload(input).into_iter().flatten() {
        let _ = packet.encode();
    }

    if let Ok(packet) = SocketPacket::decode(input) {
        let encoded = packet.encode();
        assert!(
            SocketPacket::decode(&encoded).is_ok(),
            "re-encoded packet failed to decode: {encoded:?}"
        );
    }
});
