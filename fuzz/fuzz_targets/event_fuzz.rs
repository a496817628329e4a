//! Fuzz target for domain event decoding.
//!
//! The first line of input is the event name and the rest its JSON payload.
//! Decoding must never panic, and a decoded event keeps its wire name.
//!
//! Run with: cargo +nightly fuzz run event_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use ship_core::DomainEvent;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (name, body) = input.split_once('\n').unwrap_or((input, "null"));
    let Ok(payload) = serde_json::from_str::<Value>(body) else {
        return;
    };

    if let Ok(event) = DomainEvent::decode(name, &payload) {
        assert_eq!(event.kind().as_str(), name);
        let _ = event.message_snippet();
    }
});
