//! Fuzz the handshake-envelope JSON decoder.
//!
//! Arbitrary content must never panic the parser, and anything that does
//! parse must re-serialize and parse back to an equal envelope.

#![no_main]

use libfuzzer_sys::fuzz_target;
use marmot_proto::HandshakeEnvelope;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(envelope) = serde_json::from_str::<HandshakeEnvelope>(text) {
        let reserialized = serde_json::to_string(&envelope).expect("envelope serializes");
        let reparsed: HandshakeEnvelope =
            serde_json::from_str(&reserialized).expect("round-trip parse");
        assert_eq!(reparsed, envelope);
    }
});
