//! Fuzz the media wire-frame decoder.
//!
//! Decoding must never panic, and every successful decode must re-encode
//! to the original bytes (the format has no redundancy to normalize).

#![no_main]

use libfuzzer_sys::fuzz_target;
use marmot_proto::MediaFrame;

fuzz_target!(|data: &[u8]| {
    match MediaFrame::decode(data) {
        Ok(frame) => {
            assert_eq!(frame.encode().as_ref(), data, "decode/encode must round-trip");
            // Generation is always the counter's high byte.
            assert_eq!(frame.generation(), (frame.counter >> 24) as u8);
            assert_eq!(frame.intra_counter(), frame.counter & 0x00FF_FFFF);
        }
        Err(_) => {
            // Only undersized inputs may fail.
            assert!(data.len() < marmot_proto::frame::MIN_FRAME_LEN);
        }
    }
});
