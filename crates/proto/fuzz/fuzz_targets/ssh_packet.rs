//! Fuzz target for plaintext SSH packet parsing.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use wisp_proto::ssh::Packet;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let reparsed = Packet::from_bytes(&packet.to_bytes()).expect("re-encoded packet must parse");
        assert_eq!(packet.payload(), reparsed.payload());
    }
});
