//! Fuzz target for the buffered packet decoder.
//!
//! Feeds arbitrary bytes in two chunks and drains every complete packet.

#![no_main]
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use wisp_proto::ssh::transport::PacketCodec;
use wisp_proto::ssh::Role;

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |b| *b as usize).min(data.len());
    let mut codec = PacketCodec::new(Role::Client);
    let mut buffer = BytesMut::new();

    for chunk in [&data[..split], &data[split..]] {
        buffer.extend_from_slice(chunk);
        while let Ok(Some(_)) = codec.decode(&mut buffer) {}
    }
});
