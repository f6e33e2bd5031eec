//! SSH packet codec benchmarks
//!
//! Measures framing and sealing throughput for channel-data sized payloads.
//!
//! Run with: `cargo bench -p wisp-proto --bench packet_codec`

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use wisp_proto::ssh::cipher::{CipherAlgorithm, DirectionKeys, PacketOpener, PacketSealer};
use wisp_proto::ssh::transport::PacketCodec;
use wisp_proto::ssh::{Packet, Role};

const PAYLOAD_SIZES: [usize; 3] = [64, 1024, 16 * 1024];

fn keys(algorithm: CipherAlgorithm) -> DirectionKeys {
    DirectionKeys {
        algorithm,
        key: vec![0x42; algorithm.key_len()],
        iv: vec![0x24; algorithm.iv_len()],
    }
}

fn sealed_pair(algorithm: CipherAlgorithm) -> (PacketCodec, PacketCodec) {
    let mut client = PacketCodec::new(Role::Client);
    let mut server = PacketCodec::new(Role::Server);
    let keys = keys(algorithm);
    client.install_sealer(PacketSealer::new(&keys).unwrap(), true);
    server.install_opener(PacketOpener::new(&keys).unwrap(), true);
    (client, server)
}

fn bench_clear_packets(c: &mut Criterion) {
    let mut group = c.benchmark_group("clear_packet");

    for size in PAYLOAD_SIZES {
        let payload = vec![0x5e; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("to_from_bytes", size), &payload, |b, p| {
            b.iter(|| {
                let wire = Packet::new(p.clone()).unwrap().to_bytes();
                black_box(Packet::from_bytes(&wire).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_sealed_packets(c: &mut Criterion) {
    let mut group = c.benchmark_group("sealed_packet");

    for algorithm in [
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes256Gcm,
    ] {
        for size in PAYLOAD_SIZES {
            let payload = vec![0x5e; size];
            let (mut client, mut server) = sealed_pair(algorithm);
            let mut buffer = BytesMut::with_capacity(size + 256);

            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(
                BenchmarkId::new(algorithm.name(), size),
                &payload,
                |b, p| {
                    b.iter(|| {
                        buffer.extend_from_slice(&client.encode(p).unwrap());
                        black_box(server.decode(&mut buffer).unwrap());
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_clear_packets, bench_sealed_packets);
criterion_main!(benches);
