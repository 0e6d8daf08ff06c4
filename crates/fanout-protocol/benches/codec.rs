//! Codec benchmarks for fanout-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fanout_protocol::{codec, resp, ServerFrame};

fn bench_decode_control(c: &mut Criterion) {
    let frame = br#"{"action":"subscribe","channel":"metrics:dashboard"}"#;

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("control", |b| b.iter(|| codec::decode(black_box(frame))));
    group.finish();
}

fn bench_encode_delivery(c: &mut Criterion) {
    let payload = vec![b'x'; 256];
    let frame = ServerFrame::delivery("metrics:dashboard", &payload);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(256));
    group.bench_function("delivery_256B", |b| {
        b.iter(|| codec::encode(black_box(&frame)))
    });
    group.finish();
}

fn bench_resp_push(c: &mut Criterion) {
    let payload = vec![b'x'; 256];
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&resp::encode_command(&[
        b"message",
        b"metrics:dashboard",
        &payload,
    ]));
    let wire = wire.freeze();

    c.bench_function("resp_message_256B", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&wire[..]);
            resp::decode_from(black_box(&mut buf)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_decode_control,
    bench_encode_delivery,
    bench_resp_push
);
criterion_main!(benches);
