//! Codec benchmarks for roomcast-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use roomcast_protocol::{codec, Frame, MessageKind};

fn chat_frame(text_len: usize) -> Frame {
    Frame::MessagePosted {
        room_id: "6f1c0d1e-lobby".into(),
        message_id: "msg-000001".into(),
        user_id: Some("user-42".into()),
        username: "alice".into(),
        text: "x".repeat(text_len),
        ts: 1_700_000_000_000,
        kind: MessageKind::User,
    }
}

fn bench_encode_message(c: &mut Criterion) {
    let frame = chat_frame(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("message_64B", |b| {
        b.iter(|| codec::encode(black_box(&frame)))
    });
    group.bench_function("ping", |b| b.iter(|| codec::encode(black_box(&Frame::Ping))));
    group.finish();
}

fn bench_decode_message(c: &mut Criterion) {
    let encoded = codec::encode(&chat_frame(64)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("message_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_json_event(c: &mut Criterion) {
    let frame = chat_frame(256);

    c.bench_function("json_message_256B", |b| {
        b.iter(|| black_box(&frame).to_json().unwrap())
    });
}

criterion_group!(
    benches,
    bench_encode_message,
    bench_decode_message,
    bench_json_event
);
criterion_main!(benches);
