//! Wire codec benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kcp_relay::wire::{
    encode_payload_body, rewrite_payload_sender, ClientMessage, ServerMessage,
};

fn bench_payload_decode(c: &mut Criterion) {
    let frame = ClientMessage::Payload(encode_payload_body(1, 0, 0, &[0xAB; 256])).encode();
    c.bench_function("decode_payload_256", |b| {
        b.iter(|| ClientMessage::decode(black_box(&frame)).unwrap())
    });
}

fn bench_rewrite_and_relay(c: &mut Criterion) {
    let body = encode_payload_body(1, 0, 0, &[0xCD; 1024]);
    c.bench_function("rewrite_and_relay_1k", |b| {
        b.iter(|| {
            let rewritten = rewrite_payload_sender(black_box(&body), 2);
            ServerMessage::PayloadRelay(rewritten).encode()
        })
    });
}

fn bench_preview_list(c: &mut Criterion) {
    let previews: Vec<_> = (0..64u64)
        .map(|id| kcp_relay::wire::SessionPreview {
            session_id: id,
            name: format!("session-{id}"),
            max_members: 8,
            current_members: 4,
        })
        .collect();
    c.bench_function("encode_preview_list_64", |b| {
        b.iter(|| kcp_relay::wire::encode_preview_list(black_box(&previews)))
    });
}

criterion_group!(
    benches,
    bench_payload_decode,
    bench_rewrite_and_relay,
    bench_preview_list
);
criterion_main!(benches);
