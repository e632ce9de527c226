use bytes::BytesMut;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use skein_core::{Encryption, Frame, FrameBuilder, FrameCodec, HandleType, MessageType};

fn request(payload_len: usize, encryption: Encryption) -> Frame {
    FrameBuilder::new(HandleType::Request, MessageType::Payload)
        .request_id(42)
        .action("bench.echo")
        .header("trace-id", "0af7651916cd43dd8448eb211c80319c")
        .timeout_ms(5_000)
        .encryption(encryption)
        .payload(vec![0xAA; payload_len])
        .build()
}

fn bench_frame_encode(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let sizes: Vec<(usize, &str)> = vec![
        (0, "0_bytes"),
        (64, "64_bytes"),
        (1024, "1024_bytes"),
        (16 * 1024, "16_kib"),
        (256 * 1024, "256_kib"),
    ];

    let mut group = c.benchmark_group("frame_encode_by_size");
    for (size, name) in sizes {
        let frame = request(size, Encryption::None);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| b.iter(|| codec.encode(black_box(&frame))));
    }
    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let mut group = c.benchmark_group("frame_decode");

    for (encryption, name) in [(Encryption::None, "plain_1024"), (Encryption::Crc, "crc_1024")] {
        let wire = codec.encode(&request(1024, encryption)).unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut buf = BytesMut::from(&wire[..]);
                let mut decoder = codec.decoder();
                black_box(decoder.decode(&mut buf).unwrap())
            })
        });
    }

    group.finish();
}

fn bench_decode_chunked(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let wire = codec.encode(&request(4096, Encryption::None)).unwrap();

    let mut group = c.benchmark_group("frame_decode_chunked");
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("4096_in_64_byte_reads", |b| {
        b.iter(|| {
            let mut decoder = codec.decoder();
            let mut buf = BytesMut::with_capacity(wire.len());
            let mut frames = 0;
            for chunk in wire.chunks(64) {
                buf.extend_from_slice(chunk);
                while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                    black_box(frame);
                    frames += 1;
                }
            }
            frames
        })
    });

    group.finish();
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let frame = request(1024, Encryption::Crc);

    let mut group = c.benchmark_group("frame_roundtrip");
    group.bench_function("encode_and_decode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::new();
            codec.encode_into(black_box(&frame), &mut buf).unwrap();
            let decoded = codec.decoder().decode(&mut buf).unwrap();
            black_box(decoded.map(|f| f.request_id()))
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_decode_chunked,
    bench_frame_roundtrip
);
criterion_main!(benches);
