use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rdt_wire::{Body, Codec, Module, ModuleRegistry, Packet};

fn full_packet(payload_len: usize) -> Packet {
    Packet {
        module: Module::Named("node".to_string()),
        node_id: 7,
        body: Body::Full {
            total_length: payload_len as u32,
            fragment_count: 1,
            sequence: 1,
            payload: Bytes::from(vec![0xABu8; payload_len]),
        },
    }
}

fn ack_packet() -> Packet {
    Packet {
        module: Module::Named("node".to_string()),
        node_id: 7,
        body: Body::Ack {
            status: rdt_wire::AckStatus::Confirm,
            fragment_index: 0,
            sequence: 1,
        },
    }
}

fn bench_build(c: &mut Criterion) {
    let codec = Codec::new(ModuleRegistry::with_defaults());
    let full = full_packet(1200);
    let ack = ack_packet();

    let mut group = c.benchmark_group("build");
    group.throughput(Throughput::Elements(1));

    group.bench_function("full_1200b", |b| {
        b.iter(|| codec.build(black_box(&full)).unwrap());
    });
    group.bench_function("ack", |b| {
        b.iter(|| codec.build(black_box(&ack)).unwrap());
    });

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let codec = Codec::new(ModuleRegistry::with_defaults());
    let full_wire = codec.build(&full_packet(1200)).unwrap();
    let ack_wire = codec.build(&ack_packet()).unwrap();

    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    group.bench_function("full_1200b", |b| {
        b.iter(|| codec.parse(black_box(&full_wire)).unwrap());
    });
    group.bench_function("ack", |b| {
        b.iter(|| codec.parse(black_box(&ack_wire)).unwrap());
    });

    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let codec = Codec::new(ModuleRegistry::with_defaults());
    let packet = full_packet(1200);

    let mut group = c.benchmark_group("roundtrip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("build_then_parse", |b| {
        b.iter(|| {
            let wire = codec.build(black_box(&packet)).unwrap();
            black_box(codec.parse(&wire).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_build, bench_parse, bench_roundtrip);
criterion_main!(benches);
