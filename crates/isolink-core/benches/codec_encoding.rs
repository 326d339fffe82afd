use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use isolink_core::{deserialize, serialize, BufferRef, CodecOptions, Envelope, ReplyId, Value, ValueMap};

fn sample_record(i: i64) -> Value {
    let mut map = ValueMap::new();
    map.insert("id", i);
    map.insert("name", format!("item-{}", i));
    map.insert("score", i as f64 * 0.5);
    map.insert("tags", Value::List(vec!["a".into(), "b".into(), "c".into()]));
    Value::Map(map)
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize");
    let options = CodecOptions::default();

    for count in [1i64, 16, 256] {
        let value = Value::List((0..count).map(sample_record).collect());
        let size = serialize(&value, &options).unwrap().bytes.len();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("records", count), &value, |b, value| {
            b.iter(|| serialize(black_box(value), &options).unwrap());
        });
    }

    group.finish();
}

fn bench_deserialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("deserialize");
    let options = CodecOptions::default();

    for count in [1i64, 16, 256] {
        let value = Value::List((0..count).map(sample_record).collect());
        let encoded = serialize(&value, &options).unwrap();
        group.throughput(Throughput::Bytes(encoded.bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("records", count), &encoded, |b, encoded| {
            b.iter(|| deserialize(black_box(&encoded.bytes), &encoded.attachments, &options).unwrap());
        });
    }

    group.finish();
}

fn bench_buffer_vs_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_1mb");
    let options = CodecOptions::default();
    let data = vec![7u8; 1 << 20];

    let bytes = Value::Bytes(data.clone());
    group.bench_function("bytes", |b| {
        b.iter(|| serialize(black_box(&bytes), &options).unwrap());
    });

    let buffer = Value::Buffer(BufferRef::new(data));
    group.bench_function("buffer", |b| {
        b.iter(|| serialize(black_box(&buffer), &options).unwrap());
    });

    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let options = CodecOptions::default();
    c.bench_function("envelope_message", |b| {
        b.iter(|| {
            let envelope = Envelope::Message {
                reply_id: ReplyId::new(black_box(42)),
                channel: "ping".to_string(),
                value: Value::I64(41),
            };
            let encoded = envelope.encode(&options).unwrap();
            Envelope::decode(&encoded, &options).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_serialize,
    bench_deserialize,
    bench_buffer_vs_bytes,
    bench_envelope
);
criterion_main!(benches);
