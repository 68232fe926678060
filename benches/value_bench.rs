use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use synclink::core::serialization::{NoResolver, ValueCodec};
use synclink::core::value::{SerializedData, Value};

fn sample_values() -> Vec<(&'static str, Value)> {
    vec![
        ("u32", Value::U32(42)),
        ("string", Value::String("a".repeat(1024))),
        ("bytes", Value::Bytes(Bytes::from(vec![7u8; 4096]))),
        (
            "nested_list",
            Value::List(
                (0..64)
                    .map(|i| {
                        Value::List(vec![
                            Value::I32(i),
                            Value::F64(f64::from(i) * 0.5),
                            Value::String(format!("entry-{i}")),
                        ])
                    })
                    .collect(),
            ),
        ),
    ]
}

#[allow(clippy::unwrap_used)]
fn bench_value_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_codec");
    let codec = ValueCodec::default();

    for (name, value) in sample_values() {
        group.bench_function(format!("serialize_{name}"), |b| {
            b.iter_batched(
                || value.clone(),
                |v| codec.serialize(&v).unwrap(),
                BatchSize::SmallInput,
            )
        });

        let tagged = codec.serialize(&value).unwrap();
        group.bench_function(format!("deserialize_{name}"), |b| {
            b.iter(|| codec.deserialize(&tagged, &NoResolver).unwrap())
        });

        let bytes = tagged.to_bytes().unwrap();
        group.bench_function(format!("parse_bytes_{name}"), |b| {
            b.iter(|| SerializedData::from_bytes(&bytes).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_value_codec);
criterion_main!(benches);
