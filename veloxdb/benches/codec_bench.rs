use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use veloxdb::changeset::block::{Block, BlockProperty, FieldValue, OpType, Row};
use veloxdb::changeset::codec::{decode_changeset, encode_changeset};
use veloxdb::model::PropertyType;

fn sample_block(rows: usize) -> Block {
    Block {
        class_id: 1,
        op_type: OpType::Insert,
        properties: vec![
            BlockProperty { property_id: 0, prop_type: PropertyType::Int },
            BlockProperty { property_id: 1, prop_type: PropertyType::String },
        ],
        rows: (0..rows)
            .map(|i| Row {
                object_id: i as u64,
                version: 1,
                values: vec![FieldValue::Int(i as i32), FieldValue::String(Some(format!("item-{i}")))],
            })
            .collect(),
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("changeset_encode");
    for rows in [16, 256, 4096] {
        let block = sample_block(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("encode_changeset", rows), &block, |b, block| {
            b.iter(|| encode_changeset(black_box(std::slice::from_ref(block))));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("changeset_decode");
    for rows in [16, 256, 4096] {
        let encoded = encode_changeset(&[sample_block(rows)]);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("decode_changeset", rows), &encoded, |b, encoded| {
            b.iter(|| decode_changeset(black_box(encoded)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(codec_benches, bench_encode, bench_decode);
criterion_main!(codec_benches);
