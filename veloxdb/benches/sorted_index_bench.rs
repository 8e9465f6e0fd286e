use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use veloxdb::index::sorted_index::SortedIndex;

fn k(n: u32) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

fn populated(n: u32) -> SortedIndex {
    let idx = SortedIndex::new("bench", false);
    for i in 0..n {
        idx.add(&k(i), i as u64);
    }
    idx
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorted_index_insert");
    for n in [100u32, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("add", n), &n, |b, &n| {
            b.iter(|| {
                let idx = SortedIndex::new("bench", false);
                for i in 0..n {
                    idx.add(&k(black_box(i)), i as u64);
                }
            });
        });
    }
    group.finish();
}

fn bench_find_equal(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorted_index_find_equal");
    for n in [100u32, 1_000, 10_000] {
        let idx = populated(n);
        group.bench_with_input(BenchmarkId::new("find_equal", n), &idx, |b, idx| {
            b.iter(|| idx.find_equal(&k(black_box(n / 2))));
        });
    }
    group.finish();
}

fn bench_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorted_index_range");
    for n in [100u32, 1_000, 10_000] {
        let idx = populated(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("full_range", n), &idx, |b, idx| {
            b.iter(|| idx.range(None, None, true, true));
        });
    }
    group.finish();
}

criterion_group!(sorted_index_benches, bench_insert, bench_find_equal, bench_range);
criterion_main!(sorted_index_benches);
