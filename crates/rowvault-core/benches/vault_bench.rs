//! # Vault Benchmarks
//!
//! Filter build/search and chunked store throughput.
//!
//! Run with: `cargo bench -p rowvault-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rowvault_core::bloom::BloomIndex;
use rowvault_core::{ChunkedResultStore, EntityStore, ResultKey, Row, TenantId};
use std::hint::black_box;
use std::sync::Arc;

fn device_rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| {
            Row::new()
                .with("name", format!("leaf-{:05}", i))
                .with("site", format!("dc-{}", i % 12))
                .with("platform", if i % 3 == 0 { "eos" } else { "nx-os" })
                .with("mgmt_ip", format!("10.{}.{}.{}", i / 65_536, (i / 256) % 256, i % 256))
        })
        .collect()
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_filter_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_build");

    for size in [1_000, 10_000, 50_000].iter() {
        let rows = device_rows(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &rows, |b, rows| {
            b.iter(|| black_box(BloomIndex::build(rows, 200, 0.01, 0).expect("build")));
        });
    }

    group.finish();
}

fn bench_filter_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_search");
    let terms = vec!["leaf-04242".to_string()];

    for size in [1_000, 10_000, 50_000].iter() {
        let rows = device_rows(*size);
        let index = BloomIndex::build(&rows, 200, 0.01, 0).expect("build");

        group.bench_with_input(BenchmarkId::new("confirmed", size), &rows, |b, rows| {
            b.iter(|| black_box(index.search(&terms, Some(rows)).expect("search")));
        });
        group.bench_with_input(BenchmarkId::new("approximate", size), &rows, |b, _| {
            b.iter(|| black_box(index.search(&terms, None).expect("search")));
        });
    }

    group.finish();
}

fn bench_chunked_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_store");
    let tenant = TenantId::new("bench").expect("tenant");

    for size in [1_000, 10_000].iter() {
        let rows = device_rows(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &rows, |b, rows| {
            b.iter(|| {
                let store = ChunkedResultStore::new(Arc::new(EntityStore::in_memory(tenant.clone())));
                black_box(
                    store
                        .store_with_chunking(&ResultKey::new("q", "n", "s"), rows, &[], 200)
                        .expect("store"),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_filter_build,
    bench_filter_search,
    bench_chunked_store
);
criterion_main!(benches);
