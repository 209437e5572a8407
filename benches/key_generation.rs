/// Key generation and sanitization benchmarks
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use resilient_store::backends::keys;
use std::collections::HashMap;

fn bench_generate_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_key");

    for filename in ["photo.jpg", "Quarterly Report: Q1/2024.PDF", "noextension"] {
        group.bench_with_input(
            BenchmarkId::from_parameter(filename),
            &filename,
            |b, filename| {
                b.iter(|| black_box(keys::generate_key("uploads", black_box(filename))));
            },
        );
    }

    group.finish();
}

fn bench_sanitize_metadata(c: &mut Criterion) {
    let metadata: HashMap<String, String> = (0..16)
        .map(|i| (format!("X-Field-{}", i), "value ".repeat(i + 1)))
        .chain(std::iter::once((
            "Owner".to_string(),
            "Zoë \u{1F600}".to_string(),
        )))
        .collect();

    c.bench_function("sanitize_metadata_17_fields", |b| {
        b.iter(|| black_box(keys::sanitize_metadata(black_box(&metadata))));
    });
}

fn bench_validate_key(c: &mut Criterion) {
    c.bench_function("validate_key_nested", |b| {
        let key = "uploads/2024/06/report_1718000000000_deadbeef.pdf";
        b.iter(|| black_box(keys::validate_key(black_box(key)).is_ok()));
    });
}

criterion_group!(benches, bench_generate_key, bench_sanitize_metadata, bench_validate_key);
criterion_main!(benches);
