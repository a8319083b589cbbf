use criterion::{black_box, criterion_group, criterion_main, Criterion};
use xdfmerge::parser::hints::MapHint;
use xdfmerge::prelude::*;
use xdfmerge::{scan, DataType, ReconcileOptions, ReconciliationEngine, ScanRequest};
use std::path::PathBuf;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn image() -> BinaryImage {
    BinaryImage::new((0..0x10000u32).map(|i| (i % 251) as u8).collect())
}

fn bench_scan_table(c: &mut Criterion) {
    let image = image();
    let request = ScanRequest {
        address: 0x2000,
        element_size_bits: 16,
        major_stride_bits: 16 * 32,
        minor_stride_bits: 16,
        rows: 32,
        columns: 32,
        datatype: Some(DataType::Unsigned),
        lsb_first: true,
    };

    c.bench_function("scan_32x32_u16", |b| {
        b.iter(|| scan(black_box(&image), black_box(&request)));
    });
}

fn bench_parse_definition(c: &mut Criterion) {
    c.bench_function("parse_definition", |b| {
        b.iter(|| xdfmerge::parse_definition(black_box(&fixture_path("sample.xdf"))));
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let image = image();
    let vocabulary = Vocabulary::builtin();
    let definition = xdfmerge::parse_definition(&fixture_path("sample.xdf")).expect("fixture");
    let hints: Vec<MapHint> = (0..64u32)
        .map(|i| MapHint::fixed(format!("Map {}", i), 0x1000 + i * 0x100, 16, 16, 8))
        .collect();
    let engine = ReconciliationEngine::new(&vocabulary, ReconcileOptions::default());

    c.bench_function("reconcile_64_hints", |b| {
        b.iter(|| engine.reconcile(black_box(definition.clone()), black_box(&image), black_box(&hints)));
    });
}

criterion_group!(benches, bench_scan_table, bench_parse_definition, bench_reconcile);
criterion_main!(benches);
