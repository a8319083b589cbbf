//! Reconciliation of the fixture definition against a generated image

use std::path::PathBuf;

use xdfmerge::prelude::*;
use xdfmerge::{read_hints, scan, Confidence, ObjectKind, ReconcileOptions, ReconciliationEngine};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// 512-byte image laid out to match `sample.xdf` and `hints.csv`.
fn fixture_image() -> Vec<u8> {
    let mut bytes = vec![0u8; 0x200];
    bytes[0x20..0x22].copy_from_slice(&[0x02, 0x8A]);
    bytes[0x40..0x42].copy_from_slice(&[0x03, 0x20]);
    bytes[0x60] = 32;
    bytes[0x100..0x108].copy_from_slice(&[10, 12, 14, 16, 20, 24, 28, 32]);
    bytes[0x180..0x188].copy_from_slice(&[0x01, 0x00, 0x01, 0x40, 0x01, 0x80, 0x01, 0xC0]);
    bytes[0x1C0..0x1C8].copy_from_slice(&[0x13, 3, 10, 40, 80, 100, 60, 20]);
    bytes
}

fn reconcile_fixture() -> (Definition, ReconcileReport) {
    let definition = xdfmerge::parse_definition(&fixture_path("sample.xdf")).expect("Should parse");
    let hints = read_hints(&fixture_path("hints.csv")).expect("Should read hints");
    let image = BinaryImage::new(fixture_image());
    let vocabulary = Vocabulary::builtin();
    let outcome = ReconciliationEngine::new(&vocabulary, ReconcileOptions::default()).reconcile(definition, &image, &hints);
    (outcome.definition, outcome.report)
}

#[test]
fn test_every_hint_lands_in_one_bucket() {
    let (_, report) = reconcile_fixture();
    assert_eq!(report.total(), 7);
    assert_eq!(report.matched.len(), 2);
    assert_eq!(report.recovered.len(), 3);
    assert_eq!(report.ambiguous.len(), 2);
}

#[test]
fn test_matched_hints() {
    let (_, report) = reconcile_fixture();

    assert_eq!(report.confidence_of("Spark Advance"), Some(Confidence::ExactMatch));
    let overlap = report
        .matched
        .iter()
        .find(|m| m.name == "Idle Overlap")
        .expect("Should report partial overlap");
    assert!(!overlap.exact);
    assert_eq!(overlap.existing, "Idle Target");
}

#[test]
fn test_recovered_objects_are_appended() {
    let (definition, report) = reconcile_fixture();

    // 3 original top-level objects + 2 original axes come first, untouched.
    assert_eq!(definition.objects[0].name(), "Spark Advance");
    assert_eq!(definition.objects[3].name(), "Idle Target");
    assert_eq!(definition.objects[4].name(), "Rev Limit");
    assert_eq!(definition.objects[5].name(), "Boost Target");

    let names: Vec<&str> = report.recovered.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["Boost Target", "Idle Target (0x60)", "Warmup Enrichment"]);
    assert_eq!(report.recovered[0].byte_length, 8);
    assert_eq!(report.recovered[1].object_type, "Scalar");

    assert_eq!(definition.count(ObjectKind::Table), 3);
    assert_eq!(definition.count(ObjectKind::Scalar), 2);
    assert_eq!(definition.count(ObjectKind::Axis), 6);
}

#[test]
fn test_recovered_table_decodes_like_hint() {
    let (definition, _) = reconcile_fixture();
    let image = BinaryImage::new(fixture_image());

    let boost = definition.find("Boost Target").expect("Should append table");
    let request = boost.scan_request().expect("Should have a layout");
    let values: Vec<f64> = scan(&image, &request)
        .expect("Should decode")
        .iter()
        .map(|v| v.as_f64())
        .collect();
    assert_eq!(values, vec![256.0, 320.0, 384.0, 448.0]);
    assert_eq!(boost.common().math_expression(), Some("X/10"));
    assert_eq!(boost.common().description.as_deref(), Some("Extracted from BIN 0x180"));
}

#[test]
fn test_self_described_map_recovery() {
    let (definition, report) = reconcile_fixture();

    let warmup = report
        .recovered
        .iter()
        .find(|r| r.name == "Warmup Enrichment")
        .expect("Should recover map");
    assert_eq!(warmup.address, 0x1C5);
    assert_eq!((warmup.rows, warmup.columns), (3, 1));

    let axis = definition
        .axes_of("Warmup Enrichment")
        .find(|a| a.axis_id == "y")
        .expect("Should synthesize y axis");
    assert_eq!(axis.common.address, Some(0x1C2));
    assert_eq!(axis.common.units.as_deref(), Some("Coolant Temp"));
    assert_eq!(axis.labels.get(&1).map(String::as_str), Some("40"));
}

#[test]
fn test_ambiguous_reasons() {
    let (_, report) = reconcile_fixture();

    let shadow = report
        .ambiguous
        .iter()
        .find(|a| a.name == "Boost Shadow")
        .expect("Should flag competing candidate");
    assert!(shadow.reason.contains("Boost Target"), "Reason: {}", shadow.reason);

    let far = report
        .ambiguous
        .iter()
        .find(|a| a.name == "Far Away")
        .expect("Should flag out-of-range hint");
    assert!(far.reason.contains("outside"), "Reason: {}", far.reason);
}

#[test]
fn test_reconcile_is_idempotent() {
    let (merged, _) = reconcile_fixture();
    let hints = read_hints(&fixture_path("hints.csv")).expect("Should read hints");
    let image = BinaryImage::new(fixture_image());
    let vocabulary = Vocabulary::builtin();

    let again = ReconciliationEngine::new(&vocabulary, ReconcileOptions::default()).reconcile(merged.clone(), &image, &hints);
    assert!(again.report.recovered.is_empty(), "Second pass should recover nothing");
    assert_eq!(again.definition, merged);
}
