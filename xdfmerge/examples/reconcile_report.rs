//! Reconcile a definition against a firmware image and print the report.

use xdfmerge::prelude::*;
use xdfmerge::{ReconcileOptions, ReconciliationEngine};
use std::path::Path;

fn main() -> Result<(), XdfError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 3 {
        eprintln!("Usage: cargo run --example reconcile_report <definition.xdf> <image.bin> <hints.csv>");
        std::process::exit(1);
    }

    let vocabulary = Vocabulary::builtin();
    let definition = XdfMergeCore::load_definition(Path::new(&args[0]), &vocabulary)?;
    let image = XdfMergeCore::load_image(Path::new(&args[1]), &definition, None)?;
    let hints = xdfmerge::read_hints(Path::new(&args[2]))?;

    let engine = ReconciliationEngine::new(&vocabulary, ReconcileOptions::default());
    let outcome = engine.reconcile(definition, &image, &hints);
    let report = &outcome.report;

    println!("Matched: {} ({} exact)", report.matched.len(), report.exact_matches());
    for entry in &report.matched {
        println!("  - {} at {:#X} -> {}", entry.name, entry.address, entry.existing);
    }

    println!("Recovered: {}", report.recovered.len());
    for entry in &report.recovered {
        println!(
            "  - {} at {:#X}: {} {}x{} ({} bytes)",
            entry.name, entry.address, entry.object_type, entry.rows, entry.columns, entry.byte_length
        );
    }

    if report.has_ambiguous() {
        println!("Ambiguous: {}", report.ambiguous.len());
        for entry in &report.ambiguous {
            println!("  - {} at {:#X}: {}", entry.name, entry.address, entry.reason);
        }
    }

    Ok(())
}
