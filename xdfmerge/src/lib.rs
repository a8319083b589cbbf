//! xdfmerge - TunerPro XDF definition parsing and map reconciliation
//!
//! This library reads TunerPro XDF calibration definitions into a typed model,
//! decodes cells out of firmware images, and merges map hints that the
//! definition does not yet describe into a new XDF.
//!
//! # Quick Start
//!
//! ```no_run
//! use xdfmerge::{MergeOptions, Vocabulary, XdfMergeCore};
//! use std::path::Path;
//!
//! let vocabulary = Vocabulary::builtin();
//! let result = XdfMergeCore::merge_definition(
//!     Path::new("stock.xdf"),
//!     Path::new("stock.bin"),
//!     Path::new("hints.csv"),
//!     &vocabulary,
//!     &MergeOptions::default(),
//! ).unwrap();
//!
//! for entry in &result.report.recovered {
//!     println!("recovered {} at {:#X}", entry.name, entry.address);
//! }
//! ```
//!
//! # Features
//!
//! - **XDF parsing**: tables, scalars, constants and axes with unknown tags kept for round trip
//! - **Binary scanning**: bit-granular signed strides, 8/16/32-bit integers and floats
//! - **Reconciliation**: hint matching, overlap conflicts, XDF synthesis
//! - **Review exports**: `.xlsx` workbooks and flattened JSON

pub mod core;
pub mod export;
pub mod firmware;
pub mod math;
pub mod parser;
pub mod reconcile;
pub mod scanner;
pub mod writer;

// Re-export main types
pub use core::{
    output_path, DefinitionStats, ExportOptions, ExportResult, MergeOptions, MergeResult, XdfError, XdfMergeCore,
};
pub use parser::hints::{HintKind, MapHint};
pub use parser::schema::{CalibrationObject, DataType, Definition, ObjectKind};
pub use parser::vocabulary::Vocabulary;
pub use parser::xdf::XdfParser;
pub use reconcile::{ReconcileOptions, ReconcileReport, ReconciliationEngine};
pub use scanner::{scan, BaseOffset, BinaryImage, Confidence, RawValue, ScanError, ScanRequest};
pub use writer::XdfWriter;

/// Parse a definition file with the builtin vocabulary (convenience wrapper).
pub fn parse_definition(path: &std::path::Path) -> Result<Definition, XdfError> {
    let vocabulary = Vocabulary::builtin();
    XdfParser::new(&vocabulary).parse_file(path)
}

/// Read a hint file with the builtin vocabulary (convenience wrapper).
pub fn read_hints(path: &std::path::Path) -> Result<Vec<MapHint>, XdfError> {
    parser::hints::read_hints(path, &Vocabulary::builtin())
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        BinaryImage, CalibrationObject, Confidence, Definition, MapHint, MergeOptions, MergeResult, ReconcileReport,
        Vocabulary, XdfError, XdfMergeCore,
    };
}
