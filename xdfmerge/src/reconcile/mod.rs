//! Reconciliation of a definition against a firmware image and map hints.

pub mod engine;
pub mod report;

pub use engine::{ReconcileOptions, ReconcileOutcome, ReconciliationEngine};
pub use report::{AmbiguousEntry, MatchedEntry, ReconcileReport, RecoveredEntry};
