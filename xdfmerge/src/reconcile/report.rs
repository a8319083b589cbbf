//! Reconciliation report.

use serde::{Serialize, Serializer};

use crate::scanner::Confidence;

fn hex_address<S: Serializer>(address: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:#X}", address))
}

/// A hint that overlaps an object already in the definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedEntry {
    pub name: String,
    #[serde(serialize_with = "hex_address")]
    pub address: u32,
    /// Name of the existing object it overlaps.
    pub existing: String,
    /// Same address, cell count, element size and datatype.
    pub exact: bool,
}

/// A hint that produced a new object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveredEntry {
    /// Name given to the synthesized object (may carry an address suffix).
    pub name: String,
    #[serde(serialize_with = "hex_address")]
    pub address: u32,
    pub object_type: &'static str,
    pub rows: u32,
    pub columns: u32,
    pub byte_length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbiguousEntry {
    pub name: String,
    #[serde(serialize_with = "hex_address")]
    pub address: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub matched: Vec<MatchedEntry>,
    pub recovered: Vec<RecoveredEntry>,
    pub ambiguous: Vec<AmbiguousEntry>,
}

impl ReconcileReport {
    pub fn exact_matches(&self) -> usize {
        self.matched.iter().filter(|m| m.exact).count()
    }

    pub fn has_ambiguous(&self) -> bool {
        !self.ambiguous.is_empty()
    }

    pub fn total(&self) -> usize {
        self.matched.len() + self.recovered.len() + self.ambiguous.len()
    }

    /// Confidence assigned to the hint named `name`, if it was seen.
    pub fn confidence_of(&self, name: &str) -> Option<Confidence> {
        if self.matched.iter().any(|m| m.name == name && m.exact) {
            Some(Confidence::ExactMatch)
        } else if self.recovered.iter().any(|r| r.name == name) {
            Some(Confidence::PlausibleUnmatched)
        } else if self.ambiguous.iter().any(|a| a.name == name) {
            Some(Confidence::Ambiguous)
        } else {
            None
        }
    }
}

#[derive(Serialize)]
struct ReportJson<'a> {
    matched: usize,
    matched_regions: &'a [MatchedEntry],
    recovered: &'a [RecoveredEntry],
    ambiguous: &'a [AmbiguousEntry],
}

impl Serialize for ReconcileReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ReportJson {
            matched: self.matched.len(),
            matched_regions: &self.matched,
            recovered: &self.recovered,
            ambiguous: &self.ambiguous,
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_shape() {
        let report = ReconcileReport {
            matched: vec![MatchedEntry {
                name: "Idle".to_string(),
                address: 0x40,
                existing: "Idle Speed".to_string(),
                exact: true,
            }],
            recovered: vec![RecoveredEntry {
                name: "Fuel Map".to_string(),
                address: 0x2000,
                object_type: "Table",
                rows: 16,
                columns: 16,
                byte_length: 512,
            }],
            ambiguous: vec![AmbiguousEntry {
                name: "Second".to_string(),
                address: 0x3000,
                reason: "overlap".to_string(),
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["matched"], 1);
        assert_eq!(json["recovered"][0]["address"], "0x2000");
        assert_eq!(json["ambiguous"][0]["reason"], "overlap");
        assert_eq!(report.confidence_of("Idle"), Some(Confidence::ExactMatch));
        assert_eq!(report.confidence_of("Fuel Map"), Some(Confidence::PlausibleUnmatched));
        assert_eq!(report.total(), 3);
    }
}
