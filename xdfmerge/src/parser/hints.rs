//! Map hint files: where the firmware is known (or believed) to hold maps.
//!
//! CSV with a header row, or a JSON array of objects with the same keys:
//!
//! ```text
//! kind,name,address,rows,columns,element_bits,major_stride,minor_stride,datatype,lsb_first,units,math
//! fixed,Fuel Map,0x2000,16,16,16,-256,0,unsigned,0,ms,X*0.01
//! map,Idle Trim,0x1200
//! ```
//!
//! Only `name` and `address` are required. Omitted strides describe a packed
//! row-major layout.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::XdfError;
use crate::parser::schema::{parse_flag, parse_id, parse_int, Coded, DataType};
use crate::scanner::packed_stride;
use crate::parser::vocabulary::Vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintKind {
    /// Geometry given in the hint.
    #[default]
    Fixed,
    /// Geometry read from the image's self-describing map preamble.
    Map,
}

/// One row of a hint file as written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HintRecord {
    pub kind: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub rows: Option<String>,
    pub columns: Option<String>,
    pub element_bits: Option<String>,
    pub major_stride: Option<String>,
    pub minor_stride: Option<String>,
    pub datatype: Option<String>,
    pub lsb_first: Option<String>,
    pub units: Option<String>,
    pub math: Option<String>,
}

/// A validated hint, ready for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapHint {
    pub kind: HintKind,
    pub name: String,
    pub address: u32,
    pub rows: u32,
    pub columns: u32,
    pub element_size_bits: u32,
    pub major_stride_bits: i32,
    pub minor_stride_bits: i32,
    pub datatype: Coded<DataType>,
    pub lsb_first: bool,
    pub units: Option<String>,
    pub math: Option<String>,
}

impl MapHint {
    /// Packed unsigned hint with the given shape. Strides too large for
    /// `i32` saturate, so the region never fits an image.
    pub fn fixed(name: impl Into<String>, address: u32, rows: u32, columns: u32, element_size_bits: u32) -> Self {
        Self {
            kind: HintKind::Fixed,
            name: name.into(),
            address,
            rows,
            columns,
            element_size_bits,
            major_stride_bits: packed_stride(columns, element_size_bits).unwrap_or(i32::MAX),
            minor_stride_bits: packed_stride(1, element_size_bits).unwrap_or(i32::MAX),
            datatype: Coded::known("", DataType::Unsigned),
            lsb_first: false,
            units: None,
            math: None,
        }
    }

    /// Self-describing firmware map at `address`.
    pub fn self_described(name: impl Into<String>, address: u32) -> Self {
        Self {
            kind: HintKind::Map,
            ..Self::fixed(name, address, 1, 1, 8)
        }
    }

    pub fn with_strides(mut self, major_stride_bits: i32, minor_stride_bits: i32) -> Self {
        self.major_stride_bits = major_stride_bits;
        self.minor_stride_bits = minor_stride_bits;
        self
    }

    pub fn with_datatype(mut self, datatype: DataType) -> Self {
        self.datatype = Coded::known("", datatype);
        self
    }

    pub fn cells(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.columns)
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn field_error(line: usize, field: &str, value: &str) -> XdfError {
    XdfError::Hint(format!("record {}: invalid {} '{}'", line, field, value))
}

fn unsigned_field(record: &Option<String>, line: usize, field: &str, default: u32) -> Result<u32, XdfError> {
    match present(record) {
        Some(raw) => parse_id(raw).ok_or_else(|| field_error(line, field, raw)),
        None => Ok(default),
    }
}

impl HintRecord {
    /// Validate and normalize one record. `line` is 1-based, for messages.
    pub fn resolve(&self, line: usize, vocabulary: &Vocabulary) -> Result<MapHint, XdfError> {
        let name = present(&self.name)
            .ok_or_else(|| XdfError::Hint(format!("record {}: missing name", line)))?
            .to_string();
        let address_raw = present(&self.address)
            .ok_or_else(|| XdfError::Hint(format!("record {}: missing address", line)))?;
        let address = parse_id(address_raw).ok_or_else(|| field_error(line, "address", address_raw))?;

        let kind = match present(&self.kind).map(str::to_ascii_lowercase).as_deref() {
            None | Some("fixed") => HintKind::Fixed,
            Some("map") => HintKind::Map,
            Some(other) => return Err(field_error(line, "kind", other)),
        };

        let rows = unsigned_field(&self.rows, line, "rows", 1)?;
        let columns = unsigned_field(&self.columns, line, "columns", 1)?;
        let element_size_bits = unsigned_field(&self.element_bits, line, "element_bits", 8)?;
        if rows == 0 || columns == 0 || element_size_bits == 0 {
            return Err(XdfError::Hint(format!(
                "record {}: '{}' needs positive rows, columns and element size",
                line, name
            )));
        }

        let stride_overflow = |axis: &str| {
            XdfError::Hint(format!(
                "record {}: packed {} stride of '{}' overflows; give it explicitly",
                line, axis, name
            ))
        };
        let major_stride_bits = match present(&self.major_stride) {
            Some(raw) => parse_int(raw).ok_or_else(|| field_error(line, "major_stride", raw))?,
            None => packed_stride(columns, element_size_bits).ok_or_else(|| stride_overflow("major"))?,
        };
        let minor_stride_bits = match present(&self.minor_stride) {
            Some(raw) => parse_int(raw).ok_or_else(|| field_error(line, "minor_stride", raw))?,
            None => packed_stride(1, element_size_bits).ok_or_else(|| stride_overflow("minor"))?,
        };

        let mut hint = MapHint::fixed(name, address, rows, columns, element_size_bits)
            .with_strides(major_stride_bits, minor_stride_bits);
        hint.kind = kind;
        if let Some(raw) = present(&self.datatype) {
            hint.datatype = vocabulary.datatype(raw);
            if !hint.datatype.is_verified() {
                tracing::debug!("Hint '{}' has unrecognised datatype '{}'", hint.name, raw);
            }
        }
        if let Some(raw) = present(&self.lsb_first) {
            hint.lsb_first = parse_flag(raw).ok_or_else(|| field_error(line, "lsb_first", raw))?;
        }
        hint.units = present(&self.units).map(str::to_string);
        hint.math = present(&self.math).map(str::to_string);
        Ok(hint)
    }
}

/// Parse CSV hint text (header row required).
pub fn parse_hints_csv(content: &str, vocabulary: &Vocabulary) -> Result<Vec<MapHint>, XdfError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(content.as_bytes());

    let mut hints = Vec::new();
    for (index, result) in reader.deserialize::<HintRecord>().enumerate() {
        let record = result.map_err(|e| XdfError::Hint(format!("record {}: {}", index + 1, e)))?;
        hints.push(record.resolve(index + 1, vocabulary)?);
    }
    Ok(hints)
}

/// Parse a JSON array of hint objects. Numbers and booleans are accepted
/// wherever the CSV form has text.
pub fn parse_hints_json(content: &str, vocabulary: &Vocabulary) -> Result<Vec<MapHint>, XdfError> {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(content).map_err(|e| XdfError::Hint(e.to_string()))?;

    let mut hints = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let fields: BTreeMap<String, String> = row
            .into_iter()
            .filter_map(|(key, value)| {
                let text = match value {
                    serde_json::Value::Null => return None,
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                Some((key.to_ascii_lowercase(), text))
            })
            .collect();
        let record: HintRecord = serde_json::to_value(fields)
            .and_then(serde_json::from_value)
            .map_err(|e| XdfError::Hint(format!("record {}: {}", index + 1, e)))?;
        hints.push(record.resolve(index + 1, vocabulary)?);
    }
    Ok(hints)
}

/// Read a hint file, choosing the format from its extension (`.json`, else CSV).
pub fn read_hints(path: &Path, vocabulary: &Vocabulary) -> Result<Vec<MapHint>, XdfError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let hints = if is_json {
        parse_hints_json(&content, vocabulary)?
    } else {
        parse_hints_csv(&content, vocabulary)?
    };
    tracing::info!("Loaded {} map hints from {}", hints.len(), path.display());
    Ok(hints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_full_and_minimal_rows() {
        let csv = "kind,name,address,rows,columns,element_bits,major_stride,minor_stride,datatype,lsb_first,units,math\n\
                   fixed,Fuel Map,0x2000,16,16,16,-256,0,unsigned,0,ms,X*0.01\n\
                   map, Idle Trim ,0x1200\n";
        let hints = parse_hints_csv(csv, &Vocabulary::builtin()).unwrap();
        assert_eq!(hints.len(), 2);

        let fuel = &hints[0];
        assert_eq!(fuel.address, 0x2000);
        assert_eq!(fuel.cells(), 256);
        assert_eq!(fuel.major_stride_bits, -256);
        assert_eq!(fuel.minor_stride_bits, 0);
        assert_eq!(fuel.units.as_deref(), Some("ms"));
        assert_eq!(fuel.math.as_deref(), Some("X*0.01"));

        let idle = &hints[1];
        assert_eq!(idle.kind, HintKind::Map);
        assert_eq!(idle.name, "Idle Trim");
        assert_eq!(idle.element_size_bits, 8);
    }

    #[test]
    fn test_omitted_strides_are_packed() {
        let csv = "name,address,rows,columns,element_bits\nBoost,4096,4,8,16\n";
        let hints = parse_hints_csv(csv, &Vocabulary::builtin()).unwrap();
        assert_eq!(hints[0].address, 4096);
        assert_eq!(hints[0].minor_stride_bits, 16);
        assert_eq!(hints[0].major_stride_bits, 128);
    }

    #[test]
    fn test_overflowing_packed_stride_is_an_error() {
        let csv = "name,address,rows,columns,element_bits\nBig,0x0,1,0x10000000,16\n";
        let err = parse_hints_csv(csv, &Vocabulary::builtin()).unwrap_err();
        assert!(matches!(err, XdfError::Hint(_)));
        assert!(err.to_string().contains("major stride"));

        let csv = "name,address,rows,columns,element_bits,major_stride\nBig,0x0,1,0x10000000,16,0\n";
        let hints = parse_hints_csv(csv, &Vocabulary::builtin()).unwrap();
        assert_eq!(hints[0].cells(), 0x1000_0000);
    }

    #[test]
    fn test_missing_address_is_an_error() {
        let csv = "name,address\nBroken,\n";
        let err = parse_hints_csv(csv, &Vocabulary::builtin()).unwrap_err();
        assert!(err.to_string().contains("missing address"));
    }

    #[test]
    fn test_json_accepts_numbers() {
        let json = r#"[{"name": "Spark", "address": 8192, "rows": 2, "columns": 2, "datatype": "signed", "lsb_first": true}]"#;
        let hints = parse_hints_json(json, &Vocabulary::builtin()).unwrap();
        assert_eq!(hints[0].address, 0x2000);
        assert_eq!(hints[0].datatype.get(), Some(DataType::Signed));
        assert!(hints[0].lsb_first);
    }

    #[test]
    fn test_unknown_datatype_is_unverified() {
        let csv = "name,address,datatype\nOdd,0x10,bcd\n";
        let hints = parse_hints_csv(csv, &Vocabulary::builtin()).unwrap();
        assert!(!hints[0].datatype.is_verified());
        assert_eq!(hints[0].datatype.raw, "bcd");
    }
}
