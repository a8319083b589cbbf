//! Definition Model
//!
//! Typed in-memory representation of every calibration object in an XDF file.
//! `CalibrationObject` is a closed set of variants; consumers match it
//! exhaustively instead of probing loosely-typed attribute maps.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::core::XdfError;
use crate::parser::xml::Element;
use crate::scanner::{BaseOffset, ScanRequest};

/// `mmedtypeflags` bits understood by the parser and writer.
pub const TYPE_FLAG_SIGNED: u32 = 0x01;
pub const TYPE_FLAG_LSB_FIRST: u32 = 0x02;
pub const TYPE_FLAG_FLOAT: u32 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Unsigned,
    Signed,
    Float,
}

impl DataType {
    pub fn type_flags(self, lsb_first: bool) -> u32 {
        let base = match self {
            DataType::Unsigned => 0,
            DataType::Signed => TYPE_FLAG_SIGNED,
            DataType::Float => TYPE_FLAG_FLOAT,
        };
        if lsb_first {
            base | TYPE_FLAG_LSB_FIRST
        } else {
            base
        }
    }

    pub fn from_type_flags(flags: u32) -> Self {
        if flags & TYPE_FLAG_FLOAT != 0 {
            DataType::Float
        } else if flags & TYPE_FLAG_SIGNED != 0 {
            DataType::Signed
        } else {
            DataType::Unsigned
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    Generic,
    Temperature,
    Pressure,
    Time,
    Angle,
    Ratio,
    Voltage,
    Percent,
    Rpm,
    Mass,
    Flow,
    Distance,
    Speed,
    Current,
    Frequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Unsigned,
    Signed,
    Hex,
    Ascii,
    EnumString,
}

/// A vocabulary value: the string exactly as written in the source plus its
/// normalized meaning. `value == None` marks an unverified vendor extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Coded<T> {
    pub raw: String,
    pub value: Option<T>,
}

impl<T: Copy> Coded<T> {
    pub fn known(raw: impl Into<String>, value: T) -> Self {
        Self {
            raw: raw.into(),
            value: Some(value),
        }
    }

    pub fn unverified(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            value: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.value
    }
}

/// One `MATH` element. Entries with `row`/`col` apply to a single cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MathEntry {
    pub equation: String,
    pub row: Option<u32>,
    pub col: Option<u32>,
    pub vars: Vec<String>,
}

impl MathEntry {
    pub fn identity() -> Self {
        Self {
            equation: "X".to_string(),
            row: None,
            col: None,
            vars: vec!["X".to_string()],
        }
    }

    pub fn is_cell_specific(&self) -> bool {
        self.row.is_some() || self.col.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryRef {
    pub index: String,
    pub category: String,
}

/// Attributes shared by every object variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectCommon {
    pub name: String,
    pub unique_id: Option<String>,
    pub flags: Option<String>,
    pub address: Option<u32>,
    pub datatype: Coded<DataType>,
    pub type_flags: Option<u32>,
    pub element_size_bits: u32,
    pub major_stride_bits: i32,
    pub minor_stride_bits: i32,
    pub lsb_first: bool,
    pub units: Option<String>,
    pub unit_type: Option<Coded<UnitType>>,
    pub output_type: Option<Coded<OutputType>>,
    pub math: Vec<MathEntry>,
    pub description: Option<String>,
    pub decimal_places: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
    pub categories: Vec<CategoryRef>,
    #[serde(skip)]
    pub has_embedded_data: bool,
    #[serde(skip)]
    pub extras: Vec<Element>,
}

impl ObjectCommon {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_id: None,
            flags: None,
            address: None,
            datatype: Coded::known("", DataType::Unsigned),
            type_flags: None,
            element_size_bits: 8,
            major_stride_bits: 0,
            minor_stride_bits: 0,
            lsb_first: false,
            units: None,
            unit_type: None,
            output_type: None,
            math: Vec::new(),
            description: None,
            decimal_places: None,
            min: None,
            max: None,
            categories: Vec::new(),
            has_embedded_data: false,
            extras: Vec::new(),
        }
    }

    /// The object-wide equation (first `MATH` without a row/col selector).
    pub fn math_expression(&self) -> Option<&str> {
        self.math
            .iter()
            .find(|m| !m.is_cell_specific())
            .map(|m| m.equation.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    #[serde(flatten)]
    pub common: ObjectCommon,
    pub rows: u32,
    pub columns: u32,
    /// `uniqueid` of the table's `z` axis.
    pub data_axis_id: Option<String>,
    #[serde(skip)]
    pub data_axis_extras: Vec<Element>,
}

impl Table {
    pub fn size(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.columns)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scalar {
    #[serde(flatten)]
    pub common: ObjectCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Constant {
    #[serde(flatten)]
    pub common: ObjectCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Axis {
    #[serde(flatten)]
    pub common: ObjectCommon,
    /// `x` or `y`; also `common.name`.
    pub axis_id: String,
    pub title: Option<String>,
    /// Name of the owning object. Resolved through [`Definition::index_by_name`].
    pub parent_name: String,
    pub index_count: Option<u32>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
    pub labels: BTreeMap<u32, String>,
    pub dalink: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ObjectKind {
    Table,
    Scalar,
    Constant,
    Axis,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Table => "Table",
            ObjectKind::Scalar => "Scalar",
            ObjectKind::Constant => "Constant",
            ObjectKind::Axis => "Axis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "object_type")]
pub enum CalibrationObject {
    Table(Table),
    Scalar(Scalar),
    Constant(Constant),
    Axis(Axis),
}

impl CalibrationObject {
    pub fn common(&self) -> &ObjectCommon {
        match self {
            CalibrationObject::Table(t) => &t.common,
            CalibrationObject::Scalar(s) => &s.common,
            CalibrationObject::Constant(c) => &c.common,
            CalibrationObject::Axis(a) => &a.common,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            CalibrationObject::Table(_) => ObjectKind::Table,
            CalibrationObject::Scalar(_) => ObjectKind::Scalar,
            CalibrationObject::Constant(_) => ObjectKind::Constant,
            CalibrationObject::Axis(_) => ObjectKind::Axis,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn address(&self) -> Option<u32> {
        self.common().address
    }

    /// Tables, Scalars and Constants; axes hang off a parent instead.
    pub fn is_top_level(&self) -> bool {
        !matches!(self, CalibrationObject::Axis(_))
    }

    pub fn parent_name(&self) -> Option<&str> {
        match self {
            CalibrationObject::Axis(a) => Some(&a.parent_name),
            _ => None,
        }
    }

    pub fn rows(&self) -> u32 {
        match self {
            CalibrationObject::Table(t) => t.rows,
            CalibrationObject::Scalar(_) | CalibrationObject::Constant(_) => 1,
            CalibrationObject::Axis(a) => a.rows.or(a.index_count).unwrap_or(1).max(1),
        }
    }

    pub fn columns(&self) -> u32 {
        match self {
            CalibrationObject::Table(t) => t.columns,
            CalibrationObject::Scalar(_) | CalibrationObject::Constant(_) => 1,
            CalibrationObject::Axis(a) => a.columns.unwrap_or(1).max(1),
        }
    }

    pub fn size(&self) -> u64 {
        u64::from(self.rows()) * u64::from(self.columns())
    }

    /// `[address, address + total_bits / 8)`, at least one byte wide.
    pub fn byte_range(&self) -> Option<Range<u64>> {
        let common = self.common();
        let address = common.address?;
        Some(footprint(address, self.size(), common.element_size_bits))
    }

    /// Decode request for the object's cells, if it is backed by image data.
    pub fn scan_request(&self) -> Option<ScanRequest> {
        let common = self.common();
        Some(ScanRequest {
            address: common.address?,
            element_size_bits: common.element_size_bits,
            major_stride_bits: common.major_stride_bits,
            minor_stride_bits: common.minor_stride_bits,
            rows: self.rows(),
            columns: self.columns(),
            datatype: common.datatype.get(),
            lsb_first: common.lsb_first,
        })
    }
}

/// Byte span used for overlap checks.
pub fn footprint(address: u32, cells: u64, element_size_bits: u32) -> Range<u64> {
    let bits = cells.saturating_mul(u64::from(element_size_bits));
    let bytes = bits.div_ceil(8).max(1);
    let start = u64::from(address);
    start..start.saturating_add(bytes)
}

pub fn ranges_overlap(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Defaults {
    pub datasize_bits: Option<u32>,
    pub sig_digits: Option<u32>,
    pub output_type: Option<String>,
    pub signed: bool,
    pub lsb_first: bool,
    pub float: bool,
}

impl Defaults {
    pub fn datatype(&self) -> DataType {
        if self.float {
            DataType::Float
        } else if self.signed {
            DataType::Signed
        } else {
            DataType::Unsigned
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub attributes: Vec<(String, String)>,
}

impl Region {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub index: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Header {
    pub flags: Option<String>,
    pub file_version: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub base_offset: Option<BaseOffset>,
    pub defaults: Option<Defaults>,
    pub regions: Vec<Region>,
    pub categories: Vec<Category>,
    #[serde(skip)]
    pub extras: Vec<Element>,
}

/// A parsed (and possibly reconciled) definition file.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Definition {
    pub format_version: Option<String>,
    pub header: Option<Header>,
    pub objects: Vec<CalibrationObject>,
    #[serde(skip)]
    pub extras: Vec<Element>,
}

impl Definition {
    /// Append an object at the end; existing entries are never reordered.
    pub fn append(&mut self, object: CalibrationObject) {
        self.objects.push(object);
    }

    pub fn top_level(&self) -> impl Iterator<Item = &CalibrationObject> {
        self.objects.iter().filter(|o| o.is_top_level())
    }

    /// Name → position of the first top-level object with that name.
    pub fn index_by_name(&self) -> HashMap<&str, usize> {
        let mut index = HashMap::new();
        for (i, object) in self.objects.iter().enumerate() {
            if object.is_top_level() {
                index.entry(object.name()).or_insert(i);
            }
        }
        index
    }

    pub fn find(&self, name: &str) -> Option<&CalibrationObject> {
        self.index_by_name().get(name).map(|&i| &self.objects[i])
    }

    pub fn axes_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a Axis> + 'a {
        self.objects.iter().filter_map(move |o| match o {
            CalibrationObject::Axis(a) if a.parent_name == parent => Some(a),
            _ => None,
        })
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        self.objects.iter().filter(|o| o.kind() == kind).count()
    }

    pub fn base_offset(&self) -> BaseOffset {
        self.header
            .as_ref()
            .and_then(|h| h.base_offset)
            .unwrap_or_default()
    }

    pub fn defaults(&self) -> Option<&Defaults> {
        self.header.as_ref().and_then(|h| h.defaults.as_ref())
    }

    /// Every `uniqueid` in use, normalized to a number where it parses as one.
    pub fn unique_ids(&self) -> HashSet<u32> {
        let mut ids = HashSet::new();
        for object in &self.objects {
            if let Some(id) = object.common().unique_id.as_deref().and_then(parse_id) {
                ids.insert(id);
            }
            if let CalibrationObject::Table(t) = object {
                if let Some(id) = t.data_axis_id.as_deref().and_then(parse_id) {
                    ids.insert(id);
                }
            }
        }
        ids
    }

    /// Check model invariants: unique top-level addresses, positive element sizes
    /// and table dimensions, and axis parents that resolve.
    pub fn validate(&self) -> Result<(), XdfError> {
        let mut addresses: HashMap<u32, &str> = HashMap::new();
        for object in &self.objects {
            let common = object.common();
            if common.address.is_some() && common.element_size_bits == 0 {
                return Err(XdfError::MalformedDefinition {
                    object: common.name.clone(),
                    reason: "element size must be greater than zero".to_string(),
                });
            }
            if let CalibrationObject::Table(t) = object {
                if t.rows == 0 || t.columns == 0 {
                    return Err(XdfError::MalformedDefinition {
                        object: common.name.clone(),
                        reason: format!("invalid table dimensions {}x{}", t.rows, t.columns),
                    });
                }
            }
            if object.rows().checked_mul(object.columns()).is_none() {
                return Err(XdfError::MalformedDefinition {
                    object: common.name.clone(),
                    reason: format!("{}x{} cells overflow the cell count", object.rows(), object.columns()),
                });
            }
            if !object.is_top_level() {
                continue;
            }
            if let Some(address) = common.address {
                if let Some(first) = addresses.insert(address, &common.name) {
                    return Err(XdfError::DuplicateAddress {
                        address,
                        first: first.to_string(),
                        second: common.name.clone(),
                    });
                }
            }
        }

        let index = self.index_by_name();
        for object in &self.objects {
            if let CalibrationObject::Axis(axis) = object {
                if !index.contains_key(axis.parent_name.as_str()) {
                    return Err(XdfError::MalformedDefinition {
                        object: format!("axis '{}'", axis.axis_id),
                        reason: format!("unresolved parent '{}'", axis.parent_name),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parse an XDF `uniqueid` (hex with `0x` prefix, or decimal).
pub fn parse_id(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Signed counterpart of [`parse_id`]; a leading `-` is allowed on either form.
pub fn parse_int(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let magnitude = i64::from(parse_id(digits)?);
    i32::try_from(if negative { -magnitude } else { magnitude }).ok()
}

/// XDF flag-style booleans: `1`/`0`, `true`/`false`, `yes`/`no`.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(name: &str, address: u32) -> CalibrationObject {
        let mut common = ObjectCommon::new(name);
        common.address = Some(address);
        CalibrationObject::Scalar(Scalar { common })
    }

    #[test]
    fn test_footprint_rounds_up_to_bytes() {
        assert_eq!(footprint(0x10, 1, 4), 0x10..0x11);
        assert_eq!(footprint(0x10, 16 * 16, 16), 0x10..0x210);
        assert_eq!(footprint(0, u64::MAX, 32).end, u64::MAX / 8 + 1);
    }

    #[test]
    fn test_table_cell_count_overflow_is_rejected() {
        let mut common = ObjectCommon::new("Huge");
        common.address = Some(0x100);
        let table = Table {
            common,
            rows: 0x10000,
            columns: 0x10000,
            data_axis_id: None,
            data_axis_extras: Vec::new(),
        };
        assert_eq!(table.size(), 1 << 32);
        let definition = Definition {
            objects: vec![CalibrationObject::Table(table)],
            ..Default::default()
        };
        match definition.validate() {
            Err(XdfError::MalformedDefinition { object, reason }) => {
                assert_eq!(object, "Huge");
                assert!(reason.contains("65536x65536"));
            }
            other => panic!("expected malformed definition, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let definition = Definition {
            objects: vec![scalar("A", 0x40), scalar("B", 0x40)],
            ..Default::default()
        };
        match definition.validate() {
            Err(XdfError::DuplicateAddress { address, first, second }) => {
                assert_eq!(address, 0x40);
                assert_eq!(first, "A");
                assert_eq!(second, "B");
            }
            other => panic!("expected duplicate address, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_axis_parent_is_rejected() {
        let axis = Axis {
            common: ObjectCommon::new("x"),
            axis_id: "x".to_string(),
            title: None,
            parent_name: "Missing".to_string(),
            index_count: Some(4),
            rows: None,
            columns: None,
            labels: BTreeMap::new(),
            dalink: Vec::new(),
        };
        let definition = Definition {
            objects: vec![scalar("A", 0x40), CalibrationObject::Axis(axis)],
            ..Default::default()
        };
        assert!(matches!(
            definition.validate(),
            Err(XdfError::MalformedDefinition { .. })
        ));
    }

    #[test]
    fn test_append_keeps_existing_order() {
        let mut definition = Definition::default();
        for i in 0..5 {
            definition.append(scalar(&format!("orig{}", i), i * 4));
        }
        let originals = definition.objects.clone();
        for i in 0..10 {
            definition.append(scalar(&format!("new{}", i), 0x100 + i * 4));
        }
        assert_eq!(definition.objects.len(), 15);
        assert_eq!(&definition.objects[..5], &originals[..]);
    }

    #[test]
    fn test_number_parsing() {
        assert_eq!(parse_id("0x2000"), Some(0x2000));
        assert_eq!(parse_id(" 42 "), Some(42));
        assert_eq!(parse_int("-256"), Some(-256));
        assert_eq!(parse_int("-0x10"), Some(-16));
        assert_eq!(parse_int("abc"), None);
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_type_flags_round_trip() {
        for dt in [DataType::Unsigned, DataType::Signed, DataType::Float] {
            assert_eq!(DataType::from_type_flags(dt.type_flags(true)), dt);
        }
        assert_eq!(DataType::Signed.type_flags(true), 0x03);
    }
}
