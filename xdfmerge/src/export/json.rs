//! JSON exports: the flattened per-object dump, Label/DALINK rows and the
//! reconciliation report.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::core::XdfError;
use crate::math;
use crate::parser::schema::*;
use crate::reconcile::ReconcileReport;
use crate::scanner::{scan, BinaryImage, RawValue};

/// One definition object flattened for review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddedRow {
    pub object_type: &'static str,
    pub title: String,
    pub unique_id: Option<String>,
    pub parent: Option<String>,
    pub axis_id: Option<String>,
    pub address: Option<String>,
    pub datatype: Option<DataType>,
    pub datatype_raw: String,
    pub type_flags: Option<String>,
    pub element_size_bits: u32,
    pub major_stride_bits: i32,
    pub minor_stride_bits: i32,
    pub lsb_first: bool,
    pub rows: u32,
    pub columns: u32,
    pub index_count: Option<u32>,
    pub units: Option<String>,
    pub unit_type: Option<String>,
    pub unit_type_name: Option<UnitType>,
    pub output_type: Option<String>,
    pub output_type_name: Option<OutputType>,
    pub math: Option<String>,
    pub math_table: Vec<MathEntry>,
    pub description: Option<String>,
    pub decimal_places: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
    pub categories: Vec<CategoryRef>,
    pub labels: BTreeMap<u32, String>,
    pub dalink: Vec<u32>,
    /// Raw decoded cells, when an image was supplied.
    pub values: Option<Vec<RawValue>>,
    /// `values` with the object's math applied; `None` where evaluation failed.
    pub results: Option<Vec<Option<f64>>>,
    pub decode_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddedDump<'a> {
    pub format_version: Option<&'a str>,
    pub header: Option<&'a Header>,
    pub objects: Vec<EmbeddedRow>,
}

/// One Label or DALINK entry of an axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatRow {
    pub object_type: &'static str,
    pub name: String,
    pub parent: Option<String>,
    pub field: &'static str,
    pub key: String,
    pub value: String,
}

/// Equation for cell `(row, col)`; per-cell entries use 1-based coordinates.
fn equation_for(common: &ObjectCommon, row: u32, col: u32) -> &str {
    common
        .math
        .iter()
        .find(|m| m.is_cell_specific() && m.row.unwrap_or(row + 1) == row + 1 && m.col.unwrap_or(col + 1) == col + 1)
        .map(|m| m.equation.as_str())
        .or_else(|| common.math_expression())
        .unwrap_or("X")
}

/// Apply the object's math to decoded cells, row-major.
pub fn apply_math(common: &ObjectCommon, columns: u32, values: &[RawValue]) -> Vec<Option<f64>> {
    let columns = columns.max(1);
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let i = i as u32;
            let equation = equation_for(common, i / columns, i % columns);
            math::evaluate(equation, value.as_f64()).ok()
        })
        .collect()
}

pub fn embedded_row(object: &CalibrationObject, image: Option<&BinaryImage>) -> EmbeddedRow {
    let common = object.common();
    let (parent, axis_id, title, index_count, labels, dalink) = match object {
        CalibrationObject::Axis(axis) => (
            Some(axis.parent_name.clone()),
            Some(axis.axis_id.clone()),
            axis.title.clone().unwrap_or_else(|| common.name.clone()),
            axis.index_count,
            axis.labels.clone(),
            axis.dalink.clone(),
        ),
        _ => (None, None, common.name.clone(), None, BTreeMap::new(), Vec::new()),
    };

    let mut row = EmbeddedRow {
        object_type: object.kind().as_str(),
        title,
        unique_id: common.unique_id.clone(),
        parent,
        axis_id,
        address: common.address.map(|a| format!("{:#X}", a)),
        datatype: common.datatype.get(),
        datatype_raw: common.datatype.raw.clone(),
        type_flags: common.type_flags.map(|f| format!("0x{:02X}", f)),
        element_size_bits: common.element_size_bits,
        major_stride_bits: common.major_stride_bits,
        minor_stride_bits: common.minor_stride_bits,
        lsb_first: common.lsb_first,
        rows: object.rows(),
        columns: object.columns(),
        index_count,
        units: common.units.clone(),
        unit_type: common.unit_type.as_ref().map(|c| c.raw.clone()),
        unit_type_name: common.unit_type.as_ref().and_then(Coded::get),
        output_type: common.output_type.as_ref().map(|c| c.raw.clone()),
        output_type_name: common.output_type.as_ref().and_then(Coded::get),
        math: common.math_expression().map(str::to_string),
        math_table: common.math.clone(),
        description: common.description.clone(),
        decimal_places: common.decimal_places.clone(),
        min: common.min.clone(),
        max: common.max.clone(),
        categories: common.categories.clone(),
        labels,
        dalink,
        values: None,
        results: None,
        decode_error: None,
    };

    if let (Some(image), Some(request)) = (image, object.scan_request()) {
        match scan(image, &request) {
            Ok(values) => {
                row.results = Some(apply_math(common, request.columns, &values));
                row.values = Some(values);
            }
            Err(e) => row.decode_error = Some(e.to_string()),
        }
    }
    row
}

pub fn embedded_rows(definition: &Definition, image: Option<&BinaryImage>) -> Vec<EmbeddedRow> {
    definition.objects.iter().map(|o| embedded_row(o, image)).collect()
}

/// Label and DALINK entries of every axis, one row each.
pub fn flatten_rows(definition: &Definition) -> Vec<FlatRow> {
    let mut rows = Vec::new();
    for object in &definition.objects {
        if let CalibrationObject::Axis(axis) = object {
            for (index, value) in &axis.labels {
                rows.push(FlatRow {
                    object_type: "Axis",
                    name: axis.axis_id.clone(),
                    parent: Some(axis.parent_name.clone()),
                    field: "Labels",
                    key: index.to_string(),
                    value: value.clone(),
                });
            }
            for (position, index) in axis.dalink.iter().enumerate() {
                rows.push(FlatRow {
                    object_type: "Axis",
                    name: axis.axis_id.clone(),
                    parent: Some(axis.parent_name.clone()),
                    field: "DALINK",
                    key: position.to_string(),
                    value: index.to_string(),
                });
            }
        }
    }
    rows
}

pub fn write_embedded_json(definition: &Definition, image: Option<&BinaryImage>, path: &Path) -> Result<(), XdfError> {
    let dump = EmbeddedDump {
        format_version: definition.format_version.as_deref(),
        header: definition.header.as_ref(),
        objects: embedded_rows(definition, image),
    };
    let json = serde_json::to_string_pretty(&dump).map_err(|e| XdfError::Export(e.to_string()))?;
    std::fs::write(path, json)?;
    tracing::info!("Wrote embedded dump to {}", path.display());
    Ok(())
}

pub fn write_report_json(report: &ReconcileReport, path: &Path) -> Result<(), XdfError> {
    let json = serde_json::to_string_pretty(report).map_err(|e| XdfError::Export(e.to_string()))?;
    std::fs::write(path, json)?;
    tracing::info!("Wrote reconciliation report to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(math: Vec<MathEntry>) -> CalibrationObject {
        let mut common = ObjectCommon::new("Boost");
        common.address = Some(0);
        common.minor_stride_bits = 8;
        common.major_stride_bits = 16;
        common.math = math;
        CalibrationObject::Table(Table {
            common,
            rows: 2,
            columns: 2,
            data_axis_id: None,
            data_axis_extras: Vec::new(),
        })
    }

    #[test]
    fn test_values_and_results() {
        let image = BinaryImage::new(vec![10, 20, 30, 40]);
        let object = table(vec![MathEntry {
            equation: "X/10".to_string(),
            ..MathEntry::identity()
        }]);
        let row = embedded_row(&object, Some(&image));
        assert_eq!(row.values.as_ref().map(Vec::len), Some(4));
        assert_eq!(row.results, Some(vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]));
        assert_eq!(row.address.as_deref(), Some("0x0"));
    }

    #[test]
    fn test_cell_specific_math() {
        let image = BinaryImage::new(vec![10, 20, 30, 40]);
        let object = table(vec![
            MathEntry::identity(),
            MathEntry {
                equation: "X*2".to_string(),
                row: Some(2),
                col: Some(1),
                vars: vec!["X".to_string()],
            },
        ]);
        let row = embedded_row(&object, Some(&image));
        assert_eq!(row.results, Some(vec![Some(10.0), Some(20.0), Some(60.0), Some(40.0)]));
    }

    #[test]
    fn test_decode_error_is_reported() {
        let image = BinaryImage::new(vec![0]);
        let row = embedded_row(&table(Vec::new()), Some(&image));
        assert!(row.values.is_none());
        assert!(row.decode_error.is_some());
    }

    #[test]
    fn test_flatten_labels_and_dalinks() {
        let mut labels = BTreeMap::new();
        labels.insert(0, "500".to_string());
        labels.insert(1, "1000".to_string());
        let axis = Axis {
            common: ObjectCommon::new("x"),
            axis_id: "x".to_string(),
            title: None,
            parent_name: "Boost".to_string(),
            index_count: Some(2),
            rows: None,
            columns: None,
            labels,
            dalink: vec![7],
        };
        let definition = Definition {
            objects: vec![table(Vec::new()), CalibrationObject::Axis(axis)],
            ..Default::default()
        };
        let rows = flatten_rows(&definition);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].field, "DALINK");
        assert_eq!(rows[2].value, "7");
    }
}
