//! Spreadsheet exports for manual review.
//!
//! `write_parsed_workbook` produces one sheet per object family plus a full
//! `EmbeddedData` sheet; `write_json_workbook` lists every axis Label and
//! DALINK entry on a single `JSON` sheet. Cells holding multi-line JSON are
//! wrapped, their column widened and their row grown to fit.

use std::path::Path;

use rust_xlsxwriter::{Format, FormatAlign, Workbook, Worksheet};
use serde::Serialize;

use crate::core::XdfError;
use crate::export::json::{embedded_rows, flatten_rows, EmbeddedRow};
use crate::parser::schema::*;
use crate::scanner::BinaryImage;

const WRAP_COLUMN_WIDTH: f64 = 50.0;
const LINE_HEIGHT: f64 = 15.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    fn opt(value: Option<&str>) -> Self {
        value.map_or(Cell::Empty, Cell::text)
    }

    /// Pretty JSON, or empty for null / empty collections.
    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::Null) => Cell::Empty,
            Ok(serde_json::Value::Array(a)) if a.is_empty() => Cell::Empty,
            Ok(serde_json::Value::Object(o)) if o.is_empty() => Cell::Empty,
            Ok(v) => serde_json::to_string_pretty(&v).map_or(Cell::Empty, Cell::Text),
            Err(_) => Cell::Empty,
        }
    }
}

impl From<u32> for Cell {
    fn from(value: u32) -> Self {
        Cell::Number(f64::from(value))
    }
}

impl From<i32> for Cell {
    fn from(value: i32) -> Self {
        Cell::Number(f64::from(value))
    }
}

/// Column names plus rows of cells for one worksheet.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    pub columns: Vec<&'static str>,
    pub rows: Vec<Vec<Cell>>,
}

impl Sheet {
    fn new(name: &str, columns: &[&'static str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.to_vec(),
            rows: Vec::new(),
        }
    }
}

fn export_err(e: rust_xlsxwriter::XlsxError) -> XdfError {
    XdfError::Export(e.to_string())
}

fn write_sheet(worksheet: &mut Worksheet, sheet: &Sheet) -> Result<(), XdfError> {
    let header = Format::new().set_bold();
    let wrap = Format::new().set_text_wrap().set_align(FormatAlign::Top);

    worksheet.set_name(&sheet.name).map_err(export_err)?;
    for (col, name) in sheet.columns.iter().enumerate() {
        worksheet
            .write_string_with_format(0, col as u16, *name, &header)
            .map_err(export_err)?;
    }

    let mut wrapped_columns = vec![false; sheet.columns.len()];
    for (index, cells) in sheet.rows.iter().enumerate() {
        let row = index as u32 + 1;
        let mut lines = 1;
        for (col, cell) in cells.iter().enumerate() {
            let col16 = col as u16;
            match cell {
                Cell::Empty => {}
                Cell::Number(n) => {
                    worksheet.write_number(row, col16, *n).map_err(export_err)?;
                }
                Cell::Text(s) if s.contains('\n') => {
                    worksheet
                        .write_string_with_format(row, col16, s, &wrap)
                        .map_err(export_err)?;
                    lines = lines.max(s.lines().count());
                    if let Some(flag) = wrapped_columns.get_mut(col) {
                        *flag = true;
                    }
                }
                Cell::Text(s) => {
                    worksheet.write_string(row, col16, s).map_err(export_err)?;
                }
            }
        }
        if lines > 1 {
            worksheet
                .set_row_height(row, LINE_HEIGHT * lines as f64)
                .map_err(export_err)?;
        }
    }

    for (col, wrapped) in wrapped_columns.iter().enumerate() {
        if *wrapped {
            worksheet
                .set_column_width(col as u16, WRAP_COLUMN_WIDTH)
                .map_err(export_err)?;
        }
    }
    Ok(())
}

/// Build and save a workbook; empty sheets are skipped.
pub fn write_workbook(sheets: &[Sheet], path: &Path) -> Result<usize, XdfError> {
    let mut workbook = Workbook::new();
    let mut written = 0;
    for sheet in sheets.iter().filter(|s| !s.rows.is_empty()) {
        write_sheet(workbook.add_worksheet(), sheet)?;
        written += 1;
    }
    if written == 0 {
        // A workbook needs at least one sheet.
        workbook.add_worksheet().set_name("Empty").map_err(export_err)?;
    }
    workbook.save(path).map_err(export_err)?;
    tracing::info!("Wrote {} sheets to {}", written, path.display());
    Ok(written)
}

fn header_sheet(definition: &Definition) -> Sheet {
    let mut sheet = Sheet::new(
        "Header",
        &[
            "ObjectType", "Flags", "FileVersion", "DefTitle", "Description", "Author", "BaseOffset",
            "Defaults", "Region", "Category",
        ],
    );
    if let Some(header) = &definition.header {
        let regions: Vec<_> = header
            .regions
            .iter()
            .map(|r| r.attributes.iter().cloned().collect::<std::collections::BTreeMap<_, _>>())
            .collect();
        sheet.rows.push(vec![
            Cell::text("Header"),
            Cell::opt(header.flags.as_deref()),
            Cell::opt(header.file_version.as_deref()),
            Cell::opt(header.title.as_deref()),
            Cell::opt(header.description.as_deref()),
            Cell::opt(header.author.as_deref()),
            Cell::json(&header.base_offset),
            Cell::json(&header.defaults),
            Cell::json(&regions),
            Cell::json(&header.categories),
        ]);
    }
    sheet
}

fn table_sheet(definition: &Definition) -> Sheet {
    let mut sheet = Sheet::new(
        "Tables",
        &["ObjectType", "Title", "UniqueID", "Flags", "CategoryMem", "Description", "Rows", "Columns"],
    );
    for object in &definition.objects {
        if let CalibrationObject::Table(table) = object {
            let common = &table.common;
            sheet.rows.push(vec![
                Cell::text("Table"),
                Cell::text(common.name.as_str()),
                Cell::opt(common.unique_id.as_deref()),
                Cell::opt(common.flags.as_deref()),
                Cell::json(&common.categories),
                Cell::opt(common.description.as_deref()),
                table.rows.into(),
                table.columns.into(),
            ]);
        }
    }
    sheet
}

const SINGLE_COLUMNS: &[&str] = &[
    "Title", "Address", "Datatype", "Units", "UnitType", "OutputType", "Description", "Math_Table",
    "Embedded.ElementSizeBits", "Embedded.MajorStrideBits", "Embedded.MinorStrideBits", "Values", "Results",
];

fn single_sheet(name: &str, kind: ObjectKind, rows: &[EmbeddedRow]) -> Sheet {
    let mut sheet = Sheet::new(name, SINGLE_COLUMNS);
    for row in rows.iter().filter(|r| r.object_type == kind.as_str()) {
        sheet.rows.push(vec![
            Cell::text(row.title.as_str()),
            Cell::opt(row.address.as_deref()),
            Cell::text(row.datatype_raw.as_str()),
            Cell::opt(row.units.as_deref()),
            Cell::opt(row.unit_type.as_deref()),
            Cell::opt(row.output_type.as_deref()),
            Cell::opt(row.description.as_deref()),
            Cell::json(&row.math_table),
            row.element_size_bits.into(),
            row.major_stride_bits.into(),
            row.minor_stride_bits.into(),
            Cell::json(&row.values),
            Cell::json(&row.results),
        ]);
    }
    sheet
}

fn axis_sheet(rows: &[EmbeddedRow]) -> Sheet {
    let mut sheet = Sheet::new(
        "Axes",
        &[
            "Parent", "Title", "ID", "Units", "DataType", "UnitType", "OutputType", "Math_Table", "IndexCount",
            "DecimalPl", "Min", "Max", "Embedded.ElementSizeBits", "Embedded.MajorStrideBits",
            "Embedded.MinorStrideBits", "Labels", "DALINK", "Values", "Results", "Embedded.TypeFlags",
            "Embedded.Address", "Embedded.Rowcount", "Embedded.Colcount",
        ],
    );
    for row in rows.iter().filter(|r| r.object_type == ObjectKind::Axis.as_str()) {
        sheet.rows.push(vec![
            Cell::opt(row.parent.as_deref()),
            Cell::text(row.title.as_str()),
            Cell::opt(row.axis_id.as_deref()),
            Cell::opt(row.units.as_deref()),
            Cell::text(row.datatype_raw.as_str()),
            Cell::opt(row.unit_type.as_deref()),
            Cell::opt(row.output_type.as_deref()),
            Cell::json(&row.math_table),
            row.index_count.map_or(Cell::Empty, Cell::from),
            Cell::opt(row.decimal_places.as_deref()),
            Cell::opt(row.min.as_deref()),
            Cell::opt(row.max.as_deref()),
            row.element_size_bits.into(),
            row.major_stride_bits.into(),
            row.minor_stride_bits.into(),
            Cell::json(&row.labels),
            Cell::json(&row.dalink),
            Cell::json(&row.values),
            Cell::json(&row.results),
            Cell::opt(row.type_flags.as_deref()),
            Cell::opt(row.address.as_deref()),
            row.rows.into(),
            row.columns.into(),
        ]);
    }
    sheet
}

/// Every field of every object, for auditing.
fn embedded_sheet(rows: &[EmbeddedRow]) -> Sheet {
    let mut sheet = Sheet::new(
        "EmbeddedData",
        &[
            "ObjectType", "Title", "UniqueID", "Parent", "AxisID", "Address", "Datatype", "TypeFlags",
            "ElementSizeBits", "MajorStrideBits", "MinorStrideBits", "LsbFirst", "Rows", "Columns", "Units",
            "UnitType", "OutputType", "Math", "Description", "DecodeError",
        ],
    );
    for row in rows {
        sheet.rows.push(vec![
            Cell::text(row.object_type),
            Cell::text(row.title.as_str()),
            Cell::opt(row.unique_id.as_deref()),
            Cell::opt(row.parent.as_deref()),
            Cell::opt(row.axis_id.as_deref()),
            Cell::opt(row.address.as_deref()),
            Cell::text(row.datatype.map_or_else(|| "unverified".to_string(), |d| format!("{:?}", d))),
            Cell::opt(row.type_flags.as_deref()),
            row.element_size_bits.into(),
            row.major_stride_bits.into(),
            row.minor_stride_bits.into(),
            Cell::text(if row.lsb_first { "1" } else { "0" }),
            row.rows.into(),
            row.columns.into(),
            Cell::opt(row.units.as_deref()),
            Cell::opt(row.unit_type.as_deref()),
            Cell::opt(row.output_type.as_deref()),
            Cell::opt(row.math.as_deref()),
            Cell::opt(row.description.as_deref()),
            Cell::opt(row.decode_error.as_deref()),
        ]);
    }
    sheet
}

/// Sheets of the main review workbook, in display order.
pub fn parsed_sheets(definition: &Definition, image: Option<&BinaryImage>) -> Vec<Sheet> {
    let rows = embedded_rows(definition, image);
    vec![
        header_sheet(definition),
        table_sheet(definition),
        single_sheet("Scalars", ObjectKind::Scalar, &rows),
        single_sheet("Constants", ObjectKind::Constant, &rows),
        axis_sheet(&rows),
        embedded_sheet(&rows),
    ]
}

pub fn json_sheet(definition: &Definition) -> Sheet {
    let mut sheet = Sheet::new("JSON", &["ObjectType", "Name", "Parent", "Field", "Key", "Value"]);
    for row in flatten_rows(definition) {
        sheet.rows.push(vec![
            Cell::text(row.object_type),
            Cell::text(row.name),
            Cell::opt(row.parent.as_deref()),
            Cell::text(row.field),
            Cell::text(row.key),
            Cell::text(row.value),
        ]);
    }
    sheet
}

pub fn write_parsed_workbook(definition: &Definition, image: Option<&BinaryImage>, path: &Path) -> Result<usize, XdfError> {
    write_workbook(&parsed_sheets(definition, image), path)
}

pub fn write_json_workbook(definition: &Definition, path: &Path) -> Result<usize, XdfError> {
    write_workbook(&[json_sheet(definition)], path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> Definition {
        let mut scalar = ObjectCommon::new("Idle");
        scalar.address = Some(1);
        scalar.math = vec![MathEntry::identity()];
        let mut table = ObjectCommon::new("Fuel");
        table.address = Some(4);
        Definition {
            objects: vec![
                CalibrationObject::Scalar(Scalar { common: scalar }),
                CalibrationObject::Table(Table {
                    common: table,
                    rows: 2,
                    columns: 2,
                    data_axis_id: None,
                    data_axis_extras: Vec::new(),
                }),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_sheets_follow_object_families() {
        let sheets = parsed_sheets(&definition(), None);
        let names: Vec<&str> = sheets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Header", "Tables", "Scalars", "Constants", "Axes", "EmbeddedData"]);
        assert!(sheets[0].rows.is_empty());
        assert_eq!(sheets[1].rows.len(), 1);
        assert_eq!(sheets[2].rows.len(), 1);
        assert_eq!(sheets[5].rows.len(), 2);
    }

    #[test]
    fn test_json_cells_are_multiline() {
        let sheets = parsed_sheets(&definition(), None);
        match &sheets[2].rows[0][7] {
            Cell::Text(s) => assert!(s.contains('\n')),
            other => panic!("expected JSON text, got {:?}", other),
        }
        assert_eq!(Cell::json(&Vec::<u32>::new()), Cell::Empty);
    }

    #[test]
    fn test_write_workbook_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("review.parsed.xlsx");
        let written = write_parsed_workbook(&definition(), None, &path).unwrap();
        assert_eq!(written, 3);
        assert!(path.exists());
    }
}
