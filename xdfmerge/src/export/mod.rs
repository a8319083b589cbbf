//! Review exports. All exporters take the definition by shared reference and
//! keep model order.

pub mod json;
pub mod workbook;

pub use json::{
    apply_math, embedded_row, embedded_rows, flatten_rows, write_embedded_json, write_report_json, EmbeddedRow,
    FlatRow,
};
pub use workbook::{parsed_sheets, write_json_workbook, write_parsed_workbook, write_workbook, Cell, Sheet};
