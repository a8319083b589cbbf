//! Core pipeline shared by the CLI and library users.
//! Parse, reconcile, write and export, with file naming in one place.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::export;
use crate::parser::hints::{read_hints, MapHint};
use crate::parser::schema::{Definition, ObjectKind};
use crate::parser::vocabulary::Vocabulary;
use crate::parser::xdf::XdfParser;
use crate::parser::xml::ParseError;
use crate::reconcile::{ReconcileOptions, ReconcileReport, ReconciliationEngine};
use crate::scanner::{BaseOffset, BinaryImage};
use crate::writer::XdfWriter;

#[derive(Debug, thiserror::Error)]
pub enum XdfError {
    #[error("Malformed definition in {object}: {reason}")]
    MalformedDefinition { object: String, reason: String },
    #[error("Duplicate address {address:#X}: '{first}' and '{second}'")]
    DuplicateAddress {
        address: u32,
        first: String,
        second: String,
    },
    #[error("XML error: {0}")]
    Xml(String),
    #[error("Hint file error: {0}")]
    Hint(String),
    #[error("Vocabulary error: {0}")]
    Vocabulary(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Export error: {0}")]
    Export(String),
}

impl From<ParseError> for XdfError {
    fn from(e: ParseError) -> Self {
        XdfError::Xml(e.to_string())
    }
}

/// Options for export runs.
#[derive(Clone, Debug)]
pub struct ExportOptions {
    /// Directory for outputs; defaults to the input's directory.
    pub out_dir: Option<PathBuf>,
    /// Firmware image used to fill the Values/Results columns.
    pub binary: Option<PathBuf>,
    /// Replaces the definition's `BASEOFFSET` when decoding.
    pub base_offset: Option<BaseOffset>,
    pub workbook: bool,
    pub json_workbook: bool,
    pub embedded_json: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            out_dir: None,
            binary: None,
            base_offset: None,
            workbook: true,
            json_workbook: true,
            embedded_json: true,
        }
    }
}

/// Options for merge runs.
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    pub out_dir: Option<PathBuf>,
    pub base_offset: Option<BaseOffset>,
    pub reconcile: ReconcileOptions,
    /// Also write the review exports for the merged definition.
    pub export_review: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DefinitionStats {
    pub tables: usize,
    pub scalars: usize,
    pub constants: usize,
    pub axes: usize,
}

impl DefinitionStats {
    pub fn of(definition: &Definition) -> Self {
        Self {
            tables: definition.count(ObjectKind::Table),
            scalars: definition.count(ObjectKind::Scalar),
            constants: definition.count(ObjectKind::Constant),
            axes: definition.count(ObjectKind::Axis),
        }
    }

    pub fn total(&self) -> usize {
        self.tables + self.scalars + self.constants + self.axes
    }
}

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub file: PathBuf,
    pub stats: DefinitionStats,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub file: PathBuf,
    pub merged: PathBuf,
    pub report_file: PathBuf,
    pub report: ReconcileReport,
    pub before: DefinitionStats,
    pub after: DefinitionStats,
    pub outputs: Vec<PathBuf>,
}

impl MergeResult {
    pub fn has_ambiguous(&self) -> bool {
        self.report.has_ambiguous()
    }
}

/// `<out_dir or input dir>/<input stem>.<suffix>`
pub fn output_path(input: &Path, out_dir: Option<&Path>, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("definition");
    let dir = out_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(format!("{}.{}", stem, suffix))
}

/// Core pipeline API used by the CLI.
pub struct XdfMergeCore;

impl XdfMergeCore {
    pub fn load_definition(path: &Path, vocabulary: &Vocabulary) -> Result<Definition, XdfError> {
        XdfParser::new(vocabulary).parse_file(path)
    }

    /// Read a firmware image, mapping addresses through the override or the
    /// definition's own `BASEOFFSET`.
    pub fn load_image(
        path: &Path,
        definition: &Definition,
        base_offset: Option<BaseOffset>,
    ) -> Result<BinaryImage, XdfError> {
        let base = base_offset.unwrap_or_else(|| definition.base_offset());
        let image = BinaryImage::from_file(path)?.with_base_offset(base);
        tracing::info!(
            "Loaded {} bytes from {} (base offset {:#X}{})",
            image.len(),
            path.display(),
            base.offset,
            if base.subtract { ", subtract" } else { "" }
        );
        Ok(image)
    }

    /// Write the review exports for one definition file.
    pub fn export_definition(
        path: &Path,
        vocabulary: &Vocabulary,
        options: &ExportOptions,
    ) -> Result<ExportResult, XdfError> {
        let definition = Self::load_definition(path, vocabulary)?;
        let image = match &options.binary {
            Some(bin) => Some(Self::load_image(bin, &definition, options.base_offset)?),
            None => None,
        };
        let outputs = Self::write_exports(path, &definition, image.as_ref(), options)?;
        Ok(ExportResult {
            file: path.to_path_buf(),
            stats: DefinitionStats::of(&definition),
            outputs,
        })
    }

    /// Reconcile a definition with an image and hint file, writing the
    /// merged XDF and the report.
    pub fn merge_definition(
        path: &Path,
        binary: &Path,
        hints: &Path,
        vocabulary: &Vocabulary,
        options: &MergeOptions,
    ) -> Result<MergeResult, XdfError> {
        let definition = Self::load_definition(path, vocabulary)?;
        let image = Self::load_image(binary, &definition, options.base_offset)?;
        let hints: Vec<MapHint> = read_hints(hints, vocabulary)?;
        let before = DefinitionStats::of(&definition);

        let engine = ReconciliationEngine::new(vocabulary, options.reconcile.clone());
        let outcome = engine.reconcile(definition, &image, &hints);

        let out_dir = options.out_dir.as_deref();
        if let Some(dir) = out_dir {
            std::fs::create_dir_all(dir)?;
        }
        let merged = output_path(path, out_dir, "merged.xdf");
        XdfWriter::write_file(&outcome.definition, &merged)?;
        let report_file = output_path(path, out_dir, "report.json");
        export::write_report_json(&outcome.report, &report_file)?;

        let mut outputs = vec![merged.clone(), report_file.clone()];
        if options.export_review {
            let export_options = ExportOptions {
                out_dir: options.out_dir.clone(),
                ..Default::default()
            };
            outputs.extend(Self::write_exports(&merged, &outcome.definition, Some(&image), &export_options)?);
        }

        Ok(MergeResult {
            file: path.to_path_buf(),
            merged,
            report_file,
            after: DefinitionStats::of(&outcome.definition),
            report: outcome.report,
            before,
            outputs,
        })
    }

    fn write_exports(
        path: &Path,
        definition: &Definition,
        image: Option<&BinaryImage>,
        options: &ExportOptions,
    ) -> Result<Vec<PathBuf>, XdfError> {
        let out_dir = options.out_dir.as_deref();
        if let Some(dir) = out_dir {
            std::fs::create_dir_all(dir)?;
        }

        let mut outputs = Vec::new();
        if options.workbook {
            let target = output_path(path, out_dir, "parsed.xlsx");
            export::write_parsed_workbook(definition, image, &target)?;
            outputs.push(target);
        }
        if options.json_workbook {
            let target = output_path(path, out_dir, "json.xlsx");
            export::write_json_workbook(definition, &target)?;
            outputs.push(target);
        }
        if options.embedded_json {
            let target = output_path(path, out_dir, "embedded.json");
            export::write_embedded_json(definition, image, &target)?;
            outputs.push(target);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_naming() {
        let input = Path::new("/data/ecu/stock.xdf");
        assert_eq!(
            output_path(input, None, "parsed.xlsx"),
            PathBuf::from("/data/ecu/stock.parsed.xlsx")
        );
        assert_eq!(
            output_path(input, Some(Path::new("/tmp/out")), "merged.xdf"),
            PathBuf::from("/tmp/out/stock.merged.xdf")
        );
    }

    #[test]
    fn test_error_messages() {
        let err = XdfError::DuplicateAddress {
            address: 0x40,
            first: "A".to_string(),
            second: "B".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate address 0x40: 'A' and 'B'");
        let err: XdfError = ParseError::MissingRoot.into();
        assert!(matches!(err, XdfError::Xml(_)));
    }
}
