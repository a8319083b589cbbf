//! xdfmerge CLI - TunerPro XDF export and map reconciliation from the command line.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use xdfmerge::parser::schema::parse_id;
use xdfmerge::scanner::packed_stride;
use xdfmerge::{
    math, scan, BaseOffset, BinaryImage, ExportOptions, ExportResult, MergeOptions, MergeResult, ReconcileOptions,
    ScanRequest, Vocabulary, XdfMergeCore,
};

#[derive(Parser)]
#[command(name = "xdfmerge")]
#[command(about = "TunerPro XDF export and binary map reconciliation tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON file with extra datatype/unit/output type synonyms
    #[arg(long, value_name = "FILE", global = true)]
    vocabulary: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write review workbooks and the embedded JSON dump for a definition
    Export {
        /// Path to .xdf file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Firmware image used to fill decoded values
        #[arg(long, value_name = "BIN")]
        bin: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,

        #[command(flatten)]
        base: BaseArgs,

        /// Skip <stem>.parsed.xlsx
        #[arg(long)]
        no_workbook: bool,

        /// Skip <stem>.json.xlsx
        #[arg(long)]
        no_json_workbook: bool,

        /// Skip <stem>.embedded.json
        #[arg(long)]
        no_embedded: bool,
    },

    /// Reconcile map hints against a firmware image and write a merged definition
    Merge {
        /// Path to .xdf file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Firmware image
        #[arg(long, value_name = "BIN")]
        bin: PathBuf,

        /// Hint file (.csv or .json)
        #[arg(long, value_name = "HINTS")]
        hints: PathBuf,

        #[command(flatten)]
        output: OutputArgs,

        #[command(flatten)]
        base: BaseArgs,

        /// Do not create x/y axes for recovered tables
        #[arg(long)]
        no_axes: bool,

        /// Equation for hints without one
        #[arg(long, default_value = "X")]
        default_math: String,

        /// Also write review exports for the merged definition
        #[arg(long)]
        review: bool,

        /// Exit with code 2 if any hint is ambiguous
        #[arg(long)]
        fail_on_ambiguous: bool,
    },

    /// Decode one region of a firmware image
    Scan {
        /// Firmware image
        #[arg(value_name = "BIN")]
        bin: PathBuf,

        /// Start address (hex with 0x, or decimal)
        #[arg(long, value_parser = parse_address)]
        address: u32,

        #[arg(long, default_value_t = 1)]
        rows: u32,

        #[arg(long, default_value_t = 1)]
        columns: u32,

        /// Element size in bits
        #[arg(long, default_value_t = 8)]
        bits: u32,

        /// Bits between rows (defaults to packed)
        #[arg(long, allow_hyphen_values = true)]
        major_stride: Option<i32>,

        /// Bits between columns (defaults to packed)
        #[arg(long, allow_hyphen_values = true)]
        minor_stride: Option<i32>,

        #[arg(long, default_value = "unsigned")]
        datatype: String,

        #[arg(long)]
        lsb_first: bool,

        /// Equation applied to each raw value
        #[arg(long)]
        math: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,

        #[command(flatten)]
        base: BaseArgs,
    },

    /// List the datatype/unit/output type normalization table
    Vocab {
        /// Only show one category (datatype, unit_type, output_type)
        #[arg(long)]
        category: Option<String>,
    },
}

#[derive(Args)]
struct OutputArgs {
    /// Output directory (defaults to the input's directory)
    #[arg(long, value_name = "DIR")]
    out_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "human")]
    format: OutputFormat,
}

#[derive(Args)]
struct BaseArgs {
    /// Override the definition's BASEOFFSET
    #[arg(long, value_parser = parse_address)]
    base_offset: Option<u32>,

    /// Subtract the base offset instead of adding it
    #[arg(long, requires = "base_offset")]
    subtract_base: bool,
}

impl BaseArgs {
    fn to_base_offset(&self) -> Option<BaseOffset> {
        self.base_offset.map(|offset| BaseOffset {
            offset,
            subtract: self.subtract_base,
        })
    }
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output for scripts
    Json,
}

fn parse_address(raw: &str) -> Result<u32, String> {
    parse_id(raw).ok_or_else(|| format!("invalid address '{}'", raw))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_vocabulary(path: Option<&Path>) -> anyhow::Result<Vocabulary> {
    match path {
        Some(path) => Vocabulary::with_extension_file(path)
            .with_context(|| format!("failed to load vocabulary {}", path.display())),
        None => Ok(Vocabulary::builtin()),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let vocabulary = match load_vocabulary(cli.vocabulary.as_deref()) {
        Ok(vocabulary) => vocabulary,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    let exit_code = match cli.command {
        Commands::Export {
            file,
            bin,
            output,
            base,
            no_workbook,
            no_json_workbook,
            no_embedded,
        } => {
            let options = ExportOptions {
                out_dir: output.out_dir,
                binary: bin,
                base_offset: base.to_base_offset(),
                workbook: !no_workbook,
                json_workbook: !no_json_workbook,
                embedded_json: !no_embedded,
            };
            handle_export(&file, &vocabulary, &options, &output.format)
        }
        Commands::Merge {
            file,
            bin,
            hints,
            output,
            base,
            no_axes,
            default_math,
            review,
            fail_on_ambiguous,
        } => {
            let options = MergeOptions {
                out_dir: output.out_dir,
                base_offset: base.to_base_offset(),
                reconcile: ReconcileOptions {
                    synthesize_axes: !no_axes,
                    default_math,
                },
                export_review: review,
            };
            handle_merge(&file, &bin, &hints, &vocabulary, &options, &output.format, fail_on_ambiguous)
        }
        Commands::Scan {
            bin,
            address,
            rows,
            columns,
            bits,
            major_stride,
            minor_stride,
            datatype,
            lsb_first,
            math,
            format,
            base,
        } => {
            let base_offset = base.to_base_offset().unwrap_or_default();
            let result = scan_strides(major_stride, minor_stride, columns, bits).and_then(|(major, minor)| {
                let request = ScanRequest {
                    address,
                    element_size_bits: bits,
                    major_stride_bits: major,
                    minor_stride_bits: minor,
                    rows,
                    columns,
                    datatype: vocabulary.datatype(&datatype).get(),
                    lsb_first,
                };
                handle_scan(&bin, base_offset, &request, math.as_deref(), &format)
            });
            match result {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    1
                }
            }
        }
        Commands::Vocab { category } => {
            handle_vocab(&vocabulary, category.as_deref());
            0
        }
    };

    process::exit(exit_code);
}

fn handle_export(file: &Path, vocabulary: &Vocabulary, options: &ExportOptions, format: &OutputFormat) -> i32 {
    tracing::info!("Exporting {}", file.display());
    match XdfMergeCore::export_definition(file, vocabulary, options) {
        Ok(result) => {
            match format {
                OutputFormat::Human => output_export_human(&result),
                OutputFormat::Json => print_json(&serde_json::json!({
                    "file": result.file.display().to_string(),
                    "stats": result.stats,
                    "outputs": paths(&result.outputs),
                })),
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn handle_merge(
    file: &Path,
    bin: &Path,
    hints: &Path,
    vocabulary: &Vocabulary,
    options: &MergeOptions,
    format: &OutputFormat,
    fail_on_ambiguous: bool,
) -> i32 {
    tracing::info!("Merging {} with {} using hints from {}", file.display(), bin.display(), hints.display());
    match XdfMergeCore::merge_definition(file, bin, hints, vocabulary, options) {
        Ok(result) => {
            match format {
                OutputFormat::Human => output_merge_human(&result),
                OutputFormat::Json => print_json(&serde_json::json!({
                    "file": result.file.display().to_string(),
                    "merged": result.merged.display().to_string(),
                    "report": result.report,
                    "before": result.before,
                    "after": result.after,
                    "outputs": paths(&result.outputs),
                })),
            }
            if fail_on_ambiguous && result.has_ambiguous() {
                return 2;
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// Explicit strides, or those of a packed layout where omitted.
fn scan_strides(major: Option<i32>, minor: Option<i32>, columns: u32, bits: u32) -> anyhow::Result<(i32, i32)> {
    let major = match major {
        Some(stride) => stride,
        None => packed_stride(columns, bits).with_context(|| {
            format!("{} columns of {} bits overflow the row stride; pass --major-stride", columns, bits)
        })?,
    };
    let minor = match minor {
        Some(stride) => stride,
        None => packed_stride(1, bits)
            .with_context(|| format!("{}-bit elements overflow the cell stride; pass --minor-stride", bits))?,
    };
    Ok((major, minor))
}

fn handle_scan(
    bin: &Path,
    base_offset: BaseOffset,
    request: &ScanRequest,
    equation: Option<&str>,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let image = BinaryImage::from_file(bin)
        .with_context(|| format!("failed to read {}", bin.display()))?
        .with_base_offset(base_offset);
    tracing::info!(
        "Scanning {}x{} cells at {:#X} (strides {}/{})",
        request.rows,
        request.columns,
        request.address,
        request.major_stride_bits,
        request.minor_stride_bits
    );
    let values = scan(&image, request).with_context(|| format!("failed to decode region at {:#X}", request.address))?;

    let results: Option<Vec<Option<f64>>> = equation.map(|eq| {
        values
            .iter()
            .map(|v| math::evaluate(eq, v.as_f64()).ok())
            .collect()
    });

    match format {
        OutputFormat::Human => {
            println!(
                "Region {:#X}: {}x{} x {}-bit",
                request.address, request.rows, request.columns, request.element_size_bits
            );
            println!("{}", "─".repeat(60));
            let columns = request.columns.max(1) as usize;
            for (r, row) in values.chunks(columns).enumerate() {
                let cells: Vec<String> = row
                    .iter()
                    .enumerate()
                    .map(|(c, value)| match &results {
                        Some(results) => match results[r * columns + c] {
                            Some(result) => format!("{} ({})", value, result),
                            None => format!("{} (?)", value),
                        },
                        None => value.to_string(),
                    })
                    .collect();
                println!("  {:>3}: {}", r, cells.join("  "));
            }
        }
        OutputFormat::Json => print_json(&serde_json::json!({
            "address": format!("{:#X}", request.address),
            "rows": request.rows,
            "columns": request.columns,
            "element_size_bits": request.element_size_bits,
            "values": values,
            "results": results,
        })),
    }
    Ok(())
}

fn handle_vocab(vocabulary: &Vocabulary, category: Option<&str>) {
    println!("Normalization table:\n");
    let mut current = "";
    for entry in vocabulary.entries() {
        if category.is_some_and(|c| !c.eq_ignore_ascii_case(entry.category)) {
            continue;
        }
        if entry.category != current {
            current = entry.category;
            println!("  {}", current);
        }
        println!("    {:<16} -> {}", entry.synonym, entry.canonical);
    }
}

fn output_export_human(result: &ExportResult) {
    println!("\nFile: {}", result.file.display());
    println!("{}", "─".repeat(60));
    println!("  Tables:    {}", result.stats.tables);
    println!("  Scalars:   {}", result.stats.scalars);
    println!("  Constants: {}", result.stats.constants);
    println!("  Axes:      {}", result.stats.axes);
    println!("\n  Wrote:");
    for output in &result.outputs {
        println!("    - {}", output.display());
    }
}

fn output_merge_human(result: &MergeResult) {
    let report = &result.report;
    println!("\nFile: {}", result.file.display());
    println!("{}", "─".repeat(60));

    if !report.matched.is_empty() {
        println!("\n  MATCHED:");
        for entry in &report.matched {
            let kind = if entry.exact { "exact" } else { "overlap" };
            println!("    - {} at {:#X} ({}: {})", entry.name, entry.address, kind, entry.existing);
        }
    }
    if !report.recovered.is_empty() {
        println!("\n  RECOVERED:");
        for entry in &report.recovered {
            println!(
                "    - {} at {:#X} ({} {}x{})",
                entry.name, entry.address, entry.object_type, entry.rows, entry.columns
            );
        }
    }
    if !report.ambiguous.is_empty() {
        println!("\n  AMBIGUOUS:");
        for entry in &report.ambiguous {
            println!("    - {} at {:#X}", entry.name, entry.address);
            println!("      Reason: {}", entry.reason);
        }
    }

    println!("\n  Summary:");
    println!("    Matched:   {} ({} exact)", report.matched.len(), report.exact_matches());
    println!("    Recovered: {}", report.recovered.len());
    println!("    Ambiguous: {}", report.ambiguous.len());
    println!("    Objects:   {} -> {}", result.before.total(), result.after.total());
    println!("\n  Wrote:");
    for output in &result.outputs {
        println!("    - {}", output.display());
    }
}

fn paths(outputs: &[PathBuf]) -> Vec<String> {
    outputs.iter().map(|p| p.display().to_string()).collect()
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Error: {}", e),
    }
}
