//! Reconciliation Engine
//!
//! Cross-references map hints with the definition and the firmware image.
//! Every hint is first assessed on its own against the unmodified definition;
//! a second, ordered pass resolves conflicts between new candidates and
//! appends the survivors. Existing objects are never changed or reordered.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use crate::firmware::{read_self_described_map, SelfDescribedMap};
use crate::parser::hints::{HintKind, MapHint};
use crate::parser::schema::*;
use crate::parser::vocabulary::Vocabulary;
use crate::reconcile::report::{AmbiguousEntry, MatchedEntry, ReconcileReport, RecoveredEntry};
use crate::scanner::{scan_region, BinaryImage, BinaryRegion, Confidence, ScanError, ScanRequest};

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Give synthesized tables `x`/`y` axes so editors can display them.
    pub synthesize_axes: bool,
    /// Equation for hints that do not supply one.
    pub default_math: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            synthesize_axes: true,
            default_math: "X".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub definition: Definition,
    pub report: ReconcileReport,
}

/// Result of looking at one hint in isolation.
#[derive(Debug)]
enum Assessment<'h> {
    Matched(MatchedEntry),
    Plausible(Candidate<'h>),
    Ambiguous(AmbiguousEntry),
}

#[derive(Debug)]
struct Candidate<'h> {
    hint: &'h MapHint,
    request: ScanRequest,
    range: Range<u64>,
    region: BinaryRegion,
    map: Option<SelfDescribedMap>,
}

pub struct ReconciliationEngine<'v> {
    vocabulary: &'v Vocabulary,
    options: ReconcileOptions,
}

impl<'v> ReconciliationEngine<'v> {
    pub fn new(vocabulary: &'v Vocabulary, options: ReconcileOptions) -> Self {
        Self { vocabulary, options }
    }

    pub fn reconcile(&self, mut definition: Definition, image: &BinaryImage, hints: &[MapHint]) -> ReconcileOutcome {
        tracing::info!("Reconciling {} hints against {} objects", hints.len(), definition.objects.len());

        let assessments: Vec<Assessment<'_>> = hints.iter().map(|h| assess(&definition, image, h)).collect();

        let mut report = ReconcileReport::default();
        let mut accepted: Vec<(Range<u64>, String)> = Vec::new();
        let mut used_ids = definition.unique_ids();

        for assessment in assessments {
            match assessment {
                Assessment::Matched(entry) => {
                    tracing::debug!("'{}' at {:#X} matches existing '{}'", entry.name, entry.address, entry.existing);
                    report.matched.push(entry);
                }
                Assessment::Ambiguous(entry) => {
                    tracing::warn!("'{}' at {:#X} is ambiguous: {}", entry.name, entry.address, entry.reason);
                    report.ambiguous.push(entry);
                }
                Assessment::Plausible(candidate) => {
                    if let Some((_, earlier)) = accepted.iter().find(|(r, _)| ranges_overlap(r, &candidate.range)) {
                        let entry = AmbiguousEntry {
                            name: candidate.hint.name.clone(),
                            address: candidate.request.address,
                            reason: format!("overlaps earlier recovered candidate '{}'", earlier),
                        };
                        tracing::warn!("'{}' at {:#X} is ambiguous: {}", entry.name, entry.address, entry.reason);
                        report.ambiguous.push(entry);
                        continue;
                    }

                    let name = unique_name(&definition, &candidate.hint.name, candidate.request.address);
                    let unique_id = allocate_id(&mut used_ids);
                    let objects = self.synthesize(&candidate, &name, unique_id);
                    let object_type = objects[0].kind().as_str();
                    for object in objects {
                        definition.append(object);
                    }

                    tracing::info!("Recovered '{}' at {:#X}", name, candidate.request.address);
                    report.recovered.push(RecoveredEntry {
                        name: name.clone(),
                        address: candidate.request.address,
                        object_type,
                        rows: candidate.request.rows,
                        columns: candidate.request.columns,
                        byte_length: candidate.region.byte_length,
                    });
                    accepted.push((candidate.range, name));
                }
            }
        }

        tracing::info!(
            "Reconciliation done: {} matched ({} exact), {} recovered, {} ambiguous",
            report.matched.len(),
            report.exact_matches(),
            report.recovered.len(),
            report.ambiguous.len()
        );
        ReconcileOutcome { definition, report }
    }

    /// Build the new object, plus its axes when it is a table.
    fn synthesize(&self, candidate: &Candidate<'_>, name: &str, unique_id: u16) -> Vec<CalibrationObject> {
        let hint = candidate.hint;
        let request = &candidate.request;
        // Decoding succeeded, so the datatype is known.
        let datatype = request.datatype.unwrap_or(DataType::Unsigned);

        let mut common = ObjectCommon::new(name);
        common.unique_id = Some(format!("{:#X}", unique_id));
        common.flags = Some("0x0".to_string());
        common.address = Some(request.address);
        common.datatype = Coded::known("", datatype);
        common.type_flags = Some(datatype.type_flags(request.lsb_first));
        common.element_size_bits = request.element_size_bits;
        common.major_stride_bits = request.major_stride_bits;
        common.minor_stride_bits = request.minor_stride_bits;
        common.lsb_first = request.lsb_first;
        common.description = Some(format!("Extracted from BIN {:#X}", hint.address));
        common.math = vec![MathEntry {
            equation: hint.math.clone().unwrap_or_else(|| self.options.default_math.clone()),
            ..MathEntry::identity()
        }];
        common.has_embedded_data = true;
        if let Some(units) = &hint.units {
            common.units = Some(units.clone());
            let unit_type = self.vocabulary.unit_type(units);
            if unit_type.is_verified() {
                common.unit_type = Some(unit_type);
            }
        }

        let is_table = hint.kind == HintKind::Map || request.cells() > 1;
        if !is_table {
            return vec![CalibrationObject::Scalar(Scalar { common })];
        }

        let mut objects = vec![CalibrationObject::Table(Table {
            common,
            rows: request.rows,
            columns: request.columns,
            data_axis_id: Some("0x0".to_string()),
            data_axis_extras: Vec::new(),
        })];
        if self.options.synthesize_axes {
            objects.push(CalibrationObject::Axis(index_axis("x", name, request.columns)));
            let y_axis = match &candidate.map {
                Some(map) => self.header_axis(name, map),
                None => index_axis("y", name, request.rows),
            };
            objects.push(CalibrationObject::Axis(y_axis));
        }
        objects
    }

    /// `y` axis over a self-describing map's breakpoint bytes.
    fn header_axis(&self, parent: &str, map: &SelfDescribedMap) -> Axis {
        let mut axis = index_axis("y", parent, u32::from(map.count));
        let source = map.source_name();
        axis.common.address = Some(map.header_address);
        axis.common.type_flags = Some(0);
        axis.common.element_size_bits = 8;
        axis.common.major_stride_bits = 8;
        axis.common.minor_stride_bits = 8;
        axis.common.has_embedded_data = true;
        let unit_type = self.vocabulary.unit_type(&source);
        if unit_type.is_verified() {
            axis.common.unit_type = Some(unit_type);
        }
        axis.common.units = Some(source);
        axis.rows = Some(u32::from(map.count));
        axis.columns = Some(1);
        axis.labels = map
            .header
            .iter()
            .enumerate()
            .map(|(i, value)| (i as u32, value.to_string()))
            .collect();
        axis
    }
}

fn index_axis(axis_id: &str, parent: &str, count: u32) -> Axis {
    let mut common = ObjectCommon::new(axis_id);
    common.unique_id = Some("0x0".to_string());
    common.math = vec![MathEntry::identity()];
    Axis {
        common,
        axis_id: axis_id.to_string(),
        title: Some(parent.to_string()),
        parent_name: parent.to_string(),
        index_count: Some(count),
        rows: None,
        columns: None,
        labels: BTreeMap::new(),
        dalink: Vec::new(),
    }
}

/// Phase 1 for a single hint; reads the definition and image only.
fn assess<'h>(definition: &Definition, image: &BinaryImage, hint: &'h MapHint) -> Assessment<'h> {
    let ambiguous = |address: u32, reason: String| {
        Assessment::Ambiguous(AmbiguousEntry {
            name: hint.name.clone(),
            address,
            reason,
        })
    };

    let (request, map) = match resolve_geometry(image, hint) {
        Ok(resolved) => resolved,
        Err(e) => return ambiguous(hint.address, e.to_string()),
    };
    let range = footprint(request.address, request.cells(), request.element_size_bits);

    if let Some(entry) = find_match(definition, hint, &request, &range) {
        return Assessment::Matched(entry);
    }

    match scan_region(image, &request, Confidence::PlausibleUnmatched) {
        Ok(region) => Assessment::Plausible(Candidate {
            hint,
            request,
            range,
            region,
            map,
        }),
        Err(e) => ambiguous(request.address, e.to_string()),
    }
}

fn resolve_geometry(image: &BinaryImage, hint: &MapHint) -> Result<(ScanRequest, Option<SelfDescribedMap>), ScanError> {
    match hint.kind {
        HintKind::Fixed => Ok((
            ScanRequest {
                address: hint.address,
                element_size_bits: hint.element_size_bits,
                major_stride_bits: hint.major_stride_bits,
                minor_stride_bits: hint.minor_stride_bits,
                rows: hint.rows,
                columns: hint.columns,
                datatype: hint.datatype.get(),
                lsb_first: hint.lsb_first,
            },
            None,
        )),
        HintKind::Map => {
            let map = read_self_described_map(image, hint.address)?;
            let request = ScanRequest {
                address: map.data_address,
                element_size_bits: 8,
                major_stride_bits: 8,
                minor_stride_bits: 8,
                rows: u32::from(map.count),
                columns: 1,
                datatype: Some(DataType::Unsigned),
                lsb_first: false,
            };
            Ok((request, Some(map)))
        }
    }
}

/// First existing object overlapping the candidate, preferring an exact match.
fn find_match(definition: &Definition, hint: &MapHint, request: &ScanRequest, range: &Range<u64>) -> Option<MatchedEntry> {
    let overlapping: Vec<&CalibrationObject> = definition
        .objects
        .iter()
        .filter(|o| o.byte_range().is_some_and(|r| ranges_overlap(&r, range)))
        .collect();

    let is_exact = |object: &CalibrationObject| {
        let common = object.common();
        common.address == Some(request.address)
            && object.size() == request.cells()
            && common.element_size_bits == request.element_size_bits
            && common.datatype.get().is_some()
            && common.datatype.get() == request.datatype
    };

    let (object, exact) = match overlapping.iter().find(|o| is_exact(**o)) {
        Some(object) => (*object, true),
        None => (*overlapping.first()?, false),
    };
    let existing = match object.parent_name() {
        Some(parent) => format!("{} ({} axis)", parent, object.name()),
        None => object.name().to_string(),
    };
    Some(MatchedEntry {
        name: hint.name.clone(),
        address: request.address,
        existing,
        exact,
    })
}

fn unique_name(definition: &Definition, name: &str, address: u32) -> String {
    let index = definition.index_by_name();
    if !index.contains_key(name) {
        return name.to_string();
    }
    let mut candidate = format!("{} ({:#X})", name, address);
    let mut n = 2;
    while index.contains_key(candidate.as_str()) {
        candidate = format!("{} ({:#X}) #{}", name, address, n);
        n += 1;
    }
    tracing::warn!("Name '{}' already in use; recovered object renamed to '{}'", name, candidate);
    candidate
}

/// Random 16-bit id, distinct from every id already in `used`.
fn allocate_id(used: &mut HashSet<u32>) -> u16 {
    loop {
        let bytes = uuid::Uuid::new_v4();
        let bytes = bytes.as_bytes();
        let id = u16::from_be_bytes([bytes[0], bytes[1]]);
        if id != 0 && used.insert(u32::from(id)) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(name: &str, address: u32) -> CalibrationObject {
        let mut common = ObjectCommon::new(name);
        common.address = Some(address);
        common.has_embedded_data = true;
        CalibrationObject::Scalar(Scalar { common })
    }

    fn run(definition: Definition, image: &BinaryImage, hints: &[MapHint]) -> ReconcileOutcome {
        let vocabulary = Vocabulary::builtin();
        ReconciliationEngine::new(&vocabulary, ReconcileOptions::default()).reconcile(definition, image, hints)
    }

    #[test]
    fn test_fuel_map_recovered_with_reversed_rows() {
        let mut bytes = vec![0u8; 0x2400];
        // Row-major 16x16 of 16-bit values; row r holds value r in every cell.
        for row in 0..16usize {
            for col in 0..16usize {
                let offset = 0x2000 + row * 32 + col * 2;
                bytes[offset..offset + 2].copy_from_slice(&(row as u16).to_be_bytes());
            }
        }
        let image = BinaryImage::new(bytes);
        // Start at the last row and walk backwards; minor stride 16 keeps cells distinct.
        let hint = MapHint::fixed("Fuel Map", 0x2000 + 15 * 32, 16, 16, 16).with_strides(-256, 16);

        let outcome = run(Definition::default(), &image, &[hint]);
        assert_eq!(outcome.report.recovered.len(), 1);
        let table = match &outcome.definition.objects[0] {
            CalibrationObject::Table(t) => t,
            other => panic!("expected table, got {:?}", other),
        };
        assert_eq!(table.size(), 256);
        assert_eq!(table.common.description.as_deref(), Some("Extracted from BIN 0x21E0"));
        assert_eq!(table.common.math_expression(), Some("X"));
    }

    #[test]
    fn test_fuel_map_zero_minor_stride_decodes_256_cells() {
        let image = BinaryImage::new(vec![0x11; 0x2400]);
        let hint = MapHint::fixed("Fuel Map", 0x2000, 16, 16, 16).with_strides(-256, 0);
        // Row 15 would sit at 0x2000 - 15 * 32 bytes, still inside the image.
        let outcome = run(Definition::default(), &image, &[hint]);
        assert_eq!(outcome.report.recovered.len(), 1);
        assert_eq!(outcome.report.recovered[0].rows * outcome.report.recovered[0].columns, 256);
        assert_eq!(outcome.definition.count(ObjectKind::Table), 1);
        assert_eq!(outcome.definition.count(ObjectKind::Axis), 2);
    }

    #[test]
    fn test_overlap_with_existing_scalar_is_matched() {
        let definition = Definition {
            objects: vec![scalar("Idle Speed", 0x40)],
            ..Default::default()
        };
        let image = BinaryImage::new(vec![0; 0x100]);
        let hint = MapHint::fixed("Idle Table", 0x3E, 2, 2, 8);
        let outcome = run(definition.clone(), &image, &[hint]);
        assert_eq!(outcome.report.matched.len(), 1);
        assert_eq!(outcome.report.matched[0].existing, "Idle Speed");
        assert!(!outcome.report.matched[0].exact);
        assert_eq!(outcome.definition, definition);
    }

    #[test]
    fn test_exact_match() {
        let definition = Definition {
            objects: vec![scalar("Idle Speed", 0x40)],
            ..Default::default()
        };
        let image = BinaryImage::new(vec![0; 0x100]);
        let outcome = run(definition, &image, &[MapHint::fixed("Idle", 0x40, 1, 1, 8)]);
        assert!(outcome.report.matched[0].exact);
    }

    #[test]
    fn test_competing_hints_first_wins() {
        let image = BinaryImage::new(vec![1; 0x4000]);
        let hints = vec![
            MapHint::fixed("First", 0x3000, 4, 4, 8),
            MapHint::fixed("Second", 0x3000, 2, 2, 16),
        ];
        let outcome = run(Definition::default(), &image, &hints);
        assert_eq!(outcome.report.recovered.len(), 1);
        assert_eq!(outcome.report.recovered[0].name, "First");
        assert_eq!(outcome.report.ambiguous.len(), 1);
        assert_eq!(outcome.report.ambiguous[0].name, "Second");
        assert!(outcome.report.ambiguous[0].reason.contains("First"));
    }

    #[test]
    fn test_decode_failure_is_ambiguous() {
        let image = BinaryImage::new(vec![0; 0x10]);
        let hints = vec![
            MapHint::fixed("Past End", 0x100, 2, 2, 8),
            MapHint::fixed("Odd Width", 0x0, 1, 2, 12),
        ];
        let outcome = run(Definition::default(), &image, &hints);
        assert_eq!(outcome.report.ambiguous.len(), 2);
        assert!(outcome.definition.objects.is_empty());
    }

    #[test]
    fn test_oversized_hints_are_ambiguous() {
        let image = BinaryImage::new(vec![0; 0x100]);
        let hints = vec![
            MapHint::fixed("Huge", 0, 65536, 65536, 8),
            MapHint::fixed("Large", 0, 40000, 40000, 8),
        ];
        let outcome = run(Definition::default(), &image, &hints);
        assert!(outcome.report.recovered.is_empty());
        assert_eq!(outcome.report.ambiguous.len(), 2);
        for entry in &outcome.report.ambiguous {
            assert!(entry.reason.contains("outside"), "unexpected reason: {}", entry.reason);
        }
        assert!(outcome.definition.objects.is_empty());
    }

    #[test]
    fn test_ten_recovered_objects_append_after_five() {
        let definition = Definition {
            objects: (0..5).map(|i| scalar(&format!("Stock {}", i), i * 4)).collect(),
            ..Default::default()
        };
        let image = BinaryImage::new(vec![5; 0x200]);
        let hints: Vec<MapHint> = (0..10)
            .map(|i| MapHint::fixed(format!("Found {}", i), 0x100 + i * 8, 1, 1, 8))
            .collect();

        let outcome = run(definition.clone(), &image, &hints);
        assert_eq!(outcome.report.recovered.len(), 10);
        assert_eq!(outcome.definition.objects.len(), 15);
        assert_eq!(&outcome.definition.objects[..5], &definition.objects[..]);
        assert_eq!(outcome.definition.objects[5].name(), "Found 0");
        assert_eq!(outcome.definition.objects[14].name(), "Found 9");
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let image = BinaryImage::new(vec![3; 0x400]);
        let hints = vec![
            MapHint::fixed("A", 0x100, 4, 4, 8),
            MapHint::fixed("B", 0x200, 1, 1, 16),
        ];
        let once = run(Definition::default(), &image, &hints);
        let twice = run(once.definition.clone(), &image, &hints);
        assert_eq!(twice.definition, once.definition);
        assert!(twice.report.recovered.is_empty());
        assert_eq!(twice.report.matched.len(), 2);
        assert!(twice.report.matched.iter().all(|m| m.exact));
    }

    #[test]
    fn test_single_cell_becomes_scalar_and_names_are_unique() {
        let definition = Definition {
            objects: vec![scalar("Limit", 0x10)],
            ..Default::default()
        };
        let image = BinaryImage::new(vec![0; 0x100]);
        let outcome = run(definition, &image, &[MapHint::fixed("Limit", 0x80, 1, 1, 8)]);
        let recovered = outcome.definition.objects.last().unwrap();
        assert!(matches!(recovered, CalibrationObject::Scalar(_)));
        assert_eq!(recovered.name(), "Limit (0x80)");
        assert!(outcome.definition.validate().is_ok());
    }

    #[test]
    fn test_self_described_map() {
        let mut bytes = vec![0u8; 0x100];
        bytes[0x20..0x28].copy_from_slice(&[0x37, 3, 8, 16, 24, 100, 110, 120]);
        let image = BinaryImage::new(bytes);
        let outcome = run(Definition::default(), &image, &[MapHint::self_described("Idle RPM", 0x20)]);

        assert_eq!(outcome.report.recovered[0].address, 0x25);
        let y_axis = outcome.definition.axes_of("Idle RPM").find(|a| a.axis_id == "y").unwrap();
        assert_eq!(y_axis.common.address, Some(0x22));
        assert_eq!(y_axis.common.units.as_deref(), Some("RPM"));
        assert_eq!(y_axis.labels.get(&2).map(String::as_str), Some("24"));
        assert_eq!(y_axis.common.unit_type.as_ref().and_then(|u| u.get()), Some(UnitType::Rpm));
    }

    #[test]
    fn test_unique_ids_do_not_collide() {
        let mut used: HashSet<u32> = (1..=0xFFFE).collect();
        assert_eq!(allocate_id(&mut used), 0xFFFF);
    }
}
