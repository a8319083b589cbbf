//! TunerPro XDF Parser
//!
//! Builds a [`Definition`] from XDF markup. Key format details:
//! - `XDFTABLE` data geometry lives in the `EMBEDDEDDATA` of its `z` axis;
//!   the `x`/`y` axes become [`Axis`] objects that follow their table
//! - `XDFSCALAR` / `XDFCONSTANT` carry their own `EMBEDDEDDATA`
//! - `mmedtypeflags`: 0x01 signed, 0x02 LSB first, 0x10000 float
//! - Numbers may be decimal or `0x` hex
//! - Unknown child elements are kept verbatim for the writer

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::core::XdfError;
use crate::parser::schema::*;
use crate::parser::vocabulary::Vocabulary;
use crate::parser::xml::{Element, XmlParser};
use crate::scanner::BaseOffset;

const IDENTITY_TAGS: &[&str] = &["title", "description", "flags", "CATEGORYMEM"];
const LAYOUT_TAGS: &[&str] = &[
    "EMBEDDEDDATA",
    "datatype",
    "units",
    "unittype",
    "outputtype",
    "decimalpl",
    "min",
    "max",
    "MATH",
];
const AXIS_TAGS: &[&str] = &["indexcount", "LABEL", "DALINK"];

fn is_one_of(element: &Element, tags: &[&str]) -> bool {
    tags.iter().any(|t| element.is(t))
}

fn malformed(object: &str, reason: impl Into<String>) -> XdfError {
    XdfError::MalformedDefinition {
        object: object.to_string(),
        reason: reason.into(),
    }
}

fn number_u32(raw: Option<&str>, object: &str, field: &str) -> Result<Option<u32>, XdfError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => parse_id(text)
            .map(Some)
            .ok_or_else(|| malformed(object, format!("bad number for {}: '{}'", field, text))),
        None => Ok(None),
    }
}

fn number_i32(raw: Option<&str>, object: &str, field: &str) -> Result<Option<i32>, XdfError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => parse_int(text)
            .map(Some)
            .ok_or_else(|| malformed(object, format!("bad number for {}: '{}'", field, text))),
        None => Ok(None),
    }
}

fn flag(raw: Option<&str>, object: &str, field: &str) -> Result<bool, XdfError> {
    match raw {
        Some(text) => parse_flag(text).ok_or_else(|| malformed(object, format!("bad flag for {}: '{}'", field, text))),
        None => Ok(false),
    }
}

fn owned(text: Option<&str>) -> Option<String> {
    text.map(str::to_string)
}

/// Parser for TunerPro XDF definition files.
///
/// The vocabulary is borrowed for the parser's lifetime and never modified.
pub struct XdfParser<'v> {
    vocabulary: &'v Vocabulary,
    defaults: Option<Defaults>,
    unverified: usize,
}

impl<'v> XdfParser<'v> {
    pub fn new(vocabulary: &'v Vocabulary) -> Self {
        Self {
            vocabulary,
            defaults: None,
            unverified: 0,
        }
    }

    pub fn parse_file(&mut self, path: &Path) -> Result<Definition, XdfError> {
        let content = std::fs::read_to_string(path)?;
        let definition = self.parse_str(&content)?;
        tracing::info!(
            "Parsed {}: {} tables, {} scalars, {} constants, {} axes",
            path.display(),
            definition.count(ObjectKind::Table),
            definition.count(ObjectKind::Scalar),
            definition.count(ObjectKind::Constant),
            definition.count(ObjectKind::Axis)
        );
        Ok(definition)
    }

    pub fn parse_str(&mut self, content: &str) -> Result<Definition, XdfError> {
        let root = XmlParser::new(content).parse()?;
        if !root.is("XDFFORMAT") && !root.is("XDFORMAT") {
            return Err(malformed("document", format!("expected XDFFORMAT root, found <{}>", root.name)));
        }

        self.unverified = 0;
        let mut definition = Definition {
            format_version: owned(root.attr("version")),
            ..Default::default()
        };

        let header_position = root.children.iter().position(|c| c.is("XDFHEADER"));
        if let Some(position) = header_position {
            let header = self.parse_header(&root.children[position])?;
            self.defaults = header.defaults.clone();
            definition.header = Some(header);
        } else {
            self.defaults = None;
        }

        for (position, child) in root.children.iter().enumerate() {
            if Some(position) == header_position {
                continue;
            }
            if child.is("XDFTABLE") {
                let (table, axes) = self.parse_table(child, position)?;
                definition.objects.push(CalibrationObject::Table(table));
                definition.objects.extend(axes.into_iter().map(CalibrationObject::Axis));
            } else if child.is("XDFSCALAR") || child.is("XDFCONSTANT") {
                let (common, axes) = self.parse_single(child, position)?;
                definition.objects.push(if child.is("XDFSCALAR") {
                    CalibrationObject::Scalar(Scalar { common })
                } else {
                    CalibrationObject::Constant(Constant { common })
                });
                definition.objects.extend(axes.into_iter().map(CalibrationObject::Axis));
            } else {
                definition.extras.push(child.clone());
            }
        }

        if self.unverified > 0 {
            tracing::debug!("{} vocabulary values kept unverified", self.unverified);
        }
        warn_duplicate_names(&definition);
        definition.validate()?;
        Ok(definition)
    }

    fn parse_header(&self, element: &Element) -> Result<Header, XdfError> {
        const OBJECT: &str = "XDFHEADER";
        let mut header = Header {
            flags: owned(element.child_text("flags")),
            file_version: owned(element.child_text("fileversion")),
            title: owned(element.child_text("deftitle")),
            description: owned(element.child_text("description")),
            author: owned(element.child_text("author")),
            base_offset: None,
            defaults: None,
            regions: Vec::new(),
            categories: Vec::new(),
            extras: Vec::new(),
        };

        for child in &element.children {
            if child.is("BASEOFFSET") {
                header.base_offset = Some(BaseOffset {
                    offset: number_u32(child.attr("offset"), OBJECT, "BASEOFFSET offset")?.unwrap_or(0),
                    subtract: flag(child.attr("subtract"), OBJECT, "BASEOFFSET subtract")?,
                });
            } else if child.is("DEFAULTS") {
                let datasize_bits = number_u32(child.attr("datasizeinbits"), OBJECT, "datasizeinbits")?;
                if datasize_bits == Some(0) {
                    return Err(malformed(OBJECT, "DEFAULTS datasizeinbits must be greater than zero"));
                }
                header.defaults = Some(Defaults {
                    datasize_bits,
                    sig_digits: number_u32(child.attr("sigdigits"), OBJECT, "sigdigits")?,
                    output_type: owned(child.attr("outputtype")),
                    signed: flag(child.attr("signed"), OBJECT, "signed")?,
                    lsb_first: flag(child.attr("lsbfirst"), OBJECT, "lsbfirst")?,
                    float: flag(child.attr("float"), OBJECT, "float")?,
                });
            } else if child.is("REGION") {
                header.regions.push(Region {
                    attributes: child.attributes.clone(),
                });
            } else if child.is("CATEGORY") {
                header.categories.push(Category {
                    index: child.attr("index").unwrap_or_default().to_string(),
                    name: child.attr("name").unwrap_or_default().to_string(),
                });
            } else if !is_one_of(child, &["flags", "fileversion", "deftitle", "description", "author"]) {
                header.extras.push(child.clone());
            }
        }
        Ok(header)
    }

    fn parse_table(&mut self, element: &Element, position: usize) -> Result<(Table, Vec<Axis>), XdfError> {
        let name = required_title(element, position)?;
        let z_axis = element
            .get_all("XDFAXIS")
            .into_iter()
            .find(|a| a.attr("id").is_some_and(|id| id.eq_ignore_ascii_case("z")))
            .ok_or_else(|| malformed(&name, "table has no z axis"))?;
        let embedded = z_axis
            .get("EMBEDDEDDATA")
            .ok_or_else(|| malformed(&name, "z axis has no EMBEDDEDDATA"))?;
        if embedded.attr("mmedaddress").is_none() {
            return Err(malformed(&name, "missing mmedaddress"));
        }

        let mut common = ObjectCommon::new(name.clone());
        self.read_identity(element, &mut common);
        self.read_layout(z_axis, &mut common)?;
        common.extras = element
            .children
            .iter()
            .filter(|c| !is_one_of(c, IDENTITY_TAGS) && !c.is("XDFAXIS"))
            .cloned()
            .collect();

        let mut axes = Vec::new();
        for axis_element in element.get_all("XDFAXIS") {
            if std::ptr::eq(axis_element, z_axis) {
                continue;
            }
            axes.push(self.parse_axis(axis_element, &name)?);
        }

        let index_count = |id: &str| {
            axes.iter()
                .find(|a| a.axis_id.eq_ignore_ascii_case(id))
                .and_then(|a| a.index_count)
        };
        let rows = number_u32(embedded.attr("mmedrowcount"), &name, "mmedrowcount")?
            .or_else(|| index_count("y"))
            .unwrap_or(1);
        let columns = number_u32(embedded.attr("mmedcolcount"), &name, "mmedcolcount")?
            .or_else(|| index_count("x"))
            .unwrap_or(1);

        let table = Table {
            common,
            rows,
            columns,
            data_axis_id: owned(z_axis.attr("uniqueid")),
            data_axis_extras: z_axis
                .children
                .iter()
                .filter(|c| !is_one_of(c, LAYOUT_TAGS))
                .cloned()
                .collect(),
        };
        Ok((table, axes))
    }

    /// Scalars and constants: one element, geometry on the object itself.
    fn parse_single(&mut self, element: &Element, position: usize) -> Result<(ObjectCommon, Vec<Axis>), XdfError> {
        let name = required_title(element, position)?;
        let has_address = element
            .get("EMBEDDEDDATA")
            .is_some_and(|e| e.attr("mmedaddress").is_some());
        if !has_address {
            return Err(malformed(&name, "missing mmedaddress"));
        }

        let mut common = ObjectCommon::new(name.clone());
        self.read_identity(element, &mut common);
        self.read_layout(element, &mut common)?;
        common.extras = element
            .children
            .iter()
            .filter(|c| !is_one_of(c, IDENTITY_TAGS) && !is_one_of(c, LAYOUT_TAGS) && !c.is("XDFAXIS"))
            .cloned()
            .collect();

        let axes = element
            .get_all("XDFAXIS")
            .into_iter()
            .map(|a| self.parse_axis(a, &name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((common, axes))
    }

    fn parse_axis(&mut self, element: &Element, parent: &str) -> Result<Axis, XdfError> {
        let axis_id = element
            .attr("id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed(&format!("axis of '{}'", parent), "missing id"))?
            .to_string();
        let label = format!("{} axis of '{}'", axis_id, parent);

        let mut common = ObjectCommon::new(axis_id.clone());
        self.read_identity(element, &mut common);
        self.read_layout(element, &mut common)?;
        common.extras = element
            .children
            .iter()
            .filter(|c| !is_one_of(c, IDENTITY_TAGS) && !is_one_of(c, LAYOUT_TAGS) && !is_one_of(c, AXIS_TAGS))
            .cloned()
            .collect();

        let mut labels = BTreeMap::new();
        for entry in element.get_all("LABEL") {
            let index = number_u32(entry.attr("index"), &label, "LABEL index")?
                .ok_or_else(|| malformed(&label, "LABEL without index"))?;
            // Last definition of an index wins.
            labels.insert(index, entry.attr("value").unwrap_or_default().to_string());
        }
        let mut dalink = Vec::new();
        for entry in element.get_all("DALINK") {
            let index = number_u32(entry.attr("index"), &label, "DALINK index")?
                .ok_or_else(|| malformed(&label, "DALINK without index"))?;
            dalink.push(index);
        }

        let embedded = element.get("EMBEDDEDDATA");
        Ok(Axis {
            common,
            title: owned(element.child_text("title")),
            parent_name: parent.to_string(),
            index_count: number_u32(element.child_text("indexcount"), &label, "indexcount")?,
            rows: number_u32(embedded.and_then(|e| e.attr("mmedrowcount")), &label, "mmedrowcount")?,
            columns: number_u32(embedded.and_then(|e| e.attr("mmedcolcount")), &label, "mmedcolcount")?,
            labels,
            dalink,
            axis_id,
        })
    }

    /// `uniqueid`, `flags`, description and category membership.
    fn read_identity(&self, element: &Element, common: &mut ObjectCommon) {
        common.unique_id = owned(element.attr("uniqueid"));
        common.flags = owned(element.attr("flags").or_else(|| element.child_text("flags")));
        common.description = owned(element.child_text("description"));
        common.categories = element
            .get_all("CATEGORYMEM")
            .into_iter()
            .map(|c| CategoryRef {
                index: c.attr("index").unwrap_or_default().to_string(),
                category: c.attr("category").unwrap_or_default().to_string(),
            })
            .collect();
    }

    /// Embedded data, datatype, units and math.
    fn read_layout(&mut self, element: &Element, common: &mut ObjectCommon) -> Result<(), XdfError> {
        let object = common.name.clone();

        if let Some(embedded) = element.get("EMBEDDEDDATA") {
            common.has_embedded_data = true;
            common.address = number_u32(embedded.attr("mmedaddress"), &object, "mmedaddress")?;
            common.type_flags = number_u32(embedded.attr("mmedtypeflags"), &object, "mmedtypeflags")?;
            common.major_stride_bits =
                number_i32(embedded.attr("mmedmajorstridebits"), &object, "mmedmajorstridebits")?.unwrap_or(0);
            common.minor_stride_bits =
                number_i32(embedded.attr("mmedminorstridebits"), &object, "mmedminorstridebits")?.unwrap_or(0);
            if let Some(bits) = number_u32(embedded.attr("mmedelementsizebits"), &object, "mmedelementsizebits")? {
                if bits == 0 {
                    return Err(malformed(&object, "element size must be greater than zero"));
                }
                common.element_size_bits = bits;
            } else {
                common.element_size_bits = self.default_element_size();
            }
        } else {
            common.element_size_bits = self.default_element_size();
        }

        let datatype_raw = element.child_text("datatype").unwrap_or_default();
        common.datatype = match common.type_flags {
            Some(flags) => Coded::known(datatype_raw, DataType::from_type_flags(flags)),
            None if !datatype_raw.is_empty() => {
                let coded = self.vocabulary.datatype(datatype_raw);
                self.note_unverified(&object, "datatype", &coded.raw, coded.is_verified());
                coded
            }
            None => Coded::known("", self.defaults.as_ref().map_or(DataType::Unsigned, Defaults::datatype)),
        };
        common.lsb_first = match common.type_flags {
            Some(flags) => flags & TYPE_FLAG_LSB_FIRST != 0,
            None => self.defaults.as_ref().is_some_and(|d| d.lsb_first),
        };

        common.units = owned(element.child_text("units"));
        if let Some(raw) = element.child_text("unittype") {
            let coded = self.vocabulary.unit_type(raw);
            self.note_unverified(&object, "unittype", raw, coded.is_verified());
            common.unit_type = Some(coded);
        }
        if let Some(raw) = element.child_text("outputtype") {
            let coded = self.vocabulary.output_type(raw);
            self.note_unverified(&object, "outputtype", raw, coded.is_verified());
            common.output_type = Some(coded);
        }
        common.decimal_places = owned(element.child_text("decimalpl"));
        common.min = owned(element.child_text("min"));
        common.max = owned(element.child_text("max"));

        common.math = Vec::new();
        for math in element.get_all("MATH") {
            common.math.push(MathEntry {
                equation: math.attr("equation").unwrap_or("X").trim().to_string(),
                row: number_u32(math.attr("row"), &object, "MATH row")?,
                col: number_u32(math.attr("col"), &object, "MATH col")?,
                vars: math
                    .get_all("VAR")
                    .into_iter()
                    .filter_map(|v| v.attr("id"))
                    .map(str::to_string)
                    .collect(),
            });
        }
        Ok(())
    }

    fn default_element_size(&self) -> u32 {
        self.defaults.as_ref().and_then(|d| d.datasize_bits).unwrap_or(8)
    }

    fn note_unverified(&mut self, object: &str, field: &str, raw: &str, verified: bool) {
        if !verified {
            self.unverified += 1;
            tracing::debug!("'{}': unverified {} value '{}'", object, field, raw);
        }
    }
}

fn required_title(element: &Element, position: usize) -> Result<String, XdfError> {
    element.child_text("title").map(str::to_string).ok_or_else(|| {
        let object = match element.attr("uniqueid") {
            Some(id) => format!("{} {}", element.name, id),
            None => format!("{} #{}", element.name, position),
        };
        malformed(&object, "missing title")
    })
}

fn warn_duplicate_names(definition: &Definition) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for object in definition.top_level() {
        *seen.entry(object.name()).or_default() += 1;
    }
    let mut duplicates: Vec<_> = seen.into_iter().filter(|(_, n)| *n > 1).collect();
    duplicates.sort();
    for (name, count) in duplicates {
        tracing::warn!("Object name '{}' is used {} times; lookups resolve to the first", name, count);
    }
}
