//! Merge Writer
//!
//! Serializes a [`Definition`] back to XDF in the same dialect the parser
//! reads. Objects are written in model order; axes are nested inside the
//! object their `parent_name` resolves to.

use std::collections::HashMap;
use std::path::Path;

use crate::core::XdfError;
use crate::parser::schema::*;
use crate::parser::xml::{write_document, Element};

pub struct XdfWriter;

impl XdfWriter {
    /// Render the definition as XDF text.
    pub fn to_xdf_string(definition: &Definition) -> Result<String, XdfError> {
        let root = Self::build_tree(definition);
        Ok(write_document(&root)?)
    }

    pub fn write_file(definition: &Definition, path: &Path) -> Result<(), XdfError> {
        let text = Self::to_xdf_string(definition)?;
        std::fs::write(path, text)?;
        tracing::info!("Wrote {} objects to {}", definition.objects.len(), path.display());
        Ok(())
    }

    pub fn build_tree(definition: &Definition) -> Element {
        let mut root = Element::new("XDFFORMAT");
        if let Some(version) = &definition.format_version {
            root = root.with_attr("version", version.as_str());
        }
        if let Some(header) = &definition.header {
            root.push(header_element(header));
        }

        let index = definition.index_by_name();
        let mut axes_by_parent: HashMap<usize, Vec<&Axis>> = HashMap::new();
        for object in &definition.objects {
            if let CalibrationObject::Axis(axis) = object {
                match index.get(axis.parent_name.as_str()) {
                    Some(&position) => axes_by_parent.entry(position).or_default().push(axis),
                    None => tracing::warn!(
                        "Skipping axis '{}' of unknown parent '{}'",
                        axis.axis_id,
                        axis.parent_name
                    ),
                }
            }
        }

        for (position, object) in definition.objects.iter().enumerate() {
            let axes = axes_by_parent.get(&position).map(Vec::as_slice).unwrap_or_default();
            match object {
                CalibrationObject::Table(table) => root.push(table_element(table, axes)),
                CalibrationObject::Scalar(scalar) => root.push(single_element("XDFSCALAR", &scalar.common, axes)),
                CalibrationObject::Constant(constant) => {
                    root.push(single_element("XDFCONSTANT", &constant.common, axes))
                }
                CalibrationObject::Axis(_) => {}
            }
        }

        root.children.extend(definition.extras.iter().cloned());
        root
    }
}

fn text_child(parent: &mut Element, tag: &str, value: Option<&str>) {
    if let Some(value) = value {
        parent.push(Element::new(tag).with_text(value));
    }
}

fn flag_text(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn header_element(header: &Header) -> Element {
    let mut element = Element::new("XDFHEADER");
    text_child(&mut element, "flags", header.flags.as_deref());
    text_child(&mut element, "fileversion", header.file_version.as_deref());
    text_child(&mut element, "deftitle", header.title.as_deref());
    text_child(&mut element, "description", header.description.as_deref());
    text_child(&mut element, "author", header.author.as_deref());

    if let Some(base) = &header.base_offset {
        element.push(
            Element::new("BASEOFFSET")
                .with_attr("offset", base.offset.to_string())
                .with_attr("subtract", flag_text(base.subtract)),
        );
    }
    if let Some(defaults) = &header.defaults {
        let mut node = Element::new("DEFAULTS");
        if let Some(bits) = defaults.datasize_bits {
            node = node.with_attr("datasizeinbits", bits.to_string());
        }
        if let Some(digits) = defaults.sig_digits {
            node = node.with_attr("sigdigits", digits.to_string());
        }
        if let Some(output) = &defaults.output_type {
            node = node.with_attr("outputtype", output.as_str());
        }
        element.push(
            node.with_attr("signed", flag_text(defaults.signed))
                .with_attr("lsbfirst", flag_text(defaults.lsb_first))
                .with_attr("float", flag_text(defaults.float)),
        );
    }
    for region in &header.regions {
        let mut node = Element::new("REGION");
        node.attributes = region.attributes.clone();
        element.push(node);
    }
    for category in &header.categories {
        element.push(
            Element::new("CATEGORY")
                .with_attr("index", category.index.as_str())
                .with_attr("name", category.name.as_str()),
        );
    }
    element.children.extend(header.extras.iter().cloned());
    element
}

/// `uniqueid`/`flags` attributes plus title, description and categories.
fn identity_element(tag: &str, common: &ObjectCommon, title: Option<&str>) -> Element {
    let mut element = Element::new(tag);
    if let Some(id) = &common.unique_id {
        element = element.with_attr("uniqueid", id.as_str());
    }
    if let Some(flags) = &common.flags {
        element = element.with_attr("flags", flags.as_str());
    }
    text_child(&mut element, "title", title);
    text_child(&mut element, "description", common.description.as_deref());
    for category in &common.categories {
        element.push(
            Element::new("CATEGORYMEM")
                .with_attr("index", category.index.as_str())
                .with_attr("category", category.category.as_str()),
        );
    }
    element
}

/// Embedded data, datatype, units, display metadata and math.
fn push_layout(element: &mut Element, common: &ObjectCommon, counts: (Option<u32>, Option<u32>)) {
    if common.has_embedded_data || common.address.is_some() {
        let mut embedded = Element::new("EMBEDDEDDATA");
        if let Some(flags) = common.type_flags {
            embedded = embedded.with_attr("mmedtypeflags", format!("0x{:02X}", flags));
        }
        if let Some(address) = common.address {
            embedded = embedded.with_attr("mmedaddress", format!("0x{:X}", address));
        }
        embedded = embedded.with_attr("mmedelementsizebits", common.element_size_bits.to_string());
        if let Some(rows) = counts.0 {
            embedded = embedded.with_attr("mmedrowcount", rows.to_string());
        }
        if let Some(columns) = counts.1 {
            embedded = embedded.with_attr("mmedcolcount", columns.to_string());
        }
        embedded = embedded
            .with_attr("mmedmajorstridebits", common.major_stride_bits.to_string())
            .with_attr("mmedminorstridebits", common.minor_stride_bits.to_string());
        element.push(embedded);
    }

    if !common.datatype.raw.is_empty() {
        text_child(element, "datatype", Some(&common.datatype.raw));
    }
    text_child(element, "units", common.units.as_deref());
    text_child(element, "unittype", common.unit_type.as_ref().map(|c| c.raw.as_str()));
    text_child(element, "outputtype", common.output_type.as_ref().map(|c| c.raw.as_str()));
    text_child(element, "decimalpl", common.decimal_places.as_deref());
    text_child(element, "min", common.min.as_deref());
    text_child(element, "max", common.max.as_deref());

    for math in &common.math {
        let mut node = Element::new("MATH").with_attr("equation", math.equation.as_str());
        if let Some(row) = math.row {
            node = node.with_attr("row", row.to_string());
        }
        if let Some(col) = math.col {
            node = node.with_attr("col", col.to_string());
        }
        for var in &math.vars {
            node.push(Element::new("VAR").with_attr("id", var.as_str()));
        }
        element.push(node);
    }
}

fn axis_element(axis: &Axis) -> Element {
    let mut element = identity_element("XDFAXIS", &axis.common, axis.title.as_deref());
    element.attributes.insert(0, ("id".to_string(), axis.axis_id.clone()));
    push_layout(&mut element, &axis.common, (axis.rows, axis.columns));
    if let Some(count) = axis.index_count {
        text_child(&mut element, "indexcount", Some(&count.to_string()));
    }
    for (index, value) in &axis.labels {
        element.push(
            Element::new("LABEL")
                .with_attr("index", index.to_string())
                .with_attr("value", value.as_str()),
        );
    }
    for index in &axis.dalink {
        element.push(Element::new("DALINK").with_attr("index", index.to_string()));
    }
    element.children.extend(axis.common.extras.iter().cloned());
    element
}

fn table_element(table: &Table, axes: &[&Axis]) -> Element {
    let common = &table.common;
    let mut element = identity_element("XDFTABLE", common, Some(&common.name));
    for axis in axes {
        element.push(axis_element(axis));
    }

    let mut z_axis = Element::new("XDFAXIS").with_attr("id", "z");
    if let Some(id) = &table.data_axis_id {
        z_axis = z_axis.with_attr("uniqueid", id.as_str());
    }
    push_layout(&mut z_axis, common, (Some(table.rows), Some(table.columns)));
    z_axis.children.extend(table.data_axis_extras.iter().cloned());
    element.push(z_axis);

    element.children.extend(common.extras.iter().cloned());
    element
}

fn single_element(tag: &str, common: &ObjectCommon, axes: &[&Axis]) -> Element {
    let mut element = identity_element(tag, common, Some(&common.name));
    push_layout(&mut element, common, (None, None));
    for axis in axes {
        element.push(axis_element(axis));
    }
    element.children.extend(common.extras.iter().cloned());
    element
}
