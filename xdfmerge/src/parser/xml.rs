use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unexpected end of input inside <{0}>")]
    UnexpectedEof(String),
    #[error("Unexpected closing tag: </{0}>")]
    UnexpectedClose(String),
    #[error("Document has no root element")]
    MissingRoot,
    #[error("Invalid escape sequence: {0}")]
    InvalidEscape(String),
    #[error("XML error {0}")]
    Xml(String),
    #[error("XML write error: {0}")]
    Write(String),
}

/// One markup element: tag name, attributes in document order, trimmed text and children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// First child element with the given tag (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(name))
    }

    pub fn get_all(&self, name: &str) -> Vec<&Element> {
        self.children.iter().filter(|c| c.is(name)).collect()
    }

    /// Text of the first child with the given tag, `None` when absent or blank.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.text.is_empty()
    }
}

/// Builds an [`Element`] tree from markup text.
pub struct XmlParser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> XmlParser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            reader: Reader::from_str(input),
        }
    }

    pub fn parse(&mut self) -> Result<Element, ParseError> {
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match self.reader.read_event() {
                Ok(Event::Start(e)) => stack.push(element_from_start(&e)?),
                Ok(Event::Empty(e)) => {
                    let element = element_from_start(&e)?;
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let mut element = stack.pop().ok_or(ParseError::UnexpectedClose(name))?;
                    element.text = element.text.trim().to_string();
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::Text(e)) => {
                    if let Some(top) = stack.last_mut() {
                        let raw = String::from_utf8_lossy(e.as_ref());
                        top.text.push_str(&unescape(&raw)?);
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                    }
                }
                Ok(Event::GeneralRef(e)) => {
                    if let Some(top) = stack.last_mut() {
                        let name = String::from_utf8_lossy(&e);
                        top.text.push_str(&resolve_entity(&name));
                    }
                }
                Ok(Event::Eof) => break,
                // Declarations, comments, processing instructions and doctypes carry no data.
                Ok(_) => {}
                Err(e) => {
                    return Err(ParseError::Xml(format!(
                        "at byte {}: {}",
                        self.reader.buffer_position(),
                        e
                    )))
                }
            }
        }

        if let Some(open) = stack.last() {
            return Err(ParseError::UnexpectedEof(open.name.clone()));
        }
        root.ok_or(ParseError::MissingRoot)
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, ParseError> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ParseError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attr.value);
        element.attributes.push((key, unescape(&raw)?));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            // Only the first top-level element is the document root.
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, ParseError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    quick_xml::escape::unescape(raw)
        .map(|s| s.into_owned())
        .map_err(|e| ParseError::InvalidEscape(e.to_string()))
}

fn resolve_entity(name: &str) -> String {
    match name {
        "amp" => "&".to_string(),
        "lt" => "<".to_string(),
        "gt" => ">".to_string(),
        "quot" => "\"".to_string(),
        "apos" => "'".to_string(),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()
            } else {
                name.strip_prefix('#').and_then(|dec| dec.parse().ok())
            };
            match code.and_then(char::from_u32) {
                Some(ch) => ch.to_string(),
                None => format!("&{};", name),
            }
        }
    }
}

/// Serialize an element tree as an indented UTF-8 document with an XML declaration.
pub fn write_document(root: &Element) -> Result<String, ParseError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| ParseError::Write(e.to_string()))?;
    write_element(&mut writer, root)?;
    let mut out = String::from_utf8(writer.into_inner()).map_err(|e| ParseError::Write(e.to_string()))?;
    out.push('\n');
    Ok(out)
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<(), ParseError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.is_leaf() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(|e| ParseError::Write(e.to_string()));
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|e| ParseError::Write(e.to_string()))?;
    if !element.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&element.text)))
            .map_err(|e| ParseError::Write(e.to_string()))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|e| ParseError::Write(e.to_string()))
}
