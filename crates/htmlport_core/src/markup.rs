use anyhow::{Context, Result};
use quick_xml::Reader;
use quick_xml::escape::resolve_html5_entity;
use quick_xml::events::{BytesStart, Event};

pub const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const XML_ENTITIES: [&str; 5] = ["amp", "lt", "gt", "quot", "apos"];

/// Owned markup tree. Text and attribute values are stored in escaped form so
/// serialization never has to re-encode entity references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder form of [`Element::set_attr`] taking an unescaped value.
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, &escape_attribute(value));
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Raw (escaped) attribute value, matched case-insensitively.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
            .map(|attribute| attribute.value.as_str())
    }

    /// Attribute value with entity references decoded.
    pub fn attr_decoded(&self, name: &str) -> Option<String> {
        self.attr(name).map(decode_entities)
    }

    /// Set an already-escaped attribute value, replacing any case variant.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(existing) = self
            .attributes
            .iter_mut()
            .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
        {
            existing.name = name.to_string();
            existing.value = value.to_string();
            return;
        }
        self.attributes.push(Attribute {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Decoded text of all descendant text and CDATA nodes.
    pub fn text_content(&self) -> String {
        let mut output = String::new();
        collect_text(&self.children, &mut output);
        output
    }

    pub fn has_element_children(&self) -> bool {
        self.children
            .iter()
            .any(|child| matches!(child, Node::Element(_)))
    }
}

fn collect_text(nodes: &[Node], output: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => output.push_str(&decode_entities(text)),
            Node::CData(text) => output.push_str(text),
            Node::Element(element) => collect_text(&element.children, output),
        }
    }
}

/// Parse a markup fragment into a node list.
///
/// The builder is lenient toward author HTML: end tags match case-insensitively,
/// unmatched end tags are ignored and unclosed elements are closed at end of
/// input. Comments, processing instructions and the doctype are dropped.
pub fn parse_fragment(input: &str) -> Result<Vec<Node>> {
    let mut reader = Reader::from_str(input);
    {
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.expand_empty_elements = false;
    }

    let mut stack: Vec<Element> = vec![Element::new("")];
    loop {
        let position = reader.buffer_position();
        let event = reader
            .read_event()
            .with_context(|| format!("failed to parse markup near byte {position}"))?;
        match event {
            Event::Start(start) => stack.push(element_from_start(&start)),
            Event::Empty(start) => {
                let element = element_from_start(&start);
                push_child(&mut stack, Node::Element(element));
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                let open_index = stack
                    .iter()
                    .rposition(|element| element.is_named(&name))
                    .filter(|index| *index > 0);
                if let Some(index) = open_index {
                    while stack.len() > index {
                        close_top(&mut stack);
                    }
                }
            }
            Event::Text(text) => {
                let raw = String::from_utf8_lossy(&text.into_inner()).to_string();
                if !raw.is_empty() {
                    push_child(&mut stack, Node::Text(sanitize_escaped(&raw)));
                }
            }
            Event::CData(data) => {
                let raw = String::from_utf8_lossy(&data.into_inner()).to_string();
                push_child(&mut stack, Node::CData(raw));
            }
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    while stack.len() > 1 {
        close_top(&mut stack);
    }
    Ok(stack.pop().map(|root| root.children).unwrap_or_default())
}

fn element_from_start(start: &BytesStart<'_>) -> Element {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut element = Element::new(name);
    for attribute in start.html_attributes().with_checks(false) {
        let Ok(attribute) = attribute else {
            continue;
        };
        let name = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
        let raw = String::from_utf8_lossy(&attribute.value).to_string();
        element.attributes.push(Attribute {
            name,
            value: sanitize_attribute(&raw),
        });
    }
    element
}

fn push_child(stack: &mut [Element], node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn close_top(stack: &mut Vec<Element>) {
    if let Some(element) = stack.pop() {
        push_child(stack, Node::Element(element));
    }
}

pub fn serialize_nodes(nodes: &[Node]) -> String {
    let mut output = String::new();
    for node in nodes {
        write_node(node, &mut output);
    }
    output
}

pub fn serialize_element(element: &Element) -> String {
    let mut output = String::new();
    write_element(element, &mut output);
    output
}

fn write_node(node: &Node, output: &mut String) {
    match node {
        Node::Element(element) => write_element(element, output),
        Node::Text(text) => output.push_str(text),
        Node::CData(text) => {
            output.push_str("<![CDATA[");
            output.push_str(&text.replace("]]>", "]]]]><![CDATA[>"));
            output.push_str("]]>");
        }
    }
}

fn write_element(element: &Element, output: &mut String) {
    output.push('<');
    output.push_str(&element.name);
    for attribute in &element.attributes {
        output.push(' ');
        output.push_str(&attribute.name);
        output.push_str("=\"");
        output.push_str(&attribute.value);
        output.push('"');
    }

    if element.children.is_empty() && self_closes(&element.name) {
        if element.attributes.is_empty() {
            output.push_str("/>");
        } else {
            output.push_str(" />");
        }
        return;
    }

    output.push('>');
    for child in &element.children {
        write_node(child, output);
    }
    output.push_str("</");
    output.push_str(&element.name);
    output.push('>');
}

/// Void elements and namespaced macro elements serialize self-closed when empty.
fn self_closes(name: &str) -> bool {
    name.contains(':')
        || VOID_ELEMENTS
            .iter()
            .any(|void| void.eq_ignore_ascii_case(name))
}

pub fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_attribute(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}

fn sanitize_attribute(raw: &str) -> String {
    sanitize_escaped(raw)
        .replace('<', "&lt;")
        .replace('"', "&quot;")
}

/// Make raw author text safe for strict XML: bare `&` is escaped and named
/// HTML entities outside the XML set become numeric references.
pub fn sanitize_escaped(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(index) = rest.find('&') {
        output.push_str(&rest[..index]);
        let candidate = &rest[index + 1..];
        match entity_reference(candidate) {
            Some((entity, consumed)) => {
                if entity.starts_with('#') || XML_ENTITIES.contains(&entity) {
                    output.push('&');
                    output.push_str(&candidate[..consumed]);
                } else if let Some(value) = resolve_html5_entity(entity) {
                    for ch in value.chars() {
                        output.push_str(&format!("&#{};", u32::from(ch)));
                    }
                } else {
                    output.push_str("&amp;");
                    output.push_str(&candidate[..consumed]);
                }
                rest = &candidate[consumed..];
            }
            None => {
                output.push_str("&amp;");
                rest = candidate;
            }
        }
    }
    output.push_str(rest);
    output
}

/// Recognize `name;`, `#123;` or `#x1F;` at the start of `value`.
/// Returns the entity body (without `;`) and the number of bytes consumed.
fn entity_reference(value: &str) -> Option<(&str, usize)> {
    let semi = value.find(';')?;
    let body = &value[..semi];
    if body.is_empty() || body.len() > 32 {
        return None;
    }
    let valid = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
        !hex.is_empty() && hex.chars().all(|ch| ch.is_ascii_hexdigit())
    } else if let Some(decimal) = body.strip_prefix('#') {
        !decimal.is_empty() && decimal.chars().all(|ch| ch.is_ascii_digit())
    } else {
        body.chars()
            .next()
            .is_some_and(|ch| ch.is_ascii_alphabetic())
            && body.chars().all(|ch| ch.is_ascii_alphanumeric())
    };
    if valid { Some((body, semi + 1)) } else { None }
}

/// Decode XML, HTML5 named and numeric entity references. Unknown references
/// are kept verbatim.
pub fn decode_entities(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(index) = rest.find('&') {
        output.push_str(&rest[..index]);
        let candidate = &rest[index + 1..];
        let Some((entity, consumed)) = entity_reference(candidate) else {
            output.push('&');
            rest = candidate;
            continue;
        };
        let decoded = if entity.starts_with("#x") || entity.starts_with("#X") {
            u32::from_str_radix(&entity[2..], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
        } else if let Some(decimal) = entity.strip_prefix('#') {
            decimal
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
        } else {
            resolve_html5_entity(entity).map(str::to_string)
        };
        match decoded {
            Some(text) => output.push_str(&text),
            None => {
                output.push('&');
                output.push_str(&candidate[..consumed]);
            }
        }
        rest = &candidate[consumed..];
    }
    output.push_str(rest);
    output
}

/// Depth-first search for the first element satisfying `predicate`.
pub fn find_element<'a>(
    nodes: &'a [Node],
    predicate: &dyn Fn(&Element) -> bool,
) -> Option<&'a Element> {
    for node in nodes {
        if let Node::Element(element) = node {
            if predicate(element) {
                return Some(element);
            }
            if let Some(found) = find_element(&element.children, predicate) {
                return Some(found);
            }
        }
    }
    None
}

/// All elements named `name` (case-insensitive), in document order.
pub fn collect_elements<'a>(nodes: &'a [Node], name: &str) -> Vec<&'a Element> {
    let mut output = Vec::new();
    collect_named(nodes, name, &mut output);
    output
}

fn collect_named<'a>(nodes: &'a [Node], name: &str, output: &mut Vec<&'a Element>) {
    for node in nodes {
        if let Node::Element(element) = node {
            if element.is_named(name) {
                output.push(element);
            }
            collect_named(&element.children, name, output);
        }
    }
}
