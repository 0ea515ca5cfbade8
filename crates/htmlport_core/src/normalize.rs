use std::collections::HashSet;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};

use crate::markup::{
    Attribute, Element, Node, VOID_ELEMENTS, find_element, parse_fragment, serialize_nodes,
};

pub const DISALLOWED_ELEMENTS: [&str; 5] = ["script", "style", "meta", "link", "head"];

pub const BOOLEAN_ATTRIBUTES: [&str; 22] = [
    "async",
    "autofocus",
    "autoplay",
    "checked",
    "compact",
    "controls",
    "declare",
    "defer",
    "disabled",
    "hidden",
    "ismap",
    "loop",
    "multiple",
    "muted",
    "noresize",
    "noshade",
    "nowrap",
    "open",
    "readonly",
    "required",
    "reversed",
    "selected",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Keep `id` attributes so anchor links can find their targets.
    pub keep_ids: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self { keep_ids: true }
    }
}

/// Convert author HTML into a strict-XML body fragment.
pub fn normalize_markup(input: &str, options: &NormalizeOptions) -> Result<String> {
    let prepared = close_void_elements(&escape_stray_angles(&strip_raw_text_elements(input)));
    let nodes = parse_fragment(&prepared).context("failed to parse document markup")?;
    let nodes = normalize_nodes(nodes, options);
    Ok(body_content(&nodes).unwrap_or_else(|| serialize_nodes(&nodes)))
}

/// Script and style bodies are not markup; drop them before anything parses
/// their content as tags.
pub(crate) fn strip_raw_text_elements(input: &str) -> String {
    static RAW_TEXT: OnceLock<Regex> = OnceLock::new();
    let raw_text = RAW_TEXT.get_or_init(|| {
        Regex::new(
            r"(?is)<(?:script|style)\b[^>]*/\s*>|<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>",
        )
        .expect("valid regex")
    });
    raw_text.replace_all(input, "").into_owned()
}

/// Author text such as `a < b` cannot be parsed as XML; escape any `<` that
/// does not start a tag, end tag, comment, CDATA or declaration.
pub(crate) fn escape_stray_angles(input: &str) -> String {
    static STRAY: OnceLock<Regex> = OnceLock::new();
    let stray = STRAY.get_or_init(|| Regex::new(r"<([^A-Za-z/!?]|$)").expect("valid regex"));
    stray.replace_all(input, "&lt;$1").into_owned()
}

/// Rewrite every opening tag of a void element into its self-closed form and
/// drop stray void end tags such as `</br>`.
pub(crate) fn close_void_elements(input: &str) -> String {
    static OPEN: OnceLock<Regex> = OnceLock::new();
    static CLOSE: OnceLock<Regex> = OnceLock::new();
    let open = OPEN.get_or_init(|| {
        Regex::new(&format!(
            r#"(?i)<({})\b((?:[^>"']|"[^"]*"|'[^']*')*?)\s*/?\s*>"#,
            VOID_ELEMENTS.join("|")
        ))
        .expect("valid regex")
    });
    let close = CLOSE.get_or_init(|| {
        Regex::new(&format!(r"(?i)</({})\s*>", VOID_ELEMENTS.join("|"))).expect("valid regex")
    });

    let closed = open.replace_all(input, |captures: &Captures<'_>| {
        let name = &captures[1];
        let attributes = captures[2].trim();
        if attributes.is_empty() {
            format!("<{name}/>")
        } else {
            format!("<{name} {attributes} />")
        }
    });
    close.replace_all(&closed, "").into_owned()
}

fn normalize_nodes(nodes: Vec<Node>, options: &NormalizeOptions) -> Vec<Node> {
    nodes
        .into_iter()
        .filter_map(|node| match node {
            Node::Element(element) => {
                if DISALLOWED_ELEMENTS
                    .iter()
                    .any(|name| element.is_named(name))
                {
                    None
                } else {
                    Some(Node::Element(normalize_element(element, options)))
                }
            }
            other => Some(other),
        })
        .collect()
}

fn normalize_element(element: Element, options: &NormalizeOptions) -> Element {
    let Element {
        name,
        attributes,
        children,
    } = element;

    let attributes = strip_presentation_attributes(attributes, options);
    let mut attributes = lowercase_attribute_names(attributes);
    for attribute in &mut attributes {
        if BOOLEAN_ATTRIBUTES.contains(&attribute.name.as_str()) {
            attribute.value = attribute.name.clone();
        }
    }

    Element {
        name: name.to_ascii_lowercase(),
        attributes,
        children: normalize_nodes(children, options),
    }
}

fn strip_presentation_attributes(
    attributes: Vec<Attribute>,
    options: &NormalizeOptions,
) -> Vec<Attribute> {
    attributes
        .into_iter()
        .filter(|attribute| {
            let name = attribute.name.as_str();
            if name.eq_ignore_ascii_case("style") || name.eq_ignore_ascii_case("class") {
                return false;
            }
            options.keep_ids || !name.eq_ignore_ascii_case("id")
        })
        .collect()
}

/// Lowercase names; on a case-only collision the attribute already spelled in
/// lowercase wins, otherwise the first occurrence wins.
fn lowercase_attribute_names(attributes: Vec<Attribute>) -> Vec<Attribute> {
    let already_lower: HashSet<String> = attributes
        .iter()
        .filter(|attribute| attribute.name == attribute.name.to_ascii_lowercase())
        .map(|attribute| attribute.name.clone())
        .collect();

    let mut seen = HashSet::new();
    let mut output = Vec::with_capacity(attributes.len());
    for attribute in attributes {
        let lower = attribute.name.to_ascii_lowercase();
        if lower != attribute.name && already_lower.contains(&lower) {
            continue;
        }
        if !seen.insert(lower.clone()) {
            continue;
        }
        output.push(Attribute {
            name: lower,
            value: attribute.value,
        });
    }
    output
}

fn body_content(nodes: &[Node]) -> Option<String> {
    find_element(nodes, &|element: &Element| element.name == "body")
        .map(|body| serialize_nodes(&body.children))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(input: &str) -> String {
        normalize_markup(input, &NormalizeOptions::default()).expect("normalize")
    }

    #[test]
    fn void_elements_become_self_closed() {
        assert_eq!(normalize("<img src=\"a.png\">"), "<img src=\"a.png\" />");
        assert_eq!(normalize("<p>a<br>b<BR/>c<hr ></p>"), "<p>a<br/>b<br/>c<hr/></p>");
        assert_eq!(
            normalize("<input type='text' value=\"x\"/>"),
            "<input type=\"text\" value=\"x\" />"
        );
    }

    #[test]
    fn void_rewrite_does_not_touch_longer_names() {
        assert_eq!(
            close_void_elements("<break>x</break><br>"),
            "<break>x</break><br/>"
        );
        assert_eq!(close_void_elements("<p>a<br></br>b</p>"), "<p>a<br/>b</p>");
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            "<html><body><P CLASS=\"x\">Hello<BR>World <img SRC=\"a.png\" alt=\"A\"></P></body></html>",
            "<div><input type=\"checkbox\" CHECKED><a href=\"b.html\">B &amp; c&nbsp;d</a></div>",
            "<table><tr><td>1 & 2</td></tr></table>",
        ];
        for input in inputs {
            let once = normalize(input);
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn lowercases_names_and_strips_presentation_attributes() {
        assert_eq!(
            normalize("<DIV CLASS=\"x\" ID=\"y\" STYLE=\"color:red\">t</DIV>"),
            "<div id=\"y\">t</div>"
        );
        assert_eq!(
            normalize_markup(
                "<DIV CLASS=\"x\" ID=\"y\">t</DIV>",
                &NormalizeOptions { keep_ids: false }
            )
            .expect("normalize"),
            "<div>t</div>"
        );
    }

    #[test]
    fn lowercase_attribute_wins_case_collisions() {
        assert_eq!(
            normalize("<td ALIGN=\"left\" align=\"right\">x</td>"),
            "<td align=\"right\">x</td>"
        );
    }

    #[test]
    fn boolean_attributes_take_their_own_name() {
        assert_eq!(
            normalize("<input type=\"checkbox\" CHECKED disabled=\"true\" Selected=\"no\">"),
            "<input type=\"checkbox\" checked=\"checked\" disabled=\"disabled\" selected=\"selected\" />"
        );
    }

    #[test]
    fn removes_disallowed_elements_and_comments() {
        let input = "<html><head><title>t</title><style>p{}</style></head><body><!-- c --><script>x()</script><p>Kept</p><LINK rel=\"x\"></body></html>";
        assert_eq!(normalize(input), "<p>Kept</p>");
    }

    #[test]
    fn script_bodies_with_angle_brackets_do_not_swallow_the_page() {
        let input = "<html><body><script>for(var i=0;i<n;i++){}</script><p>Kept</p><p>Also kept</p></body></html>";
        assert_eq!(normalize(input), "<p>Kept</p><p>Also kept</p>");
        let input = "<STYLE type=\"text/css\">a<b{}</STYLE><p>x</p><script src=\"a.js\"/><p>y</p>";
        assert_eq!(normalize(input), "<p>x</p><p>y</p>");
    }

    #[test]
    fn returns_whole_fragment_without_body() {
        assert_eq!(normalize("<p>one</p><p>two</p>"), "<p>one</p><p>two</p>");
    }

    #[test]
    fn escapes_stray_angle_brackets() {
        assert_eq!(normalize("<p>1 < 2</p>"), "<p>1 &lt; 2</p>");
    }
}
