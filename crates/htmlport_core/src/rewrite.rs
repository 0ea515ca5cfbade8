use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::filesystem::{
    encode_path_segment, is_external_reference, reference_extension, reference_filename,
    resolve_local_path,
};
use crate::markup::{
    Element, Node, VOID_ELEMENTS, escape_attribute, escape_text, parse_fragment, serialize_nodes,
};
use crate::pagemap::PageMap;

/// Link targets with these extensions are uploaded and linked as attachments.
pub const DOWNLOADABLE_EXTENSIONS: [&str; 15] = [
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "zip", "txt", "csv", "png", "jpg", "jpeg",
    "gif", "svg",
];

#[derive(Debug, Clone)]
pub struct RewriteContext<'a> {
    pub title: &'a str,
    pub page_map: &'a PageMap,
    /// Directory of the document being rewritten; relative references resolve here.
    pub base_dir: &'a Path,
    pub page_id: &'a str,
    /// Store base URL used to build direct attachment download links.
    pub download_base: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewriteDiagnostic {
    MissingAsset { reference: String, path: PathBuf },
}

impl RewriteDiagnostic {
    pub fn describe(&self) -> String {
        match self {
            Self::MissingAsset { reference, path } => {
                format!("missing asset {reference} ({})", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RewriteOutput {
    pub markup: String,
    /// Relative references to upload, in document order. May contain duplicates.
    pub uploads: Vec<String>,
    pub diagnostics: Vec<RewriteDiagnostic>,
}

#[derive(Debug, Default)]
struct RewriteState {
    uploads: Vec<String>,
    queued_images: HashSet<String>,
    anchor_targets: Vec<String>,
    diagnostics: Vec<RewriteDiagnostic>,
}

impl RewriteState {
    fn queue(&mut self, reference: &str) {
        self.uploads.push(reference.to_string());
    }

    fn missing(&mut self, reference: &str, path: PathBuf) {
        self.diagnostics.push(RewriteDiagnostic::MissingAsset {
            reference: reference.to_string(),
            path,
        });
    }
}

/// Rewrite images, links and anchors of normalized markup into store macros.
///
/// Images are handled before links so that a link pointing at an image of the
/// same document can be recognized.
pub fn rewrite_references(markup: &str, context: &RewriteContext<'_>) -> Result<RewriteOutput> {
    let nodes = parse_fragment(markup)
        .with_context(|| format!("failed to parse normalized markup for {}", context.title))?;
    let mut state = RewriteState::default();

    let nodes = rewrite_images(nodes, context, &mut state);
    let nodes = rewrite_links(nodes, context, &mut state);
    let mut pending = state.anchor_targets.clone();
    let nodes = define_anchors(nodes, &mut pending);

    Ok(RewriteOutput {
        markup: serialize_nodes(&nodes),
        uploads: state.uploads,
        diagnostics: state.diagnostics,
    })
}

fn rewrite_images(
    nodes: Vec<Node>,
    context: &RewriteContext<'_>,
    state: &mut RewriteState,
) -> Vec<Node> {
    nodes
        .into_iter()
        .map(|node| match node {
            Node::Element(element) if element.is_named("img") => {
                Node::Element(rewrite_image(element, context, state))
            }
            Node::Element(mut element) => {
                element.children = rewrite_images(element.children, context, state);
                Node::Element(element)
            }
            other => other,
        })
        .collect()
}

fn rewrite_image(
    element: Element,
    context: &RewriteContext<'_>,
    state: &mut RewriteState,
) -> Element {
    let Some(src) = element.attr_decoded("src") else {
        return element;
    };
    let src = src.trim().to_string();
    if src.is_empty() || is_external_reference(&src) {
        return element;
    }

    let resolved = resolve_local_path(context.base_dir, &src);
    if !resolved.is_file() {
        state.missing(&src, resolved);
        return element;
    }

    state.queue(&src);
    state.queued_images.insert(src.clone());

    let mut image = Element::new("ac:image");
    for (source, target) in [
        ("alt", "ac:alt"),
        ("title", "ac:title"),
        ("width", "ac:width"),
        ("height", "ac:height"),
    ] {
        if let Some(value) = element.attr(source) {
            image.set_attr(target, value);
        }
    }
    image.with_child(Node::Element(
        Element::new("ri:attachment").with_attr("ri:filename", &reference_filename(&src)),
    ))
}

fn rewrite_links(
    nodes: Vec<Node>,
    context: &RewriteContext<'_>,
    state: &mut RewriteState,
) -> Vec<Node> {
    nodes
        .into_iter()
        .map(|node| match node {
            Node::Element(element) if element.is_named("a") && element.attr("href").is_some() => {
                Node::Element(rewrite_link(element, context, state))
            }
            Node::Element(mut element) => {
                element.children = rewrite_links(element.children, context, state);
                Node::Element(element)
            }
            other => other,
        })
        .collect()
}

fn rewrite_link(
    element: Element,
    context: &RewriteContext<'_>,
    state: &mut RewriteState,
) -> Element {
    let href = element
        .attr_decoded("href")
        .map(|value| value.trim().to_string())
        .unwrap_or_default();
    if href.is_empty() {
        return element;
    }

    if let Some((title, fragment)) = context.page_map.resolve(&href) {
        let mut link = Element::new("ac:link");
        if let Some(fragment) = fragment {
            link = link.with_attr("ac:anchor", &fragment);
        }
        let target = Element::new("ri:page").with_attr("ri:content-title", title);
        return link
            .with_child(Node::Element(target))
            .with_child(link_body(element, &href));
    }

    if let Some(anchor) = href.strip_prefix('#') {
        if anchor.is_empty() {
            return element;
        }
        if !state.anchor_targets.iter().any(|target| target == anchor) {
            state.anchor_targets.push(anchor.to_string());
        }
        return Element::new("ac:link")
            .with_attr("ac:anchor", anchor)
            .with_child(link_body(element, &href));
    }

    if state.queued_images.contains(&href) {
        let url = format!(
            "{}/download/attachments/{}/{}",
            context.download_base.trim_end_matches('/'),
            encode_path_segment(context.page_id),
            encode_path_segment(&reference_filename(&href))
        );
        let mut link = element;
        link.set_attr("href", &escape_attribute(&url));
        return link;
    }

    if is_external_reference(&href) {
        return element;
    }
    let downloadable = reference_extension(&href).is_some_and(|extension| {
        DOWNLOADABLE_EXTENSIONS.contains(&extension.as_str())
    });
    if !downloadable {
        return element;
    }

    let resolved = resolve_local_path(context.base_dir, &href);
    if !resolved.is_file() {
        state.missing(&href, resolved);
        return element;
    }
    state.queue(&href);
    let target = Element::new("ri:attachment").with_attr("ri:filename", &reference_filename(&href));
    Element::new("ac:link")
        .with_child(Node::Element(target))
        .with_child(link_body(element, &href))
}

/// Rich links keep their child markup; plain ones carry their text as CDATA.
fn link_body(element: Element, href: &str) -> Node {
    if element.has_element_children() {
        let mut body = Element::new("ac:link-body");
        body.children = element.children;
        return Node::Element(body);
    }
    let text = element.text_content();
    let text = if text.trim().is_empty() {
        href.to_string()
    } else {
        text
    };
    Node::Element(Element::new("ac:plain-text-link-body").with_child(Node::CData(text)))
}

/// Prepend an anchor definition to the first element carrying each target id.
/// Void elements get the definition as a preceding sibling instead.
fn define_anchors(nodes: Vec<Node>, pending: &mut Vec<String>) -> Vec<Node> {
    if pending.is_empty() {
        return nodes;
    }
    let mut output = Vec::with_capacity(nodes.len());
    for node in nodes {
        let Node::Element(mut element) = node else {
            output.push(node);
            continue;
        };
        let matched = anchor_identity(&element)
            .and_then(|identity| pending.iter().position(|target| *target == identity));
        match matched {
            Some(index) => {
                let anchor = pending.remove(index);
                element.children = define_anchors(element.children, pending);
                if is_void(&element.name) {
                    output.push(anchor_definition(&anchor));
                } else {
                    element.children.insert(0, anchor_definition(&anchor));
                }
                output.push(Node::Element(element));
            }
            None => {
                element.children = define_anchors(element.children, pending);
                output.push(Node::Element(element));
            }
        }
    }
    output
}

fn anchor_identity(element: &Element) -> Option<String> {
    if element.name.contains(':') {
        return None;
    }
    element
        .attr_decoded("id")
        .or_else(|| {
            if element.is_named("a") {
                element.attr_decoded("name")
            } else {
                None
            }
        })
        .filter(|value| !value.is_empty())
}

fn anchor_definition(anchor: &str) -> Node {
    let parameter = Element::new("ac:parameter")
        .with_attr("ac:name", "")
        .with_child(Node::Text(escape_text(anchor)));
    Node::Element(
        Element::new("ac:structured-macro")
            .with_attr("ac:name", "anchor")
            .with_child(Node::Element(parameter)),
    )
}

fn is_void(name: &str) -> bool {
    VOID_ELEMENTS.iter().any(|void| void.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn context<'a>(base_dir: &'a Path, page_map: &'a PageMap) -> RewriteContext<'a> {
        RewriteContext {
            title: "Doc",
            page_map,
            base_dir,
            page_id: "42",
            download_base: "https://wiki.example.org/",
        }
    }

    #[test]
    fn images_become_attachment_macros_and_are_queued() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("img")).expect("create img");
        fs::write(temp.path().join("img").join("pic.png"), b"png").expect("write pic");
        let page_map = PageMap::new();

        let output = rewrite_references(
            "<p><img src=\"img/pic.png\" alt=\"A pic\" width=\"40\" /></p>",
            &context(temp.path(), &page_map),
        )
        .expect("rewrite");

        assert_eq!(
            output.markup,
            "<p><ac:image ac:alt=\"A pic\" ac:width=\"40\"><ri:attachment ri:filename=\"pic.png\" /></ac:image></p>"
        );
        assert_eq!(output.uploads, vec!["img/pic.png".to_string()]);
        assert!(output.diagnostics.is_empty());
    }

    #[test]
    fn missing_images_are_reported_and_left_untouched() {
        let temp = tempdir().expect("tempdir");
        let page_map = PageMap::new();
        let markup = "<img src=\"gone.png\" />";

        let output = rewrite_references(markup, &context(temp.path(), &page_map)).expect("rewrite");

        assert_eq!(output.markup, markup);
        assert!(output.uploads.is_empty());
        assert_eq!(output.diagnostics.len(), 1);
        assert!(output.diagnostics[0].describe().contains("gone.png"));
    }

    #[test]
    fn page_map_links_win_over_downloadable_extensions() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("report.pdf"), b"pdf").expect("write pdf");
        let mut page_map = PageMap::new();
        page_map.insert("report.pdf", "Quarterly Report");
        page_map.insert("b.html", "Page B");

        let output = rewrite_references(
            "<p><a href=\"report.pdf\">Report</a> and <a href=\"b.html\">B</a></p>",
            &context(temp.path(), &page_map),
        )
        .expect("rewrite");

        assert_eq!(
            output.markup,
            "<p><ac:link><ri:page ri:content-title=\"Quarterly Report\" /><ac:plain-text-link-body><![CDATA[Report]]></ac:plain-text-link-body></ac:link> and <ac:link><ri:page ri:content-title=\"Page B\" /><ac:plain-text-link-body><![CDATA[B]]></ac:plain-text-link-body></ac:link></p>"
        );
        assert!(output.uploads.is_empty());
    }

    #[test]
    fn anchor_links_define_their_targets_once() {
        let temp = tempdir().expect("tempdir");
        let page_map = PageMap::new();

        let output = rewrite_references(
            "<p><a href=\"#sec1\">Go</a> <a href=\"#sec1\">Again</a></p><h2 id=\"sec1\">Section</h2>",
            &context(temp.path(), &page_map),
        )
        .expect("rewrite");

        assert_eq!(
            output.markup,
            "<p><ac:link ac:anchor=\"sec1\"><ac:plain-text-link-body><![CDATA[Go]]></ac:plain-text-link-body></ac:link> <ac:link ac:anchor=\"sec1\"><ac:plain-text-link-body><![CDATA[Again]]></ac:plain-text-link-body></ac:link></p><h2 id=\"sec1\"><ac:structured-macro ac:name=\"anchor\"><ac:parameter ac:name=\"\">sec1</ac:parameter></ac:structured-macro>Section</h2>"
        );
    }

    #[test]
    fn anchor_links_without_targets_are_not_errors() {
        let temp = tempdir().expect("tempdir");
        let page_map = PageMap::new();

        let output = rewrite_references(
            "<a href=\"#nowhere\">x</a>",
            &context(temp.path(), &page_map),
        )
        .expect("rewrite");

        assert_eq!(
            output.markup,
            "<ac:link ac:anchor=\"nowhere\"><ac:plain-text-link-body><![CDATA[x]]></ac:plain-text-link-body></ac:link>"
        );
        assert!(output.diagnostics.is_empty());
    }

    #[test]
    fn links_to_queued_images_point_at_the_page_download() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("my pic.png"), b"png").expect("write pic");
        let page_map = PageMap::new();

        let output = rewrite_references(
            "<img src=\"my%20pic.png\" /><a href=\"my%20pic.png\">full size</a>",
            &context(temp.path(), &page_map),
        )
        .expect("rewrite");

        assert!(output.markup.contains(
            "<a href=\"https://wiki.example.org/download/attachments/42/my%20pic.png\">full size</a>"
        ));
        assert_eq!(output.uploads, vec!["my%20pic.png".to_string()]);
    }

    #[test]
    fn downloadable_links_become_attachment_links() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("files")).expect("create files");
        fs::write(temp.path().join("files").join("data.csv"), b"a,b").expect("write csv");
        let page_map = PageMap::new();

        let output = rewrite_references(
            "<a href=\"files/data.csv\">Data</a><a href=\"files/missing.zip\">Zip</a><a href=\"https://x.org/a.pdf\">Ext</a><a href=\"notes.html\">Notes</a>",
            &context(temp.path(), &page_map),
        )
        .expect("rewrite");

        assert!(output.markup.starts_with(
            "<ac:link><ri:attachment ri:filename=\"data.csv\" /><ac:plain-text-link-body><![CDATA[Data]]></ac:plain-text-link-body></ac:link>"
        ));
        assert!(output.markup.contains("<a href=\"files/missing.zip\">Zip</a>"));
        assert!(output.markup.contains("<a href=\"https://x.org/a.pdf\">Ext</a>"));
        assert!(output.markup.contains("<a href=\"notes.html\">Notes</a>"));
        assert_eq!(output.uploads, vec!["files/data.csv".to_string()]);
        assert_eq!(output.diagnostics.len(), 1);
    }

    #[test]
    fn links_wrapping_markup_keep_a_rich_body() {
        let temp = tempdir().expect("tempdir");
        let mut page_map = PageMap::new();
        page_map.insert("b.html#part", "unused");
        page_map.insert("b.html", "Page B");

        let output = rewrite_references(
            "<a href=\"b.html#intro\"><strong>B</strong></a>",
            &context(temp.path(), &page_map),
        )
        .expect("rewrite");

        assert_eq!(
            output.markup,
            "<ac:link ac:anchor=\"intro\"><ri:page ri:content-title=\"Page B\" /><ac:link-body><strong>B</strong></ac:link-body></ac:link>"
        );
    }

    #[test]
    fn void_anchor_targets_get_a_preceding_definition() {
        let temp = tempdir().expect("tempdir");
        let page_map = PageMap::new();

        let output = rewrite_references(
            "<a href=\"#rule\">r</a><hr id=\"rule\" />",
            &context(temp.path(), &page_map),
        )
        .expect("rewrite");

        assert!(output.markup.ends_with(
            "<ac:structured-macro ac:name=\"anchor\"><ac:parameter ac:name=\"\">rule</ac:parameter></ac:structured-macro><hr id=\"rule\" />"
        ));
    }
}
