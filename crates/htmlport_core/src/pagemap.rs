use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::filesystem::{is_external_reference, read_document, split_reference, title_from_path};
use crate::markup::{collect_elements, parse_fragment};
use crate::normalize::{close_void_elements, escape_stray_angles};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageEntry {
    pub reference: String,
    pub title: String,
    /// `false` when the title is only the filename-stem fallback.
    pub declared: bool,
}

/// Ordered mapping from a document's relative link string to its page title.
#[derive(Debug, Clone, Default)]
pub struct PageMap {
    entries: Vec<PageEntry>,
    positions: HashMap<String, usize>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping; the first title declared for a reference wins.
    pub fn insert(&mut self, reference: impl Into<String>, title: impl Into<String>) -> bool {
        self.push(reference.into(), title.into(), true)
    }

    /// Insert a mapping titled by the filename stem. A later [`PageMap::retitle`]
    /// may replace that title.
    pub fn insert_fallback(&mut self, reference: impl Into<String>) -> bool {
        let reference = reference.into();
        let title = title_from_path(&reference);
        self.push(reference, title, false)
    }

    fn push(&mut self, reference: String, title: String, declared: bool) -> bool {
        if self.positions.contains_key(&reference) {
            return false;
        }
        self.positions.insert(reference.clone(), self.entries.len());
        self.entries.push(PageEntry {
            reference,
            title,
            declared,
        });
        true
    }

    /// Replace a fallback title, e.g. with a front-matter title. Declared
    /// titles are kept.
    pub fn retitle(&mut self, reference: &str, title: impl Into<String>) -> bool {
        match self.positions.get(reference) {
            Some(index) if !self.entries[*index].declared => {
                self.entries[*index].title = title.into();
                true
            }
            _ => false,
        }
    }

    /// Exact lookup of a link target.
    pub fn get(&self, reference: &str) -> Option<&str> {
        self.positions
            .get(reference)
            .map(|index| self.entries[*index].title.as_str())
    }

    /// Lookup that also accepts `./` prefixes and a trailing fragment or query.
    /// Returns the title plus the fragment, if any.
    pub fn resolve(&self, href: &str) -> Option<(&str, Option<String>)> {
        let trimmed = href.trim();
        if let Some(title) = self.get(trimmed) {
            return Some((title, None));
        }
        let local = split_reference(trimmed);
        let path = local.path.trim_start_matches("./");
        if path.is_empty() {
            return None;
        }
        self.get(path).map(|title| (title, local.fragment))
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.positions.contains_key(reference)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build from an index document: each local `<a href>` is a document,
    /// its link text the title, falling back to the filename stem.
    pub fn from_index_markup(markup: &str) -> Result<Self> {
        let prepared = close_void_elements(&escape_stray_angles(markup));
        let nodes = parse_fragment(&prepared).context("failed to parse index document")?;

        let mut map = Self::new();
        for link in collect_elements(&nodes, "a") {
            let Some(href) = link.attr_decoded("href") else {
                continue;
            };
            let href = href.trim();
            if href.is_empty() || href.starts_with('#') || is_external_reference(href) {
                continue;
            }
            let reference = split_reference(href).path;
            let reference = reference.trim_start_matches("./").to_string();
            if reference.is_empty() {
                continue;
            }
            let text = collapse_whitespace(&link.text_content());
            if text.is_empty() {
                map.insert_fallback(reference);
            } else {
                map.insert(reference, text);
            }
        }
        Ok(map)
    }

    pub fn from_index_file(path: &Path) -> Result<Self> {
        let markup = read_document(path)?;
        Self::from_index_markup(&markup)
            .with_context(|| format!("failed to build page map from {}", path.display()))
    }

    /// Build from plain document paths, titling each by its filename stem.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = Self::new();
        for path in paths {
            map.insert_fallback(path.as_ref());
        }
        map
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
