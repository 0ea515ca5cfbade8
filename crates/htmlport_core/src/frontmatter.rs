use std::collections::BTreeMap;

use serde_yaml::Value;

const FRONT_MATTER_MARKER: &str = "---";

pub type FrontMatter = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct FrontMatterSplit {
    pub metadata: Option<FrontMatter>,
    pub body: String,
    pub warning: Option<String>,
}

impl FrontMatterSplit {
    /// Non-empty string value of `key`, trimmed.
    pub fn string_value(&self, key: &str) -> Option<String> {
        let value = self.metadata.as_ref()?.get(key)?;
        let text = value.as_str()?.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }
}

/// Split an optional leading `---` block off `raw`.
///
/// A malformed block is reported through `warning`; the body is still returned
/// with the block removed so the document can be imported without metadata.
pub fn extract_front_matter(raw: &str) -> FrontMatterSplit {
    let text = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let Some((block, body)) = split_block(text) else {
        return FrontMatterSplit {
            metadata: None,
            body: raw.to_string(),
            warning: None,
        };
    };

    if block.trim().is_empty() {
        return FrontMatterSplit {
            metadata: Some(FrontMatter::new()),
            body: body.to_string(),
            warning: None,
        };
    }

    match serde_yaml::from_str::<Value>(block) {
        Ok(Value::Mapping(mapping)) => {
            let mut metadata = FrontMatter::new();
            for (key, value) in mapping {
                let key = match key {
                    Value::String(key) => key,
                    Value::Number(number) => number.to_string(),
                    Value::Bool(flag) => flag.to_string(),
                    _ => continue,
                };
                metadata.insert(key, value);
            }
            FrontMatterSplit {
                metadata: Some(metadata),
                body: body.to_string(),
                warning: None,
            }
        }
        Ok(Value::Null) => FrontMatterSplit {
            metadata: Some(FrontMatter::new()),
            body: body.to_string(),
            warning: None,
        },
        Ok(_) => FrontMatterSplit {
            metadata: None,
            body: body.to_string(),
            warning: Some("front matter is not a key/value mapping".to_string()),
        },
        Err(error) => FrontMatterSplit {
            metadata: None,
            body: body.to_string(),
            warning: Some(format!("failed to parse front matter: {error}")),
        },
    }
}

fn split_block(text: &str) -> Option<(&str, &str)> {
    let (first_line, rest) = split_line(text)?;
    if first_line.trim_end() != FRONT_MATTER_MARKER {
        return None;
    }

    let mut offset = 0usize;
    let mut remaining = rest;
    while let Some((line, after)) = split_line(remaining) {
        if line.trim_end() == FRONT_MATTER_MARKER {
            return Some((&rest[..offset], after));
        }
        offset += remaining.len() - after.len();
        remaining = after;
    }
    None
}

/// Returns `(line_without_newline, rest_after_newline)`; the last line may lack a newline.
fn split_line(text: &str) -> Option<(&str, &str)> {
    if text.is_empty() {
        return None;
    }
    match text.find('\n') {
        Some(index) => {
            let line = text[..index].strip_suffix('\r').unwrap_or(&text[..index]);
            Some((line, &text[index + 1..]))
        }
        None => Some((text, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_mapping_and_strips_block() {
        let split = extract_front_matter("---\ntitle: Hello\ntags: [a, b]\n---\n<p>Body</p>\n");
        let metadata = split.metadata.as_ref().expect("metadata");
        assert_eq!(metadata.get("title").and_then(Value::as_str), Some("Hello"));
        assert!(metadata.contains_key("tags"));
        assert_eq!(split.body, "<p>Body</p>\n");
        assert!(split.warning.is_none());
        assert_eq!(split.string_value("title").as_deref(), Some("Hello"));
    }

    #[test]
    fn returns_input_unchanged_without_block() {
        let raw = "<html><body>plain</body></html>";
        let split = extract_front_matter(raw);
        assert!(split.metadata.is_none());
        assert_eq!(split.body, raw);
    }

    #[test]
    fn unterminated_block_is_treated_as_body() {
        let raw = "---\ntitle: x\n<p>never closed</p>";
        let split = extract_front_matter(raw);
        assert!(split.metadata.is_none());
        assert!(split.warning.is_none());
        assert_eq!(split.body, raw);
    }

    #[test]
    fn malformed_metadata_warns_and_keeps_body() {
        let split = extract_front_matter("---\ntitle: [unclosed\n---\n<p>kept</p>");
        assert!(split.metadata.is_none());
        assert!(
            split
                .warning
                .as_deref()
                .is_some_and(|warning| warning.contains("front matter"))
        );
        assert_eq!(split.body, "<p>kept</p>");
    }

    #[test]
    fn scalar_metadata_is_rejected_with_warning() {
        let split = extract_front_matter("---\njust a string\n---\nbody");
        assert!(split.metadata.is_none());
        assert!(split.warning.is_some());
        assert_eq!(split.body, "body");
    }

    #[test]
    fn empty_block_yields_empty_mapping() {
        let split = extract_front_matter("---\n---\nbody");
        assert_eq!(split.metadata, Some(FrontMatter::new()));
        assert_eq!(split.body, "body");
    }

    #[test]
    fn handles_crlf_and_bom() {
        let split = extract_front_matter("\u{feff}---\r\ntitle: Win\r\n---\r\n<p>x</p>");
        assert_eq!(split.string_value("title").as_deref(), Some("Win"));
        assert_eq!(split.body, "<p>x</p>");
    }
}
