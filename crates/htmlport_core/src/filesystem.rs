use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

const DOCUMENT_EXTENSIONS: [&str; 3] = ["html", "htm", "xhtml"];

/// A hyperlink or image reference split into its local path and fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReference {
    pub path: String,
    pub fragment: Option<String>,
}

/// `true` for references that never point at a local file: URLs with a
/// scheme (`https:`, `mailto:`, `data:`), protocol-relative `//host` links and
/// absolute paths on the remote host.
pub fn is_external_reference(reference: &str) -> bool {
    let trimmed = reference.trim();
    if trimmed.starts_with("//") || trimmed.starts_with('/') {
        return true;
    }
    match trimmed.find(':') {
        Some(colon) => {
            let scheme = &trimmed[..colon];
            let first_separator = trimmed.find(['/', '?', '#']).unwrap_or(trimmed.len());
            colon < first_separator
                && !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
                // Windows drive letters such as `C:\docs` are local.
                && scheme.len() > 1
        }
        None => false,
    }
}

/// Split `reference` into path and fragment, dropping any query string.
pub fn split_reference(reference: &str) -> LocalReference {
    let trimmed = reference.trim();
    let (without_fragment, fragment) = match trimmed.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment.to_string())),
        None => (trimmed, None),
    };
    let path = without_fragment
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(without_fragment);
    LocalReference {
        path: path.to_string(),
        fragment: fragment.filter(|value| !value.is_empty()),
    }
}

/// Resolve a relative reference against the directory of the referencing document.
pub fn resolve_local_path(base_dir: &Path, reference: &str) -> PathBuf {
    let local = split_reference(reference);
    let decoded = percent_decode(&local.path);
    let mut resolved = base_dir.to_path_buf();
    for component in Path::new(&decoded.replace('\\', "/")).components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(segment) => resolved.push(segment),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    resolved
}

/// Bare filename of a reference, as the remote store keys attachments.
pub fn reference_filename(reference: &str) -> String {
    let local = split_reference(reference);
    let decoded = percent_decode(&local.path).replace('\\', "/");
    decoded
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(decoded.as_str())
        .to_string()
}

/// Lowercase extension of a reference, without the dot.
pub fn reference_extension(reference: &str) -> Option<String> {
    let filename = reference_filename(reference);
    let (stem, extension) = filename.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

/// Title fallback for a document path: its filename without extension.
pub fn title_from_path(reference: &str) -> String {
    let filename = reference_filename(reference);
    let stem = match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename.as_str(),
    };
    stem.trim().to_string()
}

pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && index + 2 < bytes.len()
            && let (Some(high), Some(low)) =
                (hex_value(bytes[index + 1]), hex_value(bytes[index + 2]))
        {
            output.push(high * 16 + low);
            index += 3;
            continue;
        }
        output.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&output).to_string()
}

/// Percent-encode everything outside the URL unreserved set.
pub fn encode_path_segment(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            output.push(char::from(byte));
        } else {
            output.push_str(&format!("%{byte:02X}"));
        }
    }
    output
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Forward-slash relative form of `path` below `root`.
pub fn relative_to_root(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(normalize_path(relative))
}

pub fn normalize_path(path: impl AsRef<Path>) -> String {
    path.as_ref()
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
        .replace('\\', "/")
}

/// Every HTML document under `root` as sorted forward-slash relative paths.
pub fn scan_documents(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        bail!("import root is not a directory: {}", root.display());
    }
    let mut documents = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry =
            entry.with_context(|| format!("failed to walk import root {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_document = entry
            .path()
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| {
                DOCUMENT_EXTENSIONS
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(extension))
            });
        if is_document {
            documents.push(relative_to_root(root, entry.path())?);
        }
    }
    documents.sort();
    Ok(documents)
}

pub fn read_document(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Filesystem-safe slug used for local output names.
pub fn slugify(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.trim().chars() {
        if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            output.push(ch);
        } else if !output.ends_with('_') {
            output.push('_');
        }
    }
    let trimmed = output.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}
