use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::filesystem::ensure_parent_dir;
use crate::markup::{escape_attribute, escape_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    PageCreated,
    PageUpdated,
    PageFinalized,
    AttachmentCreated,
    AttachmentUpdated,
    Skipped,
    MissingAsset,
    Warning,
    Error,
}

impl TransferAction {
    pub const ALL: [TransferAction; 9] = [
        Self::PageCreated,
        Self::PageUpdated,
        Self::PageFinalized,
        Self::AttachmentCreated,
        Self::AttachmentUpdated,
        Self::Skipped,
        Self::MissingAsset,
        Self::Warning,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageCreated => "page_created",
            Self::PageUpdated => "page_updated",
            Self::PageFinalized => "page_finalized",
            Self::AttachmentCreated => "attachment_created",
            Self::AttachmentUpdated => "attachment_updated",
            Self::Skipped => "skipped",
            Self::MissingAsset => "missing_asset",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferLogEntry {
    pub title: String,
    pub action: TransferAction,
    pub detail: String,
    pub url: Option<String>,
}

/// Append-only record of every observable transition during a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferLog {
    entries: Vec<TransferLogEntry>,
}

impl TransferLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        title: impl Into<String>,
        action: TransferAction,
        detail: impl Into<String>,
        url: Option<String>,
    ) {
        self.entries.push(TransferLogEntry {
            title: title.into(),
            action,
            detail: detail.into(),
            url,
        });
    }

    pub fn entries(&self) -> &[TransferLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, action: TransferAction) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.action == action)
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.action == TransferAction::Error)
    }

    /// Comma-separated report with a header row and RFC 4180 quoting.
    pub fn to_csv(&self) -> String {
        let mut output = String::from("title,action,detail,url\r\n");
        for entry in &self.entries {
            let fields = [
                csv_field(&entry.title),
                csv_field(entry.action.as_str()),
                csv_field(&entry.detail),
                csv_field(entry.url.as_deref().unwrap_or("")),
            ];
            output.push_str(&fields.join(","));
            output.push_str("\r\n");
        }
        output
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;
        fs::write(path, self.to_csv())
            .with_context(|| format!("failed to write report {}", path.display()))
    }

    /// Storage-format body for the remote summary page: counts per action,
    /// then every entry.
    pub fn summary_markup(&self) -> String {
        let mut output = String::from("<h2>Summary</h2><table><tbody>");
        output.push_str("<tr><th>Action</th><th>Count</th></tr>");
        for action in TransferAction::ALL {
            output.push_str(&format!(
                "<tr><td>{}</td><td>{}</td></tr>",
                action.as_str(),
                self.count(action)
            ));
        }
        output.push_str("</tbody></table><h2>Entries</h2><table><tbody>");
        output.push_str("<tr><th>Title</th><th>Action</th><th>Detail</th><th>URL</th></tr>");
        for entry in &self.entries {
            let url = entry
                .url
                .as_deref()
                .map(|url| {
                    format!(
                        "<a href=\"{}\">{}</a>",
                        escape_attribute(url),
                        escape_text(url)
                    )
                })
                .unwrap_or_default();
            output.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{url}</td></tr>",
                escape_text(&entry.title),
                entry.action.as_str(),
                escape_text(&entry.detail)
            ));
        }
        output.push_str("</tbody></table>");
        output
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
