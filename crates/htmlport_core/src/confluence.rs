use std::fmt;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

pub const DEFAULT_USER_AGENT: &str = "htmlport/0.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    RateLimited,
    Transient,
    Fatal,
}

/// A failed remote call, classified for the retry wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    kind: RemoteErrorKind,
    status: Option<u16>,
    message: String,
}

impl RemoteError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => RemoteErrorKind::RateLimited,
            408 | 500..=599 => RemoteErrorKind::Transient,
            _ => RemoteErrorKind::Fatal,
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Fatal,
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> RemoteErrorKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "remote request failed with HTTP {status}: {}", self.message),
            None => write!(f, "remote request failed: {}", self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemotePage {
    pub id: String,
    pub title: String,
    pub version: u64,
    pub body: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteAttachment {
    pub id: String,
    pub title: String,
    pub download_url: Option<String>,
}

/// Result of an attachment upload once its response shape is understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentUpload {
    Download(String),
    /// The store returned only an id; the download link needs a follow-up fetch.
    NeedsFetch(String),
}

/// The remote operations the reconciler needs. Implemented by the REST client
/// and by the dry-run stores.
pub trait ContentStore {
    fn find_page(&mut self, title: &str) -> Result<Option<RemotePage>>;
    fn create_page(&mut self, title: &str, body: &str, parent_id: Option<&str>)
    -> Result<RemotePage>;
    fn update_page(&mut self, page: &RemotePage, version: u64, body: &str) -> Result<RemotePage>;
    fn list_attachments(&mut self, page_id: &str, filename: &str)
    -> Result<Vec<RemoteAttachment>>;
    fn create_attachment(
        &mut self,
        page_id: &str,
        file: &Path,
        filename: &str,
    ) -> Result<AttachmentUpload>;
    fn update_attachment(
        &mut self,
        page_id: &str,
        attachment_id: &str,
        file: &Path,
        filename: &str,
    ) -> Result<AttachmentUpload>;
    fn fetch_attachment(&mut self, attachment_id: &str) -> Result<RemoteAttachment>;
    fn page_url(&self, page: &RemotePage) -> Option<String>;
    /// Base used to build direct attachment download links.
    fn download_base(&self) -> &str;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfluenceAuth {
    Bearer(String),
    Basic { email: String, token: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub space_key: String,
    pub auth: Option<ConfluenceAuth>,
    pub parent_id: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
}

impl Default for ConfluenceClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            space_key: String::new(),
            auth: None,
            parent_id: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 30_000,
            rate_limit_read_ms: 300,
            rate_limit_write_ms: 1_000,
        }
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build Confluence HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|error| {
            RemoteError::fatal(format!("invalid Confluence URL {joined}: {error}")).into()
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.auth {
            Some(ConfluenceAuth::Bearer(token)) => request.bearer_auth(token),
            Some(ConfluenceAuth::Basic { email, token }) => request.basic_auth(email, Some(token)),
            None => request,
        }
    }

    fn send(&mut self, label: &str, request: RequestBuilder, is_write: bool) -> Result<Value> {
        self.apply_rate_limit(is_write);
        debug!(request = label, count = self.request_count, "confluence request");
        let response = self.authorize(request).send().map_err(|error| {
            let message = format!("{label}: {error}");
            if is_retryable_error(&error) {
                RemoteError::transient(message)
            } else {
                RemoteError::fatal(message)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RemoteError::from_status(
                status.as_u16(),
                format!("{label}: {}", truncate(&body, 300)),
            )
            .into());
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response.json::<Value>().map_err(|error| {
            RemoteError::fatal(format!("{label}: invalid JSON response: {error}")).into()
        })
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn upload_form(file: &Path, filename: &str) -> Result<Form> {
        let part = Part::file(file)
            .map_err(|error| {
                RemoteError::fatal(format!("failed to open {}: {error}", file.display()))
            })?
            .file_name(filename.to_string());
        Ok(Form::new().part("file", part))
    }

    fn storage_body(body: &str) -> Value {
        json!({ "storage": { "value": body, "representation": "storage" } })
    }
}

impl ContentStore for ConfluenceClient {
    fn find_page(&mut self, title: &str) -> Result<Option<RemotePage>> {
        let url = self.endpoint("rest/api/content")?;
        let request = self.client.get(url).query(&[
            ("spaceKey", self.config.space_key.as_str()),
            ("title", title),
            ("type", "page"),
            ("expand", "version"),
        ]);
        let payload = self.send("search page", request, false)?;
        let parsed: ContentListResponse = serde_json::from_value(payload)
            .map_err(|error| RemoteError::fatal(format!("unexpected search response: {error}")))?;
        Ok(parsed
            .results
            .into_iter()
            .find(|item| item.title == title)
            .map(|item| item.into_page(&self.config.base_url)))
    }

    fn create_page(
        &mut self,
        title: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<RemotePage> {
        let mut payload = json!({
            "type": "page",
            "title": title,
            "space": { "key": self.config.space_key },
            "body": Self::storage_body(body),
        });
        if let Some(parent_id) = parent_id.filter(|value| !value.is_empty()) {
            payload["ancestors"] = json!([{ "id": parent_id }]);
        }
        let url = self.endpoint("rest/api/content")?;
        let request = self.client.post(url).json(&payload);
        let response = self.send("create page", request, true)?;
        let item: ContentItem = serde_json::from_value(response)
            .map_err(|error| RemoteError::fatal(format!("unexpected create response: {error}")))?;
        Ok(item.into_page(&self.config.base_url))
    }

    fn update_page(&mut self, page: &RemotePage, version: u64, body: &str) -> Result<RemotePage> {
        let payload = json!({
            "id": page.id,
            "type": "page",
            "title": page.title,
            "version": { "number": version },
            "body": Self::storage_body(body),
        });
        let url = self.endpoint(&format!("rest/api/content/{}", page.id))?;
        let request = self.client.put(url).json(&payload);
        let response = self.send("update page", request, true)?;
        let item: ContentItem = serde_json::from_value(response)
            .map_err(|error| RemoteError::fatal(format!("unexpected update response: {error}")))?;
        Ok(item.into_page(&self.config.base_url))
    }

    fn list_attachments(
        &mut self,
        page_id: &str,
        filename: &str,
    ) -> Result<Vec<RemoteAttachment>> {
        let url = self.endpoint(&format!("rest/api/content/{page_id}/child/attachment"))?;
        let request = self.client.get(url).query(&[("filename", filename)]);
        let payload = self.send("list attachments", request, false)?;
        let parsed: ContentListResponse = serde_json::from_value(payload).map_err(|error| {
            RemoteError::fatal(format!("unexpected attachment listing: {error}"))
        })?;
        Ok(parsed
            .results
            .into_iter()
            .map(|item| item.into_attachment(&self.config.base_url))
            .collect())
    }

    fn create_attachment(
        &mut self,
        page_id: &str,
        file: &Path,
        filename: &str,
    ) -> Result<AttachmentUpload> {
        let url = self.endpoint(&format!("rest/api/content/{page_id}/child/attachment"))?;
        let request = self
            .client
            .post(url)
            .header("X-Atlassian-Token", "no-check")
            .multipart(Self::upload_form(file, filename)?);
        let payload = self.send("create attachment", request, true)?;
        normalize_upload_response(&self.config.base_url, &payload)
    }

    fn update_attachment(
        &mut self,
        page_id: &str,
        attachment_id: &str,
        file: &Path,
        filename: &str,
    ) -> Result<AttachmentUpload> {
        let url = self.endpoint(&format!(
            "rest/api/content/{page_id}/child/attachment/{attachment_id}/data"
        ))?;
        let request = self
            .client
            .post(url)
            .header("X-Atlassian-Token", "no-check")
            .multipart(Self::upload_form(file, filename)?);
        let payload = self.send("update attachment", request, true)?;
        normalize_upload_response(&self.config.base_url, &payload)
    }

    fn fetch_attachment(&mut self, attachment_id: &str) -> Result<RemoteAttachment> {
        let url = self.endpoint(&format!("rest/api/content/{attachment_id}"))?;
        let request = self.client.get(url);
        let payload = self.send("fetch attachment", request, false)?;
        let item: ContentItem = serde_json::from_value(payload).map_err(|error| {
            RemoteError::fatal(format!("unexpected attachment response: {error}"))
        })?;
        Ok(item.into_attachment(&self.config.base_url))
    }

    fn page_url(&self, page: &RemotePage) -> Option<String> {
        page.url.clone()
    }

    fn download_base(&self) -> &str {
        &self.config.base_url
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Interpret an attachment upload response. Accepted shapes, in order:
/// a `results` listing, a single object carrying `_links.download`, or an
/// object carrying only an `id`.
pub fn normalize_upload_response(base_url: &str, payload: &Value) -> Result<AttachmentUpload> {
    if let Some(first) = payload
        .get("results")
        .and_then(Value::as_array)
        .and_then(|results| results.first())
    {
        if let Some(download) = download_link(first) {
            return Ok(AttachmentUpload::Download(absolute_link(base_url, download)));
        }
        if let Some(id) = content_id(first) {
            return Ok(AttachmentUpload::NeedsFetch(id));
        }
    }
    if let Some(download) = download_link(payload) {
        return Ok(AttachmentUpload::Download(absolute_link(base_url, download)));
    }
    if let Some(id) = content_id(payload) {
        return Ok(AttachmentUpload::NeedsFetch(id));
    }
    Err(RemoteError::fatal(format!(
        "unrecognized attachment upload response: {}",
        truncate(&payload.to_string(), 200)
    ))
    .into())
}

fn download_link(value: &Value) -> Option<&str> {
    value
        .get("_links")
        .and_then(|links| links.get("download"))
        .and_then(Value::as_str)
        .filter(|link| !link.is_empty())
}

fn content_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Join a store-relative link (`/download/...`) onto the configured base URL.
pub fn absolute_link(base_url: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        link.trim_start_matches('/')
    )
}

fn truncate(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        Some((index, _)) => format!("{}...", &value[..index]),
        None => value.to_string(),
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct ContentListResponse {
    #[serde(default)]
    results: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    #[serde(default)]
    title: String,
    version: Option<VersionInfo>,
    body: Option<ContentBody>,
    #[serde(rename = "_links")]
    links: Option<ContentLinks>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    storage: Option<StorageValue>,
}

#[derive(Debug, Deserialize)]
struct StorageValue {
    value: String,
}

#[derive(Debug, Deserialize, Default)]
struct ContentLinks {
    webui: Option<String>,
    download: Option<String>,
}

impl ContentItem {
    fn into_page(self, base_url: &str) -> RemotePage {
        RemotePage {
            id: self.id,
            title: self.title,
            version: self.version.map(|version| version.number).unwrap_or(1),
            body: self
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value),
            url: self
                .links
                .and_then(|links| links.webui)
                .map(|webui| absolute_link(base_url, &webui)),
        }
    }

    fn into_attachment(self, base_url: &str) -> RemoteAttachment {
        RemoteAttachment {
            id: self.id,
            title: self.title,
            download_url: self
                .links
                .and_then(|links| links.download)
                .map(|download| absolute_link(base_url, &download)),
        }
    }
}
