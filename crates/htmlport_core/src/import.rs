use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{ExecutionMode, ImportConfig};
use crate::confluence::{ConfluenceClient, ContentStore, RemotePage};
use crate::filesystem::{
    read_document, reference_filename, relative_to_root, resolve_local_path, scan_documents,
};
use crate::frontmatter::{FrontMatterSplit, extract_front_matter};
use crate::normalize::{NormalizeOptions, normalize_markup};
use crate::pagemap::PageMap;
use crate::reconcile::{Reconciler, UpsertAction};
use crate::rewrite::{RewriteContext, rewrite_references};
use crate::simulate::{LocalOutputStore, SimulatedStore};
use crate::state::StateStore;
use crate::transfer_log::{TransferAction, TransferLog};

#[derive(Debug, Clone)]
pub enum DocumentSource {
    Loaded(FrontMatterSplit),
    Unreadable(String),
}

/// One local document, read once per run.
#[derive(Debug, Clone)]
pub struct Document {
    /// Source path relative to the import root; the resume identity.
    pub identity: String,
    pub path: PathBuf,
    pub title: String,
    pub source: DocumentSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Transferred,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResult {
    pub identity: String,
    pub title: String,
    pub status: DocumentStatus,
    pub detail: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub success: bool,
    pub mode: ExecutionMode,
    pub documents_total: usize,
    pub processed: usize,
    pub transferred: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pages_created: usize,
    pub pages_updated: usize,
    pub attachments_uploaded: usize,
    pub missing_assets: usize,
    pub warnings: usize,
    pub request_count: usize,
    pub report_csv: Option<PathBuf>,
    pub report_page_url: Option<String>,
    pub errors: Vec<String>,
    pub documents: Vec<DocumentResult>,
    pub log: TransferLog,
}

/// Validate `config`, pick the store for its execution mode and run.
pub fn run_import(config: &ImportConfig) -> Result<ImportReport> {
    config.validate()?;
    match config.mode {
        ExecutionMode::Normal => {
            let client = ConfluenceClient::new(config.confluence.clone())?;
            run_import_with_store(config, &mut Reconciler::new(client, config.retry))
        }
        ExecutionMode::Dry => run_import_with_store(
            config,
            &mut Reconciler::new(SimulatedStore::new(), config.retry),
        ),
        ExecutionMode::DryLocal => {
            let store = LocalOutputStore::new(&config.output_dir)?;
            run_import_with_store(config, &mut Reconciler::new(store, config.retry))
        }
    }
}

pub fn run_import_with_store<S: ContentStore>(
    config: &ImportConfig,
    reconciler: &mut Reconciler<S>,
) -> Result<ImportReport> {
    let (page_map, documents) = discover_documents(config)?;
    let state_store = StateStore::new(&config.state_file, config.full);
    let mut state = state_store.load();
    let mut log = TransferLog::new();

    let mut report = ImportReport {
        success: true,
        mode: config.mode,
        documents_total: documents.len(),
        processed: 0,
        transferred: 0,
        skipped: 0,
        failed: 0,
        pages_created: 0,
        pages_updated: 0,
        attachments_uploaded: 0,
        missing_assets: 0,
        warnings: 0,
        request_count: 0,
        report_csv: None,
        report_page_url: None,
        errors: Vec::new(),
        documents: Vec::new(),
        log: TransferLog::new(),
    };

    let mut pending = Vec::new();
    for document in &documents {
        if state.contains(&document.identity) {
            log.record(
                &document.title,
                TransferAction::Skipped,
                format!("{} already transferred", document.identity),
                None,
            );
            report.skipped += 1;
            report.documents.push(DocumentResult {
                identity: document.identity.clone(),
                title: document.title.clone(),
                status: DocumentStatus::Skipped,
                detail: Some("already transferred".to_string()),
                url: None,
            });
        } else {
            pending.push(document);
        }
    }
    if let Some(limit) = config.limit {
        pending.truncate(limit);
    }
    info!(
        total = documents.len(),
        pending = pending.len(),
        mode = config.mode.as_str(),
        "starting import"
    );

    for (position, document) in pending.into_iter().enumerate() {
        if position > 0 {
            reconciler.pause(config.document_delay);
        }
        report.processed += 1;
        info!(identity = %document.identity, title = %document.title, "importing document");

        match import_document(config, reconciler, &page_map, document, &mut log) {
            Ok(page) => {
                let url = reconciler.page_url(&page);
                state.mark(document.identity.clone());
                state_store.save(&state).with_context(|| {
                    format!("failed to record {} as transferred", document.identity)
                })?;
                report.transferred += 1;
                report.documents.push(DocumentResult {
                    identity: document.identity.clone(),
                    title: document.title.clone(),
                    status: DocumentStatus::Transferred,
                    detail: None,
                    url,
                });
            }
            Err(error) => {
                let detail = format!("{error:#}");
                warn!(identity = %document.identity, "document failed: {detail}");
                log.record(&document.title, TransferAction::Error, detail.clone(), None);
                report.failed += 1;
                report.errors.push(format!("{}: {detail}", document.identity));
                report.documents.push(DocumentResult {
                    identity: document.identity.clone(),
                    title: document.title.clone(),
                    status: DocumentStatus::Failed,
                    detail: Some(detail),
                    url: None,
                });
            }
        }
    }

    if let Some(path) = &config.report_csv {
        log.write_csv(path)?;
        report.report_csv = Some(path.clone());
    }
    if config.publish_report {
        match publish_summary(config, reconciler, &log) {
            Ok(url) => report.report_page_url = url,
            Err(error) => {
                warn!("failed to publish report page: {error:#}");
                report.errors.push(format!("report page: {error:#}"));
            }
        }
    }

    report.pages_created = log.count(TransferAction::PageCreated);
    report.pages_updated = log.count(TransferAction::PageUpdated);
    report.attachments_uploaded = log.count(TransferAction::AttachmentCreated)
        + log.count(TransferAction::AttachmentUpdated);
    report.missing_assets = log.count(TransferAction::MissingAsset);
    report.warnings = log.count(TransferAction::Warning);
    report.request_count = reconciler.store().request_count();
    report.success = !log.has_errors() && report.errors.is_empty();
    report.log = log;
    Ok(report)
}

/// Enumerate the documents to import, in index order (or sorted path order
/// without an index), and build the PageMap used to resolve links.
pub fn discover_documents(config: &ImportConfig) -> Result<(PageMap, Vec<Document>)> {
    let (mut page_map, base_dir) = match &config.index {
        Some(index) => {
            let page_map = PageMap::from_index_file(index)?;
            let base_dir = index
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| config.root.clone());
            (page_map, base_dir)
        }
        None => {
            let paths = scan_documents(&config.root)?;
            (PageMap::from_paths(&paths), config.root.clone())
        }
    };

    let mut loaded = Vec::with_capacity(page_map.len());
    for entry in page_map.iter() {
        let path = resolve_local_path(&base_dir, &entry.reference);
        let identity =
            relative_to_root(&config.root, &path).unwrap_or_else(|_| entry.reference.clone());
        let source = match read_document(&path) {
            Ok(raw) => DocumentSource::Loaded(extract_front_matter(&raw)),
            Err(error) => DocumentSource::Unreadable(format!("{error:#}")),
        };
        loaded.push((entry.reference.clone(), identity, path, source));
    }

    for (reference, _, _, source) in &loaded {
        if let DocumentSource::Loaded(split) = source
            && let Some(title) = split.string_value("title")
        {
            page_map.retitle(reference, title);
        }
    }

    let documents = loaded
        .into_iter()
        .map(|(reference, identity, path, source)| Document {
            title: page_map
                .get(&reference)
                .map(str::to_string)
                .unwrap_or_else(|| reference.clone()),
            identity,
            path,
            source,
        })
        .collect();
    Ok((page_map, documents))
}

/// The per-document pipeline: normalize, reconcile the bare page, rewrite
/// references against its id, upload assets, then finalize the page.
fn import_document<S: ContentStore>(
    config: &ImportConfig,
    reconciler: &mut Reconciler<S>,
    page_map: &PageMap,
    document: &Document,
    log: &mut TransferLog,
) -> Result<RemotePage> {
    let split = match &document.source {
        DocumentSource::Loaded(split) => split,
        DocumentSource::Unreadable(error) => anyhow::bail!("{error}"),
    };
    if let Some(warning) = &split.warning {
        log.record(
            &document.title,
            TransferAction::Warning,
            format!("front matter ignored: {warning}"),
            None,
        );
    }

    let normalized = normalize_markup(&split.body, &NormalizeOptions::default())
        .with_context(|| format!("failed to normalize {}", document.identity))?;

    let outcome = reconciler.reconcile_page(
        &document.title,
        &normalized,
        config.confluence.parent_id.as_deref(),
    )?;
    let action = match outcome.action {
        UpsertAction::Created => TransferAction::PageCreated,
        UpsertAction::Updated => TransferAction::PageUpdated,
    };
    log.record(
        &document.title,
        action,
        document.identity.clone(),
        reconciler.page_url(&outcome.page),
    );

    let base_dir = document
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.root.clone());
    let download_base = reconciler.download_base().to_string();
    let rewritten = rewrite_references(
        &normalized,
        &RewriteContext {
            title: &document.title,
            page_map,
            base_dir: &base_dir,
            page_id: &outcome.page.id,
            download_base: &download_base,
        },
    )?;
    for diagnostic in &rewritten.diagnostics {
        log.record(
            &document.title,
            TransferAction::MissingAsset,
            diagnostic.describe(),
            None,
        );
    }

    let mut uploaded: HashMap<String, PathBuf> = HashMap::new();
    for reference in &rewritten.uploads {
        let filename = reference_filename(reference);
        let path = resolve_local_path(&base_dir, reference);
        if let Some(first) = uploaded.get(&filename) {
            if *first != path {
                log.record(
                    &document.title,
                    TransferAction::Warning,
                    format!(
                        "attachment {filename} from {} not uploaded: name already used by {}",
                        path.display(),
                        first.display()
                    ),
                    None,
                );
            }
            continue;
        }
        uploaded.insert(filename.clone(), path.clone());
        let attachment = reconciler.upload_attachment(&outcome.page.id, &path, &filename)?;
        let action = match attachment.action {
            UpsertAction::Created => TransferAction::AttachmentCreated,
            UpsertAction::Updated => TransferAction::AttachmentUpdated,
        };
        log.record(
            &document.title,
            action,
            filename,
            Some(attachment.download_url),
        );
    }

    let page = reconciler.update_page(&outcome.page, &rewritten.markup)?;
    log.record(
        &document.title,
        TransferAction::PageFinalized,
        format!("version {}", page.version),
        reconciler.page_url(&page),
    );
    Ok(page)
}

fn publish_summary<S: ContentStore>(
    config: &ImportConfig,
    reconciler: &mut Reconciler<S>,
    log: &TransferLog,
) -> Result<Option<String>> {
    let title = format!("{} {}", config.report_title, unix_timestamp()?);
    let outcome = reconciler.reconcile_page(
        &title,
        &log.summary_markup(),
        config.confluence.parent_id.as_deref(),
    )?;
    info!(title = %title, "published report page");
    Ok(reconciler.page_url(&outcome.page))
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;
    use crate::config::{ConfigOverrides, FileConfig};
    use crate::retry::{NoSleep, RetryPolicy};
    use tempfile::tempdir;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write file");
    }

    fn dry_config(root: &Path, index: Option<&str>) -> ImportConfig {
        let overrides = ConfigOverrides {
            mode: Some(ExecutionMode::Dry),
            root: Some(root.to_path_buf()),
            index: index.map(|index| root.join(index)),
            state_file: Some(root.join("state.json")),
            document_delay_ms: Some(0),
            ..ConfigOverrides::default()
        };
        ImportConfig::resolve_with_env(&FileConfig::default(), &overrides, root, |_| None)
    }

    fn dry_reconciler() -> Reconciler<SimulatedStore> {
        Reconciler::new(SimulatedStore::new(), RetryPolicy::default()).with_sleeper(NoSleep)
    }

    #[test]
    fn discovery_without_index_uses_front_matter_titles() {
        let temp = tempdir().expect("tempdir");
        write_file(
            &temp.path().join("guide/intro.html"),
            "---\ntitle: Getting Started\n---\n<p>hi</p>",
        );
        write_file(&temp.path().join("notes.htm"), "<p>notes</p>");

        let config = dry_config(temp.path(), None);
        let (page_map, documents) = discover_documents(&config).expect("discover");
        let titles: Vec<(&str, &str)> = documents
            .iter()
            .map(|document| (document.identity.as_str(), document.title.as_str()))
            .collect();
        assert_eq!(
            titles,
            vec![("guide/intro.html", "Getting Started"), ("notes.htm", "notes")]
        );
        assert_eq!(page_map.get("guide/intro.html"), Some("Getting Started"));
    }

    #[test]
    fn malformed_front_matter_is_a_warning_not_a_failure() {
        let temp = tempdir().expect("tempdir");
        write_file(&temp.path().join("a.html"), "---\ntitle: [oops\n---\n<p>body</p>");

        let config = dry_config(temp.path(), None);
        let report =
            run_import_with_store(&config, &mut dry_reconciler()).expect("import succeeds");
        assert_eq!(report.transferred, 1);
        assert_eq!(report.warnings, 1);
        assert!(report.success);
    }

    #[test]
    fn limit_bounds_pending_documents() {
        let temp = tempdir().expect("tempdir");
        for name in ["a.html", "b.html", "c.html"] {
            write_file(&temp.path().join(name), "<p>x</p>");
        }
        let mut config = dry_config(temp.path(), None);
        config.limit = Some(2);

        let report = run_import_with_store(&config, &mut dry_reconciler()).expect("import");
        assert_eq!(report.processed, 2);
        assert_eq!(report.transferred, 2);

        let report = run_import_with_store(&config, &mut dry_reconciler()).expect("resume");
        assert_eq!(report.skipped, 2);
        assert_eq!(report.processed, 1);
    }

    #[test]
    fn unreadable_index_entry_fails_only_that_document() {
        let temp = tempdir().expect("tempdir");
        write_file(
            &temp.path().join("index.html"),
            r#"<ul><li><a href="gone.html">Gone</a></li><li><a href="here.html">Here</a></li></ul>"#,
        );
        write_file(&temp.path().join("here.html"), "<p>here</p>");

        let config = dry_config(temp.path(), Some("index.html"));
        let mut reconciler = dry_reconciler();
        let report = run_import_with_store(&config, &mut reconciler).expect("import");

        assert_eq!(report.failed, 1);
        assert_eq!(report.transferred, 1);
        assert!(!report.success);
        assert!(reconciler.store().page("Here").is_some());
        assert!(reconciler.store().page("Gone").is_none());
    }

    #[test]
    fn attachment_name_collisions_are_logged() {
        let temp = tempdir().expect("tempdir");
        write_file(
            &temp.path().join("a.html"),
            "<p><img src=\"x/logo.png\"><img src=\"y/logo.png\"><img src=\"x/logo.png\"></p>",
        );
        write_file(&temp.path().join("x/logo.png"), "first");
        write_file(&temp.path().join("y/logo.png"), "second");

        let config = dry_config(temp.path(), None);
        let mut reconciler = dry_reconciler();
        let report = run_import_with_store(&config, &mut reconciler).expect("import");

        assert_eq!(report.attachments_uploaded, 1);
        assert_eq!(report.warnings, 1);
        let warning = report
            .log
            .entries()
            .iter()
            .find(|entry| entry.action == TransferAction::Warning)
            .expect("warning entry");
        assert!(warning.detail.contains("y/logo.png"));
        assert!(warning.detail.contains("x/logo.png"));
        let page = reconciler.store().page("a").expect("page");
        assert_eq!(reconciler.store().attachments(&page.id).len(), 1);
    }

    #[test]
    fn failed_final_update_leaves_document_pending() {
        use std::cell::Cell;

        use crate::confluence::{AttachmentUpload, RemoteAttachment, RemoteError};

        struct FlakyFinalize {
            inner: SimulatedStore,
            fail_updates: Cell<bool>,
        }

        impl ContentStore for FlakyFinalize {
            fn find_page(&mut self, title: &str) -> Result<Option<RemotePage>> {
                self.inner.find_page(title)
            }
            fn create_page(
                &mut self,
                title: &str,
                body: &str,
                parent_id: Option<&str>,
            ) -> Result<RemotePage> {
                self.inner.create_page(title, body, parent_id)
            }
            fn update_page(
                &mut self,
                page: &RemotePage,
                version: u64,
                body: &str,
            ) -> Result<RemotePage> {
                if self.fail_updates.get() {
                    return Err(RemoteError::from_status(503, "unavailable").into());
                }
                self.inner.update_page(page, version, body)
            }
            fn list_attachments(
                &mut self,
                page_id: &str,
                filename: &str,
            ) -> Result<Vec<RemoteAttachment>> {
                self.inner.list_attachments(page_id, filename)
            }
            fn create_attachment(
                &mut self,
                page_id: &str,
                file: &Path,
                filename: &str,
            ) -> Result<AttachmentUpload> {
                self.inner.create_attachment(page_id, file, filename)
            }
            fn update_attachment(
                &mut self,
                page_id: &str,
                attachment_id: &str,
                file: &Path,
                filename: &str,
            ) -> Result<AttachmentUpload> {
                self.inner
                    .update_attachment(page_id, attachment_id, file, filename)
            }
            fn fetch_attachment(&mut self, attachment_id: &str) -> Result<RemoteAttachment> {
                self.inner.fetch_attachment(attachment_id)
            }
            fn page_url(&self, page: &RemotePage) -> Option<String> {
                self.inner.page_url(page)
            }
            fn download_base(&self) -> &str {
                self.inner.download_base()
            }
            fn request_count(&self) -> usize {
                self.inner.request_count()
            }
        }

        let temp = tempdir().expect("tempdir");
        write_file(&temp.path().join("a.html"), "<p>x</p>");
        let config = dry_config(temp.path(), None);
        let store = FlakyFinalize {
            inner: SimulatedStore::new(),
            fail_updates: Cell::new(true),
        };
        let mut reconciler = Reconciler::new(store, RetryPolicy::default()).with_sleeper(NoSleep);

        let report = run_import_with_store(&config, &mut reconciler).expect("import");
        assert_eq!(report.failed, 1);
        assert_eq!(report.transferred, 0);
        assert!(!StateStore::new(&config.state_file, false).load().contains("a.html"));

        reconciler.store().fail_updates.set(false);
        let report = run_import_with_store(&config, &mut reconciler).expect("retry run");
        assert_eq!(report.skipped, 0);
        assert_eq!(report.transferred, 1);
        assert_eq!(report.pages_updated, 1);
        assert!(StateStore::new(&config.state_file, false).load().contains("a.html"));
    }

    #[test]
    fn inter_document_pause_uses_configured_delay() {
        use std::cell::RefCell;
        use std::rc::Rc;

        use crate::retry::Sleeper;

        struct Recorder(Rc<RefCell<Vec<Duration>>>);
        impl Sleeper for Recorder {
            fn sleep(&self, duration: Duration) {
                self.0.borrow_mut().push(duration);
            }
        }

        let temp = tempdir().expect("tempdir");
        for name in ["a.html", "b.html", "c.html"] {
            write_file(&temp.path().join(name), "<p>x</p>");
        }
        let mut config = dry_config(temp.path(), None);
        config.document_delay = Duration::from_millis(250);

        let waits = Rc::new(RefCell::new(Vec::new()));
        let mut reconciler = Reconciler::new(SimulatedStore::new(), RetryPolicy::default())
            .with_sleeper(Recorder(Rc::clone(&waits)));
        run_import_with_store(&config, &mut reconciler).expect("import");

        assert_eq!(*waits.borrow(), vec![Duration::from_millis(250); 2]);
    }

    #[test]
    fn publishes_summary_page_and_csv() {
        let temp = tempdir().expect("tempdir");
        write_file(&temp.path().join("a.html"), "<p>x</p>");
        let mut config = dry_config(temp.path(), None);
        config.publish_report = true;
        config.report_csv = Some(temp.path().join("out/report.csv"));

        let mut reconciler = dry_reconciler();
        let report = run_import_with_store(&config, &mut reconciler).expect("import");

        assert!(report.report_page_url.is_some());
        let summary = reconciler
            .store()
            .pages()
            .find(|page| page.title.starts_with("Import report "))
            .expect("summary page");
        assert!(
            summary
                .body
                .as_deref()
                .unwrap_or_default()
                .contains("<td>page_created</td><td>1</td>")
        );
        let csv = fs::read_to_string(temp.path().join("out/report.csv")).expect("csv");
        assert!(csv.contains("a,page_created,a.html,"));
    }
}
