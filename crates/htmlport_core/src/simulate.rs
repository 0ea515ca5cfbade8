use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::confluence::{
    AttachmentUpload, ContentStore, RemoteAttachment, RemoteError, RemotePage,
};
use crate::filesystem::{encode_path_segment, ensure_parent_dir, slugify};

pub const DRY_BASE_URL: &str = "dry://htmlport";

/// In-memory store for dry runs. Ids are `dry-<n>`, links use the `dry://`
/// scheme, and nothing leaves the process.
#[derive(Debug)]
pub struct SimulatedStore {
    base_url: String,
    pages: BTreeMap<String, RemotePage>,
    attachments: BTreeMap<(String, String), RemoteAttachment>,
    next_id: usize,
    request_count: usize,
}

impl Default for SimulatedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedStore {
    pub fn new() -> Self {
        Self {
            base_url: DRY_BASE_URL.to_string(),
            pages: BTreeMap::new(),
            attachments: BTreeMap::new(),
            next_id: 0,
            request_count: 0,
        }
    }

    pub fn page(&self, title: &str) -> Option<&RemotePage> {
        self.pages.get(title)
    }

    pub fn pages(&self) -> impl Iterator<Item = &RemotePage> {
        self.pages.values()
    }

    pub fn attachments(&self, page_id: &str) -> Vec<&RemoteAttachment> {
        self.attachments
            .iter()
            .filter(|((owner, _), _)| owner == page_id)
            .map(|(_, attachment)| attachment)
            .collect()
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("dry-{}", self.next_id)
    }

    fn download_url(&self, page_id: &str, filename: &str) -> String {
        format!(
            "{}/download/attachments/{}/{}",
            self.base_url,
            encode_path_segment(page_id),
            encode_path_segment(filename)
        )
    }

    fn page_title(&self, page_id: &str) -> Option<&str> {
        self.pages
            .values()
            .find(|page| page.id == page_id)
            .map(|page| page.title.as_str())
    }

    fn store_attachment(&mut self, page_id: &str, attachment_id: String, filename: &str) -> String {
        let download_url = self.download_url(page_id, filename);
        self.attachments.insert(
            (page_id.to_string(), filename.to_string()),
            RemoteAttachment {
                id: attachment_id,
                title: filename.to_string(),
                download_url: Some(download_url.clone()),
            },
        );
        download_url
    }
}

impl ContentStore for SimulatedStore {
    fn find_page(&mut self, title: &str) -> Result<Option<RemotePage>> {
        self.request_count += 1;
        Ok(self.pages.get(title).cloned())
    }

    fn create_page(
        &mut self,
        title: &str,
        body: &str,
        _parent_id: Option<&str>,
    ) -> Result<RemotePage> {
        self.request_count += 1;
        if self.pages.contains_key(title) {
            return Err(RemoteError::from_status(
                400,
                format!("a page titled {title} already exists"),
            )
            .into());
        }
        let id = self.allocate_id();
        let page = RemotePage {
            url: Some(format!("{}/pages/{id}", self.base_url)),
            id,
            title: title.to_string(),
            version: 1,
            body: Some(body.to_string()),
        };
        self.pages.insert(title.to_string(), page.clone());
        Ok(page)
    }

    fn update_page(&mut self, page: &RemotePage, version: u64, body: &str) -> Result<RemotePage> {
        self.request_count += 1;
        let Some(stored) = self.pages.get_mut(&page.title) else {
            bail!("page {} does not exist", page.title);
        };
        if version != stored.version + 1 {
            return Err(RemoteError::from_status(
                409,
                format!(
                    "version conflict for {}: have {}, got {version}",
                    page.title, stored.version
                ),
            )
            .into());
        }
        stored.version = version;
        stored.body = Some(body.to_string());
        Ok(stored.clone())
    }

    fn list_attachments(
        &mut self,
        page_id: &str,
        filename: &str,
    ) -> Result<Vec<RemoteAttachment>> {
        self.request_count += 1;
        Ok(self
            .attachments
            .get(&(page_id.to_string(), filename.to_string()))
            .cloned()
            .into_iter()
            .collect())
    }

    fn create_attachment(
        &mut self,
        page_id: &str,
        _file: &Path,
        filename: &str,
    ) -> Result<AttachmentUpload> {
        self.request_count += 1;
        if self.page_title(page_id).is_none() {
            bail!("page {page_id} does not exist");
        }
        let id = self.allocate_id();
        Ok(AttachmentUpload::Download(
            self.store_attachment(page_id, id, filename),
        ))
    }

    fn update_attachment(
        &mut self,
        page_id: &str,
        attachment_id: &str,
        _file: &Path,
        filename: &str,
    ) -> Result<AttachmentUpload> {
        self.request_count += 1;
        Ok(AttachmentUpload::Download(self.store_attachment(
            page_id,
            attachment_id.to_string(),
            filename,
        )))
    }

    fn fetch_attachment(&mut self, attachment_id: &str) -> Result<RemoteAttachment> {
        self.request_count += 1;
        self.attachments
            .values()
            .find(|attachment| attachment.id == attachment_id)
            .cloned()
            .with_context(|| format!("attachment {attachment_id} does not exist"))
    }

    fn page_url(&self, page: &RemotePage) -> Option<String> {
        page.url.clone()
    }

    fn download_base(&self) -> &str {
        &self.base_url
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Dry run that also writes each page body to `<out>/<slug>.xhtml` and copies
/// attachments into `<out>/<slug>_attachments/`.
#[derive(Debug)]
pub struct LocalOutputStore {
    inner: SimulatedStore,
    output_dir: PathBuf,
    slugs: HashMap<String, String>,
}

impl LocalOutputStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;
        Ok(Self {
            inner: SimulatedStore::new(),
            output_dir,
            slugs: HashMap::new(),
        })
    }

    pub fn page_path(&self, title: &str) -> PathBuf {
        self.output_dir.join(format!("{}.xhtml", slugify(title)))
    }

    fn write_page(&mut self, page: &RemotePage, body: &str) -> Result<()> {
        self.slugs.insert(page.id.clone(), slugify(&page.title));
        let path = self.page_path(&page.title);
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
    }

    fn copy_attachment(&self, page_id: &str, file: &Path, filename: &str) -> Result<PathBuf> {
        let slug = self
            .slugs
            .get(page_id)
            .with_context(|| format!("page {page_id} was not written"))?;
        let target = self
            .output_dir
            .join(format!("{slug}_attachments"))
            .join(filename);
        ensure_parent_dir(&target)?;
        fs::copy(file, &target).with_context(|| {
            format!("failed to copy {} to {}", file.display(), target.display())
        })?;
        Ok(target)
    }
}

impl ContentStore for LocalOutputStore {
    fn find_page(&mut self, title: &str) -> Result<Option<RemotePage>> {
        self.inner.find_page(title)
    }

    fn create_page(
        &mut self,
        title: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<RemotePage> {
        let page = self.inner.create_page(title, body, parent_id)?;
        self.write_page(&page, body)?;
        Ok(page)
    }

    fn update_page(&mut self, page: &RemotePage, version: u64, body: &str) -> Result<RemotePage> {
        let updated = self.inner.update_page(page, version, body)?;
        self.write_page(&updated, body)?;
        Ok(updated)
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
        self.copy_attachment(page_id, file, filename)?;
        self.inner.create_attachment(page_id, file, filename)
    }

    fn update_attachment(
        &mut self,
        page_id: &str,
        attachment_id: &str,
        file: &Path,
        filename: &str,
    ) -> Result<AttachmentUpload> {
        self.copy_attachment(page_id, file, filename)?;
        self.inner
            .update_attachment(page_id, attachment_id, file, filename)
    }

    fn fetch_attachment(&mut self, attachment_id: &str) -> Result<RemoteAttachment> {
        self.inner.fetch_attachment(attachment_id)
    }

    fn page_url(&self, page: &RemotePage) -> Option<String> {
        Some(self.page_path(&page.title).display().to_string())
    }

    fn download_base(&self) -> &str {
        self.inner.download_base()
    }

    fn request_count(&self) -> usize {
        self.inner.request_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn simulated_store_assigns_dry_ids_and_versions() {
        let mut store = SimulatedStore::new();
        let page = store.create_page("Page B", "<p/>", None).expect("create");
        assert_eq!(page.id, "dry-1");
        assert_eq!(page.version, 1);

        let updated = store.update_page(&page, 2, "<p>x</p>").expect("update");
        assert_eq!(updated.version, 2);
        assert!(store.update_page(&page, 2, "<p>y</p>").is_err());
        assert_eq!(
            store.find_page("Page B").expect("find").map(|page| page.version),
            Some(2)
        );
    }

    #[test]
    fn simulated_store_keys_attachments_by_page_and_filename() {
        let mut store = SimulatedStore::new();
        let page = store.create_page("A", "", None).expect("create");
        let upload = store
            .create_attachment(&page.id, Path::new("img/my pic.png"), "my pic.png")
            .expect("upload");
        assert_eq!(
            upload,
            AttachmentUpload::Download(
                "dry://htmlport/download/attachments/dry-1/my%20pic.png".to_string()
            )
        );
        assert_eq!(
            store
                .list_attachments(&page.id, "my pic.png")
                .expect("list")
                .len(),
            1
        );
        assert!(store.list_attachments(&page.id, "other.png").expect("list").is_empty());
    }

    #[test]
    fn local_output_store_writes_pages_and_attachments() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("pic.png");
        fs::write(&source, b"png").expect("write source");
        let out = temp.path().join("out");

        let mut store = LocalOutputStore::new(&out).expect("store");
        let page = store.create_page("Page B", "<p>draft</p>", None).expect("create");
        store
            .create_attachment(&page.id, &source, "pic.png")
            .expect("attach");
        store.update_page(&page, 2, "<p>final</p>").expect("update");

        assert_eq!(
            fs::read_to_string(out.join("Page_B.xhtml")).expect("page file"),
            "<p>final</p>"
        );
        assert_eq!(
            fs::read(out.join("Page_B_attachments").join("pic.png")).expect("attachment"),
            b"png"
        );
    }
}
