use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::confluence::{AttachmentUpload, ContentStore, RemoteError, RemotePage};
use crate::retry::{RetryPolicy, Sleeper, ThreadSleeper, with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOutcome {
    pub page: RemotePage,
    pub action: UpsertAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentOutcome {
    pub filename: String,
    pub download_url: String,
    pub action: UpsertAction,
}

/// Search-then-create-or-update against a store that has no native upsert.
/// Every remote call goes through the retry wrapper.
pub struct Reconciler<S: ContentStore> {
    store: S,
    policy: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
}

impl<S: ContentStore> Reconciler<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Pause through the same sleeper that paces retries.
    pub fn pause(&self, duration: Duration) {
        self.sleeper.sleep(duration);
    }

    /// Make sure a page titled `title` exists with `body`: update the existing
    /// page to the next version, or create it under `parent_id`.
    pub fn reconcile_page(
        &mut self,
        title: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> Result<PageOutcome> {
        let existing = with_retry(&self.policy, "find page", self.sleeper.as_ref(), || {
            self.store.find_page(title)
        })
        .with_context(|| format!("failed to search for page {title}"))?;

        match existing {
            Some(page) => {
                debug!(title, id = %page.id, version = page.version, "page exists");
                let page = self.update_page(&page, body)?;
                Ok(PageOutcome {
                    page,
                    action: UpsertAction::Updated,
                })
            }
            None => {
                let page = with_retry(&self.policy, "create page", self.sleeper.as_ref(), || {
                    self.store.create_page(title, body, parent_id)
                })
                .with_context(|| format!("failed to create page {title}"))?;
                debug!(title, id = %page.id, "page created");
                Ok(PageOutcome {
                    page,
                    action: UpsertAction::Created,
                })
            }
        }
    }

    /// Replace the body of a known page, bumping its version by one.
    pub fn update_page(&mut self, page: &RemotePage, body: &str) -> Result<RemotePage> {
        let version = page.version + 1;
        with_retry(&self.policy, "update page", self.sleeper.as_ref(), || {
            self.store.update_page(page, version, body)
        })
        .inspect_err(|error| {
            let conflict = error
                .chain()
                .find_map(|cause| cause.downcast_ref::<RemoteError>())
                .is_some_and(RemoteError::is_conflict);
            if conflict {
                warn!(title = %page.title, version, "page changed remotely during import");
            }
        })
        .with_context(|| format!("failed to update page {} to version {version}", page.title))
    }

    /// Upload `file` as attachment `filename` of `page_id`, replacing the data
    /// of an existing attachment with the same name.
    pub fn upload_attachment(
        &mut self,
        page_id: &str,
        file: &Path,
        filename: &str,
    ) -> Result<AttachmentOutcome> {
        let existing = with_retry(&self.policy, "list attachments", self.sleeper.as_ref(), || {
            self.store.list_attachments(page_id, filename)
        })
        .with_context(|| format!("failed to list attachments of page {page_id}"))?
        .into_iter()
        .find(|attachment| attachment.title == filename);

        let (upload, action) = match existing {
            Some(attachment) => {
                let upload =
                    with_retry(&self.policy, "update attachment", self.sleeper.as_ref(), || {
                        self.store
                            .update_attachment(page_id, &attachment.id, file, filename)
                    })
                    .with_context(|| format!("failed to update attachment {filename}"))?;
                (upload, UpsertAction::Updated)
            }
            None => {
                let upload =
                    with_retry(&self.policy, "create attachment", self.sleeper.as_ref(), || {
                        self.store.create_attachment(page_id, file, filename)
                    })
                    .with_context(|| format!("failed to upload attachment {filename}"))?;
                (upload, UpsertAction::Created)
            }
        };

        let download_url = match upload {
            AttachmentUpload::Download(url) => url,
            AttachmentUpload::NeedsFetch(id) => {
                let attachment =
                    with_retry(&self.policy, "fetch attachment", self.sleeper.as_ref(), || {
                        self.store.fetch_attachment(&id)
                    })
                    .with_context(|| format!("failed to fetch attachment {id}"))?;
                attachment.download_url.ok_or_else(|| {
                    RemoteError::fatal(format!("attachment {id} has no download link"))
                })?
            }
        };

        Ok(AttachmentOutcome {
            filename: filename.to_string(),
            download_url,
            action,
        })
    }

    pub fn page_url(&self, page: &RemotePage) -> Option<String> {
        self.store.page_url(page)
    }

    pub fn download_base(&self) -> &str {
        self.store.download_base()
    }
}
