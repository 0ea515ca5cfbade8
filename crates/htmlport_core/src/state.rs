use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::filesystem::ensure_parent_dir;

/// Identities (relative source paths) of fully transferred documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    #[serde(default)]
    transferred: BTreeSet<String>,
}

impl TransferState {
    pub fn contains(&self, identity: &str) -> bool {
        self.transferred.contains(identity)
    }

    pub fn mark(&mut self, identity: impl Into<String>) -> bool {
        self.transferred.insert(identity.into())
    }

    pub fn len(&self) -> usize {
        self.transferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transferred.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.transferred.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    /// Full-resend runs start from an empty state but still record progress.
    ignore: bool,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, ignore: bool) -> Self {
        Self {
            path: path.into(),
            ignore,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state. Absent, unreadable or corrupt files yield an
    /// empty state; corruption is logged.
    pub fn load(&self) -> TransferState {
        if self.ignore || !self.path.exists() {
            return TransferState::default();
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) => {
                warn!(path = %self.path.display(), "ignoring unreadable resume state: {error}");
                return TransferState::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(error) => {
                warn!(path = %self.path.display(), "ignoring corrupt resume state: {error}");
                TransferState::default()
            }
        }
    }

    /// Overwrite the state file through a sibling temporary file.
    pub fn save(&self, state: &TransferState) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let rendered =
            serde_json::to_string_pretty(state).context("failed to serialize resume state")?;
        let temporary = self.path.with_extension("json.tmp");
        fs::write(&temporary, format!("{rendered}\n"))
            .with_context(|| format!("failed to write {}", temporary.display()))?;
        fs::rename(&temporary, &self.path).with_context(|| {
            format!(
                "failed to move {} to {}",
                temporary.display(),
                self.path.display()
            )
        })
    }
}
