use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::confluence::{ConfluenceAuth, ConfluenceClientConfig, DEFAULT_USER_AGENT};
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "htmlport.toml";
pub const DEFAULT_STATE_FILE: &str = ".htmlport/state.json";
pub const DEFAULT_OUTPUT_DIR: &str = "htmlport-out";
pub const DEFAULT_DOCUMENT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_REPORT_TITLE: &str = "Import report";

/// On-disk shape of `htmlport.toml`. Every key is optional.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FileConfig {
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub import: ImportSection,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    pub base_url: Option<String>,
    pub space_key: Option<String>,
    pub email: Option<String>,
    pub token: Option<String>,
    pub parent_id: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_read_ms: Option<u64>,
    pub rate_limit_write_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ImportSection {
    pub root: Option<PathBuf>,
    pub index: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub document_delay_ms: Option<u64>,
    pub report_csv: Option<PathBuf>,
    pub report_title: Option<String>,
    pub publish_report: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RetrySection {
    pub max_attempts: Option<usize>,
    pub base_delay_ms: Option<u64>,
    pub fixed_delay_ms: Option<u64>,
}

/// Load and parse `htmlport.toml`. Returns the default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<FileConfig> {
    if !config_path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: FileConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    Normal,
    /// Simulated store: synthetic ids and URLs, no network.
    Dry,
    /// Simulated store that writes page bodies and attachments to disk.
    DryLocal,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Dry => "dry",
            Self::DryLocal => "dry-local",
        }
    }

    pub fn is_dry(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

/// Command-line values; `None` leaves the env/file/default resolution alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub root: Option<PathBuf>,
    pub index: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub mode: Option<ExecutionMode>,
    pub limit: Option<usize>,
    pub full: bool,
    pub report_csv: Option<PathBuf>,
    pub publish_report: Option<bool>,
    pub parent_id: Option<String>,
    pub document_delay_ms: Option<u64>,
}

/// Fully resolved settings for one run. Built once, then only read.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportConfig {
    pub mode: ExecutionMode,
    pub root: PathBuf,
    pub index: Option<PathBuf>,
    pub state_file: PathBuf,
    pub output_dir: PathBuf,
    pub limit: Option<usize>,
    pub full: bool,
    pub document_delay: Duration,
    pub report_csv: Option<PathBuf>,
    pub report_title: String,
    pub publish_report: bool,
    pub confluence: ConfluenceClientConfig,
    pub retry: RetryPolicy,
}

impl ImportConfig {
    /// Resolve settings: flag > env > file > default. Relative paths are taken
    /// from `project_root`.
    pub fn resolve(file: &FileConfig, overrides: &ConfigOverrides, project_root: &Path) -> Self {
        Self::resolve_with_env(file, overrides, project_root, |key| env::var(key).ok())
    }

    pub fn resolve_with_env<F>(
        file: &FileConfig,
        overrides: &ConfigOverrides,
        project_root: &Path,
        env_lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |key: &str| {
            env_lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let env_u64 = |key: &str| env_value(key).and_then(|value| value.parse::<u64>().ok());
        let anchored = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                project_root.join(path)
            }
        };

        let section = &file.confluence;
        let email = env_value("CONFLUENCE_EMAIL").or_else(|| section.email.clone());
        let token = env_value("CONFLUENCE_TOKEN").or_else(|| section.token.clone());
        let auth = match (email, token) {
            (Some(email), Some(token)) => Some(ConfluenceAuth::Basic { email, token }),
            (None, Some(token)) => Some(ConfluenceAuth::Bearer(token)),
            (_, None) => None,
        };
        let defaults = ConfluenceClientConfig::default();
        let confluence = ConfluenceClientConfig {
            base_url: env_value("CONFLUENCE_BASE_URL")
                .or_else(|| section.base_url.clone())
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            space_key: env_value("CONFLUENCE_SPACE_KEY")
                .or_else(|| section.space_key.clone())
                .unwrap_or_default(),
            auth,
            parent_id: overrides
                .parent_id
                .clone()
                .or_else(|| env_value("CONFLUENCE_PARENT_ID"))
                .or_else(|| section.parent_id.clone()),
            user_agent: env_value("HTMLPORT_USER_AGENT")
                .or_else(|| section.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: env_u64("HTMLPORT_HTTP_TIMEOUT_MS")
                .or(section.timeout_ms)
                .unwrap_or(defaults.timeout_ms),
            rate_limit_read_ms: env_u64("HTMLPORT_RATE_LIMIT_READ_MS")
                .or(section.rate_limit_read_ms)
                .unwrap_or(defaults.rate_limit_read_ms),
            rate_limit_write_ms: env_u64("HTMLPORT_RATE_LIMIT_WRITE_MS")
                .or(section.rate_limit_write_ms)
                .unwrap_or(defaults.rate_limit_write_ms),
        };

        let import = &file.import;
        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: file
                .retry
                .max_attempts
                .unwrap_or(retry_defaults.max_attempts)
                .max(1),
            base_delay: file
                .retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.base_delay),
            fixed_delay: file
                .retry
                .fixed_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.fixed_delay),
        };

        Self {
            mode: overrides.mode.unwrap_or_default(),
            root: overrides
                .root
                .clone()
                .or_else(|| env_value("HTMLPORT_ROOT").map(PathBuf::from))
                .or_else(|| import.root.clone())
                .map(|path| anchored(&path))
                .unwrap_or_else(|| project_root.to_path_buf()),
            index: overrides
                .index
                .clone()
                .or_else(|| env_value("HTMLPORT_INDEX").map(PathBuf::from))
                .or_else(|| import.index.clone())
                .map(|path| anchored(&path)),
            state_file: anchored(
                &overrides
                    .state_file
                    .clone()
                    .or_else(|| import.state_file.clone())
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            ),
            output_dir: anchored(
                &overrides
                    .output_dir
                    .clone()
                    .or_else(|| import.output_dir.clone())
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            ),
            limit: overrides.limit,
            full: overrides.full,
            document_delay: Duration::from_millis(
                overrides
                    .document_delay_ms
                    .or_else(|| env_u64("HTMLPORT_DOCUMENT_DELAY_MS"))
                    .or(import.document_delay_ms)
                    .unwrap_or(DEFAULT_DOCUMENT_DELAY_MS),
            ),
            report_csv: overrides
                .report_csv
                .clone()
                .or_else(|| import.report_csv.clone())
                .map(|path| anchored(&path)),
            report_title: import
                .report_title
                .clone()
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REPORT_TITLE.to_string()),
            publish_report: overrides
                .publish_report
                .or(import.publish_report)
                .unwrap_or(false),
            confluence,
            retry,
        }
    }

    /// Reject settings a run cannot start with.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            bail!("import root does not exist: {}", self.root.display());
        }
        if let Some(index) = &self.index
            && !index.is_file()
        {
            bail!("index document does not exist: {}", index.display());
        }
        if self.mode.is_dry() {
            return Ok(());
        }

        let confluence = &self.confluence;
        if confluence.base_url.is_empty() {
            bail!(
                "CONFLUENCE_BASE_URL is not set (or [confluence].base_url in {DEFAULT_CONFIG_FILE})"
            );
        }
        if !confluence.base_url.starts_with("http://")
            && !confluence.base_url.starts_with("https://")
        {
            bail!("CONFLUENCE_BASE_URL must be an http(s) URL: {}", confluence.base_url);
        }
        if confluence.space_key.is_empty() {
            bail!(
                "CONFLUENCE_SPACE_KEY is not set (or [confluence].space_key in {DEFAULT_CONFIG_FILE})"
            );
        }
        if confluence.auth.is_none() {
            bail!(
                "CONFLUENCE_TOKEN is not set; a token (plus CONFLUENCE_EMAIL for basic auth) is required"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use tempfile::tempdir;

    fn no_env(_key: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/htmlport.toml")).expect("load config");
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&config_path, "[confluence\nbase_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn resolves_file_values_and_defaults() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(
            &config_path,
            r#"
[confluence]
base_url = "https://example.atlassian.net/wiki/"
space_key = "DOC"
token = "secret"

[import]
root = "site"
index = "site/index.html"
document_delay_ms = 0

[retry]
max_attempts = 5
"#,
        )
        .expect("write config");

        let file = load_config(&config_path).expect("load config");
        let config =
            ImportConfig::resolve_with_env(&file, &ConfigOverrides::default(), temp.path(), no_env);

        assert_eq!(config.confluence.base_url, "https://example.atlassian.net/wiki");
        assert_eq!(
            config.confluence.auth,
            Some(ConfluenceAuth::Bearer("secret".to_string()))
        );
        assert_eq!(config.root, temp.path().join("site"));
        assert_eq!(config.index, Some(temp.path().join("site/index.html")));
        assert_eq!(config.state_file, temp.path().join(DEFAULT_STATE_FILE));
        assert_eq!(config.document_delay, Duration::ZERO);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.report_title, DEFAULT_REPORT_TITLE);
        assert_eq!(config.mode, ExecutionMode::Normal);
    }

    #[test]
    fn precedence_is_flag_then_env_then_file() {
        let file = FileConfig {
            confluence: ConfluenceSection {
                base_url: Some("https://file.example.org".to_string()),
                parent_id: Some("1".to_string()),
                ..ConfluenceSection::default()
            },
            import: ImportSection {
                document_delay_ms: Some(5),
                ..ImportSection::default()
            },
            ..FileConfig::default()
        };
        let env: BTreeMap<&str, &str> = BTreeMap::from([
            ("CONFLUENCE_BASE_URL", "https://env.example.org"),
            ("CONFLUENCE_PARENT_ID", "2"),
            ("CONFLUENCE_EMAIL", "me@example.org"),
            ("CONFLUENCE_TOKEN", "api-token"),
            ("HTMLPORT_DOCUMENT_DELAY_MS", "7"),
        ]);
        let overrides = ConfigOverrides {
            parent_id: Some("3".to_string()),
            ..ConfigOverrides::default()
        };

        let config =
            ImportConfig::resolve_with_env(&file, &overrides, Path::new("/project"), |key| {
                env.get(key).map(|value| value.to_string())
            });

        assert_eq!(config.confluence.base_url, "https://env.example.org");
        assert_eq!(config.confluence.parent_id.as_deref(), Some("3"));
        assert_eq!(config.document_delay, Duration::from_millis(7));
        assert_eq!(
            config.confluence.auth,
            Some(ConfluenceAuth::Basic {
                email: "me@example.org".to_string(),
                token: "api-token".to_string(),
            })
        );
    }

    #[test]
    fn validate_requires_remote_settings_outside_dry_modes() {
        let temp = tempdir().expect("tempdir");
        let mut config = ImportConfig::resolve_with_env(
            &FileConfig::default(),
            &ConfigOverrides::default(),
            temp.path(),
            no_env,
        );

        let error = config.validate().expect_err("missing base url");
        assert!(error.to_string().contains("CONFLUENCE_BASE_URL"));

        config.mode = ExecutionMode::Dry;
        config.validate().expect("dry runs need no remote settings");

        config.mode = ExecutionMode::Normal;
        config.confluence.base_url = "https://wiki.example.org".to_string();
        config.confluence.space_key = "DOC".to_string();
        config.confluence.auth = Some(ConfluenceAuth::Bearer("t".to_string()));
        config.validate().expect("complete settings");
    }

    #[test]
    fn validate_rejects_missing_root_and_index() {
        let temp = tempdir().expect("tempdir");
        let overrides = ConfigOverrides {
            mode: Some(ExecutionMode::Dry),
            root: Some(PathBuf::from("missing")),
            ..ConfigOverrides::default()
        };
        let config =
            ImportConfig::resolve_with_env(&FileConfig::default(), &overrides, temp.path(), no_env);
        assert!(config.validate().is_err());

        let overrides = ConfigOverrides {
            mode: Some(ExecutionMode::Dry),
            index: Some(PathBuf::from("index.html")),
            ..ConfigOverrides::default()
        };
        let config =
            ImportConfig::resolve_with_env(&FileConfig::default(), &overrides, temp.path(), no_env);
        let error = config.validate().expect_err("missing index");
        assert!(error.to_string().contains("index document"));
    }
}
