//! Application configuration
//!
//! Values are layered: built-in defaults, then the optional TOML file, then
//! command-line flags. Every flag that names a setting can also be supplied
//! through its `LODESTONE_*` environment variable, so the environment sits
//! between the file and explicit flags.

use anyhow::{Context, Result};
use lodestone_cas::CasConfig;
use lodestone_content::{ContentConfig, ExistingContentPolicy, RetryPolicy, SourcesConfig};
use lodestone_workspace::{WorkspaceConfig, WorkspaceStrategy};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `[store]` table
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    /// Store directory
    pub root: Option<PathBuf>,
    /// Seconds an unreferenced object survives before collection
    pub gc_grace_secs: Option<u64>,
    /// Seconds between passes of `gc --watch`
    pub gc_interval_secs: Option<u64>,
    /// Concurrent store writes
    pub max_concurrent_operations: Option<usize>,
}

/// `[content]` table
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContentSection {
    /// Directory holding the manifest pool and staging area
    pub data_root: Option<PathBuf>,
    /// Provider ids to skip
    pub disabled_providers: Vec<String>,
    /// Re-hash store objects before trusting the pool
    pub verify_existing: Option<bool>,
    /// Search cache lifetime; zero disables it
    pub search_cache_secs: Option<u64>,
    /// Retries after the first HTTP attempt
    pub max_retries: Option<u32>,
    /// Whole-request HTTP timeout
    pub request_timeout_secs: Option<u64>,
    /// Content sources
    pub sources: SourcesConfig,
}

/// `[workspace]` table
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceSection {
    /// Workspace directory
    pub root: Option<PathBuf>,
    /// Default placement strategy
    pub strategy: Option<WorkspaceStrategy>,
    /// Retries for copies blocked by a file lock
    pub copy_retries: Option<u32>,
}

/// Contents of a `lodestone.toml` file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// `[store]` settings
    pub store: StoreSection,
    /// `[content]` settings
    pub content: ContentSection,
    /// `[workspace]` settings
    pub workspace: WorkspaceSection,
}

impl FileConfig {
    /// Parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Settings given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--data-root`
    pub data_root: Option<PathBuf>,
    /// `--store-root`
    pub store_root: Option<PathBuf>,
    /// `--workspace-root`
    pub workspace_root: Option<PathBuf>,
    /// Strategy given to a command
    pub strategy: Option<WorkspaceStrategy>,
    /// `--disable-provider`
    pub disabled_providers: Vec<String>,
    /// `--verify-existing`
    pub verify_existing: bool,
}

/// Fully resolved configuration for every library crate
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Content store settings
    pub cas: CasConfig,
    /// Content pipeline settings
    pub content: ContentConfig,
    /// Workspace settings
    pub workspace: WorkspaceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::compose(FileConfig::default(), &Overrides::default())
    }
}

impl AppConfig {
    /// Load the optional file and apply overrides on top
    pub fn load(file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let file = match file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let config = Self::compose(file, overrides);
        config.validate()?;
        Ok(config)
    }

    fn compose(file: FileConfig, overrides: &Overrides) -> Self {
        let mut content = ContentConfig::default();
        if let Some(root) = overrides.data_root.clone().or(file.content.data_root) {
            content.data_root = root;
        }
        content.disabled_providers = file
            .content
            .disabled_providers
            .into_iter()
            .chain(overrides.disabled_providers.iter().cloned())
            .collect::<BTreeSet<_>>();
        if overrides.verify_existing || file.content.verify_existing == Some(true) {
            content.existing_policy = ExistingContentPolicy::VerifyStore;
        }
        content.search_cache_ttl = file
            .content
            .search_cache_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        if let Some(retries) = file.content.max_retries {
            content.retry = RetryPolicy {
                max_attempts: retries,
                ..content.retry
            };
        }
        content.http.request_timeout = file
            .content
            .request_timeout_secs
            .map(Duration::from_secs);
        content.sources = file.content.sources;

        // The store lives under the data root unless placed explicitly.
        let store_root = overrides
            .store_root
            .clone()
            .or(file.store.root)
            .unwrap_or_else(|| content.data_root.join("cas"));
        let mut cas = CasConfig::new(store_root);
        if let Some(secs) = file.store.gc_grace_secs {
            cas = cas.with_grace_period(Duration::from_secs(secs));
        }
        if let Some(secs) = file.store.gc_interval_secs {
            cas = cas.with_gc_interval(Duration::from_secs(secs));
        }
        if let Some(max) = file.store.max_concurrent_operations {
            cas = cas.with_max_concurrent_operations(max);
        }

        let workspace_root = overrides
            .workspace_root
            .clone()
            .or(file.workspace.root)
            .unwrap_or_else(|| content.data_root.join("workspaces"));
        let mut workspace = WorkspaceConfig::new(workspace_root);
        if let Some(strategy) = overrides.strategy.or(file.workspace.strategy) {
            workspace = workspace.with_default_strategy(strategy);
        }
        if let Some(retries) = file.workspace.copy_retries {
            let backoff = workspace.copy_backoff;
            workspace = workspace.with_copy_retries(retries, backoff);
        }

        Self {
            cas,
            content,
            workspace,
        }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.cas.validate().context("invalid [store] configuration")?;
        self.content
            .validate()
            .context("invalid [content] configuration")?;
        self.workspace
            .validate()
            .context("invalid [workspace] configuration")?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_nest_under_data_root() {
        let config = AppConfig::default();
        assert_eq!(config.cas.root, PathBuf::from("./data/cas"));
        assert_eq!(config.workspace.root, PathBuf::from("./data/workspaces"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_then_overrides() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("lodestone.toml");
        std::fs::write(
            &path,
            r#"
[store]
gc_grace_secs = 60

[content]
data_root = "/srv/lodestone"
disabled_providers = ["slow"]
search_cache_secs = 300
max_retries = 5

[[content.sources.catalogs]]
id = "community"
base_url = "https://catalog.example"

[[content.sources.releases]]
id = "github"
repositories = ["acme/maps"]

[workspace]
strategy = "hard_link"
"#,
        )
        .expect("write");

        let overrides = Overrides {
            workspace_root: Some(PathBuf::from("/tmp/ws")),
            strategy: Some(WorkspaceStrategy::FullCopy),
            disabled_providers: vec!["github".into()],
            ..Overrides::default()
        };
        let config = AppConfig::load(Some(&path), &overrides).expect("load");

        assert_eq!(config.content.data_root, PathBuf::from("/srv/lodestone"));
        assert_eq!(config.cas.root, PathBuf::from("/srv/lodestone/cas"));
        assert_eq!(config.cas.gc_grace_period, Duration::from_secs(60));
        assert_eq!(config.content.search_cache_ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.content.retry.max_attempts, 5);
        assert_eq!(config.content.sources.catalogs.len(), 1);
        assert_eq!(
            config.content.sources.releases[0].api_url,
            "https://api.github.com"
        );
        assert_eq!(config.workspace.root, PathBuf::from("/tmp/ws"));
        assert_eq!(config.workspace.default_strategy, WorkspaceStrategy::FullCopy);
        assert_eq!(
            config.content.disabled_providers.iter().collect::<Vec<_>>(),
            vec!["github", "slow"]
        );
    }

    #[test]
    fn test_unknown_keys_and_bad_sources_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("lodestone.toml");

        std::fs::write(&path, "[store]\nroot_dir = \"/x\"\n").expect("write");
        assert!(AppConfig::load(Some(&path), &Overrides::default()).is_err());

        std::fs::write(
            &path,
            "[[content.sources.releases]]\nid = \"gh\"\nrepositories = [\"no-owner\"]\n",
        )
        .expect("write");
        assert!(AppConfig::load(Some(&path), &Overrides::default()).is_err());
    }
}
