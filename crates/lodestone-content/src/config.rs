//! Configuration for the content pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ContentError, Result};
use crate::http::HttpConfig;
use crate::retry::RetryPolicy;

/// What `acquire` does when the manifest is already in the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingContentPolicy {
    /// Return the pool entry as-is
    #[default]
    TrustPool,
    /// Re-hash every store object first; a failed check drops the entry and
    /// acquisition runs again
    VerifyStore,
}

/// Web catalog source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSourceConfig {
    /// Provider id
    pub id: String,
    /// Catalog API root; search and manifest paths are joined onto it
    pub base_url: String,
}

/// GitHub-compatible releases source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSourceConfig {
    /// Provider id
    pub id: String,
    /// Releases API root
    #[serde(default = "default_releases_api")]
    pub api_url: String,
    /// `owner/repo` pairs to search
    pub repositories: Vec<String>,
    /// Bearer token for higher rate limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_releases_api() -> String {
    "https://api.github.com".to_string()
}

/// Directory of unpacked content to import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSourceConfig {
    /// Provider id
    pub id: String,
    /// Directory scanned for one content folder per entry
    pub root: PathBuf,
}

/// Configured content sources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Web catalogs
    pub catalogs: Vec<CatalogSourceConfig>,
    /// Release feeds
    pub releases: Vec<ReleaseSourceConfig>,
    /// Local import folders
    pub local: Vec<LocalSourceConfig>,
}

impl SourcesConfig {
    /// True when no source is configured
    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty() && self.releases.is_empty() && self.local.is_empty()
    }

    fn ids(&self) -> impl Iterator<Item = &str> {
        self.catalogs
            .iter()
            .map(|c| c.id.as_str())
            .chain(self.releases.iter().map(|r| r.id.as_str()))
            .chain(self.local.iter().map(|l| l.id.as_str()))
    }
}

/// Configuration for the content pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Directory holding the manifest pool and staging area
    pub data_root: PathBuf,

    /// Provider ids that are registered but not consulted
    pub disabled_providers: BTreeSet<String>,

    /// What to do when a manifest is already in the pool
    pub existing_policy: ExistingContentPolicy,

    /// Reuse search results for this long; `None` disables caching
    pub search_cache_ttl: Option<Duration>,

    /// Retry policy for every HTTP request
    pub retry: RetryPolicy,

    /// Shared HTTP client settings
    pub http: HttpConfig,

    /// Content sources, one provider each
    pub sources: SourcesConfig,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            disabled_providers: BTreeSet::new(),
            existing_policy: ExistingContentPolicy::default(),
            search_cache_ttl: None,
            retry: RetryPolicy::default(),
            http: HttpConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

impl ContentConfig {
    /// Create a new configuration rooted at `data_root`
    pub fn new<P: AsRef<Path>>(data_root: P) -> Self {
        Self {
            data_root: data_root.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_root: std::env::var("LODESTONE_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            disabled_providers: std::env::var("LODESTONE_DISABLED_PROVIDERS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            existing_policy: match std::env::var("LODESTONE_VERIFY_EXISTING")
                .ok()
                .and_then(|s| s.parse::<bool>().ok())
            {
                Some(true) => ExistingContentPolicy::VerifyStore,
                Some(false) => ExistingContentPolicy::TrustPool,
                None => defaults.existing_policy,
            },
            search_cache_ttl: std::env::var("LODESTONE_SEARCH_CACHE_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            retry: RetryPolicy::from_env(),
            http: defaults.http,
            sources: defaults.sources,
        }
    }

    /// Manifest pool directory
    pub fn pool_dir(&self) -> PathBuf {
        self.data_root.join("manifests")
    }

    /// Scratch space for deliveries in progress
    pub fn staging_dir(&self) -> PathBuf {
        self.data_root.join("staging")
    }

    /// Set [`Self::existing_policy`]
    #[must_use]
    pub const fn with_existing_policy(mut self, policy: ExistingContentPolicy) -> Self {
        self.existing_policy = policy;
        self
    }

    /// Cache search results for `ttl`
    #[must_use]
    pub const fn with_search_cache_ttl(mut self, ttl: Duration) -> Self {
        self.search_cache_ttl = Some(ttl);
        self
    }

    /// Set [`Self::retry`]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set [`Self::sources`]
    #[must_use]
    pub fn with_sources(mut self, sources: SourcesConfig) -> Self {
        self.sources = sources;
        self
    }

    /// Skip provider `id` during search
    #[must_use]
    pub fn with_disabled_provider(mut self, id: impl Into<String>) -> Self {
        self.disabled_providers.insert(id.into());
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.data_root.as_os_str().is_empty() {
            return Err(ContentError::Config("data_root must not be empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        for id in self.sources.ids() {
            if id.trim().is_empty() {
                return Err(ContentError::Config("source id must not be empty".to_string()));
            }
            if !seen.insert(id) {
                return Err(ContentError::Config(format!("duplicate source id '{id}'")));
            }
        }
        for release in &self.sources.releases {
            for repository in &release.repositories {
                if repository.split('/').filter(|p| !p.is_empty()).count() != 2 {
                    return Err(ContentError::Config(format!(
                        "repository '{repository}' in source '{}' must be owner/repo",
                        release.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ContentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.existing_policy, ExistingContentPolicy::TrustPool);
        assert_eq!(config.pool_dir(), PathBuf::from("./data/manifests"));
    }

    #[test]
    fn test_validation_rejects_duplicate_ids_and_bad_repos() {
        let sources = SourcesConfig {
            catalogs: vec![CatalogSourceConfig {
                id: "web".into(),
                base_url: "https://catalog.example".into(),
            }],
            local: vec![LocalSourceConfig {
                id: "web".into(),
                root: PathBuf::from("/mods"),
            }],
            ..SourcesConfig::default()
        };
        assert!(ContentConfig::default().with_sources(sources).validate().is_err());

        let sources = SourcesConfig {
            releases: vec![ReleaseSourceConfig {
                id: "gh".into(),
                api_url: default_releases_api(),
                repositories: vec!["just-a-name".into()],
                token: None,
            }],
            ..SourcesConfig::default()
        };
        assert!(ContentConfig::default().with_sources(sources).validate().is_err());
    }
}
