//! Configuration for workspace materialization

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WorkspaceError};
use crate::strategy::WorkspaceStrategy;

/// Configuration for the workspace manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory holding one workspace per profile
    pub root: PathBuf,

    /// Strategy used when a request does not name one
    pub default_strategy: WorkspaceStrategy,

    /// Retries for copies and deletes blocked by another process
    pub copy_retries: u32,

    /// Initial delay between those retries, doubled each attempt
    pub copy_backoff: Duration,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./workspaces"),
            default_strategy: WorkspaceStrategy::default(),
            copy_retries: 3,
            copy_backoff: Duration::from_millis(100),
        }
    }
}

impl WorkspaceConfig {
    /// Create a new configuration rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            root: std::env::var("LODESTONE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
            default_strategy: std::env::var("LODESTONE_WORKSPACE_STRATEGY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_strategy),
            copy_retries: std::env::var("LODESTONE_COPY_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.copy_retries),
            copy_backoff: defaults.copy_backoff,
        }
    }

    /// Set [`Self::root`]
    #[must_use]
    pub fn with_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.root = root.as_ref().to_path_buf();
        self
    }

    /// Strategy used when a request names none
    #[must_use]
    pub const fn with_default_strategy(mut self, strategy: WorkspaceStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Retry locked copies `retries` times, `backoff` apart
    #[must_use]
    pub const fn with_copy_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.copy_retries = retries;
        self.copy_backoff = backoff;
        self
    }

    /// Directory of one profile's workspace
    pub fn profile_dir(&self, profile: &str) -> PathBuf {
        self.root.join(profile)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(WorkspaceError::Config(
                "workspace root must not be empty".to_string(),
            ));
        }
        if self.copy_retries > 10 {
            return Err(WorkspaceError::Config(
                "copy_retries must be at most 10".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkspaceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_strategy, WorkspaceStrategy::HybridCopySymlink);
        assert_eq!(config.profile_dir("main"), PathBuf::from("./workspaces/main"));
    }

    #[test]
    fn test_validation() {
        let config = WorkspaceConfig::new("").with_default_strategy(WorkspaceStrategy::HardLink);
        assert!(config.validate().is_err());
        let config = WorkspaceConfig::new("/tmp/ws").with_copy_retries(50, Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
