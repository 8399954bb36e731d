//! Configuration for the content store

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{CasError, Result};

/// Configuration for the content store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasConfig {
    /// Store root directory
    pub root: PathBuf,

    /// Minimum age of an unreferenced object before garbage collection may delete it
    pub gc_grace_period: Duration,

    /// Interval between background garbage collection runs
    pub gc_interval: Duration,

    /// Maximum number of simultaneous store and verify operations
    pub max_concurrent_operations: usize,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./cas"),
            gc_grace_period: Duration::from_secs(24 * 60 * 60), // 1 day
            gc_interval: Duration::from_secs(60 * 60),          // 1 hour
            max_concurrent_operations: 4,
        }
    }
}

impl CasConfig {
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
            root: std::env::var("LODESTONE_CAS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
            gc_grace_period: std::env::var("LODESTONE_GC_GRACE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(defaults.gc_grace_period, Duration::from_secs),
            gc_interval: std::env::var("LODESTONE_GC_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(defaults.gc_interval, Duration::from_secs),
            max_concurrent_operations: std::env::var("LODESTONE_CAS_MAX_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrent_operations),
        }
    }

    /// Set the store root
    #[must_use]
    pub fn with_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.root = root.as_ref().to_path_buf();
        self
    }

    /// Set the garbage collection grace period
    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.gc_grace_period = grace;
        self
    }

    /// Set the background garbage collection interval
    #[must_use]
    pub const fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the concurrency limit
    #[must_use]
    pub const fn with_max_concurrent_operations(mut self, max: usize) -> Self {
        self.max_concurrent_operations = max;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(CasError::Config("store root must not be empty".to_string()));
        }
        if self.max_concurrent_operations == 0 {
            return Err(CasError::Config(
                "max_concurrent_operations must be at least 1".to_string(),
            ));
        }
        if self.gc_interval.is_zero() {
            return Err(CasError::Config("gc_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}
