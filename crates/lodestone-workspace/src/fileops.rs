//! Filesystem primitives with fallback-on-refusal
//!
//! [`FileOperations::apply`] runs an [`OpPlan`]: it clears whatever sits at
//! the destination (including symlinks whose target is gone, which
//! `Path::exists` reports as absent), runs the primary operation, and falls
//! back only when the platform refused the primary for lack of privilege or,
//! for hard links, because source and destination are on different devices.
//! All calls are blocking.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, WorkspaceError};
use crate::strategy::{FileOp, OpPlan};

// Windows: ERROR_PRIVILEGE_NOT_HELD
const WIN_PRIVILEGE_NOT_HELD: i32 = 1314;
// Windows: ERROR_NOT_SAME_DEVICE
const WIN_NOT_SAME_DEVICE: i32 = 17;
// Windows: ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
const WIN_SHARING_VIOLATION: i32 = 32;
const WIN_LOCK_VIOLATION: i32 = 33;
// Unix: EXDEV
const UNIX_EXDEV: i32 = 18;

/// The OS refused an operation for lack of privilege or capability
pub fn is_privilege_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported
    ) || (cfg!(windows) && e.raw_os_error() == Some(WIN_PRIVILEGE_NOT_HELD))
}

/// Source and destination are on different filesystems
pub fn is_cross_device_error(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::CrossesDevices {
        return true;
    }
    let code = if cfg!(windows) {
        WIN_NOT_SAME_DEVICE
    } else {
        UNIX_EXDEV
    };
    e.raw_os_error() == Some(code)
}

/// Another process briefly holds the file
pub fn is_transient_lock_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ResourceBusy
    ) || (cfg!(windows)
        && matches!(
            e.raw_os_error(),
            Some(WIN_SHARING_VIOLATION | WIN_LOCK_VIOLATION)
        ))
}

/// Blocking filesystem seam
pub trait FileSystem: Send + Sync {
    /// Copy `source` to `dest`, returning bytes copied
    fn copy(&self, source: &Path, dest: &Path) -> io::Result<u64>;

    /// Create `dest` as a hard link to `source`
    fn hard_link(&self, source: &Path, dest: &Path) -> io::Result<()>;

    /// Create `dest` as a symlink pointing at `source`
    fn symlink(&self, source: &Path, dest: &Path) -> io::Result<()>;

    /// Remove a file or symlink at `path`, broken symlinks included.
    /// Returns whether anything was removed.
    fn remove_existing(&self, path: &Path) -> io::Result<bool>;

    /// Whether anything exists at `path`, without following symlinks
    fn exists(&self, path: &Path) -> bool;

    /// Create `path` and any missing parents
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// The host filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn copy(&self, source: &Path, dest: &Path) -> io::Result<u64> {
        std::fs::copy(source, dest)
    }

    fn hard_link(&self, source: &Path, dest: &Path) -> io::Result<()> {
        std::fs::hard_link(source, dest)
    }

    #[cfg(unix)]
    fn symlink(&self, source: &Path, dest: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(source, dest)
    }

    #[cfg(windows)]
    fn symlink(&self, source: &Path, dest: &Path) -> io::Result<()> {
        std::os::windows::fs::symlink_file(source, dest)
    }

    #[cfg(not(any(unix, windows)))]
    fn symlink(&self, _source: &Path, _dest: &Path) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn remove_existing(&self, path: &Path) -> io::Result<bool> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
        Ok(true)
    }

    fn exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

/// What happened to one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    /// Operation that produced the file
    pub op: FileOp,
    /// Set when the primary operation was refused and the fallback ran
    pub warning: Option<String>,
}

/// Applies operation plans through a [`FileSystem`]
#[derive(Clone)]
pub struct FileOperations {
    fs: Arc<dyn FileSystem>,
    copy_retries: u32,
    copy_backoff: Duration,
}

impl FileOperations {
    /// Placement helper over `fs`
    pub fn new(fs: Arc<dyn FileSystem>, copy_retries: u32, copy_backoff: Duration) -> Self {
        Self {
            fs,
            copy_retries,
            copy_backoff,
        }
    }

    /// Underlying filesystem
    pub fn file_system(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    /// Materialize `dest` from `source` according to `plan`
    pub fn apply(&self, plan: OpPlan, source: &Path, dest: &Path) -> Result<FileOutcome> {
        if let Some(parent) = dest.parent() {
            self.fs.create_dir_all(parent)?;
        }
        self.clear(dest)?;

        let primary_error = match self.run(plan.primary, source, dest) {
            Ok(()) => {
                return Ok(FileOutcome {
                    op: plan.primary,
                    warning: None,
                });
            }
            Err(e) => e,
        };

        let Some(fallback) = plan
            .fallback
            .filter(|_| Self::may_fall_back(plan.primary, &primary_error))
        else {
            return Err(WorkspaceError::FileOperation {
                op: plan.primary,
                path: dest.to_path_buf(),
                source: primary_error,
            });
        };

        let warning = format!(
            "{} refused for {} ({primary_error}), used {fallback} instead",
            plan.primary,
            dest.display()
        );
        warn!("{warning}");

        self.clear(dest)?;
        match self.run(fallback, source, dest) {
            Ok(()) => Ok(FileOutcome {
                op: fallback,
                warning: Some(warning),
            }),
            Err(fallback_error) => Err(WorkspaceError::FallbackFailed {
                path: dest.to_path_buf(),
                primary: plan.primary,
                primary_error,
                fallback,
                fallback_error,
            }),
        }
    }

    fn may_fall_back(primary: FileOp, error: &io::Error) -> bool {
        is_privilege_error(error) || (primary == FileOp::HardLink && is_cross_device_error(error))
    }

    /// Remove a stale destination, retrying while another process holds it
    fn clear(&self, dest: &Path) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.fs.remove_existing(dest) {
                Ok(removed) => {
                    if removed {
                        debug!("removed stale entry at {}", dest.display());
                    }
                    return Ok(());
                }
                Err(e) if is_transient_lock_error(&e) && attempt < self.copy_retries => {
                    warn!(
                        "retry {}: failed to remove existing file at {}: {e}",
                        attempt + 1,
                        dest.display()
                    );
                    std::thread::sleep(self.backoff(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn run(&self, op: FileOp, source: &Path, dest: &Path) -> io::Result<()> {
        match op {
            FileOp::Copy => self.copy_with_retry(source, dest).map(|_| ()),
            FileOp::HardLink => self.fs.hard_link(source, dest),
            FileOp::Symlink => self.fs.symlink(source, dest),
        }
    }

    fn copy_with_retry(&self, source: &Path, dest: &Path) -> io::Result<u64> {
        let mut attempt = 0;
        loop {
            match self.fs.copy(source, dest) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if is_transient_lock_error(&e) && attempt < self.copy_retries => {
                    debug!(
                        "copy of {} blocked ({e}), retry {}",
                        source.display(),
                        attempt + 1
                    );
                    std::thread::sleep(self.backoff(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.copy_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(Duration::from_secs(5))
    }
}

impl std::fmt::Debug for FileOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOperations")
            .field("copy_retries", &self.copy_retries)
            .field("copy_backoff", &self.copy_backoff)
            .finish_non_exhaustive()
    }
}
