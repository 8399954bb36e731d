//! Error types for workspace materialization

use lodestone_cas::{CasError, ContentHash};
use lodestone_content::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::fileops::{is_cross_device_error, is_privilege_error, is_transient_lock_error};
use crate::strategy::FileOp;

/// Result type for workspace operations
pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Errors produced while preparing or tearing down workspaces
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Another preparation of the profile is running
    #[error("Workspace '{0}' is already being prepared")]
    Busy(String),

    /// Profile name that cannot be used as a directory name
    #[error("Invalid profile name '{0}'")]
    InvalidProfile(String),

    /// Manifest path escaping the workspace or otherwise unusable
    #[error("Invalid workspace path '{path}': {reason}")]
    InvalidPath {
        /// Offending relative path
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// Manifest file without a store reference
    #[error("{path} from {manifest} has not been delivered to the store")]
    NotDelivered {
        /// Manifest id
        manifest: String,
        /// Relative path of the undelivered file
        path: String,
    },

    /// Referenced store object is gone
    #[error("Store object {hash} for {path} is missing")]
    MissingObject {
        /// Relative path that needs the object
        path: String,
        /// Missing object
        hash: ContentHash,
    },

    /// A filesystem primitive failed with no fallback left
    #[error("Failed to {op} {}: {source}", .path.display())]
    FileOperation {
        /// Primitive that failed
        op: FileOp,
        /// Destination path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Both the primary primitive and its fallback failed
    #[error("Failed to materialize {}: {primary} refused ({primary_error}), {fallback} failed ({fallback_error})", .path.display())]
    FallbackFailed {
        /// Destination path
        path: PathBuf,
        /// Primitive tried first
        primary: FileOp,
        /// Why the platform refused it
        primary_error: std::io::Error,
        /// Primitive tried second
        fallback: FileOp,
        /// Why the fallback failed
        fallback_error: std::io::Error,
    },

    /// Preparation exceeded its context timeout
    #[error("Workspace preparation timed out after {0:?}")]
    Timeout(Duration),

    /// Preparation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Content store failure
    #[error("Store error: {0}")]
    Store(#[from] CasError),

    /// Filesystem failure outside a file primitive
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Workspace record could not be encoded or decoded
    #[error("Workspace record error: {0}")]
    Record(#[from] serde_json::Error),

    /// Invalid configuration or strategy name
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkspaceError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy(_) | Self::Timeout(_) => ErrorKind::Transient,
            Self::InvalidProfile(_)
            | Self::InvalidPath { .. }
            | Self::NotDelivered { .. }
            | Self::Config(_) => ErrorKind::Validation,
            Self::MissingObject { .. } => ErrorKind::NotFound,
            Self::FileOperation { source, .. } => io_kind(source),
            Self::FallbackFailed { fallback_error, .. } => io_kind(fallback_error),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(CasError::HashMismatch { .. } | CasError::Corruption { .. }) => {
                ErrorKind::Integrity
            }
            Self::Store(CasError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(CasError::Io(e)) | Self::Io(e) => io_kind(e),
            Self::Store(_) | Self::Record(_) => ErrorKind::Internal,
        }
    }
}

fn io_kind(e: &std::io::Error) -> ErrorKind {
    if is_privilege_error(e) {
        ErrorKind::Privilege
    } else if is_transient_lock_error(e) {
        ErrorKind::Transient
    } else if e.kind() == std::io::ErrorKind::NotFound {
        ErrorKind::NotFound
    } else if is_cross_device_error(e) {
        ErrorKind::Validation
    } else {
        ErrorKind::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(WorkspaceError::Busy("p".into()).kind(), ErrorKind::Transient);
        assert_eq!(WorkspaceError::Cancelled.kind(), ErrorKind::Cancelled);
        let denied = WorkspaceError::FileOperation {
            op: FileOp::Symlink,
            path: PathBuf::from("a"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(denied.kind(), ErrorKind::Privilege);
        assert!(denied.to_string().contains("symlink"));
    }
}
