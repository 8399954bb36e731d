//! Error types for the content pipeline

use lodestone_cas::{CasError, ContentHash};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result type for content operations
pub type Result<T> = std::result::Result<T, ContentError>;

/// Coarse classification shared by every crate in the workspace.
///
/// Callers branch on the kind, not on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed query, manifest or identifier
    Validation,
    /// Unknown provider, resolver, manifest or object
    NotFound,
    /// Network failure, timeout or server-side error that may succeed on retry
    Transient,
    /// Downloaded or stored bytes do not match what was declared
    Integrity,
    /// The operating system refused an operation for lack of privilege
    Privilege,
    /// The caller cancelled the operation
    Cancelled,
    /// Anything else
    Internal,
}

/// Errors produced by discovery, resolution, delivery and registration
#[derive(Debug, Error)]
pub enum ContentError {
    /// Query with no criteria or out-of-range values
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Manifest id that does not follow `<version>.<publisher>.<type>.<slug>`
    #[error("Invalid manifest id '{id}': {reason}")]
    InvalidManifestId {
        /// The rejected id
        id: String,
        /// Which part was malformed
        reason: String,
    },

    /// Every structural problem found in a manifest
    #[error("Manifest validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Search result lacks metadata its resolver needs
    #[error("Search result {id} is missing resolver metadata '{key}'")]
    MissingMetadata {
        /// Search result id
        id: String,
        /// Missing metadata key
        key: String,
    },

    /// No registered provider or resolver with this id
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Search was attempted with every provider disabled
    #[error("No content providers are enabled")]
    NoProviders,

    /// Every enabled provider failed; one reason per provider
    #[error("All providers failed: {}", .0.join("; "))]
    AllProvidersFailed(Vec<String>),

    /// Manifest is not in the pool
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    /// Delivered bytes hash differently from what the manifest declared
    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        /// Manifest-relative file path
        path: String,
        /// Declared hash
        expected: ContentHash,
        /// Hash of the received bytes
        actual: ContentHash,
    },

    /// Delivered file size differs from the declared size
    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Manifest-relative file path
        path: String,
        /// Declared size in bytes
        expected: u64,
        /// Received size in bytes
        actual: u64,
    },

    /// Non-success HTTP status
    #[error("HTTP status {status} from {url}")]
    HttpStatus {
        /// Requested URL
        url: String,
        /// Status the server answered with
        status: StatusCode,
    },

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed URL
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Operation exceeded its context timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Content store failure
    #[error("Store error: {0}")]
    Store(#[from] CasError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed provider response
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ContentError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuery(_)
            | Self::InvalidManifestId { .. }
            | Self::Validation(_)
            | Self::MissingMetadata { .. }
            | Self::Parse(_)
            | Self::Url(_)
            | Self::Config(_) => ErrorKind::Validation,
            Self::ProviderNotFound(_) | Self::ManifestNotFound(_) => ErrorKind::NotFound,
            Self::NoProviders | Self::AllProvidersFailed(_) | Self::Timeout(_) => {
                ErrorKind::Transient
            }
            Self::HttpStatus { status, .. } => {
                if status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS {
                    ErrorKind::Transient
                } else if *status == StatusCode::NOT_FOUND {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::Internal
                }
            }
            Self::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    ErrorKind::Transient
                } else if e.is_decode() {
                    ErrorKind::Validation
                } else {
                    ErrorKind::Internal
                }
            }
            Self::Integrity { .. } | Self::SizeMismatch { .. } => ErrorKind::Integrity,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(e) => match e {
                CasError::HashMismatch { .. } | CasError::Corruption { .. } => {
                    ErrorKind::Integrity
                }
                CasError::NotFound(_) => ErrorKind::NotFound,
                CasError::InvalidHash(_) | CasError::Config(_) => ErrorKind::Validation,
                CasError::Io(io) => io_kind(io),
                CasError::References(_) => ErrorKind::Internal,
            },
            Self::Io(e) => io_kind(e),
            Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable
    pub fn should_retry(&self) -> bool {
        match self {
            // Exhausted fan-out and provider lookups are never retried per call
            Self::NoProviders | Self::AllProvidersFailed(_) => false,
            _ => self.kind() == ErrorKind::Transient,
        }
    }
}

fn io_kind(e: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match e.kind() {
        Io::NotFound => ErrorKind::NotFound,
        Io::PermissionDenied => ErrorKind::Privilege,
        Io::TimedOut | Io::Interrupted | Io::ConnectionReset | Io::ConnectionAborted => {
            ErrorKind::Transient
        }
        _ => ErrorKind::Internal,
    }
}
