//! Content-addressable store for downloaded game content.
//!
//! Payloads are keyed by the lowercase hex SHA-256 of their bytes and stored
//! exactly once, no matter how many manifests or workspaces use them:
//!
//! - **Hash provider**: fixed-algorithm hashing of byte slices, readers and
//!   files, plus an incremental hasher used while a transfer is in flight
//! - **Content store**: temp-then-rename commits into sharded object paths
//! - **Reference tracker**: owner sets per object, persisted in a sidecar
//!   JSON file that survives restarts
//! - **Garbage collector**: removes unreferenced objects once a grace period
//!   has elapsed
//!
//! # Storage Layout
//!
//! ```text
//! <root>/
//!   objects/<hash[0:2]>/<hash>
//!   tmp/<uuid>.partial
//!   refs.json
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use lodestone_cas::{CasConfig, ContentStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ContentStore::open(CasConfig::new("/var/lib/lodestone/cas"))?;
//! let stored = store.store_bytes(b"map data", None).await?;
//! store.reference(&stored.hash, "1.community.map.desert-storm").await?;
//!
//! let report = store.garbage_collect().await?;
//! println!("deleted {} objects", report.deleted);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use thiserror::Error;

pub mod config;
pub mod gc;
pub mod hash;
pub mod refs;
pub mod store;

pub use config::CasConfig;
pub use gc::{GcReport, spawn_collector};
pub use hash::{ContentHash, HashProvider, StreamHasher};
pub use refs::ReferenceTracker;
pub use store::{CasWriter, ContentStore, StoreStats, StoredObject};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, CasError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum CasError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A string is not a valid content hash.
    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    /// Object is not present in the store.
    #[error("Object not found: {0}")]
    NotFound(ContentHash),

    /// Stored bytes did not hash to the expected value. Nothing was committed.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Hash declared by the caller
        expected: ContentHash,
        /// Hash of the bytes actually received
        actual: ContentHash,
    },

    /// An object on disk no longer hashes to its own key.
    #[error("Data corruption detected for {hash}: content hashes to {actual}")]
    Corruption {
        /// Key of the corrupted object
        hash: ContentHash,
        /// Hash of the bytes found on disk
        actual: ContentHash,
    },

    /// Reference sidecar could not be read or written.
    #[error("Reference store error: {0}")]
    References(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Version information for the store.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subdirectory holding committed objects.
pub const OBJECTS_DIR: &str = "objects";

/// Subdirectory holding in-flight writes.
///
/// Lives under the store root so the final rename never crosses volumes.
pub const TEMP_DIR: &str = "tmp";

/// Reference sidecar file name.
pub const REFS_FILE: &str = "refs.json";

/// Extension for in-flight writes in [`TEMP_DIR`].
pub const PARTIAL_EXTENSION: &str = "partial";
