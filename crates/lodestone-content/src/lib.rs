//! Content pipeline for game modification content
//!
//! Content moves through four stages before it is usable:
//!
//! 1. **Discovery**: providers turn a [`ContentSearchQuery`] into search results
//! 2. **Resolution**: a result becomes a [`ContentManifest`] listing files
//! 3. **Delivery**: every file is fetched into the content-addressable store
//! 4. **Registration**: the delivered manifest enters the [`ManifestPool`] and
//!    its store objects gain a reference owned by the manifest id
//!
//! The [`ContentOrchestrator`] fans searches out to every enabled provider and
//! serializes acquisition per manifest id.
//!
//! # Example
//!
//! ```rust,no_run
//! use lodestone_cas::{CasConfig, ContentStore};
//! use lodestone_content::{ContentConfig, ContentOrchestrator, ContentSearchQuery, OperationContext};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(ContentStore::open(CasConfig::new("/var/lib/lodestone/cas"))?);
//! let orchestrator = ContentOrchestrator::open(&ContentConfig::from_env(), store)?;
//!
//! let ctx = OperationContext::new();
//! let results = orchestrator.search(&ContentSearchQuery::term("desert"), &ctx).await?;
//! if let Some(first) = results.first() {
//!     let manifest = orchestrator.acquire(first, &ctx).await?;
//!     println!("acquired {} ({} files)", manifest.id, manifest.files.len());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod delivery;
pub mod error;
pub mod http;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod sources;
pub mod validation;

pub use config::{
    CatalogSourceConfig, ContentConfig, ExistingContentPolicy, LocalSourceConfig,
    ReleaseSourceConfig, SourcesConfig,
};
pub use delivery::CasDeliverer;
pub use error::{ContentError, ErrorKind, Result};
pub use http::{HttpClient, HttpConfig};
pub use model::{
    ContentDependency, ContentManifest, ContentSearchQuery, ContentSearchResult, ContentType,
    ManifestFile, ManifestId, PublisherInfo, is_mutable_path,
};
pub use orchestrator::ContentOrchestrator;
pub use pipeline::{ContentDeliverer, ContentDiscoverer, ContentResolver, ContentValidator};
pub use pool::{AddOutcome, ManifestPool};
pub use progress::{OperationContext, ProgressEvent, ProgressSink, progress_channel};
pub use provider::{ContentProvider, PipelineProvider};
pub use retry::RetryPolicy;
pub use validation::{ManifestValidator, Severity, ValidationIssue, ValidationReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
