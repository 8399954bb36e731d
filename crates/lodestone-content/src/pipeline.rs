//! Pipeline stage traits
//!
//! A provider is composed from four stages. Each stage has a stable id so
//! search results can name the resolver that understands their metadata.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::model::{ContentManifest, ContentSearchQuery, ContentSearchResult};
use crate::progress::OperationContext;
use crate::validation::ValidationReport;

/// Turns a query into search results
#[async_trait]
pub trait ContentDiscoverer: Send + Sync {
    /// Stable stage id
    fn id(&self) -> &str;

    /// Search this stage's source; an empty result is not an error
    async fn discover(
        &self,
        query: &ContentSearchQuery,
        ctx: &OperationContext,
    ) -> Result<Vec<ContentSearchResult>>;
}

/// Turns a search result into a full manifest
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Stable id search results refer to in `resolver_id`
    fn id(&self) -> &str;

    /// Produce the full manifest for `result`
    async fn resolve(
        &self,
        result: &ContentSearchResult,
        ctx: &OperationContext,
    ) -> Result<ContentManifest>;
}

/// Fetches manifest files into the store
///
/// Returns a new manifest whose files all carry `cas_ref`. `workdir` is a
/// scratch directory owned by the caller and removed afterwards.
#[async_trait]
pub trait ContentDeliverer: Send + Sync {
    /// Stable stage id
    fn id(&self) -> &str;

    /// Whether every file has a source this deliverer understands
    fn can_deliver(&self, manifest: &ContentManifest) -> bool;

    /// Store every file and return the manifest with `cas_ref` filled in
    async fn deliver(
        &self,
        manifest: &ContentManifest,
        workdir: &Path,
        ctx: &OperationContext,
    ) -> Result<ContentManifest>;
}

/// Structural and post-delivery checks
#[async_trait]
pub trait ContentValidator: Send + Sync {
    /// Stable stage id
    fn id(&self) -> &str;

    /// Consistency of the manifest itself; touches nothing on disk
    async fn validate_manifest(&self, manifest: &ContentManifest) -> ValidationReport;

    /// Hash and size of every delivered file
    async fn validate_files(
        &self,
        manifest: &ContentManifest,
        ctx: &OperationContext,
    ) -> ValidationReport;
}
