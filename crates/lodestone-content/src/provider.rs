//! Content providers
//!
//! A provider is the unit the orchestrator fans out to. [`PipelineProvider`]
//! composes one from discoverer, resolver, deliverer and validator stages.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::error::{ContentError, Result};
use crate::model::{ContentManifest, ContentSearchQuery, ContentSearchResult};
use crate::pipeline::{ContentDeliverer, ContentDiscoverer, ContentResolver, ContentValidator};
use crate::progress::OperationContext;

/// Source of content the orchestrator can search and acquire from
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Unique provider id
    fn id(&self) -> &str;

    /// Id of the resolver this provider stamps on its search results
    fn resolver_id(&self) -> &str;

    /// Disabled providers are skipped by search
    fn is_enabled(&self) -> bool;

    /// Search this provider; an empty query is rejected
    async fn search(
        &self,
        query: &ContentSearchQuery,
        ctx: &OperationContext,
    ) -> Result<Vec<ContentSearchResult>>;

    /// Resolve (if needed) and structurally validate a search result
    async fn get_validated_content(
        &self,
        result: &ContentSearchResult,
        ctx: &OperationContext,
    ) -> Result<ContentManifest>;

    /// Re-validate `manifest` and deliver its files into the store
    ///
    /// Validation errors abort before any file is touched.
    async fn prepare_content(
        &self,
        manifest: &ContentManifest,
        workdir: &Path,
        ctx: &OperationContext,
    ) -> Result<ContentManifest>;
}

/// Provider built from the four pipeline stages
pub struct PipelineProvider {
    id: String,
    enabled: AtomicBool,
    discoverer: Arc<dyn ContentDiscoverer>,
    resolver: Arc<dyn ContentResolver>,
    deliverer: Arc<dyn ContentDeliverer>,
    validator: Arc<dyn ContentValidator>,
}

impl PipelineProvider {
    /// Provider from its four stages, enabled
    pub fn new(
        id: impl Into<String>,
        discoverer: Arc<dyn ContentDiscoverer>,
        resolver: Arc<dyn ContentResolver>,
        deliverer: Arc<dyn ContentDeliverer>,
        validator: Arc<dyn ContentValidator>,
    ) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            discoverer,
            resolver,
            deliverer,
            validator,
        }
    }

    /// Toggle participation in searches
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Builder form of `set_enabled(false)`
    #[must_use]
    pub fn disabled(self) -> Self {
        self.set_enabled(false);
        self
    }
}

impl std::fmt::Debug for PipelineProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineProvider")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("discoverer", &self.discoverer.id())
            .field("resolver", &self.resolver.id())
            .field("deliverer", &self.deliverer.id())
            .field("validator", &self.validator.id())
            .finish()
    }
}

#[async_trait]
impl ContentProvider for PipelineProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolver_id(&self) -> &str {
        self.resolver.id()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn search(
        &self,
        query: &ContentSearchQuery,
        ctx: &OperationContext,
    ) -> Result<Vec<ContentSearchResult>> {
        if query.is_empty() {
            return Err(ContentError::InvalidQuery(
                "at least one search criterion is required".to_string(),
            ));
        }
        let mut results = self.discoverer.discover(query, ctx).await?;
        for result in &mut results {
            if result.provider_id.is_empty() {
                result.provider_id.clone_from(&self.id);
            }
            if result.requires_resolution && result.resolver_id.is_empty() {
                result.resolver_id = self.resolver.id().to_string();
            }
        }
        debug!(provider = %self.id, count = results.len(), "search finished");
        Ok(results)
    }

    async fn get_validated_content(
        &self,
        result: &ContentSearchResult,
        ctx: &OperationContext,
    ) -> Result<ContentManifest> {
        let manifest = if result.requires_resolution {
            if result.resolver_id != self.resolver.id() {
                return Err(ContentError::ProviderNotFound(format!(
                    "provider {} has no resolver {}",
                    self.id, result.resolver_id
                )));
            }
            self.resolver.resolve(result, ctx).await?
        } else {
            result.manifest.clone().ok_or_else(|| {
                ContentError::Validation(vec![format!(
                    "search result {} carries no manifest and needs no resolution",
                    result.id
                )])
            })?
        };

        self.validator
            .validate_manifest(&manifest)
            .await
            .into_result()?;
        Ok(manifest)
    }

    async fn prepare_content(
        &self,
        manifest: &ContentManifest,
        workdir: &Path,
        ctx: &OperationContext,
    ) -> Result<ContentManifest> {
        let report = self.validator.validate_manifest(manifest).await;
        for issue in report.warnings() {
            warn!(manifest = %manifest.id, "{issue}");
        }
        report.into_result()?;

        if !self.deliverer.can_deliver(manifest) {
            return Err(ContentError::Validation(vec![format!(
                "deliverer {} cannot deliver {}",
                self.deliverer.id(),
                manifest.id
            )]));
        }

        ctx.check_cancelled()?;
        self.deliverer.deliver(manifest, workdir, ctx).await
    }
}
