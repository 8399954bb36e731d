//! Content orchestrator
//!
//! Fans searches out to every enabled provider and drives acquisition:
//! resolve, deliver, verify, register, reference. Acquisition of one
//! manifest id is serialized so concurrent callers end up with a single pool
//! entry and a single set of store references.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use lodestone_cas::ContentStore;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::{ContentConfig, ExistingContentPolicy};
use crate::error::{ContentError, Result};
use crate::model::{
    ContentDependency, ContentManifest, ContentSearchQuery, ContentSearchResult, ManifestId,
};
use crate::pipeline::ContentValidator;
use crate::pool::ManifestPool;
use crate::progress::OperationContext;
use crate::provider::ContentProvider;
use crate::sources::build_providers;
use crate::validation::{ManifestValidator, ValidationReport};

struct SearchCache {
    ttl: Duration,
    entries: DashMap<ContentSearchQuery, (Instant, Vec<ContentSearchResult>)>,
}

impl SearchCache {
    fn get(&self, query: &ContentSearchQuery) -> Option<Vec<ContentSearchResult>> {
        let hit = self
            .entries
            .get(query)
            .filter(|entry| entry.0.elapsed() < self.ttl)
            .map(|entry| entry.1.clone());
        if hit.is_none() {
            self.entries.remove_if(query, |_, (at, _)| at.elapsed() >= self.ttl);
        }
        hit
    }

    fn insert(&self, query: ContentSearchQuery, results: Vec<ContentSearchResult>) {
        self.entries.insert(query, (Instant::now(), results));
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

/// Per-acquisition scratch directory, removed on every exit path
struct StagingDir {
    path: PathBuf,
    removed: bool,
}

impl StagingDir {
    async fn create(path: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    async fn remove(mut self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            debug!("failed to remove staging directory {}: {e}", self.path.display());
        }
        self.removed = true;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        // Only reached when the acquisition future is dropped mid-delivery.
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Remove staging directories left behind by an interrupted process
fn sweep_staging(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let outcome = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match outcome {
            Ok(()) => removed += 1,
            Err(e) => warn!("failed to remove stale staging entry {}: {e}", path.display()),
        }
    }
    removed
}

/// Entry point for searching and acquiring content
pub struct ContentOrchestrator {
    providers: BTreeMap<String, Arc<dyn ContentProvider>>,
    disabled: RwLock<BTreeSet<String>>,
    pool: Arc<ManifestPool>,
    store: Arc<ContentStore>,
    validator: Arc<dyn ContentValidator>,
    staging_dir: PathBuf,
    policy: ExistingContentPolicy,
    acquisitions: DashMap<ManifestId, Arc<Mutex<()>>>,
    search_cache: Option<SearchCache>,
}

impl ContentOrchestrator {
    /// Orchestrator with no providers registered
    pub fn new(config: &ContentConfig, store: Arc<ContentStore>, pool: Arc<ManifestPool>) -> Self {
        Self {
            providers: BTreeMap::new(),
            disabled: RwLock::new(config.disabled_providers.clone()),
            validator: Arc::new(ManifestValidator::new(Arc::clone(&store))),
            pool,
            store,
            staging_dir: config.staging_dir(),
            policy: config.existing_policy,
            acquisitions: DashMap::new(),
            search_cache: config.search_cache_ttl.map(|ttl| SearchCache {
                ttl,
                entries: DashMap::new(),
            }),
        }
    }

    /// Open the pool and register a provider for every configured source
    ///
    /// Leftover staging directories from an earlier process are removed, so
    /// a data root must not be shared by two live orchestrators.
    pub fn open(config: &ContentConfig, store: Arc<ContentStore>) -> Result<Self> {
        let swept = sweep_staging(&config.staging_dir());
        if swept > 0 {
            info!(swept, "removed stale staging directories");
        }
        let pool = Arc::new(ManifestPool::open(config.pool_dir())?);
        let mut orchestrator = Self::new(config, Arc::clone(&store), pool);
        for provider in build_providers(config, &store)? {
            orchestrator.register(provider)?;
        }
        Ok(orchestrator)
    }

    /// Replace the post-delivery validator
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn ContentValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Add a provider; ids must be unique
    pub fn register(&mut self, provider: Arc<dyn ContentProvider>) -> Result<()> {
        let id = provider.id().to_string();
        if self.providers.contains_key(&id) {
            return Err(ContentError::Config(format!("provider '{id}' registered twice")));
        }
        debug!(provider = %id, "provider registered");
        self.providers.insert(id, provider);
        Ok(())
    }

    /// Registry of acquired manifests
    pub fn pool(&self) -> &Arc<ManifestPool> {
        &self.pool
    }

    /// Store every provider delivers into
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Registered provider ids with their effective enabled state
    pub fn providers(&self) -> Vec<(String, bool)> {
        self.providers
            .iter()
            .map(|(id, p)| (id.clone(), self.is_provider_enabled(id, p.as_ref())))
            .collect()
    }

    /// Enable or disable a provider at runtime; clears the search cache
    pub fn set_provider_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        if !self.providers.contains_key(id) {
            return Err(ContentError::ProviderNotFound(id.to_string()));
        }
        {
            let mut disabled = self.disabled.write();
            if enabled {
                disabled.remove(id);
            } else {
                disabled.insert(id.to_string());
            }
        }
        if let Some(cache) = &self.search_cache {
            cache.clear();
        }
        Ok(())
    }

    fn is_provider_enabled(&self, id: &str, provider: &dyn ContentProvider) -> bool {
        provider.is_enabled() && !self.disabled.read().contains(id)
    }

    fn enabled_providers(&self) -> Vec<Arc<dyn ContentProvider>> {
        self.providers
            .iter()
            .filter(|(id, p)| self.is_provider_enabled(id, p.as_ref()))
            .map(|(_, p)| Arc::clone(p))
            .collect()
    }

    /// Search every enabled provider concurrently
    ///
    /// Fails only when every provider fails; individual failures are logged
    /// and their results omitted.
    pub async fn search(
        &self,
        query: &ContentSearchQuery,
        ctx: &OperationContext,
    ) -> Result<Vec<ContentSearchResult>> {
        if query.is_empty() {
            return Err(ContentError::InvalidQuery(
                "at least one search criterion is required".to_string(),
            ));
        }
        let providers = self.enabled_providers();
        if providers.is_empty() {
            return Err(ContentError::NoProviders);
        }
        if let Some(cached) = self.search_cache.as_ref().and_then(|c| c.get(query)) {
            debug!(count = cached.len(), "search served from cache");
            return Ok(cached);
        }

        let results = ctx.guard(Self::fan_out(&providers, query, ctx)).await?;
        if let Some(cache) = &self.search_cache {
            cache.insert(query.clone(), results.clone());
        }
        Ok(results)
    }

    async fn fan_out(
        providers: &[Arc<dyn ContentProvider>],
        query: &ContentSearchQuery,
        ctx: &OperationContext,
    ) -> Result<Vec<ContentSearchResult>> {
        let mut pending: FuturesUnordered<_> = providers
            .iter()
            .map(|provider| async move { (provider.id().to_string(), provider.search(query, ctx).await) })
            .collect();

        let mut by_provider = BTreeMap::new();
        let mut failures = Vec::new();
        while let Some((id, outcome)) = pending.next().await {
            match outcome {
                Ok(results) => {
                    debug!(provider = %id, count = results.len(), "provider search succeeded");
                    by_provider.insert(id, results);
                }
                Err(e) => {
                    warn!(provider = %id, "provider search failed: {e}");
                    failures.push(format!("{id}: {e}"));
                }
            }
        }

        if by_provider.is_empty() {
            return Err(ContentError::AllProvidersFailed(failures));
        }

        let mut results: Vec<ContentSearchResult> = by_provider.into_values().flatten().collect();
        if let Some(take) = query.take {
            results.truncate(take);
        }
        info!(
            count = results.len(),
            failed_providers = failures.len(),
            "search finished"
        );
        Ok(results)
    }

    fn provider_for(&self, result: &ContentSearchResult) -> Result<Arc<dyn ContentProvider>> {
        let provider = self
            .providers
            .get(&result.provider_id)
            .or_else(|| {
                self.providers
                    .values()
                    .find(|p| !result.resolver_id.is_empty() && p.resolver_id() == result.resolver_id)
            })
            .ok_or_else(|| ContentError::ProviderNotFound(result.provider_id.clone()))?;
        if !self.is_provider_enabled(provider.id(), provider.as_ref()) {
            return Err(ContentError::ProviderNotFound(format!(
                "{} (disabled)",
                provider.id()
            )));
        }
        Ok(Arc::clone(provider))
    }

    /// Acquire the content a search result points at
    ///
    /// Returns the pool entry when the manifest is already registered. The
    /// whole operation runs under the context's timeout and cancellation.
    /// Stopping before registration leaves the store references and the pool
    /// as they were; once registration has begun it runs to completion even
    /// if the caller stops waiting.
    pub async fn acquire(
        &self,
        result: &ContentSearchResult,
        ctx: &OperationContext,
    ) -> Result<Arc<ContentManifest>> {
        let id = ManifestId::parse(&result.id)?;
        if let Some(existing) = self.existing_entry(&id, ctx).await? {
            return Ok(existing);
        }

        let lock = Arc::clone(
            self.acquisitions
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let outcome = {
            let guard = Arc::clone(&lock).lock_owned().await;
            match self.existing_entry(&id, ctx).await {
                Ok(Some(existing)) => Ok(existing),
                Ok(None) => {
                    ctx.guard(self.acquire_uncached(result, &id, ctx, guard))
                        .await
                }
                Err(e) => Err(e),
            }
        };
        drop(lock);
        self.acquisitions
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    async fn existing_entry(
        &self,
        id: &ManifestId,
        ctx: &OperationContext,
    ) -> Result<Option<Arc<ContentManifest>>> {
        let Some(existing) = self.pool.get(id) else {
            return Ok(None);
        };
        match self.policy {
            ExistingContentPolicy::TrustPool => {
                debug!(id = %id, "already acquired");
                Ok(Some(existing))
            }
            ExistingContentPolicy::VerifyStore => {
                let report = self.validator.validate_files(&existing, ctx).await;
                if report.is_valid() {
                    return Ok(Some(existing));
                }
                warn!(id = %id, "pool entry failed verification, acquiring again");
                self.remove(id).await?;
                Ok(None)
            }
        }
    }

    async fn acquire_uncached(
        &self,
        result: &ContentSearchResult,
        id: &ManifestId,
        ctx: &OperationContext,
        guard: OwnedMutexGuard<()>,
    ) -> Result<Arc<ContentManifest>> {
        let provider = self.provider_for(result)?;
        info!(id = %id, provider = provider.id(), "acquiring content");

        let manifest = provider.get_validated_content(result, ctx).await?;
        if &manifest.id != id {
            return Err(ContentError::Validation(vec![format!(
                "resolved manifest id {} does not match search result {id}",
                manifest.id
            )]));
        }

        let workdir = StagingDir::create(
            self.staging_dir
                .join(format!("{}-{}", id.slug(), uuid::Uuid::new_v4())),
        )
        .await?;
        let delivered = provider.prepare_content(&manifest, &workdir.path, ctx).await;
        workdir.remove().await;
        let delivered = delivered?;

        self.validator
            .validate_files(&delivered, ctx)
            .await
            .into_result()?;

        // Registration runs detached and keeps the per-id lock, so dropping
        // this future cannot split references from the pool entry.
        let store = Arc::clone(&self.store);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let registered = register(&store, &pool, delivered).await;
            drop(guard);
            registered
        })
        .await
        .map_err(|e| ContentError::Io(std::io::Error::other(e)))?
    }

    /// Required dependencies of `manifest` that are not in the pool
    pub fn missing_dependencies(&self, manifest: &ContentManifest) -> Vec<ContentDependency> {
        manifest
            .dependencies
            .iter()
            .filter(|d| !d.optional && !self.pool.is_acquired(&d.id))
            .cloned()
            .collect()
    }

    /// Re-check every file of an acquired manifest against the store
    pub async fn verify(&self, id: &ManifestId, ctx: &OperationContext) -> Result<ValidationReport> {
        let manifest = self
            .pool
            .get(id)
            .ok_or_else(|| ContentError::ManifestNotFound(id.to_string()))?;
        Ok(self.validator.validate_files(&manifest, ctx).await)
    }

    /// Unregister a manifest and release its store references
    ///
    /// Objects stay on disk until garbage collection finds them unowned.
    pub async fn remove(&self, id: &ManifestId) -> Result<Option<Arc<ContentManifest>>> {
        let removed = self.pool.remove(id).await?;
        let released = self.store.release_owner(&id.to_string()).await?;
        if removed.is_some() {
            info!(id = %id, released = released.len(), "content removed");
        }
        Ok(removed)
    }
}

/// Reference every delivered object for the manifest, then add it to the pool
///
/// Either both happen or neither does.
async fn register(
    store: &ContentStore,
    pool: &ManifestPool,
    delivered: ContentManifest,
) -> Result<Arc<ContentManifest>> {
    let id = delivered.id.clone();
    let owner = id.to_string();
    let hashes = delivered.cas_refs();
    let added = store.reference_many(&hashes, &owner).await?;

    match pool.add(delivered).await {
        Ok(outcome) => {
            let added_to_pool = outcome.was_added();
            let manifest = outcome.into_manifest();
            if !added_to_pool {
                // Keep only what the surviving entry uses.
                let kept: HashSet<_> = manifest.cas_refs().into_iter().collect();
                let extra: Vec<_> = added.into_iter().filter(|h| !kept.contains(h)).collect();
                if let Err(e) = store.release_many(&extra, &owner).await {
                    warn!(id = %id, "failed to release superseded references: {e}");
                }
            }
            info!(id = %id, added = added_to_pool, "content acquired");
            Ok(manifest)
        }
        Err(e) => {
            if let Err(release_err) = store.release_many(&added, &owner).await {
                warn!(id = %id, "failed to release references after pool error: {release_err}");
            }
            Err(e)
        }
    }
}

impl std::fmt::Debug for ContentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentOrchestrator")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("pool_entries", &self.pool.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
