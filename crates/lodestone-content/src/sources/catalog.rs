//! Web catalog source
//!
//! `GET {base}/api/search?q=&type=&tag=&publisher=&take=` returns a JSON
//! array of entries. Resolution needs no further network access: everything
//! the manifest needs travels in the result metadata.

use async_trait::async_trait;
use lodestone_cas::ContentHash;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{ContentError, Result};
use crate::http::{HttpClient, join_url};
use crate::model::{
    ContentManifest, ContentSearchQuery, ContentSearchResult, ContentType, MANIFEST_SCHEMA_VERSION,
    ManifestFile, ManifestId, PublisherInfo, metadata_keys as keys,
};
use crate::pipeline::{ContentDiscoverer, ContentResolver};
use crate::progress::OperationContext;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    version: String,
    publisher: String,
    #[serde(default)]
    content_type: Option<String>,
    download_url: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    website: Option<String>,
}

/// Searches a web catalog
#[derive(Debug, Clone)]
pub struct CatalogDiscoverer {
    id: String,
    provider_id: String,
    resolver_id: String,
    base_url: Url,
    http: HttpClient,
    retry: RetryPolicy,
}

impl CatalogDiscoverer {
    /// Discoverer querying the catalog at `base_url`
    pub fn new(provider_id: &str, base_url: Url, http: HttpClient, retry: RetryPolicy) -> Self {
        Self {
            id: format!("{provider_id}.discoverer"),
            provider_id: provider_id.to_string(),
            resolver_id: CatalogResolver::id_for(provider_id),
            base_url,
            http,
            retry,
        }
    }

    fn search_url(&self, query: &ContentSearchQuery) -> Result<Url> {
        let mut url = join_url(&self.base_url, "api/search")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(term) = query.term.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                pairs.append_pair("q", term);
            }
            if let Some(content_type) = query.content_type {
                pairs.append_pair("type", content_type.tag());
            }
            for tag in &query.tags {
                pairs.append_pair("tag", tag);
            }
            if let Some(publisher) = &query.publisher {
                pairs.append_pair("publisher", publisher);
            }
            if let Some(take) = query.take {
                pairs.append_pair("take", &take.to_string());
            }
        }
        Ok(url)
    }

    fn to_result(&self, entry: CatalogEntry, query: &ContentSearchQuery) -> Result<ContentSearchResult> {
        let content_type = entry
            .content_type
            .as_deref()
            .and_then(ContentType::from_tag)
            .or(query.content_type)
            .unwrap_or(ContentType::Other);
        let id = ManifestId::new(
            MANIFEST_SCHEMA_VERSION,
            &ManifestId::slugify(&entry.publisher),
            content_type,
            &ManifestId::slugify(&entry.id),
        )?;
        let file_name = entry
            .file_name
            .filter(|f| !f.trim().is_empty())
            .or_else(|| file_name_from_url(&entry.download_url))
            .unwrap_or_else(|| id.slug().to_string());

        let mut result = ContentSearchResult::unresolved(
            id.to_string(),
            entry.name,
            &self.provider_id,
            &self.resolver_id,
        )
        .with_metadata(keys::DOWNLOAD_URL, entry.download_url)
        .with_metadata(keys::VERSION, entry.version.clone())
        .with_metadata(keys::PUBLISHER, entry.publisher.clone())
        .with_metadata(keys::FILE_NAME, file_name)
        .with_metadata(keys::CONTENT_TYPE, content_type.tag());
        if let Some(size) = entry.file_size {
            result = result.with_metadata(keys::FILE_SIZE, size.to_string());
        }
        if let Some(sha) = entry.sha256 {
            result = result.with_metadata(keys::SHA256, sha);
        }
        if let Some(website) = entry.website {
            result = result.with_metadata(keys::WEBSITE, website);
        }
        result.description = entry.description;
        result.version = entry.version;
        result.author = entry.publisher;
        result.tags = entry.tags;
        Ok(result)
    }
}

fn file_name_from_url(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ContentDiscoverer for CatalogDiscoverer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn discover(
        &self,
        query: &ContentSearchQuery,
        ctx: &OperationContext,
    ) -> Result<Vec<ContentSearchResult>> {
        let url = self.search_url(query)?;
        let entries: Vec<CatalogEntry> = self
            .retry
            .execute_until(&ctx.cancel, || self.http.get_json(&url))
            .await?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry_id = entry.id.clone();
            match self.to_result(entry, query) {
                Ok(result) => results.push(result),
                Err(e) => debug!(provider = %self.provider_id, "skipping catalog entry {entry_id}: {e}"),
            }
        }
        Ok(results)
    }
}

/// Builds manifests from catalog result metadata
#[derive(Debug, Clone)]
pub struct CatalogResolver {
    id: String,
    provider_id: String,
}

impl CatalogResolver {
    /// Resolver for results from provider `provider_id`
    pub fn new(provider_id: &str) -> Self {
        Self {
            id: Self::id_for(provider_id),
            provider_id: provider_id.to_string(),
        }
    }

    fn id_for(provider_id: &str) -> String {
        format!("{provider_id}.resolver")
    }
}

#[async_trait]
impl ContentResolver for CatalogResolver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn resolve(
        &self,
        result: &ContentSearchResult,
        _ctx: &OperationContext,
    ) -> Result<ContentManifest> {
        let download_url = result.require_metadata(keys::DOWNLOAD_URL)?;
        let version = result.require_metadata(keys::VERSION)?;
        let publisher = result.require_metadata(keys::PUBLISHER)?;
        let file_name = result.require_metadata(keys::FILE_NAME)?;

        let id = ManifestId::parse(&result.id)?;
        let size = match result.metadata(keys::FILE_SIZE) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| ContentError::Parse(format!("invalid fileSize '{raw}': {e}")))?,
            None => 0,
        };
        let mut file = ManifestFile::remote(file_name, download_url, size);
        if let Some(raw) = result.metadata(keys::SHA256) {
            file = file.with_hash(ContentHash::parse(raw)?);
        }

        let mut publisher = PublisherInfo::new(publisher);
        if let Some(website) = result.metadata(keys::WEBSITE) {
            publisher = publisher.with_website(website);
        }

        let mut manifest = ContentManifest::new(id, &result.name, version, publisher)
            .with_files(vec![file])
            .with_metadata("source", &self.provider_id);
        if !result.description.is_empty() {
            manifest = manifest.with_metadata("description", &result.description);
        }
        manifest.tags.clone_from(&result.tags);
        Ok(manifest)
    }
}
