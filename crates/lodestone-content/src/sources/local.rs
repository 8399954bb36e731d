//! Local import source
//!
//! Every directory directly under the import root is one piece of content.
//! Resolution walks the directory, hashing each file so the manifest carries
//! declared hashes just like a remote source would.

use async_trait::async_trait;
use lodestone_cas::HashProvider;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ContentError, Result};
use crate::model::{
    ContentManifest, ContentSearchQuery, ContentSearchResult, ContentType, MANIFEST_SCHEMA_VERSION,
    ManifestFile, ManifestId, PublisherInfo, metadata_keys as keys,
};
use crate::pipeline::{ContentDiscoverer, ContentResolver};
use crate::progress::{OperationContext, ProgressEvent};

/// Publisher recorded for locally imported content
pub const LOCAL_PUBLISHER: &str = "local";

/// Lists content directories under an import root
#[derive(Debug, Clone)]
pub struct LocalDiscoverer {
    id: String,
    provider_id: String,
    resolver_id: String,
    root: PathBuf,
}

impl LocalDiscoverer {
    /// Discoverer listing content folders under `root`
    pub fn new(provider_id: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            id: format!("{provider_id}.discoverer"),
            provider_id: provider_id.to_string(),
            resolver_id: LocalResolver::id_for(provider_id),
            root: root.into(),
        }
    }
}

#[async_trait]
impl ContentDiscoverer for LocalDiscoverer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn discover(
        &self,
        query: &ContentSearchQuery,
        _ctx: &OperationContext,
    ) -> Result<Vec<ContentSearchResult>> {
        if query
            .publisher
            .as_deref()
            .is_some_and(|p| !p.eq_ignore_ascii_case(LOCAL_PUBLISHER))
        {
            return Ok(Vec::new());
        }
        let content_type = query.content_type.unwrap_or(ContentType::Mod);

        let mut dir = tokio::fs::read_dir(&self.root).await?;
        let mut results = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !query.matches(&name, "", &[]) {
                continue;
            }
            let id = ManifestId::new(
                MANIFEST_SCHEMA_VERSION,
                LOCAL_PUBLISHER,
                content_type,
                &ManifestId::slugify(&name),
            )?;
            let result = ContentSearchResult::unresolved(
                id.to_string(),
                name,
                &self.provider_id,
                &self.resolver_id,
            )
            .with_metadata(keys::SOURCE_PATH, entry.path().to_string_lossy())
            .with_metadata(keys::CONTENT_TYPE, content_type.tag());
            results.push(result);
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(results)
    }
}

/// Builds a manifest by walking and hashing a local directory
#[derive(Debug, Clone)]
pub struct LocalResolver {
    id: String,
    provider_id: String,
    hasher: HashProvider,
}

impl LocalResolver {
    /// Resolver for results from provider `provider_id`
    pub fn new(provider_id: &str) -> Self {
        Self {
            id: Self::id_for(provider_id),
            provider_id: provider_id.to_string(),
            hasher: HashProvider::new(),
        }
    }

    fn id_for(provider_id: &str) -> String {
        format!("{provider_id}.resolver")
    }
}

/// Regular files under `root` as (relative path, absolute path), sorted
fn enumerate_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            ContentError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other(format!("failed to walk {}", root.display()))
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ContentError::Parse(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((relative, entry.path().to_path_buf()));
    }
    Ok(files)
}

#[async_trait]
impl ContentResolver for LocalResolver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn resolve(
        &self,
        result: &ContentSearchResult,
        ctx: &OperationContext,
    ) -> Result<ContentManifest> {
        let root = PathBuf::from(result.require_metadata(keys::SOURCE_PATH)?);
        let id = ManifestId::parse(&result.id)?;

        let walk_root = root.clone();
        let entries = tokio::task::spawn_blocking(move || enumerate_files(&walk_root))
            .await
            .map_err(|e| ContentError::Io(std::io::Error::other(e)))??;
        if entries.is_empty() {
            return Err(ContentError::Validation(vec![format!(
                "{} contains no files",
                root.display()
            )]));
        }

        let total = entries.len();
        let mut files = Vec::with_capacity(total);
        for (index, (relative, absolute)) in entries.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let (hash, size) = self.hasher.hash_file(&absolute).await?;
            ctx.progress.emit(ProgressEvent::new(
                "resolve",
                Some(relative.clone()),
                0,
                None,
                index + 1,
                total,
            ));
            files.push(ManifestFile::local(relative, absolute, size).with_hash(hash));
        }
        debug!(id = %id, files = files.len(), "resolved local content");

        let version = result
            .metadata(keys::VERSION)
            .unwrap_or(LOCAL_PUBLISHER)
            .to_string();
        Ok(ContentManifest::new(id, &result.name, version, PublisherInfo::new(LOCAL_PUBLISHER))
            .with_files(files)
            .with_metadata("source", &self.provider_id)
            .with_metadata(keys::SOURCE_PATH, root.to_string_lossy()))
    }
}
