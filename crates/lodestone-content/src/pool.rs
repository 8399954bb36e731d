//! Durable registry of acquired manifests
//!
//! One JSON record per manifest under the pool directory. A record is
//! written (temp-then-rename) before the manifest becomes visible in memory,
//! so anything `get` returns survives a restart.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{ContentManifest, ContentSearchQuery, ManifestId};

const RECORD_FORMAT_VERSION: u32 = 1;
const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct PoolRecord {
    version: u32,
    acquired_at: DateTime<Utc>,
    manifest: ContentManifest,
}

/// Result of [`ManifestPool::add`]
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// The manifest was registered by this call
    Added(Arc<ContentManifest>),
    /// A manifest with the same id was already registered; it is returned unchanged
    AlreadyPresent(Arc<ContentManifest>),
}

impl AddOutcome {
    /// The registered manifest, whichever call added it
    pub fn manifest(&self) -> &Arc<ContentManifest> {
        match self {
            Self::Added(m) | Self::AlreadyPresent(m) => m,
        }
    }

    /// Owned form of [`Self::manifest`]
    pub fn into_manifest(self) -> Arc<ContentManifest> {
        match self {
            Self::Added(m) | Self::AlreadyPresent(m) => m,
        }
    }

    /// True if this call registered the manifest
    pub const fn was_added(&self) -> bool {
        matches!(self, Self::Added(_))
    }
}

/// Registry of acquired manifests keyed by id
#[derive(Debug)]
pub struct ManifestPool {
    dir: PathBuf,
    entries: RwLock<HashMap<ManifestId, Arc<ContentManifest>>>,
    write_lock: Mutex<()>,
}

impl ManifestPool {
    /// Open the pool, loading every readable record
    ///
    /// Unreadable records are skipped with a warning rather than failing the
    /// whole pool.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match load_record(&path) {
                Ok(record) => {
                    entries.insert(record.manifest.id.clone(), Arc::new(record.manifest));
                }
                Err(e) => warn!("skipping unreadable pool record {}: {e}", path.display()),
            }
        }
        info!("manifest pool opened with {} entries", entries.len());

        Ok(Self {
            dir,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding one record per manifest
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Register a manifest; first writer wins
    pub async fn add(&self, manifest: ContentManifest) -> Result<AddOutcome> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.get(&manifest.id) {
            debug!(id = %manifest.id, "manifest already registered");
            return Ok(AddOutcome::AlreadyPresent(existing));
        }

        let record = PoolRecord {
            version: RECORD_FORMAT_VERSION,
            acquired_at: Utc::now(),
            manifest,
        };
        let path = self.record_path(&record.manifest.id);
        let bytes = serde_json::to_vec_pretty(&record)?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let manifest = Arc::new(record.manifest);
        self.entries
            .write()
            .insert(manifest.id.clone(), Arc::clone(&manifest));
        info!(id = %manifest.id, files = manifest.files.len(), "manifest registered");
        Ok(AddOutcome::Added(manifest))
    }

    /// Registered manifest with this id
    pub fn get(&self, id: &ManifestId) -> Option<Arc<ContentManifest>> {
        self.entries.read().get(id).cloned()
    }

    /// Whether a manifest with this id is registered
    pub fn is_acquired(&self, id: &ManifestId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// All manifests, sorted by id
    pub fn list(&self) -> Vec<Arc<ContentManifest>> {
        let mut manifests: Vec<_> = self.entries.read().values().cloned().collect();
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        manifests
    }

    /// Manifests matching a query's type, publisher and text criteria
    pub fn find(&self, query: &ContentSearchQuery) -> Vec<Arc<ContentManifest>> {
        self.list()
            .into_iter()
            .filter(|m| query.content_type.is_none_or(|t| t == m.content_type))
            .filter(|m| {
                query
                    .publisher
                    .as_deref()
                    .is_none_or(|p| m.publisher.name.eq_ignore_ascii_case(p) || m.id.publisher() == p)
            })
            .filter(|m| {
                query
                    .game_variant
                    .as_deref()
                    .is_none_or(|g| m.target_game.as_deref().is_none_or(|t| t == g))
            })
            .filter(|m| query.matches(&m.name, m.id.slug(), &m.tags))
            .collect()
    }

    /// Unregister a manifest and delete its record
    pub async fn remove(&self, id: &ManifestId) -> Result<Option<Arc<ContentManifest>>> {
        let _guard = self.write_lock.lock().await;
        if !self.is_acquired(id) {
            return Ok(None);
        }
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let removed = self.entries.write().remove(id);
        info!(id = %id, "manifest unregistered");
        Ok(removed)
    }

    /// Number of registered manifests
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn record_path(&self, id: &ManifestId) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }
}

fn load_record(path: &Path) -> Result<PoolRecord> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{ContentType, ManifestFile, PublisherInfo};
    use tempfile::tempdir;

    fn manifest(id: &str, name: &str) -> ContentManifest {
        ContentManifest::new(
            ManifestId::parse(id).expect("id"),
            name,
            "1.0",
            PublisherInfo::new("Community"),
        )
        .with_files(vec![ManifestFile::remote("a.map", "http://example/a.map", 1)])
    }

    #[tokio::test]
    async fn test_add_is_first_writer_wins() {
        let dir = tempdir().expect("tempdir");
        let pool = ManifestPool::open(dir.path()).expect("open");

        let first = pool
            .add(manifest("1.community.map.dunes", "Dunes"))
            .await
            .expect("add");
        assert!(first.was_added());

        let second = pool
            .add(manifest("1.community.map.dunes", "Dunes Remastered"))
            .await
            .expect("add again");
        assert!(!second.was_added());
        assert_eq!(second.manifest().name, "Dunes");
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_records_survive_reopen_and_corrupt_ones_are_skipped() {
        let dir = tempdir().expect("tempdir");
        {
            let pool = ManifestPool::open(dir.path()).expect("open");
            pool.add(manifest("1.community.map.dunes", "Dunes"))
                .await
                .expect("add");
            pool.add(manifest("1.community.mod.rain", "Rain"))
                .await
                .expect("add");
        }
        std::fs::write(dir.path().join("garbage.json"), b"{").expect("write");

        let pool = ManifestPool::open(dir.path()).expect("reopen");
        assert_eq!(pool.len(), 2);
        let ids: Vec<String> = pool.list().iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["1.community.map.dunes", "1.community.mod.rain"]);
    }

    #[tokio::test]
    async fn test_remove_and_find() {
        let dir = tempdir().expect("tempdir");
        let pool = ManifestPool::open(dir.path()).expect("open");
        pool.add(manifest("1.community.map.dunes", "Dunes"))
            .await
            .expect("add");
        pool.add(manifest("1.community.mod.rain", "Rain"))
            .await
            .expect("add");

        let maps = pool.find(&ContentSearchQuery::default().with_content_type(ContentType::Map));
        assert_eq!(maps.len(), 1);
        assert_eq!(pool.find(&ContentSearchQuery::term("rain")).len(), 1);

        let id = ManifestId::parse("1.community.map.dunes").expect("id");
        assert!(pool.remove(&id).await.expect("remove").is_some());
        assert!(!pool.is_acquired(&id));
        assert!(pool.remove(&id).await.expect("remove again").is_none());

        let pool = ManifestPool::open(dir.path()).expect("reopen");
        assert_eq!(pool.len(), 1);
    }
}
