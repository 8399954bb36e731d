//! Content store implementation
//!
//! Writes always land in `tmp/` first and are hashed on the way in. Only once
//! the digest is known (and matches the caller's expectation, if any) is the
//! file renamed into `objects/<shard>/<hash>`. Commits and garbage collection
//! deletes of the same object serialize on a striped lock keyed by the first
//! byte of the hash.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::hash::HASH_BUFFER_SIZE;
use crate::{
    CasConfig, CasError, ContentHash, HashProvider, OBJECTS_DIR, PARTIAL_EXTENSION, REFS_FILE,
    ReferenceTracker, Result, StreamHasher, TEMP_DIR,
};

/// Number of commit lock stripes (one per possible first byte).
const LOCK_STRIPES: usize = 256;

/// Result of committing an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Key of the object.
    pub hash: ContentHash,
    /// Size in bytes.
    pub size: u64,
    /// Final object path.
    pub path: PathBuf,
    /// False when an identical object was already present.
    pub newly_stored: bool,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Objects on disk.
    pub object_count: usize,
    /// Bytes used by objects.
    pub total_bytes: u64,
    /// Objects with at least one owner.
    pub referenced_objects: usize,
}

/// Content-addressable object store.
pub struct ContentStore {
    config: CasConfig,
    objects_dir: PathBuf,
    temp_dir: PathBuf,
    refs: ReferenceTracker,
    hasher: HashProvider,
    io_permits: Arc<Semaphore>,
    stripes: Vec<Mutex<()>>,
}

impl ContentStore {
    /// Open (creating if needed) a store.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the directory layout
    /// cannot be created, or the reference sidecar is unreadable.
    pub fn open(config: CasConfig) -> Result<Self> {
        config.validate()?;

        let objects_dir = config.root.join(OBJECTS_DIR);
        let temp_dir = config.root.join(TEMP_DIR);
        for dir in [&config.root, &objects_dir, &temp_dir] {
            if !dir.exists() {
                info!("creating store directory: {}", dir.display());
                std::fs::create_dir_all(dir)?;
            } else if !dir.is_dir() {
                return Err(CasError::Config(format!(
                    "store path exists but is not a directory: {}",
                    dir.display()
                )));
            }
        }

        let refs = ReferenceTracker::load(config.root.join(REFS_FILE))?;
        let io_permits = Arc::new(Semaphore::new(config.max_concurrent_operations));
        let stripes = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect();

        Ok(Self {
            config,
            objects_dir,
            temp_dir,
            refs,
            hasher: HashProvider::new(),
            io_permits,
            stripes,
        })
    }

    /// Store configuration.
    pub const fn config(&self) -> &CasConfig {
        &self.config
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Hash provider used for keys.
    pub const fn hash_provider(&self) -> &HashProvider {
        &self.hasher
    }

    /// Reference tracker.
    pub const fn references(&self) -> &ReferenceTracker {
        &self.refs
    }

    pub(crate) fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub(crate) fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub(crate) fn stripe(&self, hash: &ContentHash) -> &Mutex<()> {
        &self.stripes[hash.stripe() % LOCK_STRIPES]
    }

    /// Where an object lives (or would live).
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.objects_dir.join(hash.shard()).join(hash.as_str())
    }

    /// Begin a streaming write.
    ///
    /// Waits for a concurrency permit. The returned writer discards its temp
    /// file when dropped without [`CasWriter::commit`].
    pub async fn writer(&self) -> Result<CasWriter<'_>> {
        let permit = self
            .io_permits
            .acquire()
            .await
            .map_err(|e| CasError::Config(format!("store is shut down: {e}")))?;
        let temp_path = self
            .temp_dir
            .join(format!("{}.{PARTIAL_EXTENSION}", uuid::Uuid::new_v4()));
        let file = File::create(&temp_path).await?;

        Ok(CasWriter {
            store: self,
            file: Some(file),
            temp_path,
            hasher: self.hasher.hasher(),
            finished: false,
            _permit: permit,
        })
    }

    /// Store everything a reader yields.
    pub async fn store_reader<R>(
        &self,
        mut reader: R,
        expected: Option<&ContentHash>,
    ) -> Result<StoredObject>
    where
        R: AsyncRead + Unpin,
    {
        let mut writer = self.writer().await?;
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }
        writer.commit(expected).await
    }

    /// Store a file from disk. The source is left untouched.
    pub async fn store_file(
        &self,
        source: &Path,
        expected: Option<&ContentHash>,
    ) -> Result<StoredObject> {
        let file = File::open(source).await?;
        let stored = self.store_reader(file, expected).await?;
        debug!(
            hash = stored.hash.short(),
            source = %source.display(),
            "stored file"
        );
        Ok(stored)
    }

    /// Store an in-memory buffer.
    pub async fn store_bytes(
        &self,
        data: &[u8],
        expected: Option<&ContentHash>,
    ) -> Result<StoredObject> {
        let mut writer = self.writer().await?;
        writer.write(data).await?;
        writer.commit(expected).await
    }

    /// Whether an object is present.
    pub async fn contains(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.object_path(hash))
            .await
            .unwrap_or(false)
    }

    /// Path of a present object.
    pub async fn get_path(&self, hash: &ContentHash) -> Result<PathBuf> {
        let path = self.object_path(hash);
        if fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(CasError::NotFound(hash.clone()))
        }
    }

    /// Open a present object for reading.
    pub async fn open_stream(&self, hash: &ContentHash) -> Result<File> {
        match File::open(self.object_path(hash)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CasError::NotFound(hash.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a whole object into memory.
    pub async fn read(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let mut file = self.open_stream(hash).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// Size of a present object.
    pub async fn object_size(&self, hash: &ContentHash) -> Result<u64> {
        match fs::metadata(self.object_path(hash)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CasError::NotFound(hash.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-hash an object and compare against its key.
    ///
    /// # Errors
    ///
    /// `NotFound` if missing, `Corruption` if the bytes no longer match.
    pub async fn verify(&self, hash: &ContentHash) -> Result<()> {
        let _permit = self
            .io_permits
            .acquire()
            .await
            .map_err(|e| CasError::Config(format!("store is shut down: {e}")))?;
        let file = self.open_stream(hash).await?;
        let (actual, _) = self.hasher.hash_reader(file).await?;
        if &actual == hash {
            Ok(())
        } else {
            warn!(hash = hash.short(), actual = actual.short(), "object is corrupt");
            Err(CasError::Corruption {
                hash: hash.clone(),
                actual,
            })
        }
    }

    /// Add `owner` as a user of `hash`. Returns true if the owner is new.
    ///
    /// # Errors
    ///
    /// `NotFound` if the object is not present.
    pub async fn reference(&self, hash: &ContentHash, owner: &str) -> Result<bool> {
        let added = self.reference_many(std::slice::from_ref(hash), owner).await?;
        Ok(!added.is_empty())
    }

    /// Add `owner` as a user of every hash, persisting once.
    ///
    /// Each hash is checked for presence under its commit stripe, the same
    /// lock garbage collection holds while deleting, so a collected object can
    /// never end up referenced. Either every object is referenced or, on
    /// error, none of the newly added owners remain. Returns the hashes the
    /// owner did not hold before.
    pub async fn reference_many(
        &self,
        hashes: &[ContentHash],
        owner: &str,
    ) -> Result<Vec<ContentHash>> {
        let mut added = Vec::new();
        for hash in hashes {
            let guard = self.stripe(hash).lock().await;
            let present = match fs::try_exists(self.object_path(hash)).await {
                Ok(present) => present,
                Err(e) => {
                    drop(guard);
                    self.refs.release_many(&added, owner);
                    return Err(e.into());
                }
            };
            if !present {
                drop(guard);
                self.refs.release_many(&added, owner);
                return Err(CasError::NotFound(hash.clone()));
            }
            if self.refs.reference(hash, owner) {
                added.push(hash.clone());
            }
        }

        if let Err(e) = self.refs.flush().await {
            self.refs.release_many(&added, owner);
            return Err(e);
        }
        Ok(added)
    }

    /// Refresh an object's grace period if it is present.
    ///
    /// Returns false when the object is absent. A true result guarantees the
    /// object survives any collection pass for at least one grace period.
    pub async fn touch(&self, hash: &ContentHash) -> Result<bool> {
        let _guard = self.stripe(hash).lock().await;
        if !fs::try_exists(self.object_path(hash)).await? {
            return Ok(false);
        }
        self.refs.touch(hash);
        Ok(true)
    }

    /// Remove `owner` as a user of `hash`.
    pub async fn release(&self, hash: &ContentHash, owner: &str) -> Result<bool> {
        let removed = self.refs.release(hash, owner);
        self.refs.flush().await?;
        Ok(removed)
    }

    /// Remove `owner` from each of `hashes`, persisting once.
    pub async fn release_many(
        &self,
        hashes: &[ContentHash],
        owner: &str,
    ) -> Result<Vec<ContentHash>> {
        let released = self.refs.release_many(hashes, owner);
        self.refs.flush().await?;
        Ok(released)
    }

    /// Remove `owner` from every object it uses.
    pub async fn release_owner(&self, owner: &str) -> Result<Vec<ContentHash>> {
        let released = self.refs.release_owner(owner);
        self.refs.flush().await?;
        Ok(released)
    }

    /// Current reference count.
    pub fn reference_count(&self, hash: &ContentHash) -> usize {
        self.refs.count(hash)
    }

    /// Enumerate every committed object.
    pub fn list_objects(&self) -> Result<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        for shard in std::fs::read_dir(&self.objects_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for object in std::fs::read_dir(shard.path())? {
                let object = object?;
                let name = object.file_name();
                match name.to_str().map(ContentHash::parse) {
                    Some(Ok(hash)) => hashes.push(hash),
                    _ => debug!("ignoring stray entry {}", object.path().display()),
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Object count and disk usage.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for hash in self.list_objects()? {
            stats.object_count += 1;
            stats.total_bytes += std::fs::metadata(self.object_path(&hash))?.len();
            if self.refs.count(&hash) > 0 {
                stats.referenced_objects += 1;
            }
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.config.root)
            .finish_non_exhaustive()
    }
}

/// Streaming writer into the store.
///
/// Bytes are hashed as they are written. Nothing is visible under
/// `objects/` until [`commit`](Self::commit) succeeds.
pub struct CasWriter<'a> {
    store: &'a ContentStore,
    file: Option<File>,
    temp_path: PathBuf,
    hasher: StreamHasher,
    finished: bool,
    _permit: SemaphorePermit<'a>,
}

impl CasWriter<'_> {
    /// Append a chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CasError::Config("writer already finished".to_string()))?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        Ok(())
    }

    /// Bytes written so far.
    pub const fn bytes_written(&self) -> u64 {
        self.hasher.bytes_hashed()
    }

    /// Finish the write and move the object into place.
    ///
    /// # Errors
    ///
    /// `HashMismatch` if `expected` is given and differs from the digest of
    /// the written bytes. The temp file is removed and nothing is committed.
    pub async fn commit(mut self, expected: Option<&ContentHash>) -> Result<StoredObject> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let size = self.hasher.bytes_hashed();
        let hash = std::mem::take(&mut self.hasher).finalize();

        if let Some(expected) = expected
            && expected != &hash
        {
            self.discard().await;
            warn!(
                expected = expected.short(),
                actual = hash.short(),
                "rejecting object with unexpected hash"
            );
            return Err(CasError::HashMismatch {
                expected: expected.clone(),
                actual: hash,
            });
        }

        let target = self.store.object_path(&hash);
        let _guard = self.store.stripe(&hash).lock().await;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let newly_stored = if fs::try_exists(&target).await? {
            // Another writer committed the same bytes first.
            self.discard().await;
            false
        } else if let Err(e) = fs::rename(&self.temp_path, &target).await {
            self.discard().await;
            return Err(e.into());
        } else {
            self.finished = true;
            true
        };

        // In memory only; persisted by the next reference flush.
        self.store.refs.touch(&hash);
        debug!(hash = hash.short(), size, newly_stored, "object committed");

        Ok(StoredObject {
            hash,
            size,
            path: target,
            newly_stored,
        })
    }

    /// Throw away everything written so far.
    pub async fn abort(mut self) {
        self.file.take();
        self.discard().await;
    }

    async fn discard(&mut self) {
        self.file.take();
        if !self.finished {
            if let Err(e) = fs::remove_file(&self.temp_path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("failed to remove temp file {}: {e}", self.temp_path.display());
            }
            self.finished = true;
        }
    }
}

impl Drop for CasWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> ContentStore {
        ContentStore::open(CasConfig::new(dir)).expect("open store")
    }

    fn temp_entries(store: &ContentStore) -> usize {
        std::fs::read_dir(store.temp_dir()).expect("read tmp").count()
    }

    #[tokio::test]
    async fn test_layout_is_sharded() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let stored = store.store_bytes(b"payload", None).await.expect("store");

        let expected = dir
            .path()
            .join(OBJECTS_DIR)
            .join(&stored.hash.as_str()[..2])
            .join(stored.hash.as_str());
        assert_eq!(stored.path, expected);
        assert!(expected.exists());
        assert_eq!(stored.size, 7);
    }

    #[tokio::test]
    async fn test_store_twice_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());

        let first = store.store_bytes(b"same bytes", None).await.expect("first");
        let second = store.store_bytes(b"same bytes", None).await.expect("second");

        assert_eq!(first.hash, second.hash);
        assert!(first.newly_stored);
        assert!(!second.newly_stored);
        assert_eq!(store.list_objects().expect("list"), vec![first.hash]);
        assert_eq!(temp_entries(&store), 0);
    }

    #[tokio::test]
    async fn test_expected_hash_mismatch_commits_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let wrong = store.hash_provider().hash_bytes(b"declared");

        let result = store.store_bytes(b"actual", Some(&wrong)).await;
        assert!(matches!(result, Err(CasError::HashMismatch { .. })));

        let actual = store.hash_provider().hash_bytes(b"actual");
        assert!(!store.contains(&wrong).await);
        assert!(!store.contains(&actual).await);
        assert_eq!(temp_entries(&store), 0);
    }

    #[tokio::test]
    async fn test_store_file_and_read_back() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir.path().join("cas"));
        let source = dir.path().join("map.bin");
        std::fs::write(&source, b"terrain").expect("write");

        let expected = store.hash_provider().hash_bytes(b"terrain");
        let stored = store
            .store_file(&source, Some(&expected))
            .await
            .expect("store file");
        assert_eq!(stored.hash, expected);
        assert!(source.exists());
        assert_eq!(store.read(&expected).await.expect("read"), b"terrain");
        assert_eq!(store.object_size(&expected).await.expect("size"), 7);
        assert_eq!(store.get_path(&expected).await.expect("path"), stored.path);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let hash = store.hash_provider().hash_bytes(b"never stored");

        assert!(matches!(store.get_path(&hash).await, Err(CasError::NotFound(_))));
        assert!(matches!(store.open_stream(&hash).await, Err(CasError::NotFound(_))));
        assert!(matches!(store.verify(&hash).await, Err(CasError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let stored = store.store_bytes(b"pristine", None).await.expect("store");
        store.verify(&stored.hash).await.expect("intact");

        std::fs::write(&stored.path, b"tampered").expect("tamper");
        assert!(matches!(
            store.verify(&stored.hash).await,
            Err(CasError::Corruption { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_writer_discards_temp_file() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        {
            let mut writer = store.writer().await.expect("writer");
            writer.write(b"partial").await.expect("write");
            assert_eq!(writer.bytes_written(), 7);
            assert_eq!(temp_entries(&store), 1);
        }
        assert_eq!(temp_entries(&store), 0);
        assert!(store.list_objects().expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_abort_discards_temp_file() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let mut writer = store.writer().await.expect("writer");
        writer.write(b"partial").await.expect("write");
        writer.abort().await;
        assert_eq!(temp_entries(&store), 0);
    }

    #[tokio::test]
    async fn test_concurrent_stores_of_same_bytes() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(open_store(dir.path()));
        let data = vec![7u8; 200_000];

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let data = data.clone();
            handles.push(tokio::spawn(async move {
                store.store_bytes(&data, None).await.expect("store")
            }));
        }

        let mut newly = 0;
        let mut hashes = Vec::new();
        for handle in handles {
            let stored = handle.await.expect("join");
            if stored.newly_stored {
                newly += 1;
            }
            hashes.push(stored.hash);
        }
        hashes.dedup();
        assert_eq!(hashes.len(), 1);
        assert_eq!(newly, 1);
        assert_eq!(store.list_objects().expect("list").len(), 1);
        assert_eq!(store.read(&hashes[0]).await.expect("read"), data);
        assert_eq!(temp_entries(&store), 0);
    }

    #[tokio::test]
    async fn test_stats_counts_referenced_objects() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let a = store.store_bytes(b"aaaa", None).await.expect("a");
        store.store_bytes(b"bb", None).await.expect("b");
        store.reference(&a.hash, "owner").await.expect("ref");

        let stats = store.stats().expect("stats");
        assert_eq!(
            stats,
            StoreStats {
                object_count: 2,
                total_bytes: 6,
                referenced_objects: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_reference_requires_present_object() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let missing = store.hash_provider().hash_bytes(b"never stored");

        assert!(matches!(
            store.reference(&missing, "owner").await,
            Err(CasError::NotFound(_))
        ));
        assert_eq!(store.reference_count(&missing), 0);
        assert!(!store.touch(&missing).await.expect("touch"));
    }

    #[tokio::test]
    async fn test_reference_many_is_all_or_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let a = store.store_bytes(b"a", None).await.expect("a").hash;
        let b = store.store_bytes(b"b", None).await.expect("b").hash;
        let missing = store.hash_provider().hash_bytes(b"missing");

        let result = store
            .reference_many(&[a.clone(), b.clone(), missing], "manifest")
            .await;
        assert!(matches!(result, Err(CasError::NotFound(_))));
        assert_eq!(store.reference_count(&a), 0);
        assert_eq!(store.reference_count(&b), 0);

        let added = store
            .reference_many(&[a.clone(), b.clone()], "manifest")
            .await
            .expect("reference");
        assert_eq!(added, vec![a.clone(), b.clone()]);
        assert!(!store.references().is_dirty());

        let reopened = open_store(dir.path());
        assert_eq!(reopened.reference_count(&a), 1);
        assert_eq!(reopened.reference_count(&b), 1);
    }

    #[test]
    fn test_open_rejects_file_root() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").expect("write");
        assert!(ContentStore::open(CasConfig::new(&file)).is_err());
    }
}
