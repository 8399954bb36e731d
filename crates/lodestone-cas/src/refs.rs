//! Reference tracking for stored objects.
//!
//! Each object keeps a set of owner ids (manifest ids, workspace ids). The
//! logical reference count is the size of that set, so referencing twice from
//! the same owner is a no-op.
//!
//! Mutations only touch the in-memory table and bump a generation counter.
//! [`ReferenceTracker::flush`] writes the JSON sidecar (temp-then-rename) on
//! the blocking pool, so a batch of changes costs one write and no tokio
//! worker ever blocks on disk IO.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{CasError, ContentHash, Result};

/// Sidecar format version.
const REFS_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefEntry {
    owners: BTreeSet<String>,
    last_referenced: DateTime<Utc>,
}

impl RefEntry {
    fn new() -> Self {
        Self {
            owners: BTreeSet::new(),
            last_referenced: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RefFile {
    version: u32,
    entries: BTreeMap<String, RefEntry>,
}

#[derive(Debug, Default)]
struct TableState {
    entries: BTreeMap<ContentHash, RefEntry>,
    /// Bumped on every mutation
    generation: u64,
    /// Generation last written to the sidecar
    persisted: u64,
}

impl TableState {
    const fn mark_dirty(&mut self) {
        self.generation += 1;
    }
}

/// Persistent owner-set reference counts keyed by content hash.
#[derive(Debug)]
pub struct ReferenceTracker {
    path: PathBuf,
    state: Mutex<TableState>,
    // Serializes sidecar writes so an older snapshot never lands last.
    flush_lock: tokio::sync::Mutex<()>,
}

impl ReferenceTracker {
    /// Load the tracker from `path`, starting empty if the file does not exist.
    ///
    /// A sidecar that exists but cannot be parsed is an error: starting empty
    /// would let garbage collection delete referenced objects.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                let file: RefFile = serde_json::from_slice(&bytes)?;
                let mut entries = BTreeMap::new();
                for (key, entry) in file.entries {
                    match ContentHash::parse(&key) {
                        Ok(hash) => {
                            entries.insert(hash, entry);
                        }
                        Err(e) => warn!("skipping reference entry {key}: {e}"),
                    }
                }
                debug!(
                    "loaded {} reference entries from {}",
                    entries.len(),
                    path.display()
                );
                entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: Mutex::new(TableState {
                entries,
                ..TableState::default()
            }),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Sidecar location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add `owner` to the object's owner set. Returns true if it was not already present.
    pub fn reference(&self, hash: &ContentHash, owner: &str) -> bool {
        let mut state = self.state.lock();
        let entry = state.entries.entry(hash.clone()).or_insert_with(RefEntry::new);
        let added = entry.owners.insert(owner.to_string());
        entry.last_referenced = Utc::now();
        state.mark_dirty();
        if added {
            debug!(hash = hash.short(), owner, "reference added");
        }
        added
    }

    /// Remove `owner` from the object's owner set. Returns true if it was present.
    ///
    /// The last-referenced timestamp moves to now so the grace period starts
    /// when the final owner lets go.
    pub fn release(&self, hash: &ContentHash, owner: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(hash) else {
            return false;
        };
        let removed = entry.owners.remove(owner);
        if removed {
            entry.last_referenced = Utc::now();
            state.mark_dirty();
            debug!(hash = hash.short(), owner, "reference released");
        }
        removed
    }

    /// Release `owner` from each of `hashes`. Returns the hashes it actually held.
    pub fn release_many<'a>(
        &self,
        hashes: impl IntoIterator<Item = &'a ContentHash>,
        owner: &str,
    ) -> Vec<ContentHash> {
        hashes
            .into_iter()
            .filter(|hash| self.release(hash, owner))
            .cloned()
            .collect()
    }

    /// Release every object held by `owner`. Returns the affected hashes.
    pub fn release_owner(&self, owner: &str) -> Vec<ContentHash> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut released = Vec::new();
        for (hash, entry) in &mut state.entries {
            if entry.owners.remove(owner) {
                entry.last_referenced = now;
                released.push(hash.clone());
            }
        }
        if !released.is_empty() {
            state.mark_dirty();
        }
        released
    }

    /// Refresh the last-referenced timestamp without changing owners.
    pub fn touch(&self, hash: &ContentHash) {
        let mut state = self.state.lock();
        state
            .entries
            .entry(hash.clone())
            .or_insert_with(RefEntry::new)
            .last_referenced = Utc::now();
        state.mark_dirty();
    }

    /// Number of owners.
    pub fn count(&self, hash: &ContentHash) -> usize {
        self.state.lock().entries.get(hash).map_or(0, |e| e.owners.len())
    }

    /// Owners of an object, sorted.
    pub fn owners(&self, hash: &ContentHash) -> Vec<String> {
        self.state
            .lock()
            .entries
            .get(hash)
            .map(|e| e.owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// When the object was last referenced, released or stored.
    pub fn last_referenced(&self, hash: &ContentHash) -> Option<DateTime<Utc>> {
        self.state.lock().entries.get(hash).map(|e| e.last_referenced)
    }

    /// Hashes with at least one owner.
    pub fn referenced_hashes(&self) -> Vec<ContentHash> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.owners.is_empty())
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Whether there are changes the sidecar does not have yet.
    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.generation != state.persisted
    }

    /// Drop the entry for a deleted object if it still has no owners.
    pub(crate) fn forget(&self, hash: &ContentHash) {
        let mut state = self.state.lock();
        if state.entries.get(hash).is_some_and(|e| e.owners.is_empty()) {
            state.entries.remove(hash);
            state.mark_dirty();
        }
    }

    /// Write pending changes to the sidecar.
    ///
    /// The snapshot is taken after the flush lock is held, so whichever flush
    /// writes last carries the newest table.
    pub async fn flush(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock().await;
        let (bytes, generation) = {
            let state = self.state.lock();
            if state.generation == state.persisted {
                return Ok(());
            }
            let file = RefFile {
                version: REFS_FORMAT_VERSION,
                entries: state
                    .entries
                    .iter()
                    .map(|(h, e)| (h.to_string(), e.clone()))
                    .collect(),
            };
            (serde_json::to_vec_pretty(&file)?, state.generation)
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_sidecar(&path, &bytes))
            .await
            .map_err(|e| CasError::Io(std::io::Error::other(e)))??;

        let mut state = self.state.lock();
        state.persisted = state.persisted.max(generation);
        Ok(())
    }
}

fn write_sidecar(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::HashProvider;
    use tempfile::tempdir;

    fn hash(data: &[u8]) -> ContentHash {
        HashProvider::new().hash_bytes(data)
    }

    #[test]
    fn test_reference_is_idempotent_per_owner() {
        let dir = tempdir().expect("tempdir");
        let tracker = ReferenceTracker::load(dir.path().join("refs.json")).expect("load");
        let h = hash(b"a");

        assert!(tracker.reference(&h, "owner-1"));
        assert!(!tracker.reference(&h, "owner-1"));
        assert!(tracker.reference(&h, "owner-2"));
        assert_eq!(tracker.count(&h), 2);
        assert_eq!(tracker.owners(&h), vec!["owner-1", "owner-2"]);

        assert!(tracker.release(&h, "owner-1"));
        assert!(!tracker.release(&h, "owner-1"));
        assert_eq!(tracker.count(&h), 1);
    }

    #[test]
    fn test_release_unknown_hash_is_noop() {
        let dir = tempdir().expect("tempdir");
        let tracker = ReferenceTracker::load(dir.path().join("refs.json")).expect("load");
        assert!(!tracker.release(&hash(b"missing"), "nobody"));
        assert!(!tracker.is_dirty());
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("refs.json");
        let a = hash(b"a");
        let b = hash(b"b");
        {
            let tracker = ReferenceTracker::load(&path).expect("load");
            tracker.reference(&a, "profile:1");
            tracker.reference(&b, "profile:1");
            tracker.reference(&b, "profile:2");
            assert!(tracker.is_dirty());
            tracker.flush().await.expect("flush");
            assert!(!tracker.is_dirty());
        }

        let tracker = ReferenceTracker::load(&path).expect("reload");
        assert_eq!(tracker.count(&a), 1);
        assert_eq!(tracker.count(&b), 2);

        let released = tracker.release_owner("profile:1");
        assert_eq!(released.len(), 2);
        assert_eq!(tracker.count(&a), 0);
        assert_eq!(tracker.referenced_hashes(), vec![b]);
    }

    #[tokio::test]
    async fn test_unflushed_changes_are_not_on_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("refs.json");
        let tracker = ReferenceTracker::load(&path).expect("load");
        tracker.reference(&hash(b"a"), "owner");
        assert!(!path.exists());

        tracker.flush().await.expect("flush");
        let written = std::fs::metadata(&path).expect("sidecar").modified().expect("mtime");
        // Nothing pending, so the second flush leaves the file alone.
        tracker.flush().await.expect("flush again");
        assert_eq!(
            std::fs::metadata(&path).expect("sidecar").modified().expect("mtime"),
            written
        );
    }

    #[test]
    fn test_release_many_reports_held_hashes() {
        let dir = tempdir().expect("tempdir");
        let tracker = ReferenceTracker::load(dir.path().join("refs.json")).expect("load");
        let a = hash(b"a");
        let b = hash(b"b");
        tracker.reference(&a, "owner");

        assert_eq!(tracker.release_many([&a, &b], "owner"), vec![a.clone()]);
        assert_eq!(tracker.count(&a), 0);
    }

    #[test]
    fn test_corrupt_sidecar_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("refs.json");
        std::fs::write(&path, b"{ not json").expect("write");
        assert!(ReferenceTracker::load(&path).is_err());
    }

    #[test]
    fn test_forget_keeps_owned_entries() {
        let dir = tempdir().expect("tempdir");
        let tracker = ReferenceTracker::load(dir.path().join("refs.json")).expect("load");
        let owned = hash(b"owned");
        let free = hash(b"free");
        tracker.reference(&owned, "x");
        tracker.touch(&free);

        tracker.forget(&owned);
        tracker.forget(&free);
        assert_eq!(tracker.count(&owned), 1);
        assert!(tracker.last_referenced(&free).is_none());
    }
}
