//! Garbage collection of unreferenced objects.
//!
//! An object is collectable when it has no owners and its last-referenced
//! time is at least one grace period in the past. Objects the tracker has
//! never seen fall back to their file modification time. The decision is
//! taken twice: once while scanning, and again under the object's commit
//! stripe immediately before the delete, so a concurrent commit or reference
//! always wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ContentHash, ContentStore, PARTIAL_EXTENSION, Result};

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Objects examined.
    pub scanned: usize,
    /// Objects deleted.
    pub deleted: usize,
    /// Bytes reclaimed from deleted objects.
    pub bytes_freed: u64,
    /// Objects kept because they have owners.
    pub retained_referenced: usize,
    /// Unreferenced objects kept because the grace period has not elapsed.
    pub retained_in_grace: usize,
    /// Abandoned partial writes removed.
    pub temp_files_removed: usize,
    /// Per-object failures (the pass continues past them).
    pub errors: Vec<String>,
}

/// Whether an object with `count` owners last referenced at `last` may be deleted at `now`.
pub fn is_collectable(
    count: usize,
    last: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    if count > 0 {
        return false;
    }
    let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
    elapsed >= grace
}

fn modified_at(path: &std::path::Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

impl ContentStore {
    /// Run one collection pass.
    pub async fn garbage_collect(&self) -> Result<GcReport> {
        let grace = self.config().gc_grace_period;
        let mut report = GcReport::default();

        for hash in self.list_objects()? {
            report.scanned += 1;
            match self.collect_object(&hash, grace).await {
                Ok(Some(freed)) => {
                    report.deleted += 1;
                    report.bytes_freed += freed;
                }
                Ok(None) => {
                    if self.reference_count(&hash) > 0 {
                        report.retained_referenced += 1;
                    } else {
                        report.retained_in_grace += 1;
                    }
                }
                Err(e) => {
                    warn!(hash = hash.short(), "garbage collection failed: {e}");
                    report.errors.push(format!("{hash}: {e}"));
                }
            }
        }

        report.temp_files_removed = self.sweep_temp_files(grace);
        self.references().flush().await?;

        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            bytes_freed = report.bytes_freed,
            errors = report.errors.len(),
            "garbage collection finished"
        );
        Ok(report)
    }

    /// Delete one object if it is still collectable under its stripe lock.
    async fn collect_object(&self, hash: &ContentHash, grace: Duration) -> Result<Option<u64>> {
        let path = self.object_path(hash);
        if !self.is_object_collectable(hash, &path, grace) {
            return Ok(None);
        }

        let _guard = self.stripe(hash).lock().await;
        if !self.is_object_collectable(hash, &path, grace) {
            debug!(hash = hash.short(), "object became live before delete");
            return Ok(None);
        }

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        tokio::fs::remove_file(&path).await?;
        self.references().forget(hash);
        debug!(hash = hash.short(), size, "object collected");
        Ok(Some(size))
    }

    fn is_object_collectable(
        &self,
        hash: &ContentHash,
        path: &std::path::Path,
        grace: Duration,
    ) -> bool {
        let count = self.reference_count(hash);
        let Some(last) = self
            .references()
            .last_referenced(hash)
            .or_else(|| modified_at(path))
        else {
            return false;
        };
        is_collectable(count, last, Utc::now(), grace)
    }

    /// Remove partial writes older than the grace period.
    fn sweep_temp_files(&self, grace: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(self.temp_dir()) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTIAL_EXTENSION) {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= grace.max(Duration::from_secs(60)));
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

/// Run garbage collection every `interval` until `cancel` fires.
///
/// The first pass happens one interval after spawning.
pub fn spawn_collector(
    store: Arc<ContentStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("garbage collector stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = store.garbage_collect().await {
                        warn!("garbage collection pass failed: {e}");
                    }
                }
            }
        }
    })
}
