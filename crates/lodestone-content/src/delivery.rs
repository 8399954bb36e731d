//! Store-backed delivery
//!
//! Files are delivered strictly one at a time. Remote files stream through a
//! [`CasWriter`], so bytes are hashed as they arrive and a mismatching
//! download never becomes a store object.

use async_trait::async_trait;
use futures::StreamExt;
use lodestone_cas::{CasError, ContentStore, StoredObject};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ContentError, Result};
use crate::http::HttpClient;
use crate::model::{ContentManifest, ManifestFile};
use crate::pipeline::ContentDeliverer;
use crate::progress::{OperationContext, ProgressEvent};
use crate::retry::RetryPolicy;

/// Deliverer that fetches HTTP and local files into the content store
#[derive(Debug, Clone)]
pub struct CasDeliverer {
    id: String,
    store: Arc<ContentStore>,
    http: HttpClient,
    retry: RetryPolicy,
}

/// Running byte count across a whole manifest
struct Transfer<'a> {
    ctx: &'a OperationContext,
    total_bytes: Option<u64>,
    items_total: usize,
    completed_bytes: u64,
    items_completed: usize,
}

impl Transfer<'_> {
    fn report(&self, item: &str, in_flight: u64) {
        self.ctx.progress.emit(ProgressEvent::new(
            "deliver",
            Some(item.to_string()),
            self.completed_bytes + in_flight,
            self.total_bytes,
            self.items_completed,
            self.items_total,
        ));
    }
}

impl CasDeliverer {
    /// Deliverer writing into `store`, fetching remote files with `http`
    pub fn new(
        id: impl Into<String>,
        store: Arc<ContentStore>,
        http: HttpClient,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            http,
            retry,
        }
    }

    async fn deliver_file(&self, file: &ManifestFile, transfer: &Transfer<'_>) -> Result<StoredObject> {
        let path = file.relative_path.as_str();

        // `touch` restarts the grace period under the object's stripe, so a
        // reused object outlives a concurrent collection until it is referenced.
        if let Some(known) = file.cas_ref.as_ref().or(file.hash.as_ref())
            && self.store.touch(known).await?
        {
            debug!(path, hash = known.short(), "already in store, skipping transfer");
            let size = self.store.object_size(known).await?;
            return Ok(StoredObject {
                hash: known.clone(),
                size,
                path: self.store.object_path(known),
                newly_stored: false,
            });
        }

        if let Some(url) = &file.download_url {
            let url = Url::parse(url)?;
            return self
                .retry
                .execute_until(&transfer.ctx.cancel, || self.fetch_once(&url, file, transfer))
                .await;
        }

        if let Some(source) = &file.source_path {
            let actual = tokio::fs::metadata(source).await?.len();
            if file.size > 0 && actual != file.size {
                return Err(ContentError::SizeMismatch {
                    path: path.to_string(),
                    expected: file.size,
                    actual,
                });
            }
            transfer.ctx.check_cancelled()?;
            let stored = self
                .store
                .store_file(source, file.hash.as_ref())
                .await
                .map_err(|e| integrity_error(path, e))?;
            transfer.report(path, stored.size);
            return Ok(stored);
        }

        Err(ContentError::Validation(vec![format!(
            "{path}: no download URL or source path"
        )]))
    }

    async fn fetch_once(
        &self,
        url: &Url,
        file: &ManifestFile,
        transfer: &Transfer<'_>,
    ) -> Result<StoredObject> {
        let path = file.relative_path.as_str();
        let response = tokio::select! {
            biased;
            () = transfer.ctx.cancel.cancelled() => return Err(ContentError::Cancelled),
            response = self.http.get(url) => response?,
        };
        let mut stream = response.bytes_stream();
        let mut writer = self.store.writer().await?;

        loop {
            tokio::select! {
                biased;
                () = transfer.ctx.cancel.cancelled() => {
                    writer.abort().await;
                    return Err(ContentError::Cancelled);
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        writer.write(&bytes).await?;
                        if file.size > 0 && writer.bytes_written() > file.size {
                            let actual = writer.bytes_written();
                            writer.abort().await;
                            return Err(ContentError::SizeMismatch {
                                path: path.to_string(),
                                expected: file.size,
                                actual,
                            });
                        }
                        transfer.report(path, writer.bytes_written());
                    }
                    Some(Err(e)) => {
                        writer.abort().await;
                        return Err(e.into());
                    }
                    None => break,
                },
            }
        }

        if file.size > 0 && writer.bytes_written() != file.size {
            let actual = writer.bytes_written();
            writer.abort().await;
            return Err(ContentError::SizeMismatch {
                path: path.to_string(),
                expected: file.size,
                actual,
            });
        }

        writer
            .commit(file.hash.as_ref())
            .await
            .map_err(|e| integrity_error(path, e))
    }
}

fn integrity_error(path: &str, error: CasError) -> ContentError {
    match error {
        CasError::HashMismatch { expected, actual } => ContentError::Integrity {
            path: path.to_string(),
            expected,
            actual,
        },
        other => other.into(),
    }
}

#[async_trait]
impl ContentDeliverer for CasDeliverer {
    fn id(&self) -> &str {
        &self.id
    }

    fn can_deliver(&self, manifest: &ContentManifest) -> bool {
        manifest.files.iter().all(|f| {
            f.cas_ref.is_some()
                || f.source_path.is_some()
                || f.download_url
                    .as_deref()
                    .and_then(|u| Url::parse(u).ok())
                    .is_some_and(|u| matches!(u.scheme(), "http" | "https"))
        })
    }

    async fn deliver(
        &self,
        manifest: &ContentManifest,
        _workdir: &Path,
        ctx: &OperationContext,
    ) -> Result<ContentManifest> {
        let total = manifest.total_size();
        let mut transfer = Transfer {
            ctx,
            total_bytes: (total > 0).then_some(total),
            items_total: manifest.files.len(),
            completed_bytes: 0,
            items_completed: 0,
        };

        let mut delivered = Vec::with_capacity(manifest.files.len());
        for file in &manifest.files {
            ctx.check_cancelled()?;
            let stored = match self.deliver_file(file, &transfer).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(
                        manifest = %manifest.id,
                        path = %file.relative_path,
                        "failed to deliver file: {e}"
                    );
                    return Err(e);
                }
            };
            transfer.completed_bytes += stored.size;
            transfer.items_completed += 1;
            transfer.report(&file.relative_path, 0);
            delivered.push(file.delivered(stored.hash, stored.size));
        }

        info!(
            manifest = %manifest.id,
            files = delivered.len(),
            bytes = transfer.completed_bytes,
            "delivered content"
        );
        Ok(manifest.with_files(delivered))
    }
}
