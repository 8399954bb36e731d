//! Per-profile workspace preparation
//!
//! A profile's workspace moves `Unprepared -> Preparing -> Ready`. Any
//! failure, cancellation or timeout lands back in `Unprepared`, and a second
//! preparation of a profile that is already `Preparing` is refused with
//! [`WorkspaceError::Busy`].
//!
//! Files are materialized into a staging directory next to the workspace
//! root. The staging directory replaces the root only after every file has
//! been placed and the workspace record has been written, so an interrupted
//! preparation never leaves a half-built workspace behind. Store objects used
//! by a ready workspace are referenced under the owner `workspace:<profile>`
//! so garbage collection keeps them while the workspace exists.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lodestone_cas::{ContentHash, ContentStore, HashProvider};
use lodestone_content::model::normalize_relative_path;
use lodestone_content::{ContentManifest, OperationContext, ProgressEvent, ProgressSink};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::config::WorkspaceConfig;
use crate::error::{Result, WorkspaceError};
use crate::fileops::{FileOperations, FileSystem, RealFileSystem};
use crate::strategy::{FileOp, WorkspaceStrategy, plan_for};

/// Name of the record written at the root of every ready workspace
pub const RECORD_FILE_NAME: &str = ".lodestone-workspace.json";

const RECORD_VERSION: u32 = 1;
const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Lifecycle of one profile's workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    /// No workspace, or the last preparation failed
    Unprepared,
    /// A preparation is running
    Preparing,
    /// The workspace matches its record
    Ready,
}

/// One materialized file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFile {
    /// Path relative to the workspace root, `/` separated
    pub relative_path: String,
    /// Store object the file was produced from
    pub hash: ContentHash,
    /// Operation that actually produced the file
    pub op: FileOp,
    /// Copied rather than linked because the game writes to it
    pub mutable: bool,
    /// Manifest that supplied the file
    pub manifest: String,
}

/// Persisted description of a ready workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    /// Record format version
    pub version: u32,
    /// Profile the workspace belongs to
    pub profile: String,
    /// Strategy the files were placed with
    pub strategy: WorkspaceStrategy,
    /// Digest of strategy and file plan, used to skip redundant preparation
    pub fingerprint: ContentHash,
    /// When the workspace was installed
    pub prepared_at: DateTime<Utc>,
    /// Every placed file
    pub files: Vec<WorkspaceFile>,
}

impl WorkspaceRecord {
    fn hashes(&self) -> BTreeSet<ContentHash> {
        self.files.iter().map(|f| f.hash.clone()).collect()
    }
}

/// Outcome of [`WorkspaceManager::prepare`]
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceResult {
    /// Profile that was prepared
    pub profile: String,
    /// Workspace root directory
    pub root: PathBuf,
    /// Strategy used
    pub strategy: WorkspaceStrategy,
    /// Every placed file
    pub files: Vec<WorkspaceFile>,
    /// One entry per file whose primary operation was refused
    pub warnings: Vec<String>,
    /// The existing workspace already matched and nothing was touched
    pub skipped: bool,
}

/// What to put in a profile's workspace
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    /// Profile to prepare
    pub profile: String,
    /// Applied in order; later manifests win on conflicting paths
    pub manifests: Vec<ContentManifest>,
    /// Falls back to the configured default when unset
    pub strategy: Option<WorkspaceStrategy>,
    /// Rebuild even when the existing workspace matches
    pub force: bool,
}

impl PrepareRequest {
    /// Request for `profile` with the default strategy
    pub fn new(profile: impl Into<String>, manifests: Vec<ContentManifest>) -> Self {
        Self {
            profile: profile.into(),
            manifests,
            strategy: None,
            force: false,
        }
    }

    /// Override the configured default strategy
    #[must_use]
    pub const fn with_strategy(mut self, strategy: WorkspaceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Rebuild even when nothing changed
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone)]
struct PlannedFile {
    relative_path: String,
    hash: ContentHash,
    mutable: bool,
    manifest: String,
}

/// Resets a profile's state when preparation ends, however it ends
struct StateGuard<'a> {
    states: &'a DashMap<String, WorkspaceState>,
    profile: String,
    settled: WorkspaceState,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.states.insert(self.profile.clone(), self.settled);
    }
}

/// Prepares and tears down per-profile workspaces
pub struct WorkspaceManager {
    config: WorkspaceConfig,
    store: Arc<ContentStore>,
    fs: Arc<dyn FileSystem>,
    states: DashMap<String, WorkspaceState>,
}

impl WorkspaceManager {
    /// Manager placing files on the host filesystem
    pub fn new(config: WorkspaceConfig, store: Arc<ContentStore>) -> Result<Self> {
        Self::with_file_system(config, store, Arc::new(RealFileSystem))
    }

    /// Use a custom filesystem for file placement
    pub fn with_file_system(
        config: WorkspaceConfig,
        store: Arc<ContentStore>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;
        Ok(Self {
            config,
            store,
            fs,
            states: DashMap::new(),
        })
    }

    /// Configuration in effect
    pub const fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Current state of a profile
    ///
    /// Profiles this manager has not touched are `Ready` when a workspace
    /// record exists on disk.
    pub fn state(&self, profile: &str) -> WorkspaceState {
        if let Some(state) = self.states.get(profile) {
            return *state;
        }
        if self.fs.exists(&self.record_path(profile)) {
            WorkspaceState::Ready
        } else {
            WorkspaceState::Unprepared
        }
    }

    /// Directory a profile's workspace lives in
    pub fn workspace_root(&self, profile: &str) -> PathBuf {
        self.config.profile_dir(profile)
    }

    fn record_path(&self, profile: &str) -> PathBuf {
        self.workspace_root(profile).join(RECORD_FILE_NAME)
    }

    fn owner(profile: &str) -> String {
        format!("workspace:{profile}")
    }

    /// Read a profile's workspace record
    pub async fn record(&self, profile: &str) -> Result<Option<WorkspaceRecord>> {
        validate_profile(profile)?;
        match tokio::fs::read(self.record_path(profile)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Profiles with a ready workspace on disk, sorted
    pub fn list_profiles(&self) -> Result<Vec<String>> {
        let mut profiles = Vec::new();
        for entry in std::fs::read_dir(&self.config.root)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || !entry.path().join(RECORD_FILE_NAME).is_file() {
                continue;
            }
            profiles.push(name);
        }
        profiles.sort();
        Ok(profiles)
    }

    fn claim(&self, profile: &str) -> Result<StateGuard<'_>> {
        match self.states.entry(profile.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == WorkspaceState::Preparing {
                    return Err(WorkspaceError::Busy(profile.to_string()));
                }
                entry.insert(WorkspaceState::Preparing);
            }
            Entry::Vacant(entry) => {
                entry.insert(WorkspaceState::Preparing);
            }
        }
        Ok(StateGuard {
            states: &self.states,
            profile: profile.to_string(),
            settled: WorkspaceState::Unprepared,
        })
    }

    /// Build or refresh a profile's workspace from delivered manifests
    pub async fn prepare(
        &self,
        request: PrepareRequest,
        ctx: &OperationContext,
    ) -> Result<WorkspaceResult> {
        validate_profile(&request.profile)?;
        let mut guard = self.claim(&request.profile)?;

        if ctx.cancel.is_cancelled() {
            return Err(WorkspaceError::Cancelled);
        }

        // Child token so a timeout cancels the blocking materialization
        // without cancelling the caller's token.
        let cancel = ctx.cancel.child_token();
        let _timer = ctx.timeout.map(|limit| {
            let token = cancel.clone();
            AbortOnDropHandle::new(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            }))
        });

        let result = self.prepare_claimed(&request, &cancel, &ctx.progress).await;
        match result {
            Ok(result) => {
                guard.settled = WorkspaceState::Ready;
                Ok(result)
            }
            Err(WorkspaceError::Cancelled) if !ctx.cancel.is_cancelled() => {
                let limit = ctx.timeout.unwrap_or_default();
                warn!(profile = %request.profile, "workspace preparation timed out after {limit:?}");
                Err(WorkspaceError::Timeout(limit))
            }
            Err(e) => {
                warn!(profile = %request.profile, "failed to prepare workspace: {e}");
                Err(e)
            }
        }
    }

    async fn prepare_claimed(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<WorkspaceResult> {
        let profile = request.profile.as_str();
        let strategy = request.strategy.unwrap_or(self.config.default_strategy);
        let root = self.workspace_root(profile);
        let owner = Self::owner(profile);

        self.sweep_staging(profile).await;

        let plan = build_plan(&request.manifests)?;
        for file in &plan {
            if !self.store.contains(&file.hash).await {
                return Err(WorkspaceError::MissingObject {
                    path: file.relative_path.clone(),
                    hash: file.hash.clone(),
                });
            }
        }
        let fingerprint = fingerprint(strategy, &plan);

        let existing = match self.record(profile).await {
            Ok(record) => record,
            Err(e) => {
                warn!(profile, "ignoring unreadable workspace record: {e}");
                None
            }
        };

        if let Some(record) = &existing
            && !request.force
            && record.fingerprint == fingerprint
            && record.strategy == strategy
            && record
                .files
                .iter()
                .all(|f| self.fs.exists(&root.join(&f.relative_path)))
        {
            let held: Vec<ContentHash> = record.hashes().into_iter().collect();
            self.store.reference_many(&held, &owner).await?;
            info!(profile, files = record.files.len(), "workspace already up to date");
            return Ok(WorkspaceResult {
                profile: profile.to_string(),
                root,
                strategy,
                files: record.files.clone(),
                warnings: Vec::new(),
                skipped: true,
            });
        }

        // The previous workspace stays live, strategy change or not, until
        // the rebuilt one is swapped in by `install`.
        if let Some(record) = &existing
            && record.strategy != strategy
        {
            info!(
                profile,
                from = %record.strategy,
                to = %strategy,
                "strategy changed, rebuilding workspace"
            );
        }
        let previous = existing.as_ref().map(WorkspaceRecord::hashes);

        let wanted: BTreeSet<ContentHash> = plan.iter().map(|f| f.hash.clone()).collect();
        let wanted_list: Vec<ContentHash> = wanted.iter().cloned().collect();
        let added = self.store.reference_many(&wanted_list, &owner).await?;

        let staging = self
            .config
            .root
            .join(format!("{STAGING_PREFIX}{profile}-{}", uuid::Uuid::new_v4()));

        let built = self
            .build_staging(&staging, strategy, &plan, cancel, progress)
            .await
            .map(|(files, warnings)| {
                let record = WorkspaceRecord {
                    version: RECORD_VERSION,
                    profile: profile.to_string(),
                    strategy,
                    fingerprint,
                    prepared_at: Utc::now(),
                    files,
                };
                (record, warnings)
            });

        let outcome = match built {
            Ok((record, warnings)) => self
                .install(&staging, &root, &record)
                .await
                .map(|()| (record, warnings)),
            Err(e) => Err(e),
        };

        let (record, warnings) = match outcome {
            Ok(done) => done,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("failed to remove staging directory {}: {cleanup}", staging.display());
                }
                self.release_all(&added, &owner).await;
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            let stale: Vec<ContentHash> = previous.difference(&wanted).cloned().collect();
            self.release_all(&stale, &owner).await;
        }

        info!(
            profile,
            strategy = %strategy,
            files = record.files.len(),
            warnings = warnings.len(),
            "workspace ready"
        );
        Ok(WorkspaceResult {
            profile: profile.to_string(),
            root,
            strategy,
            files: record.files,
            warnings,
            skipped: false,
        })
    }

    /// Place every planned file under `staging` on the blocking pool
    async fn build_staging(
        &self,
        staging: &Path,
        strategy: WorkspaceStrategy,
        plan: &[PlannedFile],
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<(Vec<WorkspaceFile>, Vec<String>)> {
        let ops = FileOperations::new(
            Arc::clone(&self.fs),
            self.config.copy_retries,
            self.config.copy_backoff,
        );
        let sources: Vec<(PlannedFile, PathBuf)> = plan
            .iter()
            .map(|f| (f.clone(), self.store.object_path(&f.hash)))
            .collect();
        let staging = staging.to_path_buf();
        let cancel = cancel.clone();
        let progress = progress.clone();

        tokio::task::spawn_blocking(move || {
            materialize(&ops, &staging, strategy, &sources, &cancel, &progress)
        })
        .await
        .map_err(|e| WorkspaceError::Io(std::io::Error::other(e)))?
    }

    /// Write the record into `staging` and swap it in as the workspace root
    async fn install(&self, staging: &Path, root: &Path, record: &WorkspaceRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::create_dir_all(staging).await?;
        tokio::fs::write(staging.join(RECORD_FILE_NAME), bytes).await?;

        let retired = if tokio::fs::symlink_metadata(root).await.is_ok() {
            let aside = self.config.root.join(format!(
                "{RETIRED_PREFIX}{}-{}",
                record.profile,
                uuid::Uuid::new_v4()
            ));
            tokio::fs::rename(root, &aside).await?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = tokio::fs::rename(staging, root).await {
            if let Some(aside) = &retired
                && let Err(restore) = tokio::fs::rename(aside, root).await
            {
                warn!("failed to restore previous workspace {}: {restore}", root.display());
            }
            return Err(e.into());
        }

        if let Some(aside) = retired
            && let Err(e) = tokio::fs::remove_dir_all(&aside).await
        {
            warn!("failed to remove retired workspace {}: {e}", aside.display());
        }
        Ok(())
    }

    /// Remove a profile's workspace and release its store references
    ///
    /// Returns the number of store objects released. Tearing down a profile
    /// with no workspace is a no-op.
    pub async fn teardown(&self, profile: &str) -> Result<usize> {
        validate_profile(profile)?;
        let _guard = self.claim(profile)?;
        let released = self.remove_workspace(profile).await?;
        info!(profile, released, "workspace torn down");
        Ok(released)
    }

    async fn remove_workspace(&self, profile: &str) -> Result<usize> {
        let root = self.workspace_root(profile);
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => debug!("removed workspace {}", root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.store.release_owner(&Self::owner(profile)).await?.len())
    }

    async fn release_all(&self, hashes: &[ContentHash], owner: &str) {
        if hashes.is_empty() {
            return;
        }
        if let Err(e) = self.store.release_many(hashes, owner).await {
            warn!(count = hashes.len(), "failed to release references for {owner}: {e}");
        }
    }

    /// Remove staging directories left by an interrupted preparation
    async fn sweep_staging(&self, profile: &str) {
        let prefix = format!("{STAGING_PREFIX}{profile}-");
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let stale = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix));
            if stale && let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                warn!("failed to remove stale staging directory {}: {e}", entry.path().display());
            }
        }
    }
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("config", &self.config)
            .field("profiles", &self.states.len())
            .finish_non_exhaustive()
    }
}

fn materialize(
    ops: &FileOperations,
    staging: &Path,
    strategy: WorkspaceStrategy,
    sources: &[(PlannedFile, PathBuf)],
    cancel: &CancellationToken,
    progress: &ProgressSink,
) -> Result<(Vec<WorkspaceFile>, Vec<String>)> {
    ops.file_system().create_dir_all(staging)?;
    let total = sources.len();
    let mut files = Vec::with_capacity(total);
    let mut warnings = Vec::new();
    let mut bytes = 0u64;

    for (index, (planned, object)) in sources.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(WorkspaceError::Cancelled);
        }
        // Symlink targets must not depend on the workspace's location.
        let source = std::path::absolute(object)?;
        let dest = staging.join(&planned.relative_path);
        let outcome = ops.apply(plan_for(strategy, planned.mutable), &source, &dest)?;
        if let Some(warning) = outcome.warning {
            warnings.push(warning);
        }
        bytes += std::fs::metadata(&source).map_or(0, |m| m.len());

        files.push(WorkspaceFile {
            relative_path: planned.relative_path.clone(),
            hash: planned.hash.clone(),
            op: outcome.op,
            mutable: planned.mutable,
            manifest: planned.manifest.clone(),
        });
        progress.emit(ProgressEvent::new(
            "prepare",
            Some(planned.relative_path.clone()),
            bytes,
            None,
            index + 1,
            total,
        ));
    }
    Ok((files, warnings))
}

/// Profile names become directory names
fn validate_profile(profile: &str) -> Result<()> {
    let valid = !profile.is_empty()
        && profile.len() <= 64
        && !profile.starts_with('.')
        && profile
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidProfile(profile.to_string()))
    }
}

fn checked_relative_path(path: &str) -> Result<String> {
    let normalized = normalize_relative_path(path);
    let reason = if normalized.is_empty() {
        Some("empty path")
    } else if path.starts_with(['/', '\\']) || normalized.contains(':') {
        Some("path must be relative")
    } else if normalized.split('/').any(|c| c == "..") {
        Some("path escapes the workspace")
    } else if normalized.eq_ignore_ascii_case(RECORD_FILE_NAME) {
        Some("path is reserved")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(WorkspaceError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(normalized),
    }
}

/// Flatten manifests into one file plan; later manifests replace earlier
/// entries with the same path, compared case-insensitively
fn build_plan(manifests: &[ContentManifest]) -> Result<Vec<PlannedFile>> {
    let mut plan: BTreeMap<String, PlannedFile> = BTreeMap::new();
    for manifest in manifests {
        let manifest_id = manifest.id.to_string();
        for file in &manifest.files {
            let Some(hash) = file.cas_ref.clone() else {
                return Err(WorkspaceError::NotDelivered {
                    manifest: manifest_id,
                    path: file.relative_path.clone(),
                });
            };
            let relative_path = checked_relative_path(&file.relative_path)?;
            let key = relative_path.to_ascii_lowercase();
            if let Some(replaced) = plan.get(&key) {
                debug!(
                    path = %relative_path,
                    "{} overrides {}",
                    manifest_id,
                    replaced.manifest
                );
            }
            plan.insert(
                key,
                PlannedFile {
                    relative_path,
                    hash,
                    mutable: file.mutable,
                    manifest: manifest_id.clone(),
                },
            );
        }
    }
    Ok(plan.into_values().collect())
}

fn fingerprint(strategy: WorkspaceStrategy, plan: &[PlannedFile]) -> ContentHash {
    let mut hasher = HashProvider::new().hasher();
    hasher.update(strategy.name().as_bytes());
    for file in plan {
        hasher.update(b"\n");
        hasher.update(file.relative_path.as_bytes());
        hasher.update(b"\0");
        hasher.update(file.hash.as_str().as_bytes());
        hasher.update(if file.mutable { b"\0m" } else { b"\0i" });
    }
    hasher.finalize()
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use lodestone_content::{ContentType, ManifestFile, ManifestId, PublisherInfo};

    fn hash(data: &[u8]) -> ContentHash {
        HashProvider::new().hash_bytes(data)
    }

    fn manifest(slug: &str, files: &[(&str, &[u8])]) -> ContentManifest {
        let id = ManifestId::new(1, "acme", ContentType::Mod, slug).expect("id");
        ContentManifest::new(id, slug, "1.0", PublisherInfo::new("Acme")).with_files(
            files
                .iter()
                .map(|(path, data)| {
                    ManifestFile::remote(*path, "https://example.invalid/x", data.len() as u64)
                        .delivered(hash(data), data.len() as u64)
                })
                .collect(),
        )
    }

    #[test]
    fn test_later_manifests_override_paths() {
        let base = manifest("base", &[("Data/a.txt", b"base"), ("data/b.txt", b"b")]);
        let patch = manifest("patch", &[("data/A.txt", b"patched")]);

        let plan = build_plan(&[base, patch]).expect("plan");
        assert_eq!(plan.len(), 2);
        let a = plan
            .iter()
            .find(|f| f.relative_path.eq_ignore_ascii_case("data/a.txt"))
            .expect("a");
        assert_eq!(a.hash, hash(b"patched"));
        assert_eq!(a.manifest, "1.acme.mod.patch");
    }

    #[test]
    fn test_plan_requires_delivered_files() {
        let id = ManifestId::new(1, "acme", ContentType::Map, "raw").expect("id");
        let raw = ContentManifest::new(id, "raw", "1.0", PublisherInfo::new("Acme"))
            .with_files(vec![ManifestFile::remote("a.map", "https://example.invalid/a", 1)]);
        assert!(matches!(
            build_plan(&[raw]),
            Err(WorkspaceError::NotDelivered { .. })
        ));
    }

    #[test]
    fn test_path_checks() {
        assert_eq!(checked_relative_path("maps\\./a.map").expect("ok"), "maps/a.map");
        for bad in ["", "/etc/passwd", "../up", "a/../../b", "C:/x", RECORD_FILE_NAME] {
            assert!(checked_relative_path(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_profile_names() {
        assert!(validate_profile("main-2").is_ok());
        for bad in ["", ".hidden", "a/b", "a b", &"x".repeat(65)] {
            assert!(validate_profile(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_fingerprint_depends_on_strategy_and_files() {
        let plan = build_plan(&[manifest("m", &[("a", b"1")])]).expect("plan");
        let other = build_plan(&[manifest("m", &[("a", b"2")])]).expect("plan");
        let hybrid = fingerprint(WorkspaceStrategy::HybridCopySymlink, &plan);
        assert_eq!(hybrid, fingerprint(WorkspaceStrategy::HybridCopySymlink, &plan));
        assert_ne!(hybrid, fingerprint(WorkspaceStrategy::FullCopy, &plan));
        assert_ne!(hybrid, fingerprint(WorkspaceStrategy::HybridCopySymlink, &other));
    }
}
