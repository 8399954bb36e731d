//! Manifest validation

use async_trait::async_trait;
use lodestone_cas::{CasError, ContentStore};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ContentError, Result};
use crate::model::ContentManifest;
use crate::pipeline::ContentValidator;
use crate::progress::{OperationContext, ProgressEvent};

/// How serious a validation finding is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Worth reporting; does not block acquisition
    Warning,
    /// Blocks acquisition
    Error,
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Whether the finding blocks acquisition
    pub severity: Severity,
    /// File the issue concerns, if any
    pub path: Option<String>,
    /// Human-readable description
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{path}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Findings of one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Findings in discovery order
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Record a blocking issue
    pub fn error(&mut self, path: Option<&str>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: Severity::Error,
            path: path.map(str::to_string),
            message: message.into(),
        });
    }

    /// Record a non-blocking issue
    pub fn warning(&mut self, path: Option<&str>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: Severity::Warning,
            path: path.map(str::to_string),
            message: message.into(),
        });
    }

    /// No error-severity issues
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    /// Error-severity issues
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    /// Warning-severity issues
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    /// Append another report's issues
    pub fn merge(&mut self, other: Self) {
        self.issues.extend(other.issues);
    }

    /// `Err(Validation)` listing every error, warnings are dropped
    pub fn into_result(self) -> Result<()> {
        let errors: Vec<String> = self.errors().map(ToString::to_string).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ContentError::Validation(errors))
        }
    }
}

/// Validator backed by the content store
#[derive(Debug, Clone)]
pub struct ManifestValidator {
    store: Arc<ContentStore>,
}

impl ManifestValidator {
    /// Stage id reported by [`ContentValidator::id`]
    pub const ID: &'static str = "manifest-validator";

    /// Validator checking delivered files against `store`
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self { store }
    }

    /// Checks that need nothing but the manifest
    pub fn check_structure(manifest: &ContentManifest) -> ValidationReport {
        let mut report = ValidationReport::default();

        if manifest.name.trim().is_empty() {
            report.error(None, "name must not be empty");
        }
        if manifest.version.trim().is_empty() {
            report.error(None, "version must not be empty");
        }
        if manifest.publisher.name.trim().is_empty() {
            report.error(None, "publisher name must not be empty");
        }
        if manifest.content_type != manifest.id.content_type() {
            report.error(
                None,
                format!(
                    "content type {} does not match id {}",
                    manifest.content_type, manifest.id
                ),
            );
        }
        if manifest.files.is_empty() {
            report.error(None, "manifest lists no files");
        }

        let mut seen = HashSet::new();
        for file in &manifest.files {
            let path = file.relative_path.as_str();
            if path.is_empty() {
                report.error(None, "file with empty relative path");
                continue;
            }
            if path.starts_with('/')
                || path.contains('\\')
                || path.split('/').any(|c| c == ".." || c.is_empty())
                || path.as_bytes().get(1) == Some(&b':')
            {
                report.error(Some(path), "path must be relative and stay inside the content root");
            }
            if !seen.insert(path.to_ascii_lowercase()) {
                report.error(Some(path), "duplicate path");
            }
            if file.download_url.is_none() && file.source_path.is_none() && file.cas_ref.is_none()
            {
                report.error(Some(path), "no download URL, source path or store reference");
            }
            if let (Some(hash), Some(cas_ref)) = (&file.hash, &file.cas_ref)
                && hash != cas_ref
            {
                report.error(
                    Some(path),
                    format!("declared hash {hash} differs from store reference {cas_ref}"),
                );
            }
            if file.hash.is_none() && file.cas_ref.is_none() {
                report.warning(Some(path), "no declared hash, integrity rests on transport");
            }
        }

        for dependency in &manifest.dependencies {
            if dependency.id == manifest.id {
                report.error(None, "manifest depends on itself");
            }
        }

        report
    }
}

#[async_trait]
impl ContentValidator for ManifestValidator {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn validate_manifest(&self, manifest: &ContentManifest) -> ValidationReport {
        Self::check_structure(manifest)
    }

    async fn validate_files(
        &self,
        manifest: &ContentManifest,
        ctx: &OperationContext,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();
        let total = manifest.files.len();

        for (index, file) in manifest.files.iter().enumerate() {
            let path = file.relative_path.as_str();
            if ctx.cancel.is_cancelled() {
                report.error(None, "validation cancelled");
                break;
            }
            let Some(cas_ref) = &file.cas_ref else {
                report.error(Some(path), "file was not delivered to the store");
                continue;
            };
            if let Some(hash) = &file.hash
                && hash != cas_ref
            {
                report.error(Some(path), format!("expected {hash}, stored as {cas_ref}"));
                continue;
            }

            match self.store.object_size(cas_ref).await {
                Ok(size) if size != file.size => {
                    report.error(
                        Some(path),
                        format!("expected {} bytes, store object has {size}", file.size),
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    report.error(Some(path), e.to_string());
                    continue;
                }
            }

            match self.store.verify(cas_ref).await {
                Ok(()) => debug!(path, hash = cas_ref.short(), "file verified"),
                Err(CasError::Corruption { actual, .. }) => {
                    report.error(Some(path), format!("store object is corrupt, hashes to {actual}"));
                }
                Err(e) => report.error(Some(path), e.to_string()),
            }

            ctx.progress.emit(ProgressEvent::new(
                "validate",
                Some(file.relative_path.clone()),
                0,
                None,
                index + 1,
                total,
            ));
        }

        report
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{ManifestFile, ManifestId, PublisherInfo};
    use lodestone_cas::CasConfig;
    use tempfile::tempdir;

    fn manifest(files: Vec<ManifestFile>) -> ContentManifest {
        ContentManifest::new(
            ManifestId::parse("1.acme.map.dunes").expect("id"),
            "Dunes",
            "1.0",
            PublisherInfo::new("Acme"),
        )
        .with_files(files)
    }

    #[test]
    fn test_structure_rejects_escaping_and_duplicate_paths() {
        let url = "http://example/x";
        let report = ManifestValidator::check_structure(&manifest(vec![
            ManifestFile::remote("maps/a.map", url, 1),
            ManifestFile::remote("MAPS/A.map", url, 1),
            ManifestFile {
                relative_path: "../escape".into(),
                ..ManifestFile::remote("x", url, 1)
            },
            ManifestFile {
                relative_path: "C:/abs".into(),
                ..ManifestFile::remote("x", url, 1)
            },
        ]));
        assert_eq!(report.errors().count(), 3);
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_structure_requires_files_and_source() {
        let report = ManifestValidator::check_structure(&manifest(vec![]));
        assert!(!report.is_valid());

        let mut file = ManifestFile::remote("a.map", "http://example/a", 1);
        file.download_url = None;
        let report = ManifestValidator::check_structure(&manifest(vec![file]));
        assert_eq!(report.errors().count(), 1);
    }

    #[test]
    fn test_missing_hash_is_only_a_warning() {
        let report = ManifestValidator::check_structure(&manifest(vec![ManifestFile::remote(
            "a.map",
            "http://example/a",
            1,
        )]));
        assert!(report.is_valid());
        assert_eq!(report.warnings().count(), 1);
    }

    #[tokio::test]
    async fn test_validate_files_checks_size_and_presence() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(ContentStore::open(CasConfig::new(dir.path())).expect("store"));
        let stored = store.store_bytes(b"dune data", None).await.expect("store");
        let validator = ManifestValidator::new(Arc::clone(&store));
        let ctx = OperationContext::new();

        let good = ManifestFile::remote("a.map", "http://example/a", 0)
            .delivered(stored.hash.clone(), stored.size);
        let report = validator
            .validate_files(&manifest(vec![good.clone()]), &ctx)
            .await;
        assert!(report.is_valid(), "{report:?}");

        let wrong_size = ManifestFile { size: 3, ..good };
        let undelivered = ManifestFile::remote("b.map", "http://example/b", 1);
        let report = validator
            .validate_files(&manifest(vec![wrong_size, undelivered]), &ctx)
            .await;
        assert_eq!(report.errors().count(), 2);
    }
}
