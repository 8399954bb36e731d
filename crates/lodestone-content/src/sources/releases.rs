//! GitHub-compatible releases source
//!
//! Discovery lists `GET {api}/repos/{owner}/{repo}/releases` for each
//! configured repository; resolution fetches `releases/tags/{tag}` and turns
//! every asset into a manifest file.

use async_trait::async_trait;
use lodestone_cas::ContentHash;
use serde::Deserialize;
use tracing::{debug, warn};
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
struct Release {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    size: u64,
    browser_download_url: String,
    /// `sha256:<hex>` on servers that publish digests
    #[serde(default)]
    digest: Option<String>,
}

/// `owner/repo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Account or organisation
    pub owner: String,
    /// Repository name
    pub repo: String,
}

impl Repository {
    /// Parse `owner/repo`
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split('/').filter(|p| !p.is_empty());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(repo), None) => Ok(Self {
                owner: owner.to_string(),
                repo: repo.to_string(),
            }),
            _ => Err(ContentError::Config(format!(
                "repository '{value}' must be owner/repo"
            ))),
        }
    }
}

fn releases_url(api: &Url, repository: &Repository) -> Result<Url> {
    join_url(
        api,
        &format!("repos/{}/{}/releases", repository.owner, repository.repo),
    )
}

fn parse_digest(digest: &str) -> Option<ContentHash> {
    digest
        .strip_prefix("sha256:")
        .and_then(|hex| ContentHash::parse(hex).ok())
}

/// Lists releases of configured repositories
#[derive(Debug, Clone)]
pub struct ReleaseDiscoverer {
    id: String,
    provider_id: String,
    resolver_id: String,
    api_url: Url,
    repositories: Vec<Repository>,
    http: HttpClient,
    retry: RetryPolicy,
}

impl ReleaseDiscoverer {
    /// Discoverer searching the latest release of each repository
    pub fn new(
        provider_id: &str,
        api_url: Url,
        repositories: Vec<Repository>,
        http: HttpClient,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: format!("{provider_id}.discoverer"),
            provider_id: provider_id.to_string(),
            resolver_id: ReleaseResolver::id_for(provider_id),
            api_url,
            repositories,
            http,
            retry,
        }
    }

    async fn list_releases(
        &self,
        repository: &Repository,
        ctx: &OperationContext,
    ) -> Result<Vec<Release>> {
        let url = releases_url(&self.api_url, repository)?;
        self.retry
            .execute_until(&ctx.cancel, || self.http.get_json(&url))
            .await
    }

    fn to_result(
        &self,
        repository: &Repository,
        release: Release,
        content_type: ContentType,
    ) -> Result<ContentSearchResult> {
        let id = ManifestId::new(
            MANIFEST_SCHEMA_VERSION,
            &ManifestId::slugify(&repository.owner),
            content_type,
            &ManifestId::slugify(&format!("{}-{}", repository.repo, release.tag_name)),
        )?;
        let title = release
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{} {}", repository.repo, release.tag_name));

        let mut result =
            ContentSearchResult::unresolved(id.to_string(), title, &self.provider_id, &self.resolver_id)
                .with_metadata(keys::OWNER, &repository.owner)
                .with_metadata(keys::REPOSITORY, &repository.repo)
                .with_metadata(keys::TAG, &release.tag_name)
                .with_metadata(keys::CONTENT_TYPE, content_type.tag());
        if let Some(url) = release.html_url {
            result = result.with_metadata(keys::WEBSITE, url);
        }
        result.description = release.body.unwrap_or_default();
        result.version = version_from_tag(&release.tag_name);
        result.author.clone_from(&repository.owner);
        if release.prerelease {
            result.tags.push("prerelease".to_string());
        }
        Ok(result)
    }
}

fn version_from_tag(tag: &str) -> String {
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(tag)
        .to_string()
}

#[async_trait]
impl ContentDiscoverer for ReleaseDiscoverer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn discover(
        &self,
        query: &ContentSearchQuery,
        ctx: &OperationContext,
    ) -> Result<Vec<ContentSearchResult>> {
        let content_type = query.content_type.unwrap_or(ContentType::Mod);
        let mut results = Vec::new();
        let mut failures = Vec::new();

        for repository in &self.repositories {
            ctx.check_cancelled()?;
            if let Some(publisher) = &query.publisher
                && !repository.owner.eq_ignore_ascii_case(publisher)
            {
                continue;
            }
            let releases = match self.list_releases(repository, ctx).await {
                Ok(releases) => releases,
                Err(ContentError::Cancelled) => return Err(ContentError::Cancelled),
                Err(e) => {
                    warn!(
                        provider = %self.provider_id,
                        "failed to list releases for {}/{}: {e}",
                        repository.owner, repository.repo
                    );
                    failures.push(e);
                    continue;
                }
            };
            for release in releases.into_iter().filter(|r| !r.draft) {
                let haystack_name = format!(
                    "{} {} {}",
                    repository.repo,
                    release.tag_name,
                    release.name.as_deref().unwrap_or_default()
                );
                if !query.matches(&haystack_name, release.body.as_deref().unwrap_or_default(), &[]) {
                    continue;
                }
                match self.to_result(repository, release, content_type) {
                    Ok(result) => results.push(result),
                    Err(e) => debug!("skipping release: {e}"),
                }
            }
        }

        if results.is_empty()
            && failures.len() == self.repositories.len()
            && let Some(first) = failures.into_iter().next()
        {
            return Err(first);
        }
        Ok(results)
    }
}

/// Resolves a release tag into a manifest of its assets
#[derive(Debug, Clone)]
pub struct ReleaseResolver {
    id: String,
    provider_id: String,
    api_url: Url,
    http: HttpClient,
    retry: RetryPolicy,
}

impl ReleaseResolver {
    /// Resolver fetching release assets through `api_url`
    pub fn new(provider_id: &str, api_url: Url, http: HttpClient, retry: RetryPolicy) -> Self {
        Self {
            id: Self::id_for(provider_id),
            provider_id: provider_id.to_string(),
            api_url,
            http,
            retry,
        }
    }

    fn id_for(provider_id: &str) -> String {
        format!("{provider_id}.resolver")
    }
}

#[async_trait]
impl ContentResolver for ReleaseResolver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn resolve(
        &self,
        result: &ContentSearchResult,
        ctx: &OperationContext,
    ) -> Result<ContentManifest> {
        let repository = Repository {
            owner: result.require_metadata(keys::OWNER)?.to_string(),
            repo: result.require_metadata(keys::REPOSITORY)?.to_string(),
        };
        let tag = result.require_metadata(keys::TAG)?;
        let id = ManifestId::parse(&result.id)?;

        let url = join_url(
            &releases_url(&self.api_url, &repository)?,
            &format!("tags/{tag}"),
        )?;
        let release: Release = self
            .retry
            .execute_until(&ctx.cancel, || self.http.get_json(&url))
            .await?;

        if release.assets.is_empty() {
            return Err(ContentError::Validation(vec![format!(
                "release {tag} of {}/{} has no assets",
                repository.owner, repository.repo
            )]));
        }

        let files = release
            .assets
            .into_iter()
            .map(|asset| {
                let file = ManifestFile::remote(asset.name, asset.browser_download_url, asset.size);
                match asset.digest.as_deref().and_then(parse_digest) {
                    Some(hash) => file.with_hash(hash),
                    None => file,
                }
            })
            .collect();

        let mut publisher = PublisherInfo::new(&repository.owner);
        if let Some(url) = release.html_url.or_else(|| result.metadata(keys::WEBSITE).map(str::to_string)) {
            publisher = publisher.with_website(url);
        }

        let mut manifest = ContentManifest::new(
            id,
            &result.name,
            version_from_tag(&release.tag_name),
            publisher,
        )
        .with_files(files)
        .with_metadata("source", &self.provider_id)
        .with_metadata(keys::REPOSITORY, format!("{}/{}", repository.owner, repository.repo))
        .with_metadata(keys::TAG, release.tag_name);
        manifest.tags.clone_from(&result.tags);
        Ok(manifest)
    }
}
