//! Content data model
//!
//! Manifests are immutable values. Operations that change a manifest (for
//! example delivery filling in store references) return a new one.

use lodestone_cas::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ContentError, Result};

/// Schema version written into newly minted manifest ids
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Kind of content a manifest describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Base game client
    GameClient,
    /// Official or community patch
    Patch,
    /// Gameplay or asset modification
    Mod,
    /// Single map
    Map,
    /// Bundle of maps
    MapPack,
    /// UI or scripting addon
    Addon,
    /// Standalone executable or tool
    Executable,
    /// Anything else
    Other,
}

impl ContentType {
    /// All content types, in declaration order
    pub const ALL: [Self; 8] = [
        Self::GameClient,
        Self::Patch,
        Self::Mod,
        Self::Map,
        Self::MapPack,
        Self::Addon,
        Self::Executable,
        Self::Other,
    ];

    /// Tag used inside manifest ids and catalog queries
    pub const fn tag(self) -> &'static str {
        match self {
            Self::GameClient => "gameclient",
            Self::Patch => "patch",
            Self::Mod => "mod",
            Self::Map => "map",
            Self::MapPack => "mappack",
            Self::Addon => "addon",
            Self::Executable => "executable",
            Self::Other => "other",
        }
    }

    /// Parse a tag, accepting the snake_case names as well
    pub fn from_tag(tag: &str) -> Option<Self> {
        let normalized: String = tag
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.tag() == normalized)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ContentType {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_tag(s).ok_or_else(|| ContentError::Parse(format!("unknown content type '{s}'")))
    }
}

/// Globally unique manifest identifier: `<schema>.<publisher>.<content-type>.<slug>`
///
/// Publisher and slug are lowercase `[a-z0-9-]`. The canonical string form is
/// what gets persisted and used as a reference owner in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ManifestId {
    schema_version: u32,
    publisher: String,
    content_type: ContentType,
    slug: String,
}

impl ManifestId {
    /// Build an id from its parts, normalizing case
    pub fn new(
        schema_version: u32,
        publisher: &str,
        content_type: ContentType,
        slug: &str,
    ) -> Result<Self> {
        let publisher = publisher.to_ascii_lowercase();
        let slug = slug.to_ascii_lowercase();
        let display = format!("{schema_version}.{publisher}.{content_type}.{slug}");
        check_segment(&display, "publisher", &publisher)?;
        check_segment(&display, "slug", &slug)?;
        Ok(Self {
            schema_version,
            publisher,
            content_type,
            slug,
        })
    }

    /// Parse the canonical string form
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| ContentError::InvalidManifestId {
            id: value.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = value.trim().split('.').collect();
        let [schema, publisher, content_type, slug] = parts.as_slice() else {
            return Err(invalid("expected four dot-separated segments"));
        };
        let schema_version = schema
            .parse::<u32>()
            .map_err(|_| invalid("schema version must be numeric"))?;
        let content_type = ContentType::from_tag(content_type)
            .ok_or_else(|| invalid("unknown content type"))?;
        Self::new(schema_version, publisher, content_type, slug)
    }

    /// Turn free text into a valid id segment
    pub fn slugify(text: &str) -> String {
        let mut slug = String::with_capacity(text.len());
        for c in text.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        let trimmed = slug.trim_end_matches('-');
        if trimmed.is_empty() {
            "content".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Schema version of the id format
    pub const fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Publisher segment
    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    /// Content type segment
    pub const fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Slug segment
    pub fn slug(&self) -> &str {
        &self.slug
    }
}

fn check_segment(id: &str, name: &str, segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(ContentError::InvalidManifestId {
            id: id.to_string(),
            reason: format!("{name} must not be empty"),
        });
    }
    if let Some(bad) = segment
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(ContentError::InvalidManifestId {
            id: id.to_string(),
            reason: format!("{name} contains invalid character '{bad}'"),
        });
    }
    Ok(())
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.schema_version, self.publisher, self.content_type, self.slug
        )
    }
}

impl FromStr for ManifestId {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ManifestId {
    type Error = ContentError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ManifestId> for String {
    fn from(id: ManifestId) -> Self {
        id.to_string()
    }
}

/// Who publishes a piece of content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInfo {
    /// Display name
    pub name: String,
    /// Home page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Free-form publisher category such as "community" or "official"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_type: Option<String>,
}

impl PublisherInfo {
    /// Publisher with only a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set [`Self::website`]
    #[must_use]
    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }
}

const MUTABLE_DIRECTORIES: &[&str] = &["save", "saves", "savegames", "settings", "profiles"];
const MUTABLE_EXTENSIONS: &[&str] = &["ini", "cfg", "sav", "save"];

/// Whether a relative path names a file the game writes to at runtime
///
/// Saves and settings must be copied into a workspace, never linked, so
/// in-place writes cannot reach shared store objects.
pub fn is_mutable_path(relative_path: &str) -> bool {
    let lower = relative_path.replace('\\', "/").to_ascii_lowercase();
    let mut components = lower.split('/').filter(|c| !c.is_empty()).peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            return component
                .rsplit_once('.')
                .is_some_and(|(_, ext)| MUTABLE_EXTENSIONS.contains(&ext));
        }
        if MUTABLE_DIRECTORIES.contains(&component) {
            return true;
        }
    }
    false
}

/// One file inside a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path relative to the content root, `/`-separated
    pub relative_path: String,
    /// Size in bytes; zero when the source did not declare one before delivery
    pub size: u64,
    /// Expected content hash, if the source declared one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
    /// HTTP source, for remote files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Filesystem source, for local imports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    /// Store object holding the bytes, set once delivered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas_ref: Option<ContentHash>,
    /// Written by the game at runtime
    #[serde(default)]
    pub mutable: bool,
}

impl ManifestFile {
    /// A file fetched over HTTP
    pub fn remote(relative_path: impl Into<String>, url: impl Into<String>, size: u64) -> Self {
        let relative_path = normalize_relative_path(&relative_path.into());
        Self {
            mutable: is_mutable_path(&relative_path),
            relative_path,
            size,
            hash: None,
            download_url: Some(url.into()),
            source_path: None,
            cas_ref: None,
        }
    }

    /// A file imported from the local filesystem
    pub fn local(relative_path: impl Into<String>, source: impl Into<PathBuf>, size: u64) -> Self {
        let relative_path = normalize_relative_path(&relative_path.into());
        Self {
            mutable: is_mutable_path(&relative_path),
            relative_path,
            size,
            hash: None,
            download_url: None,
            source_path: Some(source.into()),
            cas_ref: None,
        }
    }

    /// Declare the expected hash
    #[must_use]
    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Override the path-based mutability guess
    #[must_use]
    pub const fn with_mutable(mut self, mutable: bool) -> Self {
        self.mutable = mutable;
        self
    }

    /// Copy of this entry pointing at a delivered store object
    #[must_use]
    pub fn delivered(&self, cas_ref: ContentHash, size: u64) -> Self {
        Self {
            hash: Some(cas_ref.clone()),
            cas_ref: Some(cas_ref),
            size,
            ..self.clone()
        }
    }
}

/// Convert separators to `/` and drop empty and `.` components
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Dependency on another manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDependency {
    /// Required manifest
    pub id: ManifestId,
    /// Content type of the required manifest
    pub content_type: ContentType,
    /// Lowest acceptable version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    /// Game variants the dependency works with; empty means any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compatible_game_variants: Vec<String>,
    /// Missing optional dependencies are not reported
    #[serde(default)]
    pub optional: bool,
}

impl ContentDependency {
    /// Mandatory dependency on `id` at any version
    pub fn required(id: ManifestId) -> Self {
        Self {
            content_type: id.content_type(),
            id,
            min_version: None,
            compatible_game_variants: Vec::new(),
            optional: false,
        }
    }
}

/// Resolved description of a piece of content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentManifest {
    /// Unique manifest id
    pub id: ManifestId,
    /// Display name
    pub name: String,
    /// Publisher-assigned version string
    pub version: String,
    /// Who publishes the content
    pub publisher: PublisherInfo,
    /// Kind of content
    pub content_type: ContentType,
    /// Game variant this content targets, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_game: Option<String>,
    /// Files making up the content
    pub files: Vec<ManifestFile>,
    /// Other manifests this one needs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ContentDependency>,
    /// Free-form key/value data from the source
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Search tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ContentManifest {
    /// Minimal manifest; content type is taken from the id
    pub fn new(
        id: ManifestId,
        name: impl Into<String>,
        version: impl Into<String>,
        publisher: PublisherInfo,
    ) -> Self {
        Self {
            content_type: id.content_type(),
            id,
            name: name.into(),
            version: version.into(),
            publisher,
            target_game: None,
            files: Vec::new(),
            dependencies: Vec::new(),
            metadata: BTreeMap::new(),
            tags: Vec::new(),
        }
    }

    /// Same manifest with a different file list
    #[must_use]
    pub fn with_files(&self, files: Vec<ManifestFile>) -> Self {
        Self {
            files,
            ..self.clone()
        }
    }

    /// Add a dependency
    #[must_use]
    pub fn with_dependency(mut self, dependency: ContentDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Add a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sum of declared file sizes
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Store objects referenced by delivered files, deduplicated
    pub fn cas_refs(&self) -> Vec<ContentHash> {
        let mut refs: Vec<ContentHash> =
            self.files.iter().filter_map(|f| f.cas_ref.clone()).collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// Every file has a store reference
    pub fn is_delivered(&self) -> bool {
        self.files.iter().all(|f| f.cas_ref.is_some())
    }
}

/// Metadata keys resolvers read back from search results
pub mod metadata_keys {
    /// Direct download URL
    pub const DOWNLOAD_URL: &str = "downloadUrl";
    /// Version string
    pub const VERSION: &str = "version";
    /// Publisher name
    pub const PUBLISHER: &str = "publisher";
    /// File name for single-file downloads
    pub const FILE_NAME: &str = "fileName";
    /// Declared size in bytes
    pub const FILE_SIZE: &str = "fileSize";
    /// Declared SHA-256 in hex
    pub const SHA256: &str = "sha256";
    /// Content type tag
    pub const CONTENT_TYPE: &str = "contentType";
    /// Publisher home page
    pub const WEBSITE: &str = "website";
    /// Repository owner
    pub const OWNER: &str = "owner";
    /// Repository name
    pub const REPOSITORY: &str = "repository";
    /// Release tag
    pub const TAG: &str = "tag";
    /// Local directory to import
    pub const SOURCE_PATH: &str = "sourcePath";
}

/// One hit returned by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSearchResult {
    /// Manifest id the result resolves to
    pub id: String,
    /// Display name
    pub name: String,
    /// Short description
    #[serde(default)]
    pub description: String,
    /// Version string, empty when unknown
    #[serde(default)]
    pub version: String,
    /// Author or publisher name
    #[serde(default)]
    pub author: String,
    /// Search tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// A resolver must run before the content can be delivered
    pub requires_resolution: bool,
    /// Resolver that turns this result into a manifest
    pub resolver_id: String,
    /// Provider that produced the result
    pub provider_id: String,
    /// Opaque key/value data the resolver needs
    #[serde(default)]
    pub resolver_metadata: BTreeMap<String, String>,
    /// Already-resolved manifest when no resolution is required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ContentManifest>,
}

impl ContentSearchResult {
    /// Result that needs resolution by `resolver_id`
    pub fn unresolved(
        id: impl Into<String>,
        name: impl Into<String>,
        provider_id: impl Into<String>,
        resolver_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: String::new(),
            author: String::new(),
            tags: Vec::new(),
            requires_resolution: true,
            resolver_id: resolver_id.into(),
            provider_id: provider_id.into(),
            resolver_metadata: BTreeMap::new(),
            manifest: None,
        }
    }

    /// Result carrying its manifest
    pub fn resolved(manifest: ContentManifest, provider_id: impl Into<String>) -> Self {
        Self {
            id: manifest.id.to_string(),
            name: manifest.name.clone(),
            description: String::new(),
            version: manifest.version.clone(),
            author: manifest.publisher.name.clone(),
            tags: manifest.tags.clone(),
            requires_resolution: false,
            resolver_id: String::new(),
            provider_id: provider_id.into(),
            resolver_metadata: BTreeMap::new(),
            manifest: Some(manifest),
        }
    }

    /// Add resolver metadata
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resolver_metadata.insert(key.into(), value.into());
        self
    }

    /// Resolver metadata value, if present
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.resolver_metadata.get(key).map(String::as_str)
    }

    /// Metadata value that a resolver cannot do without
    pub fn require_metadata(&self, key: &str) -> Result<&str> {
        self.metadata(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ContentError::MissingMetadata {
                id: self.id.clone(),
                key: key.to_string(),
            })
    }
}

/// Search criteria; at least one criterion must be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentSearchQuery {
    /// Free text matched against names, descriptions and tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    /// Only this content type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    /// Every tag must match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Only this publisher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Only content for this game variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_variant: Option<String>,
    /// Maximum number of results; unbounded when `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take: Option<usize>,
}

impl ContentSearchQuery {
    /// Query matching free text
    pub fn term(term: impl Into<String>) -> Self {
        Self {
            term: Some(term.into()),
            ..Self::default()
        }
    }

    /// Restrict to `content_type`
    #[must_use]
    pub const fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    /// Require `tag`
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Restrict to `publisher`
    #[must_use]
    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    /// Cap the number of results
    #[must_use]
    pub const fn with_take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    /// No criterion set (`take` alone is not a criterion)
    pub fn is_empty(&self) -> bool {
        self.term.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.content_type.is_none()
            && self.tags.is_empty()
            && self.publisher.as_deref().is_none_or(|p| p.trim().is_empty())
            && self.game_variant.is_none()
    }

    /// Case-insensitive match used by sources that filter locally
    pub fn matches(&self, name: &str, description: &str, tags: &[String]) -> bool {
        if let Some(term) = self.term.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let term = term.to_lowercase();
            let hit = name.to_lowercase().contains(&term)
                || description.to_lowercase().contains(&term)
                || tags.iter().any(|t| t.to_lowercase().contains(&term));
            if !hit {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|wanted| tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)))
    }
}
