//! Built-in content sources
//!
//! Each source contributes a discoverer and a resolver; delivery and
//! validation are shared so every provider writes into the same store.

pub mod catalog;
pub mod local;
pub mod releases;

use lodestone_cas::ContentStore;
use std::sync::Arc;
use url::Url;

use crate::config::ContentConfig;
use crate::delivery::CasDeliverer;
use crate::error::{ContentError, Result};
use crate::http::HttpClient;
use crate::pipeline::{ContentDeliverer, ContentValidator};
use crate::provider::{ContentProvider, PipelineProvider};
use crate::validation::ManifestValidator;

pub use catalog::{CatalogDiscoverer, CatalogResolver};
pub use local::{LocalDiscoverer, LocalResolver};
pub use releases::{ReleaseDiscoverer, ReleaseResolver, Repository};

fn parse_url(source: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| ContentError::Config(format!("source '{source}': invalid URL {raw}: {e}")))
}

/// Build a provider for every configured source
pub fn build_providers(
    config: &ContentConfig,
    store: &Arc<ContentStore>,
) -> Result<Vec<Arc<PipelineProvider>>> {
    config.validate()?;

    let http = HttpClient::new(&config.http)?;
    let deliverer: Arc<dyn ContentDeliverer> = Arc::new(CasDeliverer::new(
        "cas-deliverer",
        Arc::clone(store),
        http.clone(),
        config.retry.clone(),
    ));
    let validator: Arc<dyn ContentValidator> = Arc::new(ManifestValidator::new(Arc::clone(store)));
    let mut providers = Vec::new();

    for catalog in &config.sources.catalogs {
        let base = parse_url(&catalog.id, &catalog.base_url)?;
        providers.push(PipelineProvider::new(
            &catalog.id,
            Arc::new(CatalogDiscoverer::new(
                &catalog.id,
                base,
                http.clone(),
                config.retry.clone(),
            )),
            Arc::new(CatalogResolver::new(&catalog.id)),
            Arc::clone(&deliverer),
            Arc::clone(&validator),
        ));
    }

    for release in &config.sources.releases {
        let api = parse_url(&release.id, &release.api_url)?;
        let repositories = release
            .repositories
            .iter()
            .map(String::as_str)
            .map(Repository::parse)
            .collect::<Result<Vec<_>>>()?;
        let mut headers = vec![("accept", "application/vnd.github+json".to_string())];
        if let Some(token) = &release.token {
            headers.push(("authorization", format!("Bearer {token}")));
        }
        let api_http = HttpClient::with_headers(&config.http, &headers)?;
        providers.push(PipelineProvider::new(
            &release.id,
            Arc::new(ReleaseDiscoverer::new(
                &release.id,
                api.clone(),
                repositories,
                api_http.clone(),
                config.retry.clone(),
            )),
            Arc::new(ReleaseResolver::new(
                &release.id,
                api,
                api_http,
                config.retry.clone(),
            )),
            Arc::clone(&deliverer),
            Arc::clone(&validator),
        ));
    }

    for local in &config.sources.local {
        providers.push(PipelineProvider::new(
            &local.id,
            Arc::new(LocalDiscoverer::new(&local.id, &local.root)),
            Arc::new(LocalResolver::new(&local.id)),
            Arc::clone(&deliverer),
            Arc::clone(&validator),
        ));
    }

    Ok(providers
        .into_iter()
        .map(|provider| {
            if config.disabled_providers.contains(provider.id()) {
                provider.set_enabled(false);
            }
            Arc::new(provider)
        })
        .collect())
}
