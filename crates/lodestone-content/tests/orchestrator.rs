//! End-to-end orchestrator behaviour with in-process providers.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use async_trait::async_trait;
use lodestone_cas::{CasConfig, ContentStore, HashProvider};
use lodestone_content::{
    CasDeliverer, ContentConfig, ContentDiscoverer, ContentError, ContentManifest,
    ContentOrchestrator, ContentResolver, ContentSearchQuery, ContentSearchResult, ErrorKind,
    ExistingContentPolicy, HttpClient, HttpConfig, ManifestFile, ManifestId, ManifestPool,
    ManifestValidator, OperationContext, PipelineProvider, PublisherInfo, RetryPolicy,
};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct StaticDiscoverer {
    id: String,
    results: Option<Vec<ContentSearchResult>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ContentDiscoverer for StaticDiscoverer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn discover(
        &self,
        _query: &ContentSearchQuery,
        _ctx: &OperationContext,
    ) -> lodestone_content::Result<Vec<ContentSearchResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results.clone().ok_or_else(|| ContentError::HttpStatus {
            url: format!("http://{}/search", self.id),
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
        })
    }
}

struct StaticResolver {
    id: String,
    manifest: ContentManifest,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ContentResolver for StaticResolver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn resolve(
        &self,
        _result: &ContentSearchResult,
        _ctx: &OperationContext,
    ) -> lodestone_content::Result<ContentManifest> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.manifest.clone())
    }
}

struct Harness {
    _dir: TempDir,
    root: std::path::PathBuf,
    store: Arc<ContentStore>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = Arc::new(
            ContentStore::open(CasConfig::new(root.join("cas")).with_grace_period(Duration::ZERO))
                .unwrap(),
        );
        Self {
            _dir: dir,
            root,
            store,
        }
    }

    fn orchestrator(&self, config: ContentConfig) -> ContentOrchestrator {
        let config = ContentConfig {
            data_root: self.root.join("data"),
            ..config
        };
        let pool = Arc::new(ManifestPool::open(config.pool_dir()).unwrap());
        ContentOrchestrator::new(&config, Arc::clone(&self.store), pool)
    }

    fn provider(
        &self,
        id: &str,
        results: Option<Vec<ContentSearchResult>>,
        manifest: Option<ContentManifest>,
    ) -> (Arc<PipelineProvider>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let search_calls = Arc::new(AtomicUsize::new(0));
        let resolve_calls = Arc::new(AtomicUsize::new(0));
        let placeholder = manifest.unwrap_or_else(|| {
            sample_manifest("1.placeholder.other.none", vec![])
        });
        let provider = PipelineProvider::new(
            id,
            Arc::new(StaticDiscoverer {
                id: format!("{id}.discoverer"),
                results,
                calls: Arc::clone(&search_calls),
            }),
            Arc::new(StaticResolver {
                id: format!("{id}.resolver"),
                manifest: placeholder,
                calls: Arc::clone(&resolve_calls),
            }),
            Arc::new(CasDeliverer::new(
                "cas",
                Arc::clone(&self.store),
                HttpClient::new(&HttpConfig::default()).unwrap(),
                RetryPolicy::none(),
            )),
            Arc::new(ManifestValidator::new(Arc::clone(&self.store))),
        );
        (Arc::new(provider), search_calls, resolve_calls)
    }

    fn write_file(&self, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = self.root.join("src").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }
}

fn sample_manifest(id: &str, files: Vec<ManifestFile>) -> ContentManifest {
    ContentManifest::new(
        ManifestId::parse(id).unwrap(),
        "Sample",
        "1.0",
        PublisherInfo::new("Community"),
    )
    .with_files(files)
}

fn hit(id: &str, provider: &str) -> ContentSearchResult {
    ContentSearchResult::unresolved(id, id, provider, format!("{provider}.resolver"))
}

fn local_file(relative: &str, source: &Path) -> ManifestFile {
    let size = std::fs::metadata(source).unwrap().len();
    ManifestFile::local(relative, source, size)
}

#[tokio::test]
async fn search_merges_results_from_every_provider() {
    let h = Harness::new();
    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p1, _, _) = h.provider("p1", Some(vec![hit("p1.mapA", "p1")]), None);
    let (p2, _, _) = h.provider("p2", Some(vec![hit("p2.mapB", "p2")]), None);
    orchestrator.register(p1).unwrap();
    orchestrator.register(p2).unwrap();

    let results = orchestrator
        .search(&ContentSearchQuery::term("map pack"), &OperationContext::new())
        .await
        .unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["p1.mapA", "p2.mapB"]);
}

#[tokio::test]
async fn search_without_enabled_providers_fails() {
    let h = Harness::new();
    let mut orchestrator = h.orchestrator(ContentConfig::default().with_disabled_provider("p1"));
    let ctx = OperationContext::new();
    let query = ContentSearchQuery::term("anything");

    let err = orchestrator.search(&query, &ctx).await.unwrap_err();
    assert!(matches!(err, ContentError::NoProviders));

    let (p1, _, _) = h.provider("p1", Some(vec![]), None);
    orchestrator.register(p1).unwrap();
    let err = orchestrator.search(&query, &ctx).await.unwrap_err();
    assert!(matches!(err, ContentError::NoProviders));

    orchestrator.set_provider_enabled("p1", true).unwrap();
    assert!(orchestrator.search(&query, &ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn search_tolerates_partial_failure_but_not_total_failure() {
    let h = Harness::new();
    let ctx = OperationContext::new();
    let query = ContentSearchQuery::term("dunes");

    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (bad, _, _) = h.provider("bad", None, None);
    let (good, _, _) = h.provider("good", Some(vec![hit("good.dunes", "good")]), None);
    orchestrator.register(bad).unwrap();
    orchestrator.register(good).unwrap();
    let results = orchestrator.search(&query, &ctx).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].provider_id, "good");

    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (bad1, _, _) = h.provider("bad1", None, None);
    let (bad2, _, _) = h.provider("bad2", None, None);
    orchestrator.register(bad1).unwrap();
    orchestrator.register(bad2).unwrap();
    match orchestrator.search(&query, &ctx).await.unwrap_err() {
        ContentError::AllProvidersFailed(reasons) => assert_eq!(reasons.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn search_rejects_empty_query_and_honours_take() {
    let h = Harness::new();
    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p, _, _) = h.provider(
        "p",
        Some(vec![hit("a", "p"), hit("b", "p"), hit("c", "p")]),
        None,
    );
    orchestrator.register(p).unwrap();
    let ctx = OperationContext::new();

    let err = orchestrator
        .search(&ContentSearchQuery::default(), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let results = orchestrator
        .search(&ContentSearchQuery::term("x").with_take(2), &ctx)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn search_cache_skips_providers_within_ttl() {
    let h = Harness::new();
    let mut orchestrator = h.orchestrator(
        ContentConfig::default().with_search_cache_ttl(Duration::from_secs(60)),
    );
    let (p, calls, _) = h.provider("p", Some(vec![hit("a", "p")]), None);
    orchestrator.register(p).unwrap();
    let ctx = OperationContext::new();
    let query = ContentSearchQuery::term("a");

    orchestrator.search(&query, &ctx).await.unwrap();
    orchestrator.search(&query, &ctx).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    orchestrator.search(&ContentSearchQuery::term("b"), &ctx).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_acquire_registers_once() {
    let h = Harness::new();
    let source = h.write_file("dunes.map", b"dune terrain");
    let id = "1.community.map.dunes";
    let manifest = sample_manifest(id, vec![local_file("maps/dunes.map", &source)]);

    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p, _, resolves) = h.provider("p", Some(vec![]), Some(manifest));
    orchestrator.register(p).unwrap();
    let orchestrator = Arc::new(orchestrator);

    let result = hit(id, "p");
    let ctx = OperationContext::new();
    let (a, b) = tokio::join!(
        orchestrator.acquire(&result, &ctx),
        orchestrator.acquire(&result, &ctx)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert_eq!(orchestrator.pool().len(), 1);
    assert_eq!(resolves.load(Ordering::SeqCst), 1);

    let hash = a.files[0].cas_ref.clone().unwrap();
    assert_eq!(h.store.reference_count(&hash), 1);
    assert_eq!(h.store.references().owners(&hash), vec![id.to_string()]);
    assert_eq!(h.store.read(&hash).await.unwrap(), b"dune terrain");

    // A third call is served from the pool without resolving again.
    orchestrator.acquire(&result, &ctx).await.unwrap();
    assert_eq!(resolves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hash_mismatch_leaves_no_trace() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maps/evil.map"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"swapped bytes".to_vec()))
        .mount(&server)
        .await;

    let h = Harness::new();
    let declared = HashProvider::new().hash_bytes(b"genuine bytes");
    let id = "1.community.map.evil";
    let manifest = sample_manifest(
        id,
        vec![
            ManifestFile::remote("evil.map", format!("{}/maps/evil.map", server.uri()), 0)
                .with_hash(declared.clone()),
        ],
    );

    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p, _, _) = h.provider("p", Some(vec![]), Some(manifest));
    orchestrator.register(p).unwrap();

    let err = orchestrator
        .acquire(&hit(id, "p"), &OperationContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(!h.store.contains(&declared).await);
    assert!(h.store.list_objects().unwrap().is_empty());
    assert!(orchestrator.pool().is_empty());
    assert!(!orchestrator.pool().is_acquired(&ManifestId::parse(id).unwrap()));
}

#[tokio::test]
async fn invalid_manifest_aborts_before_delivery() {
    let h = Harness::new();
    let source = h.write_file("x.bin", b"x");
    let id = "1.community.mod.broken";
    let manifest = sample_manifest(
        id,
        vec![local_file("../outside.bin", &source)],
    );
    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p, _, _) = h.provider("p", Some(vec![]), Some(manifest));
    orchestrator.register(p).unwrap();

    let err = orchestrator
        .acquire(&hit(id, "p"), &OperationContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ContentError::Validation(_)));
    assert!(h.store.list_objects().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(ContentConfig::default());
    let err = orchestrator
        .acquire(&hit("1.acme.mod.x", "nowhere"), &OperationContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn remove_releases_references_for_collection() {
    let h = Harness::new();
    let source = h.write_file("rain.pak", b"rain");
    let id = "1.community.mod.rain";
    let manifest = sample_manifest(id, vec![local_file("rain.pak", &source)]);
    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p, _, _) = h.provider("p", Some(vec![]), Some(manifest));
    orchestrator.register(p).unwrap();
    let ctx = OperationContext::new();

    let acquired = orchestrator.acquire(&hit(id, "p"), &ctx).await.unwrap();
    let hash = acquired.files[0].cas_ref.clone().unwrap();
    assert_eq!(h.store.garbage_collect().await.unwrap().deleted, 0);

    let manifest_id = ManifestId::parse(id).unwrap();
    assert!(orchestrator.verify(&manifest_id, &ctx).await.unwrap().is_valid());
    assert!(orchestrator.remove(&manifest_id).await.unwrap().is_some());
    assert_eq!(h.store.reference_count(&hash), 0);
    assert_eq!(h.store.garbage_collect().await.unwrap().deleted, 1);
}

#[tokio::test]
async fn verify_store_policy_reacquires_corrupt_content() {
    let h = Harness::new();
    let source = h.write_file("sky.pak", b"clouds");
    let id = "1.community.mod.sky";
    let manifest = sample_manifest(id, vec![local_file("sky.pak", &source)]);
    let mut orchestrator = h.orchestrator(
        ContentConfig::default().with_existing_policy(ExistingContentPolicy::VerifyStore),
    );
    let (p, _, resolves) = h.provider("p", Some(vec![]), Some(manifest));
    orchestrator.register(p).unwrap();
    let ctx = OperationContext::new();
    let result = hit(id, "p");

    let first = orchestrator.acquire(&result, &ctx).await.unwrap();
    let hash = first.files[0].cas_ref.clone().unwrap();
    orchestrator.acquire(&result, &ctx).await.unwrap();
    assert_eq!(resolves.load(Ordering::SeqCst), 1);

    std::fs::remove_file(h.store.object_path(&hash)).unwrap();
    let again = orchestrator.acquire(&result, &ctx).await.unwrap();
    assert_eq!(resolves.load(Ordering::SeqCst), 2);
    assert_eq!(again.files[0].cas_ref.as_ref(), Some(&hash));
    assert!(h.store.contains(&hash).await);
}

#[tokio::test]
async fn cancelled_acquire_registers_nothing() {
    let h = Harness::new();
    let source = h.write_file("a.pak", b"a");
    let id = "1.community.mod.cancelled";
    let manifest = sample_manifest(id, vec![local_file("a.pak", &source)]);
    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p, _, _) = h.provider("p", Some(vec![]), Some(manifest));
    orchestrator.register(p).unwrap();

    let ctx = OperationContext::new();
    ctx.cancel.cancel();
    let err = orchestrator.acquire(&hit(id, "p"), &ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(orchestrator.pool().is_empty());
}

fn staging_entries(h: &Harness) -> usize {
    std::fs::read_dir(h.root.join("data").join("staging")).map_or(0, Iterator::count)
}

#[tokio::test]
async fn timed_out_delivery_leaves_no_trace() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maps/slow.map"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow terrain".to_vec())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let h = Harness::new();
    let hash = HashProvider::new().hash_bytes(b"slow terrain");
    let id = "1.community.map.slow";
    let manifest = sample_manifest(
        id,
        vec![
            ManifestFile::remote("slow.map", format!("{}/maps/slow.map", server.uri()), 0)
                .with_hash(hash.clone()),
        ],
    );
    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p, _, _) = h.provider("p", Some(vec![]), Some(manifest));
    orchestrator.register(p).unwrap();

    let ctx = OperationContext::new().with_timeout(Duration::from_millis(300));
    let err = orchestrator.acquire(&hit(id, "p"), &ctx).await.unwrap_err();
    assert!(matches!(err, ContentError::Timeout(_)));

    assert!(orchestrator.pool().is_empty());
    assert_eq!(h.store.reference_count(&hash), 0);
    assert!(h.store.list_objects().unwrap().is_empty());
    assert_eq!(staging_entries(&h), 0);
}

#[tokio::test]
async fn interrupted_acquire_keeps_pool_and_references_in_step() {
    let h = Harness::new();
    let source = h.write_file("step.pak", b"in step");
    let hash = HashProvider::new().hash_bytes(b"in step");
    let id = "1.community.mod.step";
    let manifest_id = ManifestId::parse(id).unwrap();
    let manifest = sample_manifest(id, vec![local_file("step.pak", &source)]);
    let mut orchestrator = h.orchestrator(ContentConfig::default());
    let (p, _, _) = h.provider("p", Some(vec![]), Some(manifest));
    orchestrator.register(p).unwrap();
    let result = hit(id, "p");

    // The resolver takes 20ms, so these limits land before, during and
    // after delivery and registration.
    for millis in 15..60 {
        let ctx = OperationContext::new().with_timeout(Duration::from_millis(millis));
        let outcome = orchestrator.acquire(&result, &ctx).await;

        // Detached registration finishes under the per-id lock; a plain
        // acquire queues behind it.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let acquired = orchestrator.pool().is_acquired(&manifest_id);
        assert_eq!(
            acquired,
            h.store.reference_count(&hash) > 0,
            "pool and references disagree after a {millis}ms limit ({outcome:?})"
        );
        if outcome.is_ok() {
            assert!(acquired);
        }
        assert_eq!(staging_entries(&h), 0);

        orchestrator.remove(&manifest_id).await.unwrap();
        assert_eq!(h.store.reference_count(&hash), 0);
    }
}

#[tokio::test]
async fn open_sweeps_stale_staging_directories() {
    let h = Harness::new();
    let config = ContentConfig::new(h.root.join("data"));
    let stale = config.staging_dir().join("1.community.mod.old-crashed");
    std::fs::create_dir_all(stale.join("nested")).unwrap();
    std::fs::write(stale.join("nested").join("half.pak"), b"half").unwrap();
    std::fs::write(config.staging_dir().join("loose.partial"), b"x").unwrap();

    let orchestrator = ContentOrchestrator::open(&config, Arc::clone(&h.store)).unwrap();
    assert!(orchestrator.pool().is_empty());
    assert!(!stale.exists());
    assert_eq!(staging_entries(&h), 0);
}
