//! Command handlers

use anyhow::{Context, Result, bail};
use lodestone_cas::{ContentStore, spawn_collector};
use lodestone_content::{
    ContentOrchestrator, ContentSearchQuery, ManifestId, OperationContext, progress_channel,
};
use lodestone_workspace::{PrepareRequest, WorkspaceManager, WorkspaceStrategy};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Command, OutputFormat, SearchArgs};
use crate::config::AppConfig;
use crate::output;

const PROGRESS_BUFFER: usize = 64;
const PROGRESS_DRAIN: Duration = Duration::from_millis(250);

/// Everything a command needs, opened once per invocation
pub struct App {
    store: Arc<ContentStore>,
    orchestrator: ContentOrchestrator,
    workspaces: WorkspaceManager,
    format: OutputFormat,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    gc_interval: Duration,
}

impl App {
    /// Open the store, providers and workspace manager described by `config`
    pub fn open(
        config: &AppConfig,
        format: OutputFormat,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let store = Arc::new(
            ContentStore::open(config.cas.clone())
                .with_context(|| format!("failed to open store at {}", config.cas.root.display()))?,
        );
        let orchestrator = ContentOrchestrator::open(&config.content, Arc::clone(&store))
            .context("failed to initialize content providers")?;
        let workspaces = WorkspaceManager::new(config.workspace.clone(), Arc::clone(&store))
            .context("failed to initialize workspaces")?;
        Ok(Self {
            store,
            orchestrator,
            workspaces,
            format,
            cancel,
            timeout,
            gc_interval: config.cas.gc_interval,
        })
    }

    fn context(&self) -> OperationContext {
        let ctx = OperationContext::new().with_cancel(self.cancel.clone());
        match self.timeout {
            Some(limit) => ctx.with_timeout(limit),
            None => ctx,
        }
    }

    /// Context with a progress printer attached when output is for humans
    fn context_with_progress(&self) -> (OperationContext, Option<JoinHandle<()>>) {
        if self.format == OutputFormat::Json {
            return (self.context(), None);
        }
        let (sink, events) = progress_channel(PROGRESS_BUFFER);
        let printer = output::spawn_progress_printer(events);
        (self.context().with_progress(sink), Some(printer))
    }

    /// Run one command to completion
    pub async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Search(args) => self.search(args).await,
            Command::Acquire { id, query } => self.acquire(&id, query).await,
            Command::List { content_type } => {
                let mut manifests = self.orchestrator.pool().list();
                if let Some(content_type) = content_type {
                    manifests.retain(|m| m.content_type == content_type);
                }
                output::manifests(&manifests, self.format)
            }
            Command::Verify { id } => self.verify(&id).await,
            Command::Remove { id } => self.remove(&id).await,
            Command::Providers => output::providers(&self.orchestrator.providers(), self.format),
            Command::Prepare {
                profile,
                ids,
                strategy,
                force,
            } => self.prepare(profile, &ids, strategy, force).await,
            Command::Teardown { profile } => {
                let released = self.workspaces.teardown(&profile).await?;
                info!(profile, released, "workspace removed");
                if self.format == OutputFormat::Text {
                    println!("Removed {profile}");
                }
                Ok(())
            }
            Command::Profiles => output::profiles(&self.workspaces.list_profiles()?, self.format),
            Command::Gc { watch } => self.collect(watch).await,
        }
    }

    /// One collection pass, then optionally periodic passes until cancelled
    async fn collect(&self, watch: bool) -> Result<()> {
        let report = self.store.garbage_collect().await?;
        output::gc_report(&report, self.format)?;
        if !watch {
            return Ok(());
        }
        info!(interval = ?self.gc_interval, "collecting periodically until interrupted");
        spawn_collector(Arc::clone(&self.store), self.gc_interval, self.cancel.clone())
            .await
            .context("garbage collector task failed")
    }

    async fn search(&self, args: SearchArgs) -> Result<()> {
        let query = ContentSearchQuery {
            term: args.term,
            content_type: args.content_type,
            tags: args.tags,
            publisher: args.publisher,
            take: args.take,
            ..ContentSearchQuery::default()
        };
        let results = self.orchestrator.search(&query, &self.context()).await?;
        output::search_results(&results, self.format)
    }

    async fn acquire(&self, id: &str, query: Option<String>) -> Result<()> {
        let id = ManifestId::parse(id)?;
        // Leading slug word plus publisher and type; the id picks the hit.
        let term = query.unwrap_or_else(|| {
            id.slug().split('-').next().unwrap_or_default().to_string()
        });
        let search = ContentSearchQuery::term(term)
            .with_content_type(id.content_type())
            .with_publisher(id.publisher());
        let results = self.orchestrator.search(&search, &self.context()).await?;
        let wanted = id.to_string();
        let Some(result) = results.into_iter().find(|r| r.id == wanted) else {
            bail!("{wanted} was not found by any enabled provider");
        };

        let (ctx, printer) = self.context_with_progress();
        let outcome = self.orchestrator.acquire(&result, &ctx).await;
        drop(ctx);
        finish_progress(printer).await;
        let manifest = outcome?;

        for dependency in self.orchestrator.missing_dependencies(&manifest) {
            warn!("{} requires {} which is not acquired", manifest.id, dependency.id);
        }
        output::manifest(&manifest, self.format)
    }

    async fn verify(&self, id: &str) -> Result<()> {
        let id = ManifestId::parse(id)?;
        let report = self.orchestrator.verify(&id, &self.context()).await?;
        output::validation(&id.to_string(), &report, self.format)?;
        if !report.is_valid() {
            bail!("{id} failed verification; remove and acquire it again");
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let id = ManifestId::parse(id)?;
        match self.orchestrator.remove(&id).await? {
            Some(_) => {
                if self.format == OutputFormat::Text {
                    println!("Removed {id}");
                }
                Ok(())
            }
            None => bail!("{id} is not acquired"),
        }
    }

    async fn prepare(
        &self,
        profile: String,
        ids: &[String],
        strategy: Option<WorkspaceStrategy>,
        force: bool,
    ) -> Result<()> {
        let mut manifests = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = ManifestId::parse(raw)?;
            let Some(manifest) = self.orchestrator.pool().get(&id) else {
                bail!("{id} is not acquired; run `lodestone acquire {id}` first");
            };
            manifests.push(manifest.as_ref().clone());
        }

        let mut request = PrepareRequest::new(profile, manifests).with_force(force);
        if let Some(strategy) = strategy {
            request = request.with_strategy(strategy);
        }

        let (ctx, printer) = self.context_with_progress();
        let outcome = self.workspaces.prepare(request, &ctx).await;
        drop(ctx);
        finish_progress(printer).await;
        output::workspace(&outcome?, self.format)
    }
}

/// Let the printer drain remaining events, then stop it
async fn finish_progress(printer: Option<JoinHandle<()>>) {
    if let Some(mut printer) = printer
        && tokio::time::timeout(PROGRESS_DRAIN, &mut printer).await.is_err()
    {
        printer.abort();
    }
}
