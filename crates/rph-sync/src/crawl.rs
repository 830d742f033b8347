//! Worker-pool crawl: frontier → fetcher → adapter → sink, with a run-wide
//! abort flag raised by the first blocked outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rph_adapters::{adapter_for_source, ExtractionAdapter, FetchedPage};
use rph_core::{ExtractedRecord, FetchOutcome, WorkItem};
use rph_storage::{
    load_ndjson, load_work_list, sha256_hex, BackoffPolicy, BackoffTracker, CheckpointedSink,
    DedupStore, DocumentArchive, Fetcher, GlobalPacer, IdentityRotation, ProgressStore,
    RateLimitedFetcher, ReqwestTransport, ResponseClassifier,
};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::config::{ConfigError, CrawlConfig, SourceRegistry};
use crate::frontier::Frontier;

/// Builds the fetcher each worker owns for its whole lifetime.
pub trait FetcherFactory: Send + Sync {
    fn build(&self, worker_id: usize) -> anyhow::Result<Box<dyn Fetcher>>;
}

pub struct HttpFetcherFactory {
    pacer: Arc<GlobalPacer>,
    identities: Arc<IdentityRotation>,
    classifier: ResponseClassifier,
    backoff: BackoffPolicy,
    reset_after_successes: u32,
    timeout: Duration,
}

impl HttpFetcherFactory {
    pub fn new(config: &CrawlConfig, pacer: Arc<GlobalPacer>) -> Self {
        Self {
            pacer,
            identities: Arc::new(IdentityRotation::new(config.user_agents.clone())),
            classifier: config.classifier(),
            backoff: config.backoff,
            reset_after_successes: config.reset_after_successes,
            timeout: config.request_timeout,
        }
    }
}

impl FetcherFactory for HttpFetcherFactory {
    fn build(&self, _worker_id: usize) -> anyhow::Result<Box<dyn Fetcher>> {
        let transport = ReqwestTransport::new(self.timeout)?;
        Ok(Box::new(RateLimitedFetcher::new(
            transport,
            self.pacer.clone(),
            self.identities.clone(),
            self.classifier.clone(),
            BackoffTracker::new(self.backoff, self.reset_after_successes),
        )))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items handed to a fetcher.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub parse_errors: usize,
    pub blocked: usize,
    pub skipped_seen: usize,
    pub expanded: usize,
    pub sunk: u64,
    pub malformed_work_lines: usize,
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    processed: usize,
    succeeded: usize,
    failed: usize,
    parse_errors: usize,
    blocked: usize,
    skipped_seen: usize,
    expanded: usize,
    malformed_work_lines: usize,
}

struct SourceRuntime {
    adapter: Box<dyn ExtractionAdapter>,
    expand_sub_listings: bool,
}

/// Everything mutable shared by workers, behind one lock.
struct CrawlState {
    frontier: Frontier,
    dedup: DedupStore,
    sink: CheckpointedSink,
    /// Keys appended but not yet flushed; marked seen once the sink flushes.
    unflushed: Vec<String>,
    tally: Tally,
    in_flight: usize,
}

impl CrawlState {
    fn mark_flushed(&mut self) {
        for key in self.unflushed.drain(..) {
            self.dedup.mark_seen(key);
        }
    }
}

struct Shared {
    state: Mutex<CrawlState>,
    abort: AtomicBool,
    wake: Notify,
    sources: BTreeMap<String, SourceRuntime>,
    archive: Option<DocumentArchive>,
    pacer: Arc<GlobalPacer>,
    cooldown_every: Option<u64>,
    cooldown: Duration,
    force: bool,
}

enum Claim {
    Item(WorkItem),
    Wait,
    Done,
}

struct Completed {
    record: ExtractedRecord,
    total_pages: Option<u32>,
    fetched: bool,
    expansions: Vec<WorkItem>,
}

pub struct CrawlRunner {
    config: CrawlConfig,
    registry: SourceRegistry,
    pacer: Arc<GlobalPacer>,
    factory: Arc<dyn FetcherFactory>,
}

impl CrawlRunner {
    pub fn new(config: CrawlConfig, registry: SourceRegistry) -> Result<Self, ConfigError> {
        config.validate()?;
        let pacer = Arc::new(GlobalPacer::new(config.pacing));
        let factory = Arc::new(HttpFetcherFactory::new(&config, pacer.clone()));
        Ok(Self {
            config,
            registry,
            pacer,
            factory,
        })
    }

    pub fn with_fetcher_factory(mut self, factory: Arc<dyn FetcherFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub async fn run(&self) -> anyhow::Result<CrawlSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("crawl_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> anyhow::Result<CrawlSummary> {
        let started_at = Utc::now();
        let config = &self.config;

        let mut sources = BTreeMap::new();
        for source in self.registry.enabled() {
            let adapter = adapter_for_source(&source.source_id, &source.extraction)
                .with_context(|| format!("building adapter for {}", source.source_id))?;
            sources.insert(
                source.source_id.clone(),
                SourceRuntime {
                    adapter,
                    expand_sub_listings: source.expand_sub_listings,
                },
            );
        }

        let dedup = if config.force {
            DedupStore::new()
        } else {
            DedupStore::load_from_sink(&config.output_path, config.retry_failed)
                .await?
                .0
        };
        let progress = ProgressStore::load(&config.progress_path).await?;
        let mut frontier = Frontier::new(progress);
        let mut tally = Tally::default();

        for source in self.registry.enabled() {
            for seed in &source.seeds {
                frontier.add_resource(&source.source_id, seed.clone());
            }

            let mut items: Vec<WorkItem> = source
                .urls
                .iter()
                .map(|url| WorkItem::single(url.clone(), source.source_id.clone()))
                .collect();
            if let Some(path) = &source.work_list {
                let load = load_work_list(path, &source.source_id)
                    .await
                    .with_context(|| format!("loading work list for {}", source.source_id))?;
                tally.malformed_work_lines += load.malformed.len();
                items.extend(load.entries);
            }

            let before = items.len();
            items.retain(|item| config.force || !dedup.is_seen(&item.dedup_key()));
            tally.skipped_seen += before - items.len();
            frontier.add_items(items);
        }

        let expanding: BTreeSet<&str> = self
            .registry
            .enabled()
            .filter(|s| s.expand_sub_listings)
            .map(|s| s.source_id.as_str())
            .collect();
        if !expanding.is_empty() {
            let pending = pending_expansions(&config.output_path, &expanding, &dedup).await?;
            let requeued = frontier.add_items(pending);
            if requeued > 0 {
                info!(requeued, "requeued sub-listings discovered by earlier runs");
            }
        }

        info!(
            sources = sources.len(),
            queued = frontier.queued(),
            seen = dedup.len(),
            skipped_seen = tally.skipped_seen,
            workers = config.workers,
            "starting crawl"
        );

        let sink = CheckpointedSink::open(&config.output_path, config.flush_every).await?;
        let fetchers = (0..config.workers)
            .map(|worker_id| {
                self.factory
                    .build(worker_id)
                    .with_context(|| format!("building fetcher for worker {worker_id}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(CrawlState {
                frontier,
                dedup,
                sink,
                unflushed: Vec::new(),
                tally,
                in_flight: 0,
            }),
            abort: AtomicBool::new(false),
            wake: Notify::new(),
            sources,
            archive: config.archive_dir.clone().map(DocumentArchive::new),
            pacer: self.pacer.clone(),
            cooldown_every: config.cooldown_every,
            cooldown: config.cooldown,
            force: config.force,
        });

        let mut workers = JoinSet::new();
        for (worker_id, fetcher) in fetchers.into_iter().enumerate() {
            let span = info_span!("crawl_worker", worker_id);
            workers.spawn(run_worker(shared.clone(), fetcher).instrument(span));
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .context("crawl worker panicked")
                .and_then(|inner| inner);
            if let Err(err) = result {
                error!(error = %err, "crawl worker failed");
                shared.abort.store(true, Ordering::SeqCst);
                shared.wake.notify_waiters();
                first_error.get_or_insert(err);
            }
        }

        // Drain whatever is still buffered, including after an abort.
        let mut state = shared.state.lock().await;
        state.sink.flush().await?;
        state.mark_flushed();
        state.frontier.progress().save().await?;

        let tally = state.tally;
        let summary = CrawlSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            processed: tally.processed,
            succeeded: tally.succeeded,
            failed: tally.failed,
            parse_errors: tally.parse_errors,
            blocked: tally.blocked,
            skipped_seen: tally.skipped_seen,
            expanded: tally.expanded,
            sunk: state.sink.written(),
            malformed_work_lines: tally.malformed_work_lines,
            aborted: shared.abort.load(Ordering::SeqCst),
        };
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            parse_errors = summary.parse_errors,
            blocked = summary.blocked,
            skipped_seen = summary.skipped_seen,
            sunk = summary.sunk,
            aborted = summary.aborted,
            "crawl finished"
        );

        match first_error {
            Some(err) => {
                let summary_json = serde_json::to_string(&summary).unwrap_or_default();
                Err(err.context(format!("crawl run {run_id} failed, summary: {summary_json}")))
            }
            None => Ok(summary),
        }
    }
}

pub async fn run_crawl(
    config: CrawlConfig,
    registry: SourceRegistry,
) -> anyhow::Result<CrawlSummary> {
    CrawlRunner::new(config, registry)?.run().await
}

/// Called with the state lock held; `aborted` must be read under that lock.
fn claim_next(state: &mut CrawlState, force: bool, aborted: bool) -> Claim {
    if aborted {
        return Claim::Done;
    }
    while let Some(item) = state.frontier.next_item() {
        // Pages are tracked by progress, not by the seen set.
        if !force && !item.is_paged() && state.dedup.is_seen(&item.dedup_key()) {
            state.tally.skipped_seen += 1;
            continue;
        }
        state.in_flight += 1;
        return Claim::Item(item);
    }
    if state.in_flight == 0 {
        Claim::Done
    } else {
        Claim::Wait
    }
}

async fn run_worker(shared: Arc<Shared>, mut fetcher: Box<dyn Fetcher>) -> anyhow::Result<()> {
    loop {
        let notified = shared.wake.notified();
        let claim = {
            let mut state = shared.state.lock().await;
            let aborted = shared.abort.load(Ordering::SeqCst);
            claim_next(&mut state, shared.force, aborted)
        };

        let item = match claim {
            Claim::Item(item) => item,
            Claim::Wait => {
                notified.await;
                continue;
            }
            Claim::Done => {
                shared.wake.notify_waiters();
                return Ok(());
            }
        };
        drop(notified);

        let result = process_item(&shared, fetcher.as_mut(), &item).await;
        shared.state.lock().await.in_flight -= 1;
        shared.wake.notify_waiters();
        result?;
    }
}

async fn process_item(
    shared: &Shared,
    fetcher: &mut dyn Fetcher,
    item: &WorkItem,
) -> anyhow::Result<()> {
    let key = item.dedup_key();
    let outcome = fetcher.fetch(item).await;
    debug!(url = %item.url, outcome = outcome.label(), "fetched");

    let completed = match outcome {
        FetchOutcome::Blocked { reason } => {
            // Raised under the lock so no claim can interleave with it.
            let mut state = shared.state.lock().await;
            if !shared.abort.swap(true, Ordering::SeqCst) {
                error!(url = %item.url, %reason, "blocked outcome observed, aborting run");
            }
            state.tally.processed += 1;
            state.tally.blocked += 1;
            return Ok(());
        }
        FetchOutcome::Success { document, final_url } => {
            extract_document(shared, item, &key, document, final_url).await?
        }
        FetchOutcome::PermanentFailure { reason } | FetchOutcome::TransientFailure { reason } => {
            Completed {
                record: ExtractedRecord::failed(key.clone(), item.source.clone(), reason),
                total_pages: None,
                fetched: false,
                expansions: Vec::new(),
            }
        }
    };

    commit(shared, item, key, completed).await
}

async fn extract_document(
    shared: &Shared,
    item: &WorkItem,
    key: &str,
    document: String,
    final_url: String,
) -> anyhow::Result<Completed> {
    let Some(runtime) = shared.sources.get(&item.source) else {
        warn!(source = %item.source, "no adapter registered for source");
        return Ok(Completed {
            record: ExtractedRecord::failed(
                key,
                item.source.clone(),
                format!("no adapter registered for {}", item.source),
            ),
            total_pages: None,
            fetched: true,
            expansions: Vec::new(),
        });
    };

    let fetched_at = Utc::now();
    let content_hash = match &shared.archive {
        Some(archive) => {
            archive
                .store(fetched_at, &item.source, document_extension(&document), document.as_bytes())
                .await?
                .content_hash
        }
        None => sha256_hex(document.as_bytes()),
    };

    let page = FetchedPage {
        url: key.to_string(),
        final_url,
        body: document,
        fetched_at,
    };
    let extraction = runtime.adapter.extract(&page);
    let mut record = extraction.record;
    record.content_hash = Some(content_hash);

    let expansions = if runtime.expand_sub_listings && !record.is_error() {
        expansion_items(&record, &page.final_url)
    } else {
        Vec::new()
    };

    Ok(Completed {
        record,
        total_pages: extraction.total_pages,
        fetched: true,
        expansions,
    })
}

async fn commit(
    shared: &Shared,
    item: &WorkItem,
    key: String,
    completed: Completed,
) -> anyhow::Result<()> {
    let mut guard = shared.state.lock().await;
    let state = &mut *guard;

    state.tally.processed += 1;
    if completed.fetched {
        state.tally.succeeded += 1;
        if completed.record.is_error() {
            state.tally.parse_errors += 1;
        }
    } else {
        state.tally.failed += 1;
    }

    let flushed = state.sink.append(&completed.record).await?;
    state.unflushed.push(key);

    if item.is_paged() {
        // Progress may only move once the page's record is on disk.
        if !flushed {
            state.sink.flush().await?;
        }
        state.mark_flushed();
        if completed.fetched {
            if state.frontier.page_sunk(item, completed.total_pages).is_some() {
                state.frontier.progress().save().await?;
            }
        } else {
            state.frontier.page_failed(item);
        }
    } else if flushed {
        state.mark_flushed();
    }

    if !completed.expansions.is_empty() {
        let fresh: Vec<WorkItem> = completed
            .expansions
            .into_iter()
            .filter(|candidate| shared.force || !state.dedup.is_seen(&candidate.dedup_key()))
            .collect();
        let added = state.frontier.add_items(fresh);
        state.tally.expanded += added;
        debug!(url = %item.url, added, "expanded sub-listings");
    }

    if completed.fetched {
        if let Some(every) = shared.cooldown_every {
            if state.tally.succeeded as u64 % every == 0 {
                shared.pacer.pause_for(shared.cooldown).await;
            }
        }
    }
    Ok(())
}

fn document_extension(document: &str) -> &'static str {
    match document.trim_start().chars().next() {
        Some('{') | Some('[') => "json",
        _ => "html",
    }
}

/// Expansions of records already in the sink whose own items were never
/// sunk. Expanded items live only in memory, so a restart rebuilds them here.
async fn pending_expansions(
    sink_path: &Path,
    sources: &BTreeSet<&str>,
    dedup: &DedupStore,
) -> anyhow::Result<Vec<WorkItem>> {
    let load = load_ndjson::<ExtractedRecord>(sink_path)
        .await
        .with_context(|| format!("reading sunk records from {}", sink_path.display()))?;
    Ok(load
        .entries
        .iter()
        .filter(|record| !record.is_error() && sources.contains(record.source.as_str()))
        .flat_map(|record| expansion_items(record, &record.source_url))
        .filter(|item| !dedup.is_seen(&item.dedup_key()))
        .collect())
}

/// Sub-listing URLs of `record`, resolved against the page they came from.
fn expansion_items(record: &ExtractedRecord, base_url: &str) -> Vec<WorkItem> {
    let base = Url::parse(base_url).ok();
    record
        .sub_listings()
        .iter()
        .filter_map(|listing| listing.url.as_deref())
        .filter_map(|href| match &base {
            Some(base) => base.join(href).ok(),
            None => Url::parse(href).ok(),
        })
        .map(|url| WorkItem::single(url.to_string(), record.source.clone()))
        .collect()
}
