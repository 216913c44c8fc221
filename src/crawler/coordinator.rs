//! Pass coordinator - wires the pipeline for one pass over all sources
//!
//! A pass:
//! - records a run and decides whether it is a full rescan
//! - scans the download directory into the dedup registry
//! - starts the rate limiter, one crawl and one finalizer per source, the
//!   fan-in merge, and the download worker pool
//! - waits for every stage, then records the outcome
//!
//! In server mode passes repeat with a sleep in between until shutdown.

use crate::config::Config;
use crate::crawler::fetcher::build_http_client;
use crate::crawler::merge::merge;
use crate::crawler::rate_limiter::RateLimiter;
use crate::crawler::shutdown::Shutdown;
use crate::crawler::source_crawl::{crawl_source, finalize_source, CrawlContext};
use crate::download::{scan_existing, spawn_workers, DedupRegistry, DownloadContext};
use crate::output::{GlobalStats, StatsSnapshot};
use crate::state::{PostId, SourceTable};
use crate::storage::{open_storage, RunCounters, RunStatus, SqliteStorage, Storage};
use crate::UpdateError;
use reqwest::Client;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Version recorded in the store after a successful pass
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main pipeline coordinator
pub struct Coordinator {
    config: Arc<Config>,
    storage: Arc<Mutex<SqliteStorage>>,
    stats: Arc<GlobalStats>,
    registry: Arc<DedupRegistry>,
    shutdown: Arc<Shutdown>,
    client: Client,
    current_run: Mutex<Option<(i64, StatsSnapshot)>>,
}

impl Coordinator {
    /// Creates a coordinator, opening the store at `output.database-path`
    ///
    /// # Arguments
    ///
    /// * `config` - The validated configuration
    /// * `shutdown` - Process-wide cancellation, shared with signal handlers
    pub fn new(config: Config, shutdown: Arc<Shutdown>) -> Result<Self, UpdateError> {
        let storage = open_storage(&config.output.database_path)?;
        Self::with_storage(config, storage, shutdown)
    }

    /// Creates a coordinator over an already opened store
    pub fn with_storage(
        config: Config,
        storage: SqliteStorage,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self, UpdateError> {
        let client = build_http_client(&config.api)?;

        Ok(Self {
            config: Arc::new(config),
            storage: Arc::new(Mutex::new(storage)),
            stats: Arc::new(GlobalStats::new()),
            registry: Arc::new(DedupRegistry::new()),
            shutdown,
            client,
            current_run: Mutex::new(None),
        })
    }

    /// Process-wide counters, for status printing
    pub fn stats(&self) -> Arc<GlobalStats> {
        Arc::clone(&self.stats)
    }

    /// Runs passes until done
    ///
    /// Without server mode this is a single pass. In server mode passes repeat
    /// every `sleep-time` seconds until shutdown; `force` only applies to the
    /// first pass.
    ///
    /// # Returns
    ///
    /// * `Ok(StatsSnapshot)` - Counters of the last pass
    /// * `Err(UpdateError::Cancelled)` - Interrupted by shutdown
    /// * `Err(UpdateError)` - A fatal error ended the pass
    pub async fn run(&self, force: bool) -> Result<StatsSnapshot, UpdateError> {
        let mut force = force;

        loop {
            let pass = self.run_pass(force).await?;
            if !self.config.downloader.server_mode {
                return Ok(pass);
            }
            force = false;

            let sleep = self.config.downloader.sleep_duration();
            tracing::info!("Server mode: next pass in {:?}", sleep);
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return Ok(pass),
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// Runs one pass over every configured source
    pub async fn run_pass(&self, force: bool) -> Result<StatsSnapshot, UpdateError> {
        let start = self.stats.snapshot();

        let (run_id, rescan) = {
            let mut storage = self.lock_storage();
            let stored = storage.load_version()?;
            let rescan = requires_rescan(stored.as_deref(), CRATE_VERSION);
            if rescan {
                tracing::info!(
                    "Stored version {} predates {}; rescanning every source",
                    stored.as_deref().unwrap_or("(none)"),
                    CRATE_VERSION
                );
            }
            (storage.create_run(CRATE_VERSION)?, rescan)
        };
        *self.lock_current_run() = Some((run_id, start));

        let force = force || self.config.downloader.force || rescan;
        tracing::info!("Starting run {} over {} sources", run_id, self.config.sources.len());

        let outcome = self.execute_pass(force).await;
        let counters = self.stats.snapshot().since(&start);

        let status = match &outcome {
            Ok(()) => RunStatus::Completed,
            Err(UpdateError::Cancelled) => RunStatus::Interrupted,
            Err(_) => RunStatus::Failed,
        };
        self.finish_current_run(status, counters)?;

        match outcome {
            Ok(()) => {
                self.lock_storage().save_version(CRATE_VERSION)?;
                tracing::info!(
                    "Run {} completed: {} found, {} downloaded, {} already existed, {} linked, {} failed",
                    run_id,
                    counters.found,
                    counters.downloaded,
                    counters.already_exists,
                    counters.linked,
                    counters.failed
                );
                Ok(counters)
            }
            Err(e) => Err(e),
        }
    }

    /// Marks the current run as interrupted with the counters so far
    ///
    /// Does nothing when no run is in progress.
    pub fn mark_interrupted(&self) -> Result<(), UpdateError> {
        let counters = match *self.lock_current_run() {
            Some((_, start)) => self.stats.snapshot().since(&start),
            None => return Ok(()),
        };
        self.finish_current_run(RunStatus::Interrupted, counters)
    }

    async fn execute_pass(&self, force: bool) -> Result<(), UpdateError> {
        let root = self.config.downloader.directory.clone();
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        tokio::task::spawn_blocking(move || scan_existing(&root, &registry, &stats)).await??;

        let sources = Arc::new(self.load_sources()?);
        let pass_token = self.shutdown.token().child_token();

        let limiter = Arc::new(RateLimiter::new(self.config.downloader.rate));
        let limiter_task = limiter.spawn(pass_token.clone());

        let crawl_ctx = Arc::new(CrawlContext {
            config: Arc::clone(&self.config),
            client: self.client.clone(),
            limiter: Arc::clone(&limiter),
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            shutdown: Arc::clone(&self.shutdown),
            force,
        });

        let mut crawls = JoinSet::new();
        let mut finalizers = JoinSet::new();
        let mut queues = Vec::with_capacity(sources.len());

        for source in sources.iter() {
            self.stats.register_source(Arc::clone(source));

            let (tx, rx) = mpsc::channel(self.config.downloader.queue_size.max(1));
            queues.push(rx);

            crawls.spawn(crawl_source(
                Arc::clone(&crawl_ctx),
                Arc::clone(source),
                tx,
            ));
            finalizers.spawn(finalize_source(
                Arc::clone(source),
                Arc::clone(&self.storage),
                Arc::clone(&self.stats),
                Arc::clone(&self.shutdown),
            ));
        }

        let num_downloaders = self.config.downloader.num_downloaders;
        let merged = merge(queues, num_downloaders.max(1), pass_token.clone());
        let download_ctx = Arc::new(DownloadContext {
            client: self.client.clone(),
            limiter: Arc::clone(&limiter),
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            shutdown: Arc::clone(&self.shutdown),
            sources: Arc::clone(&sources),
        });
        let mut workers = spawn_workers(num_downloaders, download_ctx, merged);

        drain("crawl", &mut crawls, &self.shutdown).await;
        tracing::debug!("All crawls finished");
        drain("download worker", &mut workers, &self.shutdown).await;
        tracing::debug!("All downloads done");
        drain("finalizer", &mut finalizers, &self.shutdown).await;

        pass_token.cancel();
        if let Err(e) = limiter_task.await {
            tracing::warn!("Rate limiter task failed: {}", e);
        }

        for source in sources.iter() {
            self.stats.deregister_source(source.id());
        }

        if let Some(fatal) = self.shutdown.take_fatal() {
            return Err(fatal);
        }
        if self.shutdown.is_triggered() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    /// Builds the pass's source table with stored watermarks
    fn load_sources(&self) -> Result<SourceTable, UpdateError> {
        let watermarks = self.lock_storage().load_watermarks()?;
        let mut table = SourceTable::new();

        for entry in &self.config.sources {
            let watermark = watermarks
                .get(&entry.name)
                .cloned()
                .unwrap_or_else(PostId::zero);
            table.insert(entry.name.clone(), entry.tag.clone(), watermark);
        }

        Ok(table)
    }

    fn finish_current_run(
        &self,
        status: RunStatus,
        counters: StatsSnapshot,
    ) -> Result<(), UpdateError> {
        let Some((run_id, _)) = self.lock_current_run().take() else {
            return Ok(());
        };
        self.lock_storage()
            .finish_run(run_id, status, &RunCounters::from(counters))?;
        Ok(())
    }

    fn lock_storage(&self) -> MutexGuard<'_, SqliteStorage> {
        self.storage.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_current_run(&self) -> MutexGuard<'_, Option<(i64, StatsSnapshot)>> {
        self.current_run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Joins every task in `set`, reporting panics as fatal
async fn drain(stage: &str, set: &mut JoinSet<()>, shutdown: &Shutdown) {
    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("A {} task panicked", stage);
                shutdown.fail(UpdateError::Task(e));
            }
        }
    }
}

/// Whether a store written by `stored` must be rescanned by `current`
///
/// Versions compare as `major.minor.patch`; an absent or unparsable stored
/// version always rescans.
pub fn requires_rescan(stored: Option<&str>, current: &str) -> bool {
    match (stored.and_then(parse_version), parse_version(current)) {
        (Some(stored), Some(current)) => stored < current,
        _ => true,
    }
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}
