//! Per-source crawl and finalization
//!
//! A crawl walks a source's pages newest first. Each fetched page is handed
//! to a spawned unit that decides and queues its posts while the next page is
//! fetched; the unit that meets the confirmed watermark signals the source to
//! stop paginating. When the crawl side is finished the source drains its
//! outstanding downloads and links, and the finalizer persists the new
//! watermark.

use crate::config::Config;
use crate::crawler::fetcher::{fetch_page, page_url, retry_delay, FetchResult};
use crate::crawler::parser::{decode_page, extract_media, Post};
use crate::crawler::rate_limiter::RateLimiter;
use crate::crawler::shutdown::Shutdown;
use crate::download::{Claim, DedupRegistry, DownloadReference, LinkOutcome};
use crate::output::GlobalStats;
use crate::state::SourceState;
use crate::storage::{SqliteStorage, Storage};
use reqwest::Client;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Shared collaborators of every crawl in a pass
#[derive(Debug)]
pub struct CrawlContext {
    pub config: Arc<Config>,
    pub client: Client,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<DedupRegistry>,
    pub stats: Arc<GlobalStats>,
    pub shutdown: Arc<Shutdown>,

    /// Ignore confirmed watermarks
    pub force: bool,
}

/// Crawls one source until it runs out of pages, meets its watermark, or
/// shutdown fires
///
/// References to download go to `queue`; the sender is dropped when the crawl
/// side finishes, after which the source moves to Draining.
pub async fn crawl_source(
    ctx: Arc<CrawlContext>,
    source: Arc<SourceState>,
    queue: mpsc::Sender<DownloadReference>,
) {
    let page_size = ctx.config.api.page_size;
    let endpoint = ctx.config.api.endpoint_for(source.name());
    let mut units = JoinSet::new();
    let mut page = 1u32;

    tracing::info!(
        "[{}] Crawling (watermark {}{})",
        source.name(),
        source.last_confirmed(),
        if ctx.force { ", forced" } else { "" }
    );

    loop {
        let Some(body) = fetch_with_retry(&ctx, &source, &endpoint, page).await else {
            break;
        };
        ctx.stats
            .bytes_overhead
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        let decoded = match decode_page(&body) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("[{}] Malformed page {}: {}", source.name(), page, e);
                break;
            }
        };

        if page == 1 {
            if let Some(total) = decoded.posts_total {
                tracing::debug!("[{}] {} posts in total", source.name(), total);
            }
        }
        tracing::debug!(
            "[{}] Page {}: {} posts",
            source.name(),
            page,
            decoded.item_count
        );

        let item_count = decoded.item_count;
        units.spawn(process_page(
            Arc::clone(&ctx),
            Arc::clone(&source),
            queue.clone(),
            decoded.posts,
        ));

        if item_count < page_size as usize || source.is_stopped() {
            break;
        }
        page += 1;
    }

    while let Some(result) = units.join_next().await {
        if let Err(e) = result {
            tracing::warn!("[{}] Page unit failed: {}", source.name(), e);
        }
    }
    drop(queue);

    source.finish_crawl();
    tracing::info!(
        "[{}] Crawl finished after {} pages, {} files found",
        source.name(),
        page,
        source.files_found()
    );
}

/// Fetches one page, retrying transient failures
///
/// Returns `None` when the crawl should end: the source stopped, shutdown
/// fired, or the page cannot be fetched at all.
async fn fetch_with_retry(
    ctx: &CrawlContext,
    source: &SourceState,
    endpoint: &str,
    page: u32,
) -> Option<String> {
    let url = match page_url(endpoint, page, ctx.config.api.page_size, source.tag()) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!("[{}] Invalid endpoint '{}': {}", source.name(), endpoint, e);
            return None;
        }
    };

    let cancel = ctx.shutdown.token();
    let mut attempt = 0;

    loop {
        let admitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = source.stop_token().cancelled() => false,
            result = ctx.limiter.acquire() => result.is_ok(),
        };
        if !admitted {
            return None;
        }

        match fetch_page(&ctx.client, &url).await {
            FetchResult::Success { body, .. } => return Some(body),
            FetchResult::NotFound { status_code } if page == 1 => {
                tracing::warn!(
                    "[{}] Source does not exist (HTTP {}); skipping",
                    source.name(),
                    status_code
                );
                return None;
            }
            FetchResult::NotFound { status_code } | FetchResult::Rejected { status_code } => {
                tracing::warn!(
                    "[{}] Page {} returned HTTP {}; ending crawl",
                    source.name(),
                    page,
                    status_code
                );
                return None;
            }
            FetchResult::Retryable { error } => {
                let delay = retry_delay(attempt);
                tracing::warn!(
                    "[{}] Page {} failed: {}; retrying in {:?}",
                    source.name(),
                    page,
                    error,
                    delay
                );
                attempt = attempt.saturating_add(1);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Decides and queues the posts of one page, in page order
async fn process_page(
    ctx: Arc<CrawlContext>,
    source: Arc<SourceState>,
    queue: mpsc::Sender<DownloadReference>,
    posts: Vec<Post>,
) {
    let root = ctx.config.downloader.directory.clone();

    for post in posts {
        if ctx.shutdown.is_triggered() {
            return;
        }

        let confirmed = source.observe(&post.id);
        if confirmed && !ctx.force {
            tracing::debug!(
                "[{}] Reached confirmed post {}; stopping",
                source.name(),
                post.id
            );
            source.signal_stop();
            break;
        }

        for url in extract_media(&post, &ctx.config.media) {
            match DownloadReference::new(&source, &url, post.unix_timestamp, &root) {
                Some(reference) => queue_reference(&ctx, &source, &queue, reference).await,
                None => tracing::debug!("[{}] No content key in {}", source.name(), url),
            }
        }
    }
}

async fn queue_reference(
    ctx: &Arc<CrawlContext>,
    source: &Arc<SourceState>,
    queue: &mpsc::Sender<DownloadReference>,
    reference: DownloadReference,
) {
    if tokio::fs::try_exists(&reference.local_path)
        .await
        .unwrap_or(false)
    {
        source.record_skip();
        ctx.stats.already_exists.fetch_add(1, Ordering::Relaxed);
        return;
    }

    ctx.stats.found.fetch_add(1, Ordering::Relaxed);
    source.add_obligation();

    match ctx.registry.claim(&reference.content_key) {
        Claim::Download => {
            tracing::trace!("Queued {}", reference);
            if let Err(mpsc::error::SendError(reference)) = queue.send(reference).await {
                // Queue closed by shutdown
                ctx.registry.abandon(&reference.content_key);
                source.complete_obligation();
            }
        }
        Claim::Link => {
            tokio::spawn(link_reference(
                Arc::clone(ctx),
                Arc::clone(source),
                reference,
            ));
        }
    }
}

/// Waits for another source's download of the same content and links it
async fn link_reference(
    ctx: Arc<CrawlContext>,
    source: Arc<SourceState>,
    reference: DownloadReference,
) {
    let cancel = ctx.shutdown.token();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = ctx.registry.await_and_link(
            &reference.content_key,
            &reference.local_path,
            &ctx.stats,
        ) => result,
    };

    match result {
        Ok(LinkOutcome::Linked { .. }) => tracing::debug!("Linked {}", reference),
        Ok(LinkOutcome::SameFile) => {}
        Ok(LinkOutcome::Unavailable) => {
            tracing::debug!("Nothing to link for {}", reference)
        }
        Err(e) => {
            ctx.shutdown.fail(e);
            return;
        }
    }
    source.complete_obligation();
}

/// Persists the source's watermark once it is Done
///
/// Returns without writing if shutdown fires first. Storage failures are
/// fatal for the pass.
pub async fn finalize_source(
    source: Arc<SourceState>,
    storage: Arc<Mutex<SqliteStorage>>,
    stats: Arc<GlobalStats>,
    shutdown: Arc<Shutdown>,
) {
    tokio::select! {
        biased;
        _ = shutdown.triggered() => {
            tracing::debug!("[{}] Not done at shutdown; watermark kept", source.name());
            return;
        }
        _ = source.wait_done() => {}
    }

    if let Some(watermark) = source.confirm_watermark() {
        let saved = {
            let mut storage = storage.lock().unwrap_or_else(|e| e.into_inner());
            storage.save_watermark(source.name(), &watermark)
        };
        match saved {
            Ok(true) => tracing::info!("[{}] Watermark advanced to {}", source.name(), watermark),
            Ok(false) => tracing::debug!("[{}] Stored watermark already ahead", source.name()),
            Err(e) => {
                shutdown.fail(e.into());
                return;
            }
        }
    }

    tracing::info!(
        "[{}] Done: {}/{} files processed",
        source.name(),
        source.files_processed(),
        source.files_found()
    );
    stats.deregister_source(source.id());
}
