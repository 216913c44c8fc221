//! Download worker pool
//!
//! A fixed number of workers share the merged queue. Each worker takes a
//! token from the shared rate limiter per attempt, streams the body into a
//! `.part` sibling and renames it into place once complete. Transient failures
//! retry forever with a capped delay; a missing remote file abandons the
//! content key so link waiters stop waiting. Local filesystem errors latch a
//! fatal error in [`Shutdown`] and cancel the pass.

use crate::crawler::{classify_status, retry_delay, Admission, RateLimiter, Shutdown, StatusClass};
use crate::download::dedup::DedupRegistry;
use crate::download::reference::DownloadReference;
use crate::download::scan::PARTIAL_SUFFIX;
use crate::output::GlobalStats;
use crate::state::SourceTable;
use crate::UpdateError;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Everything a worker needs, shared by the whole pool
#[derive(Debug)]
pub struct DownloadContext {
    pub client: Client,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<DedupRegistry>,
    pub stats: Arc<GlobalStats>,
    pub shutdown: Arc<Shutdown>,
    pub sources: Arc<SourceTable>,
}

/// Outcome of one download attempt
#[derive(Debug)]
enum Transfer {
    Saved { bytes: u64 },
    Missing { status_code: u16 },
    Retry { error: String },
}

/// Final outcome of a reference after all retries
#[derive(Debug)]
enum Delivery {
    Saved { bytes: u64 },
    Missing { status_code: u16 },
    Stopped,
}

/// Spawns `count` workers draining `queue`
///
/// The returned set completes once the queue is closed and empty, or once
/// shutdown is triggered.
pub fn spawn_workers(
    count: usize,
    ctx: Arc<DownloadContext>,
    queue: mpsc::Receiver<DownloadReference>,
) -> JoinSet<()> {
    let queue = Arc::new(Mutex::new(queue));
    let mut workers = JoinSet::new();

    for worker_id in 0..count.max(1) {
        let ctx = Arc::clone(&ctx);
        let queue = Arc::clone(&queue);
        workers.spawn(async move { run_worker(worker_id, ctx, queue).await });
    }

    workers
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<DownloadContext>,
    queue: Arc<Mutex<mpsc::Receiver<DownloadReference>>>,
) {
    let cancel = ctx.shutdown.token();
    tracing::trace!("Download worker {} started", worker_id);

    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = queue.recv() => item,
            }
        };
        let Some(reference) = next else {
            break;
        };

        process_reference(&ctx, reference).await;
    }

    tracing::trace!("Download worker {} finished", worker_id);
}

async fn process_reference(ctx: &DownloadContext, reference: DownloadReference) {
    match deliver(ctx, &reference).await {
        Ok(Delivery::Saved { bytes }) => {
            ctx.stats.downloaded.fetch_add(1, Ordering::Relaxed);
            ctx.stats.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
            ctx.registry
                .complete(&reference.content_key, &reference.local_path);
            tracing::debug!("Downloaded {}", reference);
        }
        Ok(Delivery::Missing { status_code }) => {
            ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
            ctx.registry.abandon(&reference.content_key);
            tracing::warn!(
                "[{}] Giving up on {} (HTTP {})",
                reference.source_name,
                reference.url,
                status_code
            );
        }
        Ok(Delivery::Stopped) => return,
        Err(e) => {
            // Latch before waking link waiters so no finalizer sees Done first
            ctx.shutdown.fail(e);
            ctx.registry.abandon(&reference.content_key);
            return;
        }
    }

    if let Some(source) = ctx.sources.get(reference.source_id) {
        source.complete_obligation();
    }
}

/// Retries `transfer` until it succeeds, fails permanently, or shutdown fires
async fn deliver(
    ctx: &DownloadContext,
    reference: &DownloadReference,
) -> Result<Delivery, UpdateError> {
    let cancel = ctx.shutdown.token();
    let mut attempt = 0;

    loop {
        if ctx.limiter.acquire_or_stop(&cancel).await == Admission::Stopped {
            return Ok(Delivery::Stopped);
        }

        match transfer(&ctx.client, reference).await? {
            Transfer::Saved { bytes } => {
                set_mtime(reference).await;
                return Ok(Delivery::Saved { bytes });
            }
            Transfer::Missing { status_code } => return Ok(Delivery::Missing { status_code }),
            Transfer::Retry { error } => {
                let delay = retry_delay(attempt);
                tracing::warn!(
                    "[{}] {} failed: {}; retrying in {:?}",
                    reference.source_name,
                    reference.url,
                    error,
                    delay
                );
                attempt = attempt.saturating_add(1);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(Delivery::Stopped),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// One GET of `reference`, streamed to disk
///
/// Network failures come back as [`Transfer::Retry`]; only local filesystem
/// failures are errors.
async fn transfer(client: &Client, reference: &DownloadReference) -> Result<Transfer, UpdateError> {
    let mut response = match client.get(reference.url.as_str()).send().await {
        Ok(response) => response,
        Err(e) => {
            return Ok(Transfer::Retry {
                error: e.to_string(),
            })
        }
    };

    let status = response.status();
    match classify_status(status) {
        StatusClass::Success => {}
        StatusClass::NotFound | StatusClass::Rejected => {
            return Ok(Transfer::Missing {
                status_code: status.as_u16(),
            })
        }
        StatusClass::Retryable => {
            return Ok(Transfer::Retry {
                error: format!("HTTP {}", status.as_u16()),
            })
        }
    }

    let part = partial_path(&reference.local_path);
    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| UpdateError::filesystem(parent, e))?;
    }

    let file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| UpdateError::filesystem(&part, e))?;
    let mut writer = BufWriter::new(file);
    let mut bytes = 0u64;

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| UpdateError::filesystem(&part, e))?;
                bytes += chunk.len() as u64;
            }
            Ok(None) => break,
            Err(e) => {
                drop(writer);
                if let Err(remove_err) = tokio::fs::remove_file(&part).await {
                    tracing::debug!("Could not remove {}: {}", part.display(), remove_err);
                }
                return Ok(Transfer::Retry {
                    error: format!("Failed to read body: {}", e),
                });
            }
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| UpdateError::filesystem(&part, e))?;
    drop(writer);

    tokio::fs::rename(&part, &reference.local_path)
        .await
        .map_err(|e| UpdateError::filesystem(&reference.local_path, e))?;

    Ok(Transfer::Saved { bytes })
}

/// `<path>.part`
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Applies the post timestamp as modification time; failures only warn
async fn set_mtime(reference: &DownloadReference) {
    let Some(timestamp) = reference.timestamp else {
        return;
    };
    let path = reference.local_path.clone();
    let modified = SystemTime::from(timestamp);

    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(modified))
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Could not set mtime of {}: {}", reference, e),
        Err(e) => tracing::warn!("Could not set mtime of {}: {}", reference, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PostId;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        ctx: Arc<DownloadContext>,
        cancel: CancellationToken,
        _dir: TempDir,
        root: PathBuf,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let mut table = SourceTable::new();
        table.insert("demo", None, PostId::zero());

        let limiter = Arc::new(RateLimiter::new(1000));
        let cancel = CancellationToken::new();
        limiter.spawn(cancel.clone());

        let ctx = Arc::new(DownloadContext {
            client: Client::new(),
            limiter,
            registry: Arc::new(DedupRegistry::new()),
            stats: Arc::new(GlobalStats::new()),
            shutdown: Arc::new(Shutdown::new()),
            sources: Arc::new(table),
        });

        Harness {
            ctx,
            cancel,
            _dir: dir,
            root,
        }
    }

    fn reference(h: &Harness, url: String, timestamp: Option<i64>) -> DownloadReference {
        let source = h.ctx.sources.get(crate::state::SourceId(0)).unwrap();
        source.add_obligation();
        h.ctx.registry.claim(&crate::download::content_key(&url).unwrap());
        DownloadReference::new(source, &url, timestamp, &h.root).unwrap()
    }

    async fn run_one(h: &Harness, reference: DownloadReference) {
        let (tx, rx) = mpsc::channel(1);
        tx.send(reference).await.unwrap();
        drop(tx);
        let mut workers = spawn_workers(2, Arc::clone(&h.ctx), rx);
        while workers.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_download_writes_file_and_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/abc123.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-bytes".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        let url = format!("{}/media/abc123.jpg", server.uri());
        let r = reference(&h, url, Some(1_500_000_000));
        let local = r.local_path.clone();
        run_one(&h, r).await;

        assert_eq!(std::fs::read(&local).unwrap(), b"image-bytes");
        assert!(!partial_path(&local).exists());

        let modified = std::fs::metadata(&local).unwrap().modified().unwrap();
        let expected = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_500_000_000);
        assert_eq!(modified, expected);

        let snapshot = h.ctx.stats.snapshot();
        assert_eq!(snapshot.downloaded, 1);
        assert_eq!(snapshot.bytes_downloaded, 11);
        assert_eq!(
            h.ctx.registry.state("abc123.jpg"),
            Some(crate::download::EntryState::Ready(local))
        );
        assert_eq!(h.ctx.sources.get(crate::state::SourceId(0)).unwrap().pending(), 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_file_is_abandoned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        let r = reference(&h, format!("{}/media/gone.jpg", server.uri()), None);
        let local = r.local_path.clone();
        run_one(&h, r).await;

        assert!(!local.exists());
        assert_eq!(h.ctx.stats.snapshot().failed, 1);
        assert_eq!(
            h.ctx.registry.state("gone.jpg"),
            Some(crate::download::EntryState::Unavailable)
        );
        assert_eq!(h.ctx.sources.get(crate::state::SourceId(0)).unwrap().pending(), 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let h = harness();
        let r = reference(&h, format!("{}/media/flaky.jpg", server.uri()), None);
        let local = r.local_path.clone();
        run_one(&h, r).await;

        assert_eq!(std::fs::read(&local).unwrap(), b"ok");
        assert_eq!(h.ctx.stats.snapshot().failed, 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;

        let h = harness();
        // A regular file where the source directory should be
        std::fs::write(h.root.join("demo"), b"not a directory").unwrap();

        let r = reference(&h, format!("{}/media/x.jpg", server.uri()), None);
        let registry = Arc::clone(&h.ctx.registry);
        let shutdown = Arc::clone(&h.ctx.shutdown);
        // Whoever wakes on the abandoned key must already see the shutdown
        let waiter = tokio::spawn(async move {
            let state = registry.wait("x.jpg").await;
            (state, shutdown.is_triggered())
        });
        run_one(&h, r).await;

        let (state, triggered_before_wake) = waiter.await.unwrap();
        assert_eq!(state, crate::download::EntryState::Unavailable);
        assert!(triggered_before_wake);
        assert!(h.ctx.shutdown.is_triggered());
        assert!(matches!(
            h.ctx.shutdown.take_fatal(),
            Some(UpdateError::Filesystem { .. })
        ));
        assert_eq!(h.ctx.stats.snapshot().downloaded, 0);
        h.cancel.cancel();
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/data/demo/abc.jpg")),
            PathBuf::from("/data/demo/abc.jpg.part")
        );
    }
}
