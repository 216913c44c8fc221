use crate::state::PostId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Stable handle for a source within one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub usize);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle phase of a source
///
/// A source moves strictly forward: it crawls pages, then drains the downloads
/// and links it produced, then is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Crawling,
    Draining,
    Done,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceStatus::Crawling => "crawling",
            SourceStatus::Draining => "draining",
            SourceStatus::Done => "done",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct Watermarks {
    /// Persisted from a previous pass; only advanced after Done
    last_confirmed: PostId,

    /// Largest ID seen during this pass
    highest_seen: PostId,
}

/// Per-source crawl state and lifecycle controller
///
/// Tracks:
/// - the watermark pair used to stop paginating at already-processed posts
/// - outstanding obligations (queued downloads and link waiters)
/// - the Crawling → Draining → Done transition, which fires exactly once
/// - a one-shot stop signal that ends pagination early
#[derive(Debug)]
pub struct SourceState {
    id: SourceId,
    name: String,
    tag: Option<String>,
    watermarks: RwLock<Watermarks>,
    status: watch::Sender<SourceStatus>,
    pending: AtomicUsize,
    crawl_finished: AtomicBool,
    done_fired: AtomicBool,
    files_found: AtomicU64,
    files_processed: AtomicU64,
    stop: CancellationToken,
}

impl SourceState {
    pub fn new(
        id: SourceId,
        name: impl Into<String>,
        tag: Option<String>,
        last_confirmed: PostId,
    ) -> Self {
        let (status, _) = watch::channel(SourceStatus::Crawling);
        Self {
            id,
            name: name.into(),
            tag,
            watermarks: RwLock::new(Watermarks {
                highest_seen: last_confirmed.clone(),
                last_confirmed,
            }),
            status,
            pending: AtomicUsize::new(0),
            crawl_finished: AtomicBool::new(false),
            done_fired: AtomicBool::new(false),
            files_found: AtomicU64::new(0),
            files_processed: AtomicU64::new(0),
            stop: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn status(&self) -> SourceStatus {
        *self.status.borrow()
    }

    pub fn last_confirmed(&self) -> PostId {
        self.read_watermarks().last_confirmed.clone()
    }

    pub fn highest_seen(&self) -> PostId {
        self.read_watermarks().highest_seen.clone()
    }

    pub fn files_found(&self) -> u64 {
        self.files_found.load(Ordering::Relaxed)
    }

    pub fn files_processed(&self) -> u64 {
        self.files_processed.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Records a post ID seen on a page
    ///
    /// Raises `highest_seen` when `id` is larger and returns whether `id` is
    /// at or below the confirmed watermark.
    pub fn observe(&self, id: &PostId) -> bool {
        {
            let marks = self.read_watermarks();
            if *id <= marks.highest_seen {
                return *id <= marks.last_confirmed;
            }
        }

        let mut marks = self
            .watermarks
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if *id > marks.highest_seen {
            marks.highest_seen = id.clone();
        }
        *id <= marks.last_confirmed
    }

    /// Asks the crawl to stop paginating; safe to call more than once
    pub fn signal_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled by [`signal_stop`](Self::signal_stop)
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Registers a reference the source must wait for before it is done
    pub fn add_obligation(&self) {
        self.files_found.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Resolves one obligation (download finished, abandoned, or linked)
    pub fn complete_obligation(&self) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
        let before = self.pending.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(before > 0, "obligation count underflow for {}", self.name);
        if before == 1 && self.crawl_finished.load(Ordering::SeqCst) {
            self.fire_done();
        }
    }

    /// Counts a reference that was already on disk
    pub fn record_skip(&self) {
        self.files_found.fetch_add(1, Ordering::Relaxed);
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks the crawl side finished and moves to Draining
    ///
    /// Fires Done immediately when nothing is outstanding.
    pub fn finish_crawl(&self) {
        self.status.send_if_modified(|status| {
            if *status == SourceStatus::Crawling {
                *status = SourceStatus::Draining;
                true
            } else {
                false
            }
        });
        self.crawl_finished.store(true, Ordering::SeqCst);
        if self.pending.load(Ordering::SeqCst) == 0 {
            self.fire_done();
        }
    }

    fn fire_done(&self) {
        if self
            .done_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::debug!("Source '{}' is done", self.name);
            self.status.send_replace(SourceStatus::Done);
        }
    }

    /// Waits until the source reaches Done
    pub async fn wait_done(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|status| *status == SourceStatus::Done).await;
    }

    /// Promotes `highest_seen` to the confirmed watermark
    ///
    /// Only takes effect once the source is Done and only moves forward.
    /// Returns the new watermark when it advanced.
    pub fn confirm_watermark(&self) -> Option<PostId> {
        if self.status() != SourceStatus::Done {
            return None;
        }

        let mut marks = self
            .watermarks
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if marks.highest_seen > marks.last_confirmed {
            marks.last_confirmed = marks.highest_seen.clone();
            Some(marks.last_confirmed.clone())
        } else {
            None
        }
    }

    fn read_watermarks(&self) -> std::sync::RwLockReadGuard<'_, Watermarks> {
        self.watermarks.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns the sources of one pass, indexed by [`SourceId`]
#[derive(Debug, Default)]
pub struct SourceTable {
    sources: Vec<Arc<SourceState>>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source and returns its shared state
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        tag: Option<String>,
        last_confirmed: PostId,
    ) -> Arc<SourceState> {
        let id = SourceId(self.sources.len());
        let state = Arc::new(SourceState::new(id, name, tag, last_confirmed));
        self.sources.push(Arc::clone(&state));
        state
    }

    pub fn get(&self, id: SourceId) -> Option<&Arc<SourceState>> {
        self.sources.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SourceState>> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
