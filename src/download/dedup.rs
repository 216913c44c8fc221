//! Cross-source content deduplication
//!
//! The first task to claim a content key downloads it; every later claimant
//! waits for that download and hard-links the finished file into its own
//! source directory. Each key has a `watch` channel whose value moves from
//! `Pending` to a terminal state exactly once.

use crate::output::GlobalStats;
use crate::UpdateError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome of [`DedupRegistry::claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller is the downloader of record
    Download,
    /// Someone else downloads; the caller links
    Link,
}

/// State of one content key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Ready(PathBuf),
    /// The downloader gave up; waiters skip linking
    Unavailable,
}

/// Outcome of [`DedupRegistry::await_and_link`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked { bytes: u64 },
    /// The target already is the downloaded file
    SameFile,
    Unavailable,
}

/// Registry of content keys seen during this process
#[derive(Debug, Default)]
pub struct DedupRegistry {
    entries: DashMap<String, Arc<watch::Sender<EntryState>>>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`; exactly one caller per key gets [`Claim::Download`]
    pub fn claim(&self, key: &str) -> Claim {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Claim::Link,
            Entry::Vacant(vacant) => {
                let (tx, _) = watch::channel(EntryState::Pending);
                vacant.insert(Arc::new(tx));
                Claim::Download
            }
        }
    }

    /// Registers a file that is already on disk
    ///
    /// Returns the path of an earlier file with the same key, if one was
    /// registered before.
    pub fn register_existing(&self, key: &str, path: &Path) -> Option<PathBuf> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => match &*occupied.get().borrow() {
                EntryState::Ready(existing) => Some(existing.clone()),
                _ => None,
            },
            Entry::Vacant(vacant) => {
                let (tx, _) = watch::channel(EntryState::Ready(path.to_path_buf()));
                vacant.insert(Arc::new(tx));
                None
            }
        }
    }

    /// Publishes the downloaded file for `key`
    pub fn complete(&self, key: &str, path: &Path) {
        self.resolve(key, EntryState::Ready(path.to_path_buf()));
    }

    /// Marks `key` as permanently unavailable
    pub fn abandon(&self, key: &str) {
        self.resolve(key, EntryState::Unavailable);
    }

    fn resolve(&self, key: &str, state: EntryState) {
        let Some(sender) = self.sender(key) else {
            tracing::warn!("Resolving unclaimed content key '{}'", key);
            return;
        };
        sender.send_if_modified(|current| {
            if *current == EntryState::Pending {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Current state of `key`, if it was ever claimed or registered
    pub fn state(&self, key: &str) -> Option<EntryState> {
        self.sender(key).map(|sender| sender.borrow().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Waits until `key` leaves `Pending`
    pub async fn wait(&self, key: &str) -> EntryState {
        // Clone the sender out so no shard lock is held across the await
        let Some(sender) = self.sender(key) else {
            return EntryState::Unavailable;
        };
        let mut rx = sender.subscribe();
        let state = match rx.wait_for(|state| *state != EntryState::Pending).await {
            Ok(state) => state.clone(),
            Err(_) => EntryState::Unavailable,
        };
        state
    }

    /// Waits for `key` and hard-links the result to `target`
    ///
    /// The parent directory of `target` is created as needed and a different
    /// file already at `target` is replaced. Successful links add to the
    /// `linked` and `bytes_saved` counters.
    pub async fn await_and_link(
        &self,
        key: &str,
        target: &Path,
        stats: &GlobalStats,
    ) -> Result<LinkOutcome, UpdateError> {
        let source = match self.wait(key).await {
            EntryState::Ready(path) => path,
            EntryState::Unavailable | EntryState::Pending => {
                return Ok(LinkOutcome::Unavailable)
            }
        };

        let target = target.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || hard_link_replacing(&source, &target))
            .await??;

        if let LinkOutcome::Linked { bytes } = outcome {
            stats.linked.fetch_add(1, Ordering::Relaxed);
            stats.bytes_saved.fetch_add(bytes, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    fn sender(&self, key: &str) -> Option<Arc<watch::Sender<EntryState>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }
}

/// Makes `target` a hard link to `source`
///
/// Blocking; call from a blocking context.
pub fn hard_link_replacing(source: &Path, target: &Path) -> Result<LinkOutcome, UpdateError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| UpdateError::filesystem(parent, e))?;
    }

    let source_meta =
        std::fs::metadata(source).map_err(|e| UpdateError::filesystem(source, e))?;

    match std::fs::metadata(target) {
        Ok(target_meta) => {
            if same_file(&source_meta, &target_meta, source, target) {
                return Ok(LinkOutcome::SameFile);
            }
            std::fs::remove_file(target).map_err(|e| UpdateError::filesystem(target, e))?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(UpdateError::filesystem(target, e)),
    }

    std::fs::hard_link(source, target).map_err(|e| UpdateError::filesystem(target, e))?;
    Ok(LinkOutcome::Linked {
        bytes: source_meta.len(),
    })
}

#[cfg(unix)]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata, _: &Path, _: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_: &std::fs::Metadata, _: &std::fs::Metadata, a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_first_claim_downloads() {
        let registry = DedupRegistry::new();
        assert_eq!(registry.claim("abc.jpg"), Claim::Download);
        assert_eq!(registry.claim("abc.jpg"), Claim::Link);
        assert_eq!(registry.claim("other.jpg"), Claim::Download);
        assert_eq!(registry.state("abc.jpg"), Some(EntryState::Pending));
    }

    #[test]
    fn test_completion_fires_once() {
        let registry = DedupRegistry::new();
        registry.claim("abc.jpg");

        registry.complete("abc.jpg", Path::new("/a/abc.jpg"));
        registry.complete("abc.jpg", Path::new("/b/abc.jpg"));
        registry.abandon("abc.jpg");

        assert_eq!(
            registry.state("abc.jpg"),
            Some(EntryState::Ready(PathBuf::from("/a/abc.jpg")))
        );
    }

    #[test]
    fn test_register_existing_returns_first_path() {
        let registry = DedupRegistry::new();
        assert_eq!(registry.register_existing("k.jpg", Path::new("/a/k.jpg")), None);
        assert_eq!(
            registry.register_existing("k.jpg", Path::new("/b/k.jpg")),
            Some(PathBuf::from("/a/k.jpg"))
        );
        assert_eq!(registry.claim("k.jpg"), Claim::Link);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_one_download_many_links() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(DedupRegistry::new());
        let stats = Arc::new(GlobalStats::new());
        let claimants = 16;

        let mut handles = Vec::new();
        for i in 0..claimants {
            let registry = Arc::clone(&registry);
            let stats = Arc::clone(&stats);
            let root = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                let path = root.join(format!("source{}", i)).join("abc123.jpg");
                match registry.claim("abc123.jpg") {
                    Claim::Download => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                        std::fs::write(&path, b"0123456789").unwrap();
                        registry.complete("abc123.jpg", &path);
                        Claim::Download
                    }
                    Claim::Link => {
                        let outcome = registry
                            .await_and_link("abc123.jpg", &path, &stats)
                            .await
                            .unwrap();
                        assert_eq!(outcome, LinkOutcome::Linked { bytes: 10 });
                        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
                        Claim::Link
                    }
                }
            }));
        }

        let mut downloads = 0;
        for handle in handles {
            if handle.await.unwrap() == Claim::Download {
                downloads += 1;
            }
        }

        assert_eq!(downloads, 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.linked, claimants - 1);
        assert_eq!(snapshot.bytes_saved, 10 * (claimants - 1));
    }

    #[tokio::test]
    async fn test_wait_returns_completed_state() {
        let registry = Arc::new(DedupRegistry::new());
        registry.claim("late.jpg");

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait("late.jpg").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.complete("late.jpg", Path::new("/a/late.jpg"));

        assert_eq!(
            waiter.await.unwrap(),
            EntryState::Ready(PathBuf::from("/a/late.jpg"))
        );
        assert_eq!(registry.wait("never-claimed.jpg").await, EntryState::Unavailable);
    }

    #[tokio::test]
    async fn test_abandoned_key_skips_linking() {
        let dir = TempDir::new().unwrap();
        let registry = DedupRegistry::new();
        let stats = GlobalStats::new();
        registry.claim("gone.jpg");
        registry.abandon("gone.jpg");

        let target = dir.path().join("beta").join("gone.jpg");
        let outcome = registry
            .await_and_link("gone.jpg", &target, &stats)
            .await
            .unwrap();

        assert_eq!(outcome, LinkOutcome::Unavailable);
        assert!(!target.exists());
        assert_eq!(stats.snapshot().linked, 0);
    }

    #[tokio::test]
    async fn test_link_to_itself_is_not_counted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alpha").join("x.jpg");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"x").unwrap();

        let registry = DedupRegistry::new();
        let stats = GlobalStats::new();
        registry.claim("x.jpg");
        registry.complete("x.jpg", &path);

        let outcome = registry.await_and_link("x.jpg", &path, &stats).await.unwrap();
        assert_eq!(outcome, LinkOutcome::SameFile);
        assert_eq!(stats.snapshot().linked, 0);
    }

    #[test]
    fn test_hard_link_replaces_different_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("alpha").join("k.jpg");
        let target = dir.path().join("beta").join("k.jpg");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&source, b"original").unwrap();
        std::fs::write(&target, b"stale").unwrap();

        let outcome = hard_link_replacing(&source, &target).unwrap();
        assert_eq!(outcome, LinkOutcome::Linked { bytes: 8 });
        assert_eq!(std::fs::read(&target).unwrap(), b"original");

        // Linking again is a no-op
        assert_eq!(
            hard_link_replacing(&source, &target).unwrap(),
            LinkOutcome::SameFile
        );
    }
}
