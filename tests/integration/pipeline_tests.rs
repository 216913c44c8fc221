//! End-to-end passes over mocked blogs
//!
//! Every blog is served under `/<name>/api/read/json` and every media file
//! under `/media/`, both by the same mock server.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tumblr_update::config::{Config, SourceEntry};
use tumblr_update::crawler::{Coordinator, Shutdown, CRATE_VERSION};
use tumblr_update::state::PostId;
use tumblr_update::storage::{RunStatus, SqliteStorage, Storage};
use tumblr_update::UpdateError;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestEnv {
    _dir: TempDir,
    root: PathBuf,
    db_path: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path().join("downloads");
        let db_path = dir.path().join("state.db");
        Self {
            _dir: dir,
            root,
            db_path,
        }
    }

    /// Stores watermarks and the current version so the pass is incremental
    fn seed(&self, watermarks: &[(&str, u64)]) {
        let mut storage = SqliteStorage::new(&self.db_path).expect("Failed to open storage");
        storage
            .save_version(CRATE_VERSION)
            .expect("Failed to save version");
        for (name, id) in watermarks {
            storage
                .save_watermark(name, &PostId::from(*id))
                .expect("Failed to save watermark");
        }
    }

    fn config(&self, server: &MockServer, sources: &[&str]) -> Config {
        let mut config = Config::default();
        config.downloader.directory = self.root.clone();
        config.downloader.rate = 1000;
        config.downloader.num_downloaders = 4;
        config.output.database_path = self.db_path.clone();
        config.api.base_url = format!("{}/{{name}}/api/read/json", server.uri());
        config.sources = sources
            .iter()
            .map(|name| SourceEntry::new(*name, None))
            .collect();
        config
    }

    fn storage(&self) -> SqliteStorage {
        SqliteStorage::new(&self.db_path).expect("Failed to reopen storage")
    }
}

/// A page of photo posts, newest first, wrapped like the real API does
fn photo_page(server: &MockServer, ids: impl Iterator<Item = u64>) -> String {
    let posts: Vec<_> = ids
        .map(|id| {
            json!({
                "id": id,
                "type": "photo",
                "unix-timestamp": 1_500_000_000u64 + id,
                "photo-url-1280": format!("{}/media/{}.jpg", server.uri(), id),
            })
        })
        .collect();
    format!(
        "var tumblr_api_read = {};",
        json!({ "posts-total": 150, "posts": posts })
    )
}

async fn mount_page(server: &MockServer, name: &str, start: u32, body: String) {
    Mock::given(method("GET"))
        .and(path(format!("/{}/api/read/json", name)))
        .and(query_param("start", start.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn mount_empty_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/[a-z]+/api/read/json$"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"posts": []}"#))
        .mount(server)
        .await;
}

fn run_pass_coordinator(config: Config) -> Coordinator {
    Coordinator::new(config, Arc::new(Shutdown::new())).expect("Failed to create coordinator")
}

fn file(root: &Path, source: &str, name: &str) -> PathBuf {
    root.join(source).join(name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_incremental_pass_stops_at_watermark() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    env.seed(&[("alpha", 100)]);

    mount_page(&server, "alpha", 0, photo_page(&server, (101..=150).rev())).await;
    mount_page(&server, "alpha", 50, photo_page(&server, (51..=100).rev())).await;
    mount_empty_pages(&server).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
        .expect(50)
        .mount(&server)
        .await;

    let coordinator = run_pass_coordinator(env.config(&server, &["alpha"]));
    let counters = coordinator.run_pass(false).await.expect("Pass failed");

    assert_eq!(counters.found, 50);
    assert_eq!(counters.downloaded, 50);
    assert_eq!(counters.bytes_downloaded, 200);
    assert!(file(&env.root, "alpha", "150.jpg").exists());
    assert!(file(&env.root, "alpha", "101.jpg").exists());
    assert!(!file(&env.root, "alpha", "100.jpg").exists());

    let storage = env.storage();
    assert_eq!(
        storage.load_watermark("alpha").unwrap(),
        Some(PostId::from(150u64))
    );
    let run = storage.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.downloaded, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_content_downloaded_once_and_linked() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    env.seed(&[]);

    let shared = |id: u64| {
        format!(
            "var tumblr_api_read = {};",
            json!({ "posts": [{
                "id": id,
                "type": "photo",
                "photo-url-1280": format!("{}/media/abc123.jpg", server.uri()),
            }]})
        )
    };
    mount_page(&server, "alpha", 0, shared(10)).await;
    mount_page(&server, "beta", 0, shared(20)).await;

    Mock::given(method("GET"))
        .and(path("/media/abc123.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"shared image".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = run_pass_coordinator(env.config(&server, &["alpha", "beta"]));
    let counters = coordinator.run_pass(false).await.expect("Pass failed");

    assert_eq!(counters.downloaded, 1);
    assert_eq!(counters.linked, 1);
    assert_eq!(counters.bytes_saved, 12);

    let alpha = file(&env.root, "alpha", "abc123.jpg");
    let beta = file(&env.root, "beta", "abc123.jpg");
    assert_eq!(std::fs::read(&alpha).unwrap(), b"shared image");
    assert_eq!(std::fs::read(&beta).unwrap(), b"shared image");

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let a = std::fs::metadata(&alpha).unwrap();
        let b = std::fs::metadata(&beta).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert_eq!(a.nlink(), 2);
    }

    let storage = env.storage();
    assert_eq!(
        storage.load_watermark("alpha").unwrap(),
        Some(PostId::from(10u64))
    );
    assert_eq!(
        storage.load_watermark("beta").unwrap(),
        Some(PostId::from(20u64))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_up_to_date_source_queues_nothing() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    env.seed(&[("alpha", 150)]);

    mount_page(&server, "alpha", 0, photo_page(&server, (101..=150).rev())).await;
    mount_empty_pages(&server).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/media/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let coordinator = run_pass_coordinator(env.config(&server, &["alpha"]));
    let counters = coordinator.run_pass(false).await.expect("Pass failed");

    assert_eq!(counters.found, 0);
    assert_eq!(counters.downloaded, 0);
    assert!(!env.root.join("alpha").exists());
    assert_eq!(
        env.storage().load_watermark("alpha").unwrap(),
        Some(PostId::from(150u64))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_write_failure_fails_pass_with_counters() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    env.seed(&[]);

    // A regular file where the source directory belongs
    std::fs::create_dir_all(&env.root).unwrap();
    std::fs::write(env.root.join("alpha"), b"in the way").unwrap();

    mount_page(&server, "alpha", 0, photo_page(&server, [7u64].into_iter())).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
        .mount(&server)
        .await;

    let coordinator = run_pass_coordinator(env.config(&server, &["alpha"]));
    let result = coordinator.run_pass(false).await;

    assert!(matches!(result, Err(UpdateError::Filesystem { .. })));
    let snapshot = coordinator.stats().snapshot();
    assert_eq!(snapshot.found, 1);
    assert_eq!(snapshot.downloaded, 0);

    let storage = env.storage();
    let run = storage.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counters.found, 1);
    assert_eq!(storage.load_watermark("alpha").unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_source_is_skipped() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    env.seed(&[]);

    Mock::given(method("GET"))
        .and(path("/ghost/api/read/json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    mount_page(&server, "alpha", 0, photo_page(&server, [3u64].into_iter())).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
        .mount(&server)
        .await;

    let coordinator = run_pass_coordinator(env.config(&server, &["ghost", "alpha"]));
    let counters = coordinator.run_pass(false).await.expect("Pass failed");

    assert_eq!(counters.downloaded, 1);
    assert!(file(&env.root, "alpha", "3.jpg").exists());
    assert_eq!(env.storage().load_watermark("ghost").unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_version_forces_rescan() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    {
        // Watermark without a stored version
        let mut storage = SqliteStorage::new(&env.db_path).unwrap();
        storage
            .save_watermark("alpha", &PostId::from(150u64))
            .unwrap();
    }

    mount_page(&server, "alpha", 0, photo_page(&server, (148..=150).rev())).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
        .expect(3)
        .mount(&server)
        .await;

    let coordinator = run_pass_coordinator(env.config(&server, &["alpha"]));
    let counters = coordinator.run_pass(false).await.expect("Pass failed");

    assert_eq!(counters.downloaded, 3);
    assert_eq!(
        env.storage().load_version().unwrap().as_deref(),
        Some(CRATE_VERSION)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_page_retried_after_server_error() {
    let server = MockServer::start().await;
    let env = TestEnv::new();
    env.seed(&[]);

    // Mounted first so it answers the first two page requests
    Mock::given(method("GET"))
        .and(path("/alpha/api/read/json"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_page(&server, "alpha", 0, photo_page(&server, [7u64].into_iter())).await;
    Mock::given(method("GET"))
        .and(path("/media/7.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = run_pass_coordinator(env.config(&server, &["alpha"]));
    let counters = coordinator.run_pass(false).await.expect("Pass failed");

    assert_eq!(counters.found, 1);
    assert_eq!(counters.downloaded, 1);
    assert!(file(&env.root, "alpha", "7.jpg").exists());
    assert_eq!(
        env.storage().load_watermark("alpha").unwrap(),
        Some(PostId::from(7u64))
    );
}
