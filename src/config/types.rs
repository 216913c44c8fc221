use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default URL template for the read API; `{name}` is replaced by the blog name
pub const DEFAULT_API_BASE: &str = "https://{name}.tumblr.com/api/read/json";

/// Number of posts the read API returns per page at most
pub const MAX_PAGE_SIZE: u32 = 50;

/// Main configuration structure for tumblr-update
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceEntry>,
}

/// Pipeline behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Size of the download worker pool
    #[serde(rename = "num-downloaders")]
    pub num_downloaders: usize,

    /// Requests per second shared by crawling and downloading
    pub rate: u32,

    /// Ignore stored watermarks and rescan every page of every source
    pub force: bool,

    /// Keep running passes forever, sleeping in between
    #[serde(rename = "server-mode")]
    pub server_mode: bool,

    /// Seconds to sleep between server-mode passes
    #[serde(rename = "sleep-time")]
    pub sleep_time: u64,

    /// Root directory downloads are written under
    pub directory: PathBuf,

    /// Bound of each source's output queue
    #[serde(rename = "queue-size")]
    pub queue_size: usize,
}

impl DownloaderConfig {
    /// Returns the server-mode sleep as a Duration
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.sleep_time)
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            num_downloaders: 10,
            rate: 4,
            force: false,
            server_mode: false,
            sleep_time: 3600,
            directory: PathBuf::from("downloads"),
            queue_size: 10_000,
        }
    }
}

/// Which kinds of media to collect
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    #[serde(rename = "ignore-photos")]
    pub ignore_photos: bool,

    #[serde(rename = "ignore-videos")]
    pub ignore_videos: bool,
}

/// Remote API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// URL template for a source's read endpoint, containing `{name}`
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Posts requested per page
    #[serde(rename = "page-size")]
    pub page_size: u32,

    /// User-Agent header sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,
}

impl ApiConfig {
    /// Builds the read endpoint for a single source
    pub fn endpoint_for(&self, name: &str) -> String {
        self.base_url.replace("{name}", name)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            page_size: MAX_PAGE_SIZE,
            user_agent: format!("tumblr-update/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Path to the SQLite database holding watermarks and run history
    #[serde(rename = "database-path")]
    pub database_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("tumblr-update.db"),
        }
    }
}

/// One blog to crawl, with an optional tag filter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceEntry {
    pub name: String,

    #[serde(default)]
    pub tag: Option<String>,
}

impl SourceEntry {
    pub fn new(name: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            name: name.into(),
            tag,
        }
    }
}
