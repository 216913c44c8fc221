use crate::state::{SourceId, SourceState};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// One file to fetch, as discovered by a crawl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReference {
    pub source_id: SourceId,
    pub source_name: String,
    pub url: String,

    /// Final path segment of the URL; identical across sources for identical media
    pub content_key: String,

    /// Post time, applied as the file's modification time
    pub timestamp: Option<DateTime<Utc>>,

    /// `<root>/<source>/<content_key>`
    pub local_path: PathBuf,
}

impl DownloadReference {
    /// Builds a reference for `url` found on `source`
    ///
    /// Returns `None` when the URL has no usable content key.
    pub fn new(
        source: &SourceState,
        url: &str,
        unix_timestamp: Option<i64>,
        root: &Path,
    ) -> Option<Self> {
        let content_key = content_key(url)?;
        let local_path = root.join(source.name()).join(&content_key);
        let timestamp = unix_timestamp.and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        Some(Self {
            source_id: source.id(),
            source_name: source.name().to_string(),
            url: url.to_string(),
            content_key,
            timestamp,
            local_path,
        })
    }
}

impl fmt::Display for DownloadReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = self
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        write!(f, "{} - {} - {}", self.source_name, date, self.content_key)
    }
}

/// Derives the content key of a media URL: its last non-empty path segment
///
/// Segments that could escape the source directory are rejected.
pub fn content_key(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()?;

    if segment == "." || segment == ".." || segment.contains('\\') {
        return None;
    }
    Some(segment.to_string())
}
