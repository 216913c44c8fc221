//! Crawler module - the concurrent side of a pass
//!
//! This module contains the crawl pipeline, including:
//! - HTTP fetching, page URLs, and retry delays
//! - API payload decoding and media extraction
//! - The shared rate limiter
//! - Per-source crawls and their finalizers
//! - Fan-in of per-source queues
//! - Shutdown and pass coordination

mod coordinator;
mod fetcher;
mod merge;
mod parser;
mod rate_limiter;
mod shutdown;
mod source_crawl;

pub use coordinator::{requires_rescan, Coordinator, CRATE_VERSION};
pub use fetcher::{
    build_http_client, classify_status, fetch_page, page_url, retry_delay, trim_js, FetchResult,
    StatusClass, RETRY_BASE_DELAY, RETRY_MAX_DELAY,
};
pub use merge::merge;
pub use parser::{decode_page, extract_media, DecodedPage, Photo, Post, PostKind};
pub use rate_limiter::{Admission, LimiterClosed, RateLimiter, BURST_FACTOR};
pub use shutdown::Shutdown;
pub use source_crawl::{crawl_source, finalize_source, CrawlContext};
