//! Download side of the pipeline
//!
//! This module handles:
//! - Download references produced by crawls
//! - Cross-source deduplication with hard links
//! - The startup scan of already-downloaded files
//! - The download worker pool

mod dedup;
mod reference;
mod scan;
mod worker;

pub use dedup::{hard_link_replacing, Claim, DedupRegistry, EntryState, LinkOutcome};
pub use reference::{content_key, DownloadReference};
pub use scan::{scan_existing, ScanSummary, PARTIAL_SUFFIX};
pub use worker::{partial_path, spawn_workers, DownloadContext};
