//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `PostId`: arbitrary-width post identifier with numeric ordering
//! - `SourceState`: per-source watermarks, obligations, and lifecycle
//! - `SourceTable`: owns every source of a pass, indexed by `SourceId`

mod post_id;
mod source_state;

// Re-export main types
pub use post_id::{InvalidPostId, PostId};
pub use source_state::{SourceId, SourceState, SourceStatus, SourceTable};
