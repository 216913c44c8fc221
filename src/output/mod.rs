//! Output module for progress and history reporting
//!
//! This module handles:
//! - Process-wide counters and the active-source registry
//! - Human-readable byte sizes
//! - Printing the run history recorded in storage

pub mod stats;

pub use stats::{byte_size, load_run_history, print_run_history, GlobalStats, StatsSnapshot};
