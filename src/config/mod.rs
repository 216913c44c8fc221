//! Configuration module for tumblr-update
//!
//! This module handles loading, parsing, and validating the TOML configuration
//! file and the plain-text source list.
//!
//! # Example
//!
//! ```no_run
//! use tumblr_update::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("config.toml")).unwrap();
//! println!("Requests per second: {}", config.downloader.rate);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    ApiConfig, Config, DownloaderConfig, MediaConfig, OutputConfig, SourceEntry,
    DEFAULT_API_BASE, MAX_PAGE_SIZE,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, load_config, load_config_with_hash, load_source_list, parse_config,
    parse_source_list,
};
pub use validation::{retain_valid_sources, validate, validate_source};
