use crate::config::types::{
    ApiConfig, Config, DownloaderConfig, OutputConfig, SourceEntry, MAX_PAGE_SIZE,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
///
/// Sources are not checked here: an unusable source is dropped on its own by
/// [`retain_valid_sources`] so the remaining sources can still run.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_downloader_config(&config.downloader)?;
    validate_api_config(&config.api)?;
    validate_output_config(&config.output)?;
    Ok(())
}

/// Validates pipeline configuration
fn validate_downloader_config(config: &DownloaderConfig) -> Result<(), ConfigError> {
    if config.num_downloaders < 1 || config.num_downloaders > 100 {
        return Err(ConfigError::Validation(format!(
            "num-downloaders must be between 1 and 100, got {}",
            config.num_downloaders
        )));
    }

    if config.rate < 1 || config.rate > 1000 {
        return Err(ConfigError::Validation(format!(
            "rate must be between 1 and 1000 requests per second, got {}",
            config.rate
        )));
    }

    if config.queue_size < 1 {
        return Err(ConfigError::Validation(
            "queue-size must be at least 1".to_string(),
        ));
    }

    if config.directory.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "directory cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates remote API configuration
fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    if !config.base_url.contains("{name}") {
        return Err(ConfigError::Validation(format!(
            "base-url must contain a {{name}} placeholder, got '{}'",
            config.base_url
        )));
    }

    Url::parse(&config.endpoint_for("example"))
        .map_err(|e| ConfigError::Validation(format!("Invalid base-url: {}", e)))?;

    if config.page_size < 1 || config.page_size > MAX_PAGE_SIZE {
        return Err(ConfigError::Validation(format!(
            "page-size must be between 1 and {}, got {}",
            MAX_PAGE_SIZE, config.page_size
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates a single source entry
///
/// Blog names become both a hostname label and a directory name, so only
/// ASCII alphanumerics and hyphens are accepted.
pub fn validate_source(entry: &SourceEntry) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSource {
        name: entry.name.clone(),
        reason: reason.to_string(),
    };

    if entry.name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }

    if !entry
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(invalid(
            "name must contain only alphanumeric characters and hyphens",
        ));
    }

    if entry.name.starts_with('-') || entry.name.ends_with('-') {
        return Err(invalid("name cannot start or end with '-'"));
    }

    if let Some(tag) = &entry.tag {
        if tag.trim().is_empty() {
            return Err(invalid("tag cannot be blank"));
        }
    }

    Ok(())
}

/// Drops invalid and duplicate sources, logging a warning for each one
///
/// The first entry for a given name wins.
pub fn retain_valid_sources(sources: &mut Vec<SourceEntry>) {
    let mut seen = std::collections::HashSet::new();
    sources.retain(|entry| {
        if let Err(e) = validate_source(entry) {
            tracing::warn!("Skipping source: {}", e);
            return false;
        }
        if !seen.insert(entry.name.to_ascii_lowercase()) {
            tracing::warn!("Skipping duplicate source '{}'", entry.name);
            return false;
        }
        true
    });
}
