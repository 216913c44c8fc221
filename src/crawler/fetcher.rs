//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building the shared HTTP client with the configured user agent
//! - Building paginated read-API URLs
//! - Fetching pages and classifying the outcome
//! - The retry delay used by every retry loop
//! - Unwrapping the JavaScript assignment around API payloads

use crate::config::ApiConfig;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

/// First delay between retries
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Longest delay between retries
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

const JS_PREFIX: &str = "var tumblr_api_read = ";

/// Result of a fetch operation
#[derive(Debug)]
pub enum FetchResult {
    /// Successfully fetched the page
    Success {
        /// HTTP status code
        status_code: u16,
        /// Response body
        body: String,
    },

    /// The server reported the resource as missing (404 or 410)
    NotFound {
        /// The HTTP status code
        status_code: u16,
    },

    /// A failure worth retrying (network error, 5xx, 429, truncated body)
    Retryable {
        /// Error description
        error: String,
    },

    /// A client error that will not go away by retrying
    Rejected {
        /// The HTTP status code
        status_code: u16,
    },
}

/// How a response status should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    NotFound,
    Retryable,
    Rejected,
}

/// Classifies an HTTP status code
///
/// | Status | Class |
/// |--------|-------|
/// | 2xx | Success |
/// | 404, 410 | NotFound |
/// | 408, 429, 5xx | Retryable |
/// | other | Rejected |
pub fn classify_status(status: StatusCode) -> StatusClass {
    match status {
        s if s.is_success() => StatusClass::Success,
        StatusCode::NOT_FOUND | StatusCode::GONE => StatusClass::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => StatusClass::Retryable,
        s if s.is_server_error() => StatusClass::Retryable,
        _ => StatusClass::Rejected,
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The API configuration holding the user agent
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use tumblr_update::config::ApiConfig;
/// use tumblr_update::crawler::build_http_client;
///
/// let client = build_http_client(&ApiConfig::default()).unwrap();
/// ```
pub fn build_http_client(config: &ApiConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Builds the URL of one page of a source's posts
///
/// Pages are 1-based: page `p` starts at post `(p - 1) × page_size`.
///
/// # Arguments
///
/// * `endpoint` - The source's read endpoint
/// * `page` - 1-based page number
/// * `page_size` - Posts per page
/// * `tag` - Optional tag filter
pub fn page_url(
    endpoint: &str,
    page: u32,
    page_size: u32,
    tag: Option<&str>,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(endpoint)?;
    {
        let start = u64::from(page.saturating_sub(1)) * u64::from(page_size);
        let mut query = url.query_pairs_mut();
        query.append_pair("num", &page_size.to_string());
        query.append_pair("start", &start.to_string());
        if let Some(tag) = tag {
            query.append_pair("tagged", tag);
        }
    }
    Ok(url)
}

/// Fetches a URL and classifies the response
///
/// # Arguments
///
/// * `client` - The HTTP client to use
/// * `url` - The URL to fetch
///
/// # Returns
///
/// A FetchResult indicating success or the type of failure
pub async fn fetch_page(client: &Client, url: &Url) -> FetchResult {
    let response = match client.get(url.clone()).send().await {
        Ok(response) => response,
        Err(e) => {
            let error = if e.is_timeout() {
                "Request timeout".to_string()
            } else if e.is_connect() {
                format!("Connection failed: {}", e)
            } else {
                e.to_string()
            };
            return FetchResult::Retryable { error };
        }
    };

    let status = response.status();
    match classify_status(status) {
        StatusClass::Success => match response.text().await {
            Ok(body) => FetchResult::Success {
                status_code: status.as_u16(),
                body,
            },
            Err(e) => FetchResult::Retryable {
                error: format!("Failed to read body: {}", e),
            },
        },
        StatusClass::NotFound => FetchResult::NotFound {
            status_code: status.as_u16(),
        },
        StatusClass::Retryable => FetchResult::Retryable {
            error: format!("HTTP {}", status.as_u16()),
        },
        StatusClass::Rejected => FetchResult::Rejected {
            status_code: status.as_u16(),
        },
    }
}

/// Delay before retry number `attempt` (0-based), doubling up to a cap
pub fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    RETRY_BASE_DELAY.saturating_mul(factor).min(RETRY_MAX_DELAY)
}

/// Strips the `var tumblr_api_read = ...;` wrapper from a payload
///
/// Plain JSON is returned unchanged apart from surrounding whitespace.
pub fn trim_js(body: &str) -> &str {
    let body = body.trim();
    match body.strip_prefix(JS_PREFIX) {
        Some(rest) => rest.strip_suffix(';').unwrap_or(rest).trim(),
        None => body,
    }
}
