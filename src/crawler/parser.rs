//! Read-API payload parser
//!
//! This module decodes one page of posts and extracts media URLs:
//! - Photo posts: every 1280px photo URL
//! - Regular and answer posts: inline images hosted on the media CDN
//! - Video posts: the CDN video behind the embedded player
//!
//! Any other post type yields nothing.

use crate::config::MediaConfig;
use crate::crawler::fetcher::trim_js;
use crate::state::PostId;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

/// Host suffix of the media CDN
const MEDIA_HOST_SUFFIX: &str = "media.tumblr.com";

/// Base of direct video downloads
const VIDEO_BASE: &str = "https://vtt.tumblr.com/";

static VIDEO_HD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""hdUrl":".*(tumblr_\w+)""#).expect("hd video regex is valid")
});

static VIDEO_SOURCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"source src=".*(tumblr_\w+)(?:/\d+)?" type"#).expect("video source regex is valid")
});

static IMG_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img[src]").expect("img selector is valid"));

/// One post as returned by the read API
#[derive(Debug, Clone, Deserialize)]
pub struct Post {
    pub id: PostId,

    #[serde(rename = "unix-timestamp", default)]
    pub unix_timestamp: Option<i64>,

    #[serde(flatten)]
    pub kind: PostKind,
}

/// Type-specific part of a post, selected by its `type` field
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PostKind {
    Photo {
        #[serde(rename = "photo-url-1280", default)]
        photo_url: Option<String>,
        #[serde(default)]
        photos: Vec<Photo>,
    },
    Regular {
        #[serde(rename = "regular-body", default)]
        body: Option<String>,
    },
    Answer {
        #[serde(default)]
        answer: Option<String>,
    },
    Video {
        #[serde(rename = "video-player", default)]
        player: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// One entry of a photoset
#[derive(Debug, Clone, Deserialize)]
pub struct Photo {
    #[serde(rename = "photo-url-1280", default)]
    pub photo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default)]
    posts: Vec<serde_json::Value>,

    #[serde(rename = "posts-total", default)]
    posts_total: Option<serde_json::Value>,
}

/// A decoded page of posts
#[derive(Debug, Default)]
pub struct DecodedPage {
    /// Posts in page order
    pub posts: Vec<Post>,

    /// Number of raw items on the page, including ones that failed to decode
    pub item_count: usize,

    /// Total posts of the source, when reported
    pub posts_total: Option<u64>,
}

/// Decodes a page body, with or without the JavaScript wrapper
///
/// A page whose envelope is not valid JSON is an error. Individual posts that
/// fail to decode are logged and skipped; they still count toward
/// `item_count` so pagination is not cut short.
pub fn decode_page(body: &str) -> Result<DecodedPage, serde_json::Error> {
    let raw: RawPage = serde_json::from_str(trim_js(body))?;

    let item_count = raw.posts.len();
    let posts = raw
        .posts
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Post>(value) {
            Ok(post) => Some(post),
            Err(e) => {
                tracing::warn!("Skipping undecodable post: {}", e);
                None
            }
        })
        .collect();

    let posts_total = raw.posts_total.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });

    Ok(DecodedPage {
        posts,
        item_count,
        posts_total,
    })
}

/// Extracts the media URLs of a post, honoring the media filters
///
/// URLs are returned in document order without duplicates.
pub fn extract_media(post: &Post, media: &MediaConfig) -> Vec<String> {
    let urls = match &post.kind {
        PostKind::Photo { photo_url, photos } if !media.ignore_photos => {
            if photos.is_empty() {
                photo_url.iter().cloned().collect()
            } else {
                photos.iter().filter_map(|p| p.photo_url.clone()).collect()
            }
        }
        PostKind::Regular { body: Some(html) } | PostKind::Answer { answer: Some(html) }
            if !media.ignore_photos =>
        {
            inline_images(html)
        }
        PostKind::Video {
            player: Some(player),
        } if !media.ignore_videos => video_url(player).into_iter().collect(),
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|url| !url.trim().is_empty())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Finds `<img src>` values served by the media CDN
fn inline_images(html: &str) -> Vec<String> {
    let fragment = Html::parse_fragment(html);
    fragment
        .select(&IMG_SELECTOR)
        .filter_map(|img| img.value().attr("src"))
        .filter(|src| {
            Url::parse(src)
                .ok()
                .and_then(|url| url.host_str().map(|h| h.ends_with(MEDIA_HOST_SUFFIX)))
                .unwrap_or(false)
        })
        .map(str::to_string)
        .collect()
}

/// Resolves the direct video URL from an embedded player
///
/// Prefers the HD source and falls back to the `<source>` element. Players
/// for third-party hosts yield nothing.
fn video_url(player: &str) -> Option<String> {
    let player = player.replace('\\', "");
    let captures = VIDEO_HD_PATTERN
        .captures(&player)
        .or_else(|| VIDEO_SOURCE_PATTERN.captures(&player))?;
    let id = captures.get(1)?.as_str();
    Some(format!("{}{}.mp4", VIDEO_BASE, id))
}
