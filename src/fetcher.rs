//! Fetching and parsing of weibo.cn list pages.
//!
//! The mobile site has no usable JSON API for history this deep; everything
//! is scraped from the paginated HTML profile view. One page yields a batch
//! of cards, each parsed into a [`PostCandidate`] carrying the post fields
//! plus any embedded media references.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, REFERER, USER_AGENT};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::{NewPost, PostExtra, RetweetCategory};
use crate::http::{get_with_retries, FetchError, RetryPolicy};
use crate::parser;

static CARD_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("div.c[id]").unwrap());
static TIME_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("span.ct").unwrap());
static ANCHOR_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

static RE_ATTITUDES: Lazy<Regex> = Lazy::new(|| Regex::new(r"赞\[(\d+)\]").unwrap());
static RE_REPOSTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"转发\[(\d+)\]").unwrap());
static RE_COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"评论\[(\d+)\]").unwrap());

/// One parsed list card: the post plus its embedded media references.
#[derive(Debug, Clone)]
pub struct PostCandidate {
    pub post: NewPost,
    pub image_urls: Vec<String>,
    /// `(url, cover_url)` pairs.
    pub video_urls: Vec<(String, Option<String>)>,
    /// Link to the group-photo page listing every image, when present.
    pub picall_href: Option<String>,
}

/// Fetches list pages and group-photo pages for one account.
///
/// Holds the shared HTTP client explicitly; nothing here is a process-wide
/// singleton.
pub struct Fetcher {
    client: Client,
    base_url: String,
    user_id: String,
    headers: HeaderMap,
    policy: RetryPolicy,
}

impl Fetcher {
    #[must_use]
    pub fn new(client: Client, config: &Config, policy: RetryPolicy) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: config.user_id.clone(),
            headers: session_headers(config),
            policy,
        }
    }

    fn list_url(&self, page: u32) -> String {
        if page > 1 {
            format!("{}/{}?page={page}", self.base_url, self.user_id)
        } else {
            format!("{}/{}", self.base_url, self.user_id)
        }
    }

    /// Detail-page URL for a post id (with or without the `M_` prefix).
    #[must_use]
    pub fn detail_url(&self, post_id: &str) -> String {
        let clean = post_id.strip_prefix("M_").unwrap_or(post_id);
        format!("{}/{}/{}", self.base_url, self.user_id, clean)
    }

    /// Fetch and parse one list page. `Ok(None)` means the page was not
    /// served (non-200 after retries) and pagination should stop.
    ///
    /// # Errors
    ///
    /// Propagates [`FetchError`] from the retry policy; anti-bot signals
    /// reach the caller untouched.
    pub async fn fetch_list_page(&self, page: u32) -> Result<Option<Vec<PostCandidate>>, FetchError> {
        let url = self.list_url(page);
        let resp = get_with_retries(&self.client, &url, &self.headers, &self.policy).await?;
        if resp.status() != reqwest::StatusCode::OK {
            warn!(page, status = %resp.status(), "list page not served");
            return Ok(None);
        }
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(page, error = %e, "failed to read list page body");
                return Ok(None);
            }
        };
        // A CAPTCHA interstitial is served with a 200 and zero cards; it must
        // not be mistaken for the end of the history.
        if parser::body_is_antibot_page(&body) {
            return Err(FetchError::AntiBot(format!(
                "interstitial page served for {url}"
            )));
        }

        let mut candidates = parse_list_page(&body, &self.user_id);

        // Group-photo cards only carry a link to the full image set; expand
        // them now so the list phase records every image reference.
        for candidate in &mut candidates {
            if let Some(href) = candidate.picall_href.take() {
                match self.fetch_group_photos(&href).await {
                    Ok(urls) => candidate.image_urls = urls,
                    Err(FetchError::AntiBot(msg)) => return Err(FetchError::AntiBot(msg)),
                    Err(e) => {
                        warn!(post_id = %candidate.post.id, error = %e, "group photo fetch failed");
                    }
                }
            }
        }

        debug!(page, cards = candidates.len(), "parsed list page");
        Ok(Some(candidates))
    }

    async fn fetch_group_photos(&self, href: &str) -> Result<Vec<String>, FetchError> {
        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}{href}", self.base_url)
        };
        let resp = get_with_retries(&self.client, &url, &self.headers, &self.policy).await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Ok(Vec::new());
        }
        let body = resp.text().await.unwrap_or_default();
        let doc = Html::parse_document(&body);
        Ok(parser::extract_image_urls(&doc))
    }
}

/// Request headers carrying the operator-supplied session credential.
#[must_use]
pub fn session_headers(config: &Config) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&config.user_agent) {
        headers.insert(USER_AGENT, v);
    }
    if let Ok(v) = HeaderValue::from_str(&config.cookie) {
        headers.insert(COOKIE, v);
    }
    headers.insert(REFERER, HeaderValue::from_static("https://weibo.cn/"));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
    );
    headers
}

/// Parse a list page body into post candidates. Pure and synchronous.
#[must_use]
pub fn parse_list_page(body: &str, user_id: &str) -> Vec<PostCandidate> {
    let doc = Html::parse_document(body);
    let mut candidates = Vec::new();

    for card in doc.select(&CARD_SELECTOR) {
        let Some(mid) = card.value().attr("id") else {
            continue;
        };
        if !mid.starts_with("M_") {
            continue;
        }
        match parse_card(card, mid, user_id) {
            Some(candidate) => candidates.push(candidate),
            None => debug!(post_id = mid, "skipped unparseable card"),
        }
    }

    candidates
}

fn parse_card(card: ElementRef<'_>, mid: &str, user_id: &str) -> Option<PostCandidate> {
    let content = parser::content_node(card);
    let (mut text, html_with_links) = content
        .map(parser::extract_text_and_markup)
        .unwrap_or_default();
    let is_truncated = content.is_some_and(parser::detect_truncated);

    if text.is_empty() {
        // Forward-only cards keep their text outside span.ctt; fall back to
        // the whole card, but drop fragments too short to be a post.
        text = card.text().collect::<String>().trim().to_string();
        if text.chars().count() < 10 {
            return None;
        }
    }

    let (created_at, source) = extract_time_and_source(card);
    let all_text: String = card.text().collect();
    let attitudes_count = capture_count(&RE_ATTITUDES, &all_text);
    let reposts_count = capture_count(&RE_REPOSTS, &all_text);
    let comments_count = capture_count(&RE_COMMENTS, &all_text);

    let picall_href = card
        .select(&ANCHOR_SELECTOR)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| href.contains("picAll"))
        .map(ToString::to_string);

    let image_urls = if picall_href.is_some() {
        Vec::new()
    } else {
        let fragment = Html::parse_fragment(&card.html());
        parser::extract_image_urls(&fragment)
    };

    let video_urls: Vec<(String, Option<String>)> = card
        .select(&ANCHOR_SELECTOR)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.contains("video.weibo.com"))
        .map(|href| (href.to_string(), None))
        .collect();

    // Fast forward/original call from the list card alone; a long commentary
    // can only be confirmed from the detail page, so the category may be
    // flipped to long_comment later.
    let forward = parser::classify_forward(card);
    let (is_retweet, retweet_category) = if forward.is_forward {
        (true, RetweetCategory::Retweet)
    } else {
        (false, RetweetCategory::Original)
    };

    let extra = PostExtra {
        html_with_links: (!html_with_links.is_empty()).then_some(html_with_links),
        forward_meta: Some(forward),
        ..PostExtra::default()
    };

    Some(PostCandidate {
        post: NewPost {
            id: mid.to_string(),
            user_id: user_id.to_string(),
            created_at,
            text,
            source,
            reposts_count,
            comments_count,
            attitudes_count,
            is_retweet,
            is_truncated,
            retweet_category,
            extra,
        },
        image_urls,
        video_urls,
        picall_href,
    })
}

/// Timestamp and client-source label live together in `span.ct`, separated
/// by a "via" marker.
fn extract_time_and_source(card: ElementRef<'_>) -> (Option<String>, Option<String>) {
    let Some(node) = card.select(&TIME_SELECTOR).next() else {
        return (None, None);
    };
    let raw: String = node.text().collect();
    let raw = raw.trim();
    if raw.is_empty() {
        return (None, None);
    }
    match raw.split_once("来自") {
        Some((time, source)) => (
            Some(time.trim().to_string()),
            Some(source.trim().to_string()),
        ),
        None => (Some(raw.to_string()), None),
    }
}

fn capture_count(re: &Regex, text: &str) -> i64 {
    re.captures(text)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}
