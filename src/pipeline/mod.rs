//! Run orchestration: list discovery, detail enrichment, media download,
//! and report generation, in that order, with checkpointing between steps.
//!
//! Every phase is resumable: the list phase checkpoints its page cursor
//! after each page, the detail phase selects its candidates from the store
//! rather than from run state, and the media phase derives its backlog from
//! the absence of local paths. Killing a run and starting another never
//! loses work.

pub mod events;

pub use events::EventSink;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, Database, PostExtra, PostPatch};
use crate::fetcher::{session_headers, Fetcher, PostCandidate};
use crate::http::{get_with_retries, FetchError, RetryPolicy};
use crate::media::{MediaDownloader, MediaKind, ProgressThrottle};
use crate::parser;
use crate::report;

static CARD_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("div.c[id]").unwrap());

/// Outcome of a full run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    /// True when any phase hit a stop condition (anti-bot exhaustion,
    /// cancellation, zero-progress batch) before finishing its work.
    pub stopped_early: bool,
    pub new_posts: u64,
    pub pages_seen: u64,
    pub enriched: u64,
    pub marked_missing: u64,
    pub images_downloaded: u64,
    pub videos_downloaded: u64,
}

pub struct Pipeline {
    config: Config,
    db: Database,
    client: Client,
    fetcher: Fetcher,
    headers: HeaderMap,
    events: EventSink,
    cancel: CancellationToken,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        config: Config,
        db: Database,
        client: Client,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let policy = RetryPolicy {
            base_delay: config.request_delay,
            fail_fast: config.antibot_fail_fast,
            ..RetryPolicy::default()
        };
        let fetcher = Fetcher::new(client.clone(), &config, policy);
        let headers = session_headers(&config);
        Self {
            config,
            db,
            client,
            fetcher,
            headers,
            events,
            cancel,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.config.request_delay,
            fail_fast: self.config.antibot_fail_fast,
            ..RetryPolicy::default()
        }
    }

    fn antibot_guard(&self) -> AntibotGuard {
        AntibotGuard {
            cooldowns: 0,
            max_cooldowns: self.config.antibot_max_cooldowns,
            delay: self.config.antibot_cooldown,
        }
    }

    /// Execute the selected phases in order.
    ///
    /// # Errors
    ///
    /// Returns an error on store or filesystem failures; remote-side
    /// trouble (anti-bot, missing posts) is absorbed into the summary.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let phases = self.config.phases;
        self.events.emit(
            "run_started",
            json!({
                "user_id": self.config.user_id,
                "phases": {
                    "list": phases.list,
                    "detail": phases.detail,
                    "media": phases.media,
                    "report": phases.report,
                },
            }),
        );

        if phases.list && !self.cancel.is_cancelled() {
            self.events.emit("phase_started", json!({"phase": "list"}));
            self.run_list_phase(&mut summary).await?;
            self.events.emit("phase_completed", json!({"phase": "list"}));
        }
        if phases.detail && !self.cancel.is_cancelled() {
            self.events.emit("phase_started", json!({"phase": "detail"}));
            self.run_detail_phase(&mut summary).await?;
            self.events.emit("phase_completed", json!({"phase": "detail"}));
        }
        if phases.media && !self.cancel.is_cancelled() {
            self.events.emit("phase_started", json!({"phase": "media"}));
            self.run_media_phase(&mut summary).await?;
            self.events.emit("phase_completed", json!({"phase": "media"}));
        }
        if phases.report && !self.cancel.is_cancelled() {
            self.events.emit("phase_started", json!({"phase": "report"}));
            let path = report::generate(&self.db, &self.config.storage_dir).await?;
            info!(path = %path.display(), "report written");
            self.events.emit("phase_completed", json!({"phase": "report"}));
        }

        if self.cancel.is_cancelled() {
            summary.stopped_early = true;
        }
        self.events.emit(
            "run_completed",
            json!({
                "stopped_early": summary.stopped_early,
                "new_posts": summary.new_posts,
                "pages_seen": summary.pages_seen,
                "enriched": summary.enriched,
                "marked_missing": summary.marked_missing,
                "images_downloaded": summary.images_downloaded,
                "videos_downloaded": summary.videos_downloaded,
            }),
        );
        Ok(summary)
    }

    // ===== List phase =====

    async fn run_list_phase(&self, summary: &mut RunSummary) -> Result<()> {
        let pool = self.db.pool();
        let checkpoint_key = format!("last_page:{}", self.config.user_id);
        let start_page = db::get_progress(pool, &checkpoint_key)
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .map_or(1, |last| last + 1);

        self.events
            .emit("list_started", json!({"start_page": start_page}));
        info!(start_page, "list phase started");

        let mut guard = self.antibot_guard();
        let mut page = start_page;
        let mut pages_this_run = 0_u32;
        let mut consecutive_no_new = 0_u32;

        let reason = loop {
            if self.cancel.is_cancelled() {
                break "cancelled";
            }
            if let Some(max) = self.config.max_pages {
                if pages_this_run >= max {
                    break "max_pages";
                }
            }

            let candidates = match self.fetcher.fetch_list_page(page).await {
                Ok(Some(candidates)) => candidates,
                Ok(None) => break "no_more_pages",
                Err(FetchError::AntiBot(msg)) => {
                    warn!(page, msg, "anti-bot signal on list page");
                    if guard.cool_down("list", &self.events, &self.cancel).await {
                        continue; // same page again
                    }
                    break "antibot_max_cooldowns";
                }
                Err(e) => {
                    warn!(page, error = %e, "list page fetch failed");
                    break "no_more_pages";
                }
            };
            if candidates.is_empty() {
                break "no_more_pages";
            }

            let total = candidates.len();
            let mut new_this_page = 0_u64;
            for candidate in candidates {
                if self.store_candidate(&candidate).await? {
                    new_this_page += 1;
                }
            }
            summary.new_posts += new_this_page;
            summary.pages_seen += 1;
            pages_this_run += 1;

            self.events.emit(
                "list_page",
                json!({"page": page, "cards": total, "new_posts": new_this_page}),
            );
            // The cursor advances after every fully processed page, so an
            // interrupted run resumes on the next one.
            db::set_progress(pool, &checkpoint_key, &page.to_string()).await?;

            if new_this_page == 0 {
                consecutive_no_new += 1;
                if consecutive_no_new >= self.config.stop_after_no_new_pages {
                    break "no_new_pages";
                }
            } else {
                consecutive_no_new = 0;
            }
            page += 1;
        };

        if matches!(reason, "antibot_max_cooldowns" | "cancelled") {
            summary.stopped_early = true;
        }
        self.events.emit("list_stopped", json!({"reason": reason}));
        self.events.emit(
            "list_completed",
            json!({"pages": summary.pages_seen, "new_posts": summary.new_posts}),
        );
        info!(
            reason,
            pages = summary.pages_seen,
            new_posts = summary.new_posts,
            "list phase finished"
        );
        Ok(())
    }

    /// Insert a candidate and its media references. Returns whether the post
    /// was new; an existing id is left untouched, media included.
    async fn store_candidate(&self, candidate: &PostCandidate) -> Result<bool> {
        let pool = self.db.pool();
        let inserted = db::insert_post(pool, &candidate.post).await?;
        if !inserted {
            return Ok(false);
        }
        for url in &candidate.image_urls {
            db::save_image(pool, &candidate.post.id, url).await?;
        }
        for (url, cover) in &candidate.video_urls {
            db::save_video(pool, &candidate.post.id, url, cover.as_deref()).await?;
        }
        Ok(true)
    }

    // ===== Detail phase =====

    async fn run_detail_phase(&self, summary: &mut RunSummary) -> Result<()> {
        self.run_offline_heuristic_pass().await?;

        let mut guard = self.antibot_guard();
        let mut failed = 0_u64;
        let mut reason: Option<&str> = None;
        // Ids already attempted this run. Keeps a recheck candidate that was
        // reconfirmed as original from being selected again and again.
        let mut attempted = std::collections::HashSet::new();

        'phase: loop {
            if self.cancel.is_cancelled() {
                reason = Some("cancelled");
                break;
            }

            let mut pending: Vec<String> = self
                .collect_detail_candidates()
                .await?
                .into_iter()
                .filter(|id| !attempted.contains(id))
                .collect();
            if pending.is_empty() {
                break;
            }
            info!(candidates = pending.len(), "detail batch selected");

            loop {
                self.events
                    .emit("detail_batch_started", json!({"candidates": pending.len()}));

                let batch = self.run_detail_batch(&pending).await;
                summary.enriched += batch.enriched;
                summary.marked_missing += batch.missing;
                failed += batch.failed;
                for id in &pending {
                    if !batch.antibot_ids.contains(id) {
                        attempted.insert(id.clone());
                    }
                }

                self.events.emit(
                    "detail_batch_completed",
                    json!({
                        "enriched": batch.enriched,
                        "missing": batch.missing,
                        "failed": batch.failed,
                        "antibot": batch.antibot_ids.len(),
                    }),
                );

                if !batch.antibot_ids.is_empty() {
                    if guard.cool_down("detail", &self.events, &self.cancel).await {
                        pending = batch.antibot_ids;
                        continue;
                    }
                    reason = Some("antibot_max_cooldowns");
                    break 'phase;
                }
                if batch.enriched + batch.missing == 0 {
                    // A full batch with zero terminal outcomes would loop
                    // forever against a broken or blocking remote.
                    reason = Some("zero_success");
                    break 'phase;
                }
                break;
            }
        }

        if let Some(reason) = reason {
            summary.stopped_early = true;
            self.events.emit("detail_stopped", json!({"reason": reason}));
            warn!(reason, "detail phase stopped early");
        }
        self.events.emit(
            "detail_completed",
            json!({
                "enriched": summary.enriched,
                "missing": summary.marked_missing,
                "failed": failed,
            }),
        );
        Ok(())
    }

    /// Fill unknown retweet flags on already-enriched posts from their text
    /// alone. Free of network traffic, so it runs before any fetching.
    async fn run_offline_heuristic_pass(&self) -> Result<()> {
        let pool = self.db.pool();
        let briefs =
            db::list_missing_retweet_flag(pool, i64::from(self.config.detail_batch_size)).await?;
        let mut patched = 0_u32;
        for brief in briefs {
            if brief.detail_fetched == 0 {
                continue;
            }
            let (is_retweet, category) =
                parser::classify_from_text_heuristic(brief.text.as_deref().unwrap_or(""));
            let patch = PostPatch {
                is_retweet: Some(is_retweet),
                retweet_category: Some(category),
                ..PostPatch::default()
            };
            db::update_post_fields(pool, &brief.id, &patch).await?;
            patched += 1;
        }
        if patched > 0 {
            info!(patched, "retweet flags filled from text heuristic");
        }
        Ok(())
    }

    /// Union of everything the detail phase should touch this run, deduped,
    /// with permanently-missing posts filtered out so they are never
    /// refetched.
    async fn collect_detail_candidates(&self) -> Result<Vec<String>> {
        let pool = self.db.pool();
        let batch = i64::from(self.config.detail_batch_size);

        let mut ids: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut push = |id: String, ids: &mut Vec<String>| {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        };

        for id in db::list_truncated_unfetched(pool, batch).await? {
            push(id, &mut ids);
        }
        for brief in db::list_missing_retweet_flag(pool, batch).await? {
            if brief.detail_fetched == 0 {
                push(brief.id, &mut ids);
            }
        }
        // An explicit recheck year takes precedence; otherwise a configured
        // backfill horizon also rechecks the misclassified originals before it.
        let recheck_scope = match (
            self.config.retweet_recheck_year,
            self.config.detail_backfill_before_year,
        ) {
            (Some(year), _) => Some(db::RecheckScope::Year(year)),
            (None, Some(year)) => Some(db::RecheckScope::BeforeYear(year)),
            (None, None) => None,
        };
        if let Some(scope) = recheck_scope {
            let limit = i64::from(self.config.retweet_recheck_limit);
            for id in
                db::list_recheck_candidates(pool, scope, self.config.retweet_recheck_mode, limit)
                    .await?
            {
                push(id, &mut ids);
            }
        }
        if let Some(year) = self.config.detail_backfill_before_year {
            for id in db::list_unfetched_before_year(pool, year, batch).await? {
                push(id, &mut ids);
            }
        }

        let mut filtered = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(brief) = db::get_post_brief(pool, &id).await? else {
                continue;
            };
            if db::EnrichmentState::of(&brief) == db::EnrichmentState::PermanentlyMissing {
                continue;
            }
            filtered.push(id);
        }
        Ok(filtered)
    }

    async fn run_detail_batch(&self, ids: &[String]) -> DetailBatch {
        let semaphore = Arc::new(Semaphore::new(self.config.detail_concurrency));
        let mut tasks = JoinSet::new();
        let threshold = self.config.retweet_long_comment_threshold;
        let policy = self.retry_policy();

        for id in ids {
            let semaphore = Arc::clone(&semaphore);
            let client = self.client.clone();
            let headers = self.headers.clone();
            let policy = policy.clone();
            let pool = self.db.pool().clone();
            let url = self.fetcher.detail_url(id);
            let id = id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                let kind = enrich_one(&client, &headers, &policy, &pool, &id, &url, threshold).await;
                (id, kind)
            });
        }

        let mut batch = DetailBatch::default();
        let total = ids.len();
        let mut done = 0_usize;
        let mut throttle = ProgressThrottle::new(10);
        while let Some(joined) = tasks.join_next().await {
            let Ok((id, kind)) = joined else {
                batch.failed += 1;
                continue;
            };
            match kind {
                DetailOutcome::Enriched => batch.enriched += 1,
                DetailOutcome::Missing => batch.missing += 1,
                DetailOutcome::AntiBot => batch.antibot_ids.push(id),
                DetailOutcome::Failed => batch.failed += 1,
            }
            done += 1;
            if throttle.should_report(done, total) {
                self.events
                    .emit("detail_batch_progress", json!({"done": done, "total": total}));
            }
        }
        batch
    }

    // ===== Media phase =====

    async fn run_media_phase(&self, summary: &mut RunSummary) -> Result<()> {
        let pool = self.db.pool();
        let downloader = MediaDownloader::new(
            self.client.clone(),
            self.headers.clone(),
            self.config.storage_dir.clone(),
            self.config.media_concurrency,
        );

        let images = db::undownloaded_images(pool).await?;
        self.events
            .emit("media_images_started", json!({"count": images.len()}));
        let results = downloader
            .download_batch(MediaKind::Image, images, |done, total| {
                self.events
                    .emit("media_images_progress", json!({"done": done, "total": total}));
            })
            .await?;
        let mut failed = 0_u64;
        for (row_id, path) in results {
            match path {
                Some(path) => {
                    db::set_image_path(pool, row_id, &path).await?;
                    summary.images_downloaded += 1;
                }
                None => failed += 1,
            }
        }
        self.events.emit(
            "media_images_completed",
            json!({"downloaded": summary.images_downloaded, "failed": failed}),
        );

        if self.cancel.is_cancelled() {
            summary.stopped_early = true;
            return Ok(());
        }

        let videos = db::undownloaded_videos(pool).await?;
        self.events
            .emit("media_videos_started", json!({"count": videos.len()}));
        let results = downloader
            .download_batch(MediaKind::Video, videos, |done, total| {
                self.events
                    .emit("media_videos_progress", json!({"done": done, "total": total}));
            })
            .await?;
        let mut failed = 0_u64;
        for (row_id, path) in results {
            match path {
                Some(path) => {
                    db::set_video_path(pool, row_id, &path).await?;
                    summary.videos_downloaded += 1;
                }
                None => failed += 1,
            }
        }
        self.events.emit(
            "media_videos_completed",
            json!({"downloaded": summary.videos_downloaded, "failed": failed}),
        );
        Ok(())
    }
}

// ===== Detail enrichment internals =====

#[derive(Debug, Default)]
struct DetailBatch {
    enriched: u64,
    missing: u64,
    failed: u64,
    antibot_ids: Vec<String>,
}

enum DetailOutcome {
    Enriched,
    Missing,
    AntiBot,
    Failed,
}

/// Everything pulled out of one detail page, parsed before any further I/O.
enum DetailParse {
    AntiBot,
    Missing,
    NoCard,
    Enriched(DetailData),
}

struct DetailData {
    text: String,
    html_with_links: String,
    classification: parser::Classification,
    image_urls: Vec<String>,
}

async fn enrich_one(
    client: &Client,
    headers: &HeaderMap,
    policy: &RetryPolicy,
    pool: &sqlx::SqlitePool,
    id: &str,
    url: &str,
    threshold: usize,
) -> DetailOutcome {
    let resp = match get_with_retries(client, url, headers, policy).await {
        Ok(resp) => resp,
        Err(FetchError::AntiBot(msg)) => {
            warn!(post_id = id, msg, "anti-bot signal on detail page");
            return DetailOutcome::AntiBot;
        }
        Err(e) => {
            warn!(post_id = id, error = %e, "detail fetch failed");
            return DetailOutcome::Failed;
        }
    };
    let status = resp.status();
    let Ok(body) = resp.text().await else {
        return DetailOutcome::Failed;
    };

    match parse_detail_body(&body, threshold) {
        DetailParse::AntiBot => DetailOutcome::AntiBot,
        DetailParse::Missing => match mark_missing(pool, id).await {
            Ok(()) => DetailOutcome::Missing,
            Err(e) => {
                warn!(post_id = id, error = %e, "failed to mark post missing");
                DetailOutcome::Failed
            }
        },
        DetailParse::NoCard => {
            warn!(post_id = id, %status, "detail page had no recognizable card");
            DetailOutcome::Failed
        }
        DetailParse::Enriched(data) => match apply_enrichment(pool, id, data).await {
            Ok(()) => DetailOutcome::Enriched,
            Err(e) => {
                warn!(post_id = id, error = %e, "failed to store enrichment");
                DetailOutcome::Failed
            }
        },
    }
}

/// Parse a detail-page body into owned data. Pure and synchronous; the
/// parsed document never crosses an await point.
fn parse_detail_body(body: &str, threshold: usize) -> DetailParse {
    if parser::body_is_antibot_page(body) {
        return DetailParse::AntiBot;
    }
    if parser::body_reports_missing(body) {
        return DetailParse::Missing;
    }

    let doc = Html::parse_document(body);
    let Some(card) = doc
        .select(&CARD_SELECTOR)
        .find(|c| c.value().attr("id").is_some_and(|id| id.starts_with("M_")))
        .or_else(|| doc.select(&CARD_SELECTOR).next())
    else {
        return DetailParse::NoCard;
    };

    let (text, html_with_links) = match parser::content_node(card) {
        Some(content) => parser::extract_text_and_markup(content),
        None => (card.text().collect::<String>().trim().to_string(), String::new()),
    };

    let mut classification = parser::classify_detail_card(card, threshold);
    if classification.forward.is_forward && classification.forward.forward_reason.is_empty() {
        let (reason, _) = parser::extract_forward_reason_from_detail(card);
        classification.forward.forward_reason = reason;
    }
    let image_urls = parser::extract_image_urls(&doc);

    DetailParse::Enriched(DetailData {
        text,
        html_with_links,
        classification,
        image_urls,
    })
}

async fn apply_enrichment(pool: &sqlx::SqlitePool, id: &str, data: DetailData) -> Result<()> {
    let brief = db::get_post_brief(pool, id).await?;
    let mut extra = PostExtra::from_json(brief.and_then(|b| b.extra_json).as_deref());
    // A detail page that parses to empty text must not clobber the text
    // captured from the list view.
    let text = (!data.text.is_empty()).then_some(data.text);
    if text.is_some() {
        extra.text_detail.clone_from(&text);
    }
    if !data.html_with_links.is_empty() {
        extra.html_with_links = Some(data.html_with_links);
    }
    extra.forward_meta = Some(data.classification.forward.clone());

    let patch = PostPatch {
        text,
        extra_json: Some(extra.to_json()),
        is_retweet: Some(data.classification.is_retweet),
        is_truncated: Some(false),
        retweet_category: Some(data.classification.category),
        detail_fetched: Some(true),
        fetched_at: Some(Utc::now().to_rfc3339()),
    };
    db::update_post_fields(pool, id, &patch).await?;

    for url in &data.image_urls {
        db::save_image(pool, id, url).await?;
    }
    Ok(())
}

/// Record the terminal missing state. The post keeps its list-view data but
/// is never selected for enrichment again.
async fn mark_missing(pool: &sqlx::SqlitePool, id: &str) -> Result<()> {
    let brief = db::get_post_brief(pool, id).await?;
    let mut extra = PostExtra::from_json(brief.and_then(|b| b.extra_json).as_deref());
    extra.detail_missing = true;
    extra.detail_missing_reason = Some("reported_missing_or_deleted".to_string());

    let patch = PostPatch {
        extra_json: Some(extra.to_json()),
        detail_fetched: Some(true),
        fetched_at: Some(Utc::now().to_rfc3339()),
        ..PostPatch::default()
    };
    db::update_post_fields(pool, id, &patch).await
}

/// Cooldown bookkeeping shared by the list and detail phases. Each trigger
/// is counted and announced; once the budget is spent the phase aborts
/// instead of sleeping again.
struct AntibotGuard {
    cooldowns: u32,
    max_cooldowns: u32,
    delay: std::time::Duration,
}

impl AntibotGuard {
    /// Returns true when the caller may retry after the cooldown, false when
    /// the budget is exhausted (or the run was cancelled mid-sleep).
    async fn cool_down(
        &mut self,
        phase: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> bool {
        self.cooldowns += 1;
        events.emit(
            "antibot_triggered",
            json!({
                "phase": phase,
                "cooldowns": self.cooldowns,
                "max_cooldowns": self.max_cooldowns,
            }),
        );
        if self.cooldowns >= self.max_cooldowns {
            warn!(
                phase,
                cooldowns = self.cooldowns,
                "anti-bot cooldown budget exhausted"
            );
            return false;
        }
        info!(
            phase,
            cooldowns = self.cooldowns,
            delay_secs = self.delay.as_secs_f64(),
            "anti-bot cooldown"
        );
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RetweetCategory;

    #[test]
    fn detail_body_antibot_detected_before_parsing() {
        assert!(matches!(
            parse_detail_body("请输入验证码", 100),
            DetailParse::AntiBot
        ));
    }

    #[test]
    fn detail_body_missing_detected() {
        assert!(matches!(
            parse_detail_body("抱歉，该微博已被删除", 100),
            DetailParse::Missing
        ));
    }

    #[test]
    fn detail_body_without_card_is_nocard() {
        assert!(matches!(
            parse_detail_body("<html><body><p>nothing here</p></body></html>", 100),
            DetailParse::NoCard
        ));
    }

    #[test]
    fn detail_body_enriched_with_full_text() {
        let body = r#"<html><body>
            <div class="c" id="M_1">
                <span class="ctt">这是完整的正文内容，不再截断</span>
                <img src="https://wx1.sinaimg.cn/wap180/detailpic.jpg">
            </div>
        </body></html>"#;
        let DetailParse::Enriched(data) = parse_detail_body(body, 100) else {
            panic!("expected enrichment");
        };
        assert_eq!(data.text, "这是完整的正文内容，不再截断");
        assert_eq!(
            data.classification.category,
            RetweetCategory::Original
        );
        assert_eq!(
            data.image_urls,
            vec!["https://wx1.sinaimg.cn/large/detailpic.jpg".to_string()]
        );
    }

    #[tokio::test]
    async fn antibot_guard_allows_then_aborts() {
        let events = EventSink::disabled();
        let cancel = CancellationToken::new();
        let mut guard = AntibotGuard {
            cooldowns: 0,
            max_cooldowns: 3,
            delay: std::time::Duration::from_millis(1),
        };
        assert!(guard.cool_down("detail", &events, &cancel).await);
        assert!(guard.cool_down("detail", &events, &cancel).await);
        // Third trigger exhausts the budget of three.
        assert!(!guard.cool_down("detail", &events, &cancel).await);
    }

    #[tokio::test]
    async fn antibot_guard_larger_budget_keeps_going() {
        let events = EventSink::disabled();
        let cancel = CancellationToken::new();
        let mut guard = AntibotGuard {
            cooldowns: 0,
            max_cooldowns: 4,
            delay: std::time::Duration::from_millis(1),
        };
        for _ in 0..3 {
            assert!(guard.cool_down("detail", &events, &cancel).await);
        }
        assert!(!guard.cool_down("detail", &events, &cancel).await);
    }

    #[tokio::test]
    async fn antibot_guard_stops_on_cancel() {
        let events = EventSink::disabled();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut guard = AntibotGuard {
            cooldowns: 0,
            max_cooldowns: 5,
            delay: std::time::Duration::from_secs(600),
        };
        assert!(!guard.cool_down("list", &events, &cancel).await);
    }
}
