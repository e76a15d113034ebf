//! Static HTML report over the archived posts.
//!
//! One self-contained `index.html` in the storage root: archive totals at
//! the top, then every post newest-first with its text, classification,
//! counters, and any downloaded media. Media references use the relative
//! paths recorded by the media phase, so the storage directory can be
//! browsed offline as-is.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use maud::{html, Markup, PreEscaped, DOCTYPE};

use crate::db::{self, Database, MediaRow, Post, PostExtra, Statistics};

/// Generate the report into `{storage_dir}/index.html`.
///
/// # Errors
///
/// Returns an error on store or filesystem failures.
pub async fn generate(db: &Database, storage_dir: &Path) -> Result<PathBuf> {
    let pool = db.pool();
    let stats = db::statistics(pool).await?;
    let posts = db::get_all_posts(pool).await?;

    let mut entries = Vec::with_capacity(posts.len());
    for post in posts {
        let images = db::images_for_post(pool, &post.id).await?;
        let videos = db::videos_for_post(pool, &post.id).await?;
        entries.push((post, images, videos));
    }

    let page = render_page(&stats, &entries);
    let path = storage_dir.join("index.html");
    tokio::fs::write(&path, page.into_string())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn render_page(stats: &Statistics, entries: &[(Post, Vec<MediaRow>, Vec<MediaRow>)]) -> Markup {
    html! {
        (DOCTYPE)
        html lang="zh" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { "Weibo Archive" }
                style { (PreEscaped(STYLE)) }
            }
            body {
                header {
                    h1 { "Weibo Archive" }
                    p.stats {
                        (stats.total_posts) " posts · "
                        (stats.downloaded_images) "/" (stats.total_images) " images · "
                        (stats.downloaded_videos) "/" (stats.total_videos) " videos"
                    }
                }
                main {
                    @for (post, images, videos) in entries {
                        (render_post(post, images, videos))
                    }
                }
            }
        }
    }
}

fn render_post(post: &Post, images: &[MediaRow], videos: &[MediaRow]) -> Markup {
    let extra = PostExtra::from_json(post.extra_json.as_deref());
    let category = post.retweet_category.as_deref().unwrap_or("unknown");

    html! {
        article.post id=(post.id) {
            div.meta {
                @if let Some(created_at) = &post.created_at {
                    span.time { (created_at) }
                }
                @if let Some(source) = &post.source {
                    span.source { (source) }
                }
                span.category { (category) }
                @if extra.detail_missing {
                    span.missing { "original unavailable" }
                }
            }
            div.text {
                // Markup-preserving text keeps the post's inline links; it
                // was escaped and rebuilt at parse time, not taken verbatim.
                @if let Some(markup) = &extra.html_with_links {
                    (PreEscaped(markup.clone()))
                } @else {
                    (post.text.as_deref().unwrap_or(""))
                }
            }
            @if let Some(meta) = &extra.forward_meta {
                @if meta.is_forward && !meta.forwarded_author.is_empty() {
                    div.forward { "forwarded from " (meta.forwarded_author) }
                }
            }
            @if !images.is_empty() {
                div.media {
                    @for image in images {
                        @if let Some(path) = downloaded_path(image) {
                            a href=(path) { img src=(path) loading="lazy"; }
                        } @else {
                            a.remote href=(image.url) { "image (not downloaded)" }
                        }
                    }
                }
            }
            @if !videos.is_empty() {
                div.media {
                    @for video in videos {
                        @if let Some(path) = downloaded_path(video) {
                            video controls preload="none" src=(path) {}
                        } @else {
                            a.remote href=(video.url) { "video (not downloaded)" }
                        }
                    }
                }
            }
            div.counters {
                span { "likes " (post.attitudes_count) }
                span { "reposts " (post.reposts_count) }
                span { "comments " (post.comments_count) }
            }
        }
    }
}

fn downloaded_path(row: &MediaRow) -> Option<&str> {
    row.local_path.as_deref().filter(|p| !p.is_empty())
}

const STYLE: &str = "
body { max-width: 46rem; margin: 0 auto; padding: 1rem; font-family: sans-serif; color: #222; }
header h1 { margin-bottom: 0.25rem; }
.stats { color: #666; }
article.post { border-top: 1px solid #ddd; padding: 1rem 0; }
.meta { font-size: 0.85rem; color: #888; display: flex; gap: 0.75rem; flex-wrap: wrap; }
.meta .category { text-transform: uppercase; letter-spacing: 0.05em; }
.meta .missing { color: #b00; }
.text { margin: 0.5rem 0; white-space: pre-wrap; word-break: break-word; }
.forward { font-size: 0.85rem; color: #666; margin-bottom: 0.5rem; }
.media { display: flex; gap: 0.5rem; flex-wrap: wrap; margin: 0.5rem 0; }
.media img { max-width: 10rem; max-height: 10rem; object-fit: cover; }
.media video { max-width: 100%; }
.media a.remote { font-size: 0.85rem; color: #36c; }
.counters { font-size: 0.85rem; color: #888; display: flex; gap: 1rem; }
";
