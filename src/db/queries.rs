use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{MediaRow, NewPost, Post, PostBrief, PostPatch};
use crate::config::RecheckMode;

// ========== Posts ==========

/// Check whether a post id is already in the store. The list phase gates
/// inserts on this so an existing id is never re-parsed or overwritten.
pub async fn post_exists(pool: &SqlitePool, post_id: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM posts WHERE id = ? LIMIT 1")
        .bind(post_id)
        .fetch_optional(pool)
        .await
        .context("Failed to check post existence")?;
    Ok(row.is_some())
}

/// Insert a newly sighted post. Insert-or-ignore semantics: an existing id
/// is left untouched. Returns whether a row was actually inserted.
pub async fn insert_post(pool: &SqlitePool, post: &NewPost) -> Result<bool> {
    let result = sqlx::query(
        r"
        INSERT OR IGNORE INTO posts
        (id, user_id, created_at, text, source, reposts_count, comments_count, attitudes_count,
         is_retweet, is_truncated, retweet_category, detail_fetched, extra_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        ",
    )
    .bind(&post.id)
    .bind(&post.user_id)
    .bind(&post.created_at)
    .bind(&post.text)
    .bind(&post.source)
    .bind(post.reposts_count)
    .bind(post.comments_count)
    .bind(post.attitudes_count)
    .bind(i64::from(post.is_retweet))
    .bind(i64::from(post.is_truncated))
    .bind(post.retweet_category.as_str())
    .bind(post.extra.to_json())
    .execute(pool)
    .await
    .context("Failed to insert post")?;

    Ok(result.rows_affected() > 0)
}

/// Fetch the short projection the detail phase works with.
pub async fn get_post_brief(pool: &SqlitePool, post_id: &str) -> Result<Option<PostBrief>> {
    sqlx::query_as(
        "SELECT id, text, is_retweet, detail_fetched, extra_json FROM posts WHERE id = ?",
    )
    .bind(post_id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch post brief")
}

/// All posts, newest first. Used by the report phase.
pub async fn get_all_posts(pool: &SqlitePool) -> Result<Vec<Post>> {
    sqlx::query_as("SELECT * FROM posts ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("Failed to fetch posts")
}

/// Apply a partial update to a post's enrichable columns. An empty patch is
/// a no-op. The patch type itself restricts which columns can be touched.
pub async fn update_post_fields(pool: &SqlitePool, post_id: &str, patch: &PostPatch) -> Result<()> {
    if patch.is_empty() {
        return Ok(());
    }

    let mut qb = sqlx::QueryBuilder::new("UPDATE posts SET ");
    let mut parts = qb.separated(", ");
    if let Some(text) = &patch.text {
        parts.push("text = ").push_bind_unseparated(text.clone());
    }
    if let Some(extra) = &patch.extra_json {
        parts
            .push("extra_json = ")
            .push_bind_unseparated(extra.clone());
    }
    if let Some(is_retweet) = patch.is_retweet {
        parts
            .push("is_retweet = ")
            .push_bind_unseparated(i64::from(is_retweet));
    }
    if let Some(is_truncated) = patch.is_truncated {
        parts
            .push("is_truncated = ")
            .push_bind_unseparated(i64::from(is_truncated));
    }
    if let Some(category) = patch.retweet_category {
        parts
            .push("retweet_category = ")
            .push_bind_unseparated(category.as_str());
    }
    if let Some(detail_fetched) = patch.detail_fetched {
        parts
            .push("detail_fetched = ")
            .push_bind_unseparated(i64::from(detail_fetched));
    }
    if let Some(fetched_at) = &patch.fetched_at {
        parts
            .push("fetched_at = ")
            .push_bind_unseparated(fetched_at.clone());
    }
    qb.push(" WHERE id = ").push_bind(post_id);

    qb.build()
        .execute(pool)
        .await
        .context("Failed to update post fields")?;
    Ok(())
}

// ========== Detail-phase candidate queries ==========

/// Posts whose list-view text was clipped and that have not been enriched.
pub async fn list_truncated_unfetched(pool: &SqlitePool, limit: i64) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r"
        SELECT id FROM posts
        WHERE is_truncated = 1 AND (detail_fetched IS NULL OR detail_fetched = 0)
        ORDER BY created_at DESC
        LIMIT ?
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list truncated posts")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Posts whose retweet flag is still unknown, enriched or not.
pub async fn list_missing_retweet_flag(pool: &SqlitePool, limit: i64) -> Result<Vec<PostBrief>> {
    sqlx::query_as(
        r"
        SELECT id, text, is_retweet, detail_fetched, extra_json FROM posts
        WHERE is_retweet IS NULL
        ORDER BY created_at DESC
        LIMIT ?
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list posts with unknown retweet flag")
}

/// Historical backfill: unenriched posts from before `before_year`,
/// regardless of truncation or classification.
pub async fn list_unfetched_before_year(
    pool: &SqlitePool,
    before_year: i32,
    limit: i64,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r"
        SELECT id FROM posts
        WHERE (detail_fetched IS NULL OR detail_fetched = 0)
          AND CAST(substr(created_at, 1, 4) AS int) < ?
        ORDER BY created_at DESC
        LIMIT ?
        ",
    )
    .bind(before_year)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list backfill candidates")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Which posts a targeted recheck re-examines.
#[derive(Debug, Clone, Copy)]
pub enum RecheckScope {
    /// Posts from exactly this year.
    Year(i32),
    /// Posts from before this year.
    BeforeYear(i32),
}

/// Misclassification-correction candidates: posts currently classified
/// original, optionally narrowed to those whose text carries the "weibo
/// video" tell typical of structural forwards.
pub async fn list_recheck_candidates(
    pool: &SqlitePool,
    scope: RecheckScope,
    mode: RecheckMode,
    limit: i64,
) -> Result<Vec<String>> {
    let scope_sql = match scope {
        RecheckScope::Year(_) => "created_at LIKE ?",
        RecheckScope::BeforeYear(_) => "CAST(substr(created_at, 1, 4) AS int) < ?",
    };
    let mode_sql = match mode {
        RecheckMode::VideoPhrase => " AND text LIKE '%微博视频%'",
        RecheckMode::AllOriginal => "",
    };
    let sql = format!(
        "SELECT id FROM posts WHERE {scope_sql} AND is_retweet = 0{mode_sql} \
         ORDER BY created_at DESC LIMIT ?"
    );

    let query = sqlx::query_as::<_, (String,)>(&sql);
    let query = match scope {
        RecheckScope::Year(year) => query.bind(format!("{year}-%")),
        RecheckScope::BeforeYear(year) => query.bind(year),
    };
    let rows = query
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list recheck candidates")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ========== Media ==========

/// Record an image reference. Idempotent on `(post_id, url)`: re-saving the
/// same pair returns the existing row id.
pub async fn save_image(pool: &SqlitePool, post_id: &str, url: &str) -> Result<i64> {
    if let Some((id,)) =
        sqlx::query_as::<_, (i64,)>("SELECT id FROM images WHERE post_id = ? AND url = ? LIMIT 1")
            .bind(post_id)
            .bind(url)
            .fetch_optional(pool)
            .await
            .context("Failed to look up image")?
    {
        return Ok(id);
    }

    let result = sqlx::query("INSERT OR IGNORE INTO images (post_id, url) VALUES (?, ?)")
        .bind(post_id)
        .bind(url)
        .execute(pool)
        .await
        .context("Failed to insert image")?;

    if result.rows_affected() > 0 {
        return Ok(result.last_insert_rowid());
    }
    // Lost a race with a concurrent insert of the same pair.
    let (id,): (i64,) =
        sqlx::query_as("SELECT id FROM images WHERE post_id = ? AND url = ? LIMIT 1")
            .bind(post_id)
            .bind(url)
            .fetch_one(pool)
            .await
            .context("Failed to re-fetch image after insert race")?;
    Ok(id)
}

/// Record a video reference. Idempotent on `(post_id, url)`.
pub async fn save_video(
    pool: &SqlitePool,
    post_id: &str,
    url: &str,
    cover_url: Option<&str>,
) -> Result<i64> {
    if let Some((id,)) =
        sqlx::query_as::<_, (i64,)>("SELECT id FROM videos WHERE post_id = ? AND url = ? LIMIT 1")
            .bind(post_id)
            .bind(url)
            .fetch_optional(pool)
            .await
            .context("Failed to look up video")?
    {
        return Ok(id);
    }

    let result =
        sqlx::query("INSERT OR IGNORE INTO videos (post_id, url, cover_url) VALUES (?, ?, ?)")
            .bind(post_id)
            .bind(url)
            .bind(cover_url)
            .execute(pool)
            .await
            .context("Failed to insert video")?;

    if result.rows_affected() > 0 {
        return Ok(result.last_insert_rowid());
    }
    let (id,): (i64,) =
        sqlx::query_as("SELECT id FROM videos WHERE post_id = ? AND url = ? LIMIT 1")
            .bind(post_id)
            .bind(url)
            .fetch_one(pool)
            .await
            .context("Failed to re-fetch video after insert race")?;
    Ok(id)
}

/// Record where an image landed locally. Written exactly once per row by
/// the media phase.
pub async fn set_image_path(pool: &SqlitePool, image_id: i64, local_path: &str) -> Result<()> {
    sqlx::query("UPDATE images SET local_path = ? WHERE id = ?")
        .bind(local_path)
        .bind(image_id)
        .execute(pool)
        .await
        .context("Failed to set image path")?;
    Ok(())
}

pub async fn set_video_path(pool: &SqlitePool, video_id: i64, local_path: &str) -> Result<()> {
    sqlx::query("UPDATE videos SET local_path = ? WHERE id = ?")
        .bind(local_path)
        .bind(video_id)
        .execute(pool)
        .await
        .context("Failed to set video path")?;
    Ok(())
}

/// Image rows not yet downloaded ("undownloaded" is derived from the
/// absence of a local path).
pub async fn undownloaded_images(pool: &SqlitePool) -> Result<Vec<MediaRow>> {
    sqlx::query_as(
        "SELECT id, post_id, url, local_path FROM images \
         WHERE local_path IS NULL OR local_path = '' ORDER BY post_id, id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list undownloaded images")
}

pub async fn undownloaded_videos(pool: &SqlitePool) -> Result<Vec<MediaRow>> {
    sqlx::query_as(
        "SELECT id, post_id, url, local_path FROM videos \
         WHERE local_path IS NULL OR local_path = '' ORDER BY post_id, id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list undownloaded videos")
}

/// All image rows of one post, for the report.
pub async fn images_for_post(pool: &SqlitePool, post_id: &str) -> Result<Vec<MediaRow>> {
    sqlx::query_as("SELECT id, post_id, url, local_path FROM images WHERE post_id = ? ORDER BY id")
        .bind(post_id)
        .fetch_all(pool)
        .await
        .context("Failed to list post images")
}

pub async fn videos_for_post(pool: &SqlitePool, post_id: &str) -> Result<Vec<MediaRow>> {
    sqlx::query_as("SELECT id, post_id, url, local_path FROM videos WHERE post_id = ? ORDER BY id")
        .bind(post_id)
        .fetch_all(pool)
        .await
        .context("Failed to list post videos")
}

// ========== Progress checkpoint ==========

/// Read a progress cursor. The pagination cursor (`last_page`) only ever
/// advances; it is never rolled back by a successful page.
pub async fn get_progress(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT value FROM progress WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("Failed to get progress")?;
    Ok(row.and_then(|(v,)| v))
}

pub async fn set_progress(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO progress (key, value, updated_at)
        VALUES (?, ?, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        ",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to set progress")?;
    Ok(())
}

// ========== Statistics ==========

/// Archive totals for the report page.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub total_posts: i64,
    pub total_images: i64,
    pub downloaded_images: i64,
    pub total_videos: i64,
    pub downloaded_videos: i64,
}

pub async fn statistics(pool: &SqlitePool) -> Result<Statistics> {
    let (total_posts,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
        .fetch_one(pool)
        .await?;
    let (total_images,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images")
        .fetch_one(pool)
        .await?;
    let (downloaded_images,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM images WHERE local_path IS NOT NULL AND local_path != ''",
    )
    .fetch_one(pool)
    .await?;
    let (total_videos,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM videos")
        .fetch_one(pool)
        .await?;
    let (downloaded_videos,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM videos WHERE local_path IS NOT NULL AND local_path != ''",
    )
    .fetch_one(pool)
    .await?;

    Ok(Statistics {
        total_posts,
        total_images,
        downloaded_images,
        total_videos,
        downloaded_videos,
    })
}
