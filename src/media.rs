//! Bulk media download for archived posts.
//!
//! Media references are recorded during the list/detail phases; this module
//! drains the "no local path yet" backlog, writing files under the storage
//! root and recording their relative paths back into the store. Downloads
//! are bounded by a semaphore and individually retried; a file already on
//! disk is treated as done and never re-fetched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::db::MediaRow;

const DOWNLOAD_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// What kind of media a batch holds; decides subdirectory, fallback
/// extension, and progress cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn subdir(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
        }
    }

    const fn default_ext(self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
        }
    }

    /// Videos are few and slow, so report more often.
    const fn progress_stride(self) -> usize {
        match self {
            Self::Image => 10,
            Self::Video => 5,
        }
    }
}

/// Downloads one kind of media into `{storage_root}/{subdir}/`.
pub struct MediaDownloader {
    client: Client,
    headers: HeaderMap,
    storage_root: PathBuf,
    concurrency: usize,
}

impl MediaDownloader {
    #[must_use]
    pub fn new(client: Client, headers: HeaderMap, storage_root: PathBuf, concurrency: usize) -> Self {
        Self {
            client,
            headers,
            storage_root,
            concurrency: concurrency.max(1),
        }
    }

    /// Download every row in the batch, returning `(row_id, local_path)`
    /// pairs; a `None` path means the download failed after retries and the
    /// row stays in the backlog for the next run.
    ///
    /// `progress` is invoked with `(done, total)` on a throttled cadence,
    /// including once for the final completion.
    ///
    /// # Errors
    ///
    /// Returns an error only if the target directory cannot be created;
    /// individual download failures are reported through the `None` paths.
    pub async fn download_batch<F>(
        &self,
        kind: MediaKind,
        rows: Vec<MediaRow>,
        progress: F,
    ) -> Result<Vec<(i64, Option<String>)>>
    where
        F: Fn(usize, usize),
    {
        let dir = self.storage_root.join(kind.subdir());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let total = rows.len();
        if total == 0 {
            progress(0, 0);
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (row, filename) in assign_filenames(rows, kind) {
            let semaphore = Arc::clone(&semaphore);
            let client = self.client.clone();
            let headers = self.headers.clone();
            let target = dir.join(&filename);
            let relative = format!("{}/{filename}", kind.subdir());
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                let ok = download_one(&client, &headers, &row.url, &target).await;
                (row.id, ok.then_some(relative))
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut throttle = ProgressThrottle::new(kind.progress_stride());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => warn!(error = %e, "media download task panicked"),
            }
            if throttle.should_report(results.len(), total) {
                progress(results.len(), total);
            }
        }

        Ok(results)
    }
}

/// Stable per-post filenames: `{post_id}_{n}.{ext}`, where `n` counts the
/// rows of one post in row-id order. Rows arrive ordered by `(post_id, id)`.
fn assign_filenames(rows: Vec<MediaRow>, kind: MediaKind) -> Vec<(MediaRow, String)> {
    let mut out = Vec::with_capacity(rows.len());
    let mut current_post = String::new();
    let mut index = 0usize;

    for row in rows {
        if row.post_id != current_post {
            current_post.clone_from(&row.post_id);
            index = 0;
        }
        let ext = extension_from_url(&row.url).unwrap_or_else(|| kind.default_ext().to_string());
        let filename = format!("{}_{index}.{ext}", row.post_id);
        index += 1;
        out.push((row, filename));
    }

    out
}

/// Extension from the URL path's final segment, when it looks like one.
fn extension_from_url(url: &str) -> Option<String> {
    let path = url::Url::parse(url).ok().map(|u| u.path().to_string())?;
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

async fn download_one(client: &Client, headers: &HeaderMap, url: &str, target: &Path) -> bool {
    // Present on disk means a previous run already fetched it.
    if tokio::fs::try_exists(target).await.unwrap_or(false) {
        debug!(path = %target.display(), "already downloaded, skipping");
        return true;
    }

    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match fetch_to_file(client, headers, url, target).await {
            Ok(()) => return true,
            Err(e) => {
                warn!(url, attempt, error = %e, "media download failed");
                if attempt < DOWNLOAD_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
            }
        }
    }
    false
}

async fn fetch_to_file(
    client: &Client,
    headers: &HeaderMap,
    url: &str,
    target: &Path,
) -> Result<()> {
    let resp = client
        .get(url)
        .headers(headers.clone())
        .send()
        .await
        .context("request failed")?;
    if !resp.status().is_success() {
        anyhow::bail!("status {}", resp.status());
    }
    let bytes = resp.bytes().await.context("body read failed")?;
    if bytes.is_empty() {
        anyhow::bail!("empty body");
    }
    tokio::fs::write(target, &bytes)
        .await
        .with_context(|| format!("write {} failed", target.display()))?;
    Ok(())
}

/// Emit progress on the final completion, on every Nth completion, or after
/// a second of silence, whichever comes first.
pub(crate) struct ProgressThrottle {
    stride: usize,
    last: Instant,
}

impl ProgressThrottle {
    pub(crate) fn new(stride: usize) -> Self {
        Self {
            stride: stride.max(1),
            last: Instant::now(),
        }
    }

    pub(crate) fn should_report(&mut self, done: usize, total: usize) -> bool {
        if done == total
            || done % self.stride == 0
            || self.last.elapsed() >= Duration::from_secs(1)
        {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}
