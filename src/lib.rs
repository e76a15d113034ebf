//! Weibo backup pipeline library.
//!
//! Incrementally harvests a user's post history from the weibo.cn mobile
//! HTML site, enriches truncated/ambiguous posts via per-post detail pages,
//! downloads referenced media, and persists everything into a resumable
//! SQLite store.

pub mod config;
pub mod db;
pub mod fetcher;
pub mod http;
pub mod media;
pub mod parser;
pub mod pipeline;
pub mod report;
