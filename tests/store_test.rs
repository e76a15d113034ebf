//! Integration tests for the SQLite store contract.

use tempfile::TempDir;
use weibo_backup::config::RecheckMode;
use weibo_backup::db::{
    self, Database, EnrichmentState, NewPost, PostExtra, PostPatch, RecheckScope, RetweetCategory,
};

async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

fn new_post(id: &str, created_at: &str, text: &str) -> NewPost {
    NewPost {
        id: id.to_string(),
        user_id: "42".to_string(),
        created_at: Some(created_at.to_string()),
        text: text.to_string(),
        source: Some("iPhone".to_string()),
        reposts_count: 0,
        comments_count: 0,
        attitudes_count: 0,
        is_retweet: false,
        is_truncated: false,
        retweet_category: RetweetCategory::Original,
        extra: PostExtra::default(),
    }
}

#[tokio::test]
async fn insert_is_idempotent_and_preserves_first_write() {
    let (db, _tmp) = setup_db().await;

    let post = new_post("M_A", "2024-01-01 10:00", "first version");
    assert!(db::insert_post(db.pool(), &post).await.unwrap());

    let mut again = new_post("M_A", "2024-01-01 10:00", "second version");
    again.attitudes_count = 99;
    assert!(!db::insert_post(db.pool(), &again).await.unwrap());

    let brief = db::get_post_brief(db.pool(), "M_A").await.unwrap().unwrap();
    assert_eq!(brief.text.as_deref(), Some("first version"));
    assert!(db::post_exists(db.pool(), "M_A").await.unwrap());
    assert!(!db::post_exists(db.pool(), "M_B").await.unwrap());
}

#[tokio::test]
async fn patch_updates_only_named_fields() {
    let (db, _tmp) = setup_db().await;
    db::insert_post(db.pool(), &new_post("M_A", "2024-01-01 10:00", "clipped..."))
        .await
        .unwrap();

    let patch = PostPatch {
        text: Some("full text".to_string()),
        is_retweet: Some(true),
        retweet_category: Some(RetweetCategory::Retweet),
        detail_fetched: Some(true),
        ..PostPatch::default()
    };
    db::update_post_fields(db.pool(), "M_A", &patch).await.unwrap();

    let posts = db::get_all_posts(db.pool()).await.unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].text.as_deref(), Some("full text"));
    assert_eq!(posts[0].is_retweet, Some(1));
    assert_eq!(posts[0].retweet_category.as_deref(), Some("retweet"));
    assert_eq!(posts[0].detail_fetched, 1);
    // Untouched columns keep their values.
    assert_eq!(posts[0].created_at.as_deref(), Some("2024-01-01 10:00"));
    assert_eq!(posts[0].source.as_deref(), Some("iPhone"));

    // An empty patch is a no-op rather than an error.
    db::update_post_fields(db.pool(), "M_A", &PostPatch::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn truncated_unfetched_query_excludes_enriched() {
    let (db, _tmp) = setup_db().await;

    let mut truncated = new_post("M_A", "2024-01-02 10:00", "clipped");
    truncated.is_truncated = true;
    db::insert_post(db.pool(), &truncated).await.unwrap();

    let mut done = new_post("M_B", "2024-01-01 10:00", "already enriched");
    done.is_truncated = true;
    db::insert_post(db.pool(), &done).await.unwrap();
    let patch = PostPatch {
        detail_fetched: Some(true),
        ..PostPatch::default()
    };
    db::update_post_fields(db.pool(), "M_B", &patch).await.unwrap();

    let ids = db::list_truncated_unfetched(db.pool(), 10).await.unwrap();
    assert_eq!(ids, vec!["M_A".to_string()]);
}

#[tokio::test]
async fn permanently_missing_is_terminal() {
    let (db, _tmp) = setup_db().await;
    db::insert_post(db.pool(), &new_post("M_A", "2024-01-01 10:00", "gone soon"))
        .await
        .unwrap();

    let extra = PostExtra {
        detail_missing: true,
        detail_missing_reason: Some("reported_missing_or_deleted".to_string()),
        ..PostExtra::default()
    };
    let patch = PostPatch {
        extra_json: Some(extra.to_json()),
        detail_fetched: Some(true),
        ..PostPatch::default()
    };
    db::update_post_fields(db.pool(), "M_A", &patch).await.unwrap();

    let brief = db::get_post_brief(db.pool(), "M_A").await.unwrap().unwrap();
    let state = EnrichmentState::of(&brief);
    assert_eq!(state, EnrichmentState::PermanentlyMissing);
    assert!(state.is_terminal());
    assert!(db::list_truncated_unfetched(db.pool(), 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn recheck_candidates_scoped_by_year_and_mode() {
    let (db, _tmp) = setup_db().await;

    let mut video_2019 = new_post("M_A", "2019-05-01 10:00", "看看这个 微博视频 很精彩");
    video_2019.is_retweet = false;
    db::insert_post(db.pool(), &video_2019).await.unwrap();

    db::insert_post(
        db.pool(),
        &new_post("M_B", "2019-06-01 10:00", "plain original"),
    )
    .await
    .unwrap();

    db::insert_post(
        db.pool(),
        &new_post("M_C", "2020-01-01 10:00", "也有 微博视频 但年份不对"),
    )
    .await
    .unwrap();

    let mut retweet_2019 = new_post("M_D", "2019-07-01 10:00", "转发 微博视频");
    retweet_2019.is_retweet = true;
    retweet_2019.retweet_category = RetweetCategory::Retweet;
    db::insert_post(db.pool(), &retweet_2019).await.unwrap();

    let ids = db::list_recheck_candidates(
        db.pool(),
        RecheckScope::Year(2019),
        RecheckMode::VideoPhrase,
        10,
    )
    .await
    .unwrap();
    assert_eq!(ids, vec!["M_A".to_string()]);

    let ids = db::list_recheck_candidates(
        db.pool(),
        RecheckScope::Year(2019),
        RecheckMode::AllOriginal,
        10,
    )
    .await
    .unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"M_A".to_string()));
    assert!(ids.contains(&"M_B".to_string()));

    let ids = db::list_recheck_candidates(
        db.pool(),
        RecheckScope::BeforeYear(2020),
        RecheckMode::VideoPhrase,
        10,
    )
    .await
    .unwrap();
    assert_eq!(ids, vec!["M_A".to_string()]);
}

#[tokio::test]
async fn backfill_query_selects_old_unfetched_posts() {
    let (db, _tmp) = setup_db().await;
    db::insert_post(db.pool(), &new_post("M_A", "2015-01-01 10:00", "old post"))
        .await
        .unwrap();
    db::insert_post(db.pool(), &new_post("M_B", "2023-01-01 10:00", "new post"))
        .await
        .unwrap();

    let ids = db::list_unfetched_before_year(db.pool(), 2020, 10)
        .await
        .unwrap();
    assert_eq!(ids, vec!["M_A".to_string()]);
}

#[tokio::test]
async fn media_rows_are_deduped_per_post_and_url() {
    let (db, _tmp) = setup_db().await;
    db::insert_post(db.pool(), &new_post("M_A", "2024-01-01 10:00", "with pics"))
        .await
        .unwrap();

    let first = db::save_image(db.pool(), "M_A", "https://wx1.sinaimg.cn/large/a.jpg")
        .await
        .unwrap();
    let second = db::save_image(db.pool(), "M_A", "https://wx1.sinaimg.cn/large/a.jpg")
        .await
        .unwrap();
    assert_eq!(first, second);

    let undone = db::undownloaded_images(db.pool()).await.unwrap();
    assert_eq!(undone.len(), 1);

    db::set_image_path(db.pool(), first, "images/M_A_0.jpg")
        .await
        .unwrap();
    assert!(db::undownloaded_images(db.pool()).await.unwrap().is_empty());

    let rows = db::images_for_post(db.pool(), "M_A").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_downloaded());
}

#[tokio::test]
async fn progress_checkpoint_round_trips_and_overwrites() {
    let (db, _tmp) = setup_db().await;

    assert!(db::get_progress(db.pool(), "last_page:42")
        .await
        .unwrap()
        .is_none());
    db::set_progress(db.pool(), "last_page:42", "7").await.unwrap();
    assert_eq!(
        db::get_progress(db.pool(), "last_page:42").await.unwrap(),
        Some("7".to_string())
    );
    db::set_progress(db.pool(), "last_page:42", "8").await.unwrap();
    assert_eq!(
        db::get_progress(db.pool(), "last_page:42").await.unwrap(),
        Some("8".to_string())
    );
}

#[tokio::test]
async fn statistics_count_downloads() {
    let (db, _tmp) = setup_db().await;
    db::insert_post(db.pool(), &new_post("M_A", "2024-01-01 10:00", "post"))
        .await
        .unwrap();
    let img = db::save_image(db.pool(), "M_A", "https://wx1.sinaimg.cn/large/a.jpg")
        .await
        .unwrap();
    db::save_image(db.pool(), "M_A", "https://wx1.sinaimg.cn/large/b.jpg")
        .await
        .unwrap();
    db::save_video(db.pool(), "M_A", "https://video.weibo.com/show?fid=1", None)
        .await
        .unwrap();
    db::set_image_path(db.pool(), img, "images/M_A_0.jpg")
        .await
        .unwrap();

    let stats = db::statistics(db.pool()).await.unwrap();
    assert_eq!(stats.total_posts, 1);
    assert_eq!(stats.total_images, 2);
    assert_eq!(stats.downloaded_images, 1);
    assert_eq!(stats.total_videos, 1);
    assert_eq!(stats.downloaded_videos, 0);
}
