//! Task store and engine lifecycle properties.

use chrono::{Duration as ChronoDuration, Utc};
use retube::api::CookieHintState;
use retube::config::{AppPaths, Config, TestConfigService};
use retube::core::engine::PipelineEngine;
use retube::store::{TaskPatch, TaskStatus, TaskStore, open_pool};
use std::sync::Arc;
use tempfile::TempDir;

async fn fixture() -> (TempDir, TaskStore, Arc<PipelineEngine>) {
    let dir = TempDir::new().unwrap();
    let paths = AppPaths::new(dir.path());
    let pool = open_pool(&paths.tasks_db()).await.unwrap();
    let store = TaskStore::open(pool, paths.clone()).await.unwrap();
    let engine = PipelineEngine::new(
        store.clone(),
        Arc::new(TestConfigService::new(Config::default())),
        paths,
        Arc::new(CookieHintState::default()),
    );
    (dir, store, engine)
}

#[tokio::test]
async fn updated_at_is_monotonic_across_transitions() {
    let (_dir, store, _engine) = fixture().await;
    let task = store.create("https://www.youtube.com/watch?v=A").await.unwrap();

    let mut previous = task.updated_at;
    for status in [
        TaskStatus::FetchingInfo,
        TaskStatus::InfoFetched,
        TaskStatus::Translating,
        TaskStatus::Tagging,
        TaskStatus::Partitioning,
        TaskStatus::Downloading,
        TaskStatus::Downloaded,
        TaskStatus::ReadyForUpload,
    ] {
        let updated = store
            .update(&task.id, TaskPatch::status(status), false)
            .await
            .unwrap()
            .unwrap();
        // Strictly greater on every status change.
        assert!(updated.updated_at > previous, "{:?}", status);
        assert!(updated.updated_at >= updated.created_at);
        previous = updated.updated_at;
    }
}

#[tokio::test]
async fn field_update_without_status_change_still_bumps() {
    let (_dir, store, _engine) = fixture().await;
    let task = store.create("https://example.com/v").await.unwrap();
    let before = task.updated_at;
    let updated = store
        .update(
            &task.id,
            TaskPatch {
                title_original: Some("a title".into()),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap()
        .unwrap();
    assert!(updated.updated_at >= before);
}

#[tokio::test]
async fn scenario_stuck_uploading_row_resets_after_45_minutes() {
    let (_dir, store, _engine) = fixture().await;
    let task = store.create("https://example.com/v").await.unwrap();
    store
        .update(&task.id, TaskPatch::status(TaskStatus::Uploading), false)
        .await
        .unwrap();

    // Simulate a process restart that left the row idle for 45 minutes.
    let backdated = (Utc::now() - ChronoDuration::minutes(45)).to_rfc3339();
    sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
        .bind(&backdated)
        .bind(&task.id)
        .execute(store.pool())
        .await
        .unwrap();

    let reset = store.reset_stuck(30).await.unwrap();
    assert_eq!(reset, 1);
    let task = store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.error_message
            .unwrap()
            .starts_with("timeout reset (prev=uploading)")
    );
}

#[tokio::test]
async fn ready_for_upload_rows_are_not_stuck_candidates() {
    let (_dir, store, _engine) = fixture().await;
    let task = store.create("https://example.com/v").await.unwrap();
    store
        .update(&task.id, TaskPatch::status(TaskStatus::ReadyForUpload), false)
        .await
        .unwrap();
    let backdated = (Utc::now() - ChronoDuration::minutes(90)).to_rfc3339();
    sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
        .bind(&backdated)
        .bind(&task.id)
        .execute(store.pool())
        .await
        .unwrap();
    assert_eq!(store.reset_stuck(30).await.unwrap(), 0);
}

#[tokio::test]
async fn scanner_promotes_oldest_pending_only_below_cap() {
    let (_dir, store, _engine) = fixture().await;
    // Cap is 3; three in-progress rows saturate it.
    for _ in 0..3 {
        let t = store.create("https://example.com/busy").await.unwrap();
        store
            .update(&t.id, TaskPatch::status(TaskStatus::Downloading), false)
            .await
            .unwrap();
    }
    let _pending = store.create("https://example.com/waiting").await.unwrap();
    assert_eq!(store.count_in_progress().await.unwrap(), 3);

    // The scanner's own check: in-progress >= cap means no promotion.
    let cap = Config::default().concurrency.max_concurrent_tasks;
    assert!(store.count_in_progress().await.unwrap() >= cap);

    // Free one slot; the oldest pending becomes eligible.
    let busy = store.list_by_status(TaskStatus::Downloading).await.unwrap();
    store
        .update(&busy[0].id, TaskPatch::status(TaskStatus::Completed), false)
        .await
        .unwrap();
    assert!(store.count_in_progress().await.unwrap() < cap);
    let next = store.oldest_pending().await.unwrap().unwrap();
    assert_eq!(next.source_url, "https://example.com/waiting");
}

#[tokio::test]
async fn delete_while_in_flight_is_observed_on_next_write() {
    let (_dir, store, _engine) = fixture().await;
    let task = store.create("https://example.com/v").await.unwrap();
    store.delete(&task.id, true).await.unwrap();
    // A stage writing after deletion sees None and stops quietly.
    let result = store
        .update(&task.id, TaskPatch::status(TaskStatus::Downloading), false)
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn submit_playlist_shaped_url_requires_downloader() {
    let (_dir, _store, engine) = fixture().await;
    // Without the external binary the playlist expansion must error,
    // not create half a batch.
    let result = engine
        .submit_url("https://www.youtube.com/playlist?list=PL123")
        .await;
    assert!(result.is_err());
    let tasks = engine.store().list().await.unwrap();
    assert!(tasks.is_empty());
}
