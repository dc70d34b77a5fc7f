//! HTTP boundary tests over a live listener.

use retube::api::{self, AppState, CookieHintState, LoginGate};
use retube::config::{AppPaths, Config, TestConfigService};
use retube::core::engine::{PipelineEngine, PipelineEngineHandle};
use retube::core::housekeeping::Housekeeper;
use retube::services::monitor::DiscoveryScheduler;
use retube::store::{MonitorStore, TaskStore, open_pool};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;

async fn serve(config: Config) -> (TempDir, String, AppState) {
    let dir = TempDir::new().unwrap();
    let paths = AppPaths::new(dir.path());
    let pool = open_pool(&paths.tasks_db()).await.unwrap();
    let store = TaskStore::open(pool, paths.clone()).await.unwrap();
    let monitor_pool = open_pool(&paths.monitor_db()).await.unwrap();
    let monitor_store = MonitorStore::open(monitor_pool).await.unwrap();
    let config_service = Arc::new(TestConfigService::new(config.clone()));
    let cookie_hints = Arc::new(CookieHintState::default());
    let engine = PipelineEngine::new(
        store.clone(),
        config_service.clone(),
        paths.clone(),
        cookie_hints.clone(),
    );
    let housekeeper = Arc::new(Housekeeper::new(
        paths.clone(),
        store,
        config_service.clone(),
    ));
    let discovery = Arc::new(DiscoveryScheduler::new(
        monitor_store.clone(),
        Arc::new(PipelineEngineHandle {
            engine: Arc::clone(&engine),
        }),
        config.monitor.clone(),
    ));
    let login_gate = Arc::new(LoginGate::load(paths.security_state(), 3, 15));
    let state = AppState {
        engine,
        housekeeper,
        config_service,
        paths,
        cookie_hints,
        login_gate,
        monitor_store,
        discovery,
    };
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (dir, format!("http://{}", addr), state)
}

#[tokio::test]
async fn submit_single_url_creates_pending_task() {
    let (_dir, base, state) = serve(Config::default()).await;
    let client = reqwest::Client::new();
    let response: Value = client
        .post(format!("{}/tasks", base))
        .json(&json!({"source_url": "https://www.youtube.com/watch?v=abc"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["success"], true);
    let task_id = response["task_id"].as_str().unwrap();

    let task = state.engine.store().get(task_id).await.unwrap();
    assert_eq!(task.status.as_str(), "pending");

    // Listing shows it.
    let listing: Value = client
        .get(format!("{}/tasks", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["tasks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_url_is_rejected() {
    let (_dir, base, _state) = serve(Config::default()).await;
    let response: Value = reqwest::Client::new()
        .post(format!("{}/tasks", base))
        .json(&json!({"source_url": "  "}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["success"], false);
}

#[tokio::test]
async fn delete_endpoint_removes_task_and_files() {
    let (_dir, base, state) = serve(Config::default()).await;
    let client = reqwest::Client::new();
    let created: Value = client
        .post(format!("{}/tasks", base))
        .json(&json!({"source_url": "https://www.youtube.com/watch?v=gone"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = created["task_id"].as_str().unwrap();
    let task_dir = state.engine.store().ensure_task_dir(task_id).unwrap();
    std::fs::write(task_dir.join("metadata.json"), "{}").unwrap();

    let response: Value = client
        .post(format!("{}/tasks/{}/delete", base, task_id))
        .json(&json!({"delete_files": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["success"], true);
    assert!(!task_dir.exists());
    assert!(state.engine.store().try_get(task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn cookie_sync_writes_jar_and_clears_hint() {
    let (dir, base, state) = serve(Config::default()).await;
    state.cookie_hints.record("bot_detection", None);

    let client = reqwest::Client::new();
    let response: Value = client
        .post(format!("{}/api/cookies/sync", base))
        .json(&json!({
            "source": "extension",
            "timestamp": 1767225600,
            "cookies": "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t0\tSID\txyz\n",
            "cookieCount": 1
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["success"], true);
    let jar = dir.path().join("cookies").join("yt_cookies.txt");
    assert!(jar.exists());

    let status: Value = client
        .get(format!("{}/api/cookies/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["exists"], true);
    assert!(status["refresh_hint"].is_null());
}

#[tokio::test]
async fn refresh_needed_records_hint() {
    let (_dir, base, state) = serve(Config::default()).await;
    let response: Value = reqwest::Client::new()
        .post(format!("{}/api/cookies/refresh-needed", base))
        .json(&json!({"reason": "bot_detection", "video_url": "https://x/watch?v=1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["success"], true);
    assert_eq!(state.cookie_hints.current().unwrap().reason, "bot_detection");
}

#[tokio::test]
async fn login_lockout_after_repeated_failures() {
    let (_dir, base, state) = serve(Config::default()).await;
    state
        .config_service
        .set_value("LOGIN_PASSWORD", json!("correct-horse"))
        .unwrap();
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response: Value = client
            .post(format!("{}/login", base))
            .json(&json!({"password": "wrong"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["success"], false);
    }
    // Locked now; even the right password is refused.
    let response: Value = client
        .post(format!("{}/login", base))
        .json(&json!({"password": "correct-horse"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["success"], false);
    assert_eq!(response["locked"], true);
}

#[tokio::test]
async fn monitor_config_crud_round_trip() {
    let (_dir, base, _state) = serve(Config::default()).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/monitors", base))
        .json(&json!({
            "name": "weekly music",
            "keywords": "live concert",
            "min_view_count": 5000,
            "schedule_type": "auto",
            "auto_add_to_tasks": true
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["success"], true);
    let id = created["config_id"].as_i64().unwrap();

    // Replace the schedule; the scheduler observes the edit on its next
    // tick without re-registration.
    let updated: Value = client
        .post(format!("{}/monitors/{}", base, id))
        .json(&json!({
            "name": "weekly music",
            "keywords": "live concert",
            "schedule_type": "manual"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["success"], true);

    let listing: Value = client
        .get(format!("{}/monitors", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["configs"][0]["schedule_type"], "manual");

    let deleted: Value = client
        .post(format!("{}/monitors/{}/delete", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["success"], true);
    let listing: Value = client
        .get(format!("{}/monitors", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["configs"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn reset_stuck_endpoint_reports_count() {
    let (_dir, base, _state) = serve(Config::default()).await;
    let response: Value = reqwest::Client::new()
        .post(format!("{}/tasks/reset_stuck", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["success"], true);
    assert_eq!(response["reset"], 0);
}
