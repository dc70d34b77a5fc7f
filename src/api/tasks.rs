//! Task submission and control routes.

use super::AppState;
use crate::core::housekeeping::STUCK_TIMEOUT_MINUTES;
use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub source_url: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteTaskRequest {
    #[serde(default)]
    pub delete_files: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct ClearAllRequest {
    #[serde(default = "default_true")]
    pub delete_files: bool,
}

fn default_true() -> bool {
    true
}

fn ok(extra: Value) -> Json<Value> {
    let mut body = json!({"success": true, "message": "ok"});
    if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    Json(body)
}

fn fail(message: String) -> Json<Value> {
    Json(json!({"success": false, "message": message}))
}

/// `POST /tasks` — create one task, or one per video for a playlist URL.
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Json<Value> {
    let url = request.source_url.trim();
    if url.is_empty() {
        return fail("source_url is required".into());
    }
    match state.engine.submit_url(url).await {
        Ok(ids) if ids.len() == 1 => ok(json!({"task_id": ids[0]})),
        Ok(ids) => ok(json!({"added_count": ids.len()})),
        Err(e) => fail(e.to_string()),
    }
}

/// `GET /tasks` — full task listing, newest first.
pub async fn list_tasks(State(state): State<AppState>) -> Json<Value> {
    match state.engine.store().list().await {
        Ok(tasks) => {
            let rows: Vec<Value> = tasks
                .iter()
                .map(|t| {
                    json!({
                        "id": t.id,
                        "source_url": t.source_url,
                        "status": t.status.as_str(),
                        "created_at": t.created_at.to_rfc3339(),
                        "updated_at": t.updated_at.to_rfc3339(),
                        "title": t.title_translated.as_deref().or(t.title_original.as_deref()),
                        "upload_progress": t.upload_progress,
                        "error_message": t.error_message,
                    })
                })
                .collect();
            ok(json!({"tasks": rows}))
        }
        Err(e) => fail(e.to_string()),
    }
}

/// `POST /tasks/{id}/start`.
pub async fn start_task(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    match state.engine.start_task(&id).await {
        Ok(()) => ok(json!({"task_id": id})),
        Err(e) => fail(e.to_string()),
    }
}

/// `POST /tasks/{id}/delete`.
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<DeleteTaskRequest>>,
) -> Json<Value> {
    let delete_files = body.map(|Json(b)| b.delete_files).unwrap_or(false);
    match state.engine.delete_task(&id, delete_files).await {
        Ok(true) => ok(json!({})),
        Ok(false) => fail("task not found".into()),
        Err(e) => fail(e.to_string()),
    }
}

/// `POST /tasks/{id}/abandon`.
pub async fn abandon_task(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    match state.engine.abandon_task(&id).await {
        Ok(()) => ok(json!({})),
        Err(e) => fail(e.to_string()),
    }
}

/// `POST /tasks/{id}/force_upload`.
pub async fn force_upload(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    match state.engine.force_upload(&id).await {
        Ok(()) => ok(json!({})),
        Err(e) => fail(e.to_string()),
    }
}

/// `POST /tasks/clear_all`.
pub async fn clear_all(
    State(state): State<AppState>,
    body: Option<Json<ClearAllRequest>>,
) -> Json<Value> {
    let delete_files = body.map(|Json(b)| b.delete_files).unwrap_or(true);
    match state.engine.store().clear_all(delete_files).await {
        Ok(count) => ok(json!({"cleared": count})),
        Err(e) => fail(e.to_string()),
    }
}

/// `POST /tasks/reset_stuck`.
pub async fn reset_stuck(State(state): State<AppState>) -> Json<Value> {
    match state.engine.store().reset_stuck(STUCK_TIMEOUT_MINUTES).await {
        Ok(count) => ok(json!({"reset": count})),
        Err(e) => fail(e.to_string()),
    }
}

/// `POST /logs/clear` — truncate the long-lived logs, drop per-task logs.
pub async fn clear_logs(State(state): State<AppState>) -> Json<Value> {
    match state.housekeeper.clear_current_logs() {
        Ok(count) => ok(json!({"cleared": count})),
        Err(e) => fail(e.to_string()),
    }
}
