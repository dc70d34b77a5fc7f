//! Discovery config management routes.
//!
//! Config edits here are how recurring discovery jobs are added,
//! replaced and removed at runtime: the scheduler re-reads `auto`
//! configs on every tick, so a saved edit takes effect on the next one.

use super::AppState;
use crate::store::monitor::MonitorConfigInput;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct MonitorConfigRequest {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_region")]
    pub region_code: String,
    #[serde(default = "default_category")]
    pub category_id: String,
    #[serde(default = "default_time_period")]
    pub time_period_days: i64,
    #[serde(default = "default_max_results")]
    pub max_results: i64,
    #[serde(default)]
    pub min_view_count: i64,
    #[serde(default)]
    pub min_like_count: i64,
    #[serde(default)]
    pub min_comment_count: i64,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub exclude_keywords: String,
    #[serde(default)]
    pub channel_ids: String,
    #[serde(default)]
    pub exclude_channel_ids: String,
    #[serde(default)]
    pub min_duration: i64,
    #[serde(default)]
    pub max_duration: i64,
    #[serde(default = "default_schedule")]
    pub schedule_type: String,
    #[serde(default = "default_interval")]
    pub schedule_interval_minutes: i64,
    #[serde(default = "default_order")]
    pub order_by: String,
    #[serde(default)]
    pub start_date: String,
    #[serde(default = "default_rate_requests")]
    pub rate_limit_requests: i64,
    #[serde(default = "default_rate_window")]
    pub rate_limit_window: i64,
    #[serde(default)]
    pub auto_add_to_tasks: bool,
}

fn default_enabled() -> bool {
    true
}
fn default_region() -> String {
    "US".into()
}
fn default_category() -> String {
    "0".into()
}
fn default_time_period() -> i64 {
    7
}
fn default_max_results() -> i64 {
    10
}
fn default_schedule() -> String {
    "manual".into()
}
fn default_interval() -> i64 {
    60
}
fn default_order() -> String {
    "viewCount".into()
}
fn default_rate_requests() -> i64 {
    100
}
fn default_rate_window() -> i64 {
    60
}

impl From<MonitorConfigRequest> for MonitorConfigInput {
    fn from(r: MonitorConfigRequest) -> Self {
        Self {
            name: r.name,
            enabled: r.enabled,
            region_code: r.region_code,
            category_id: r.category_id,
            time_period_days: r.time_period_days,
            max_results: r.max_results,
            min_view_count: r.min_view_count,
            min_like_count: r.min_like_count,
            min_comment_count: r.min_comment_count,
            keywords: r.keywords,
            exclude_keywords: r.exclude_keywords,
            channel_ids: r.channel_ids,
            exclude_channel_ids: r.exclude_channel_ids,
            min_duration: r.min_duration,
            max_duration: r.max_duration,
            schedule_type: r.schedule_type,
            schedule_interval_minutes: r.schedule_interval_minutes,
            order_by: r.order_by,
            start_date: r.start_date,
            rate_limit_requests: r.rate_limit_requests,
            rate_limit_window: r.rate_limit_window,
            auto_add_to_tasks: r.auto_add_to_tasks,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    pub config_id: Option<i64>,
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    100
}

/// `POST /monitors` — save a new discovery config.
pub async fn create_config(
    State(state): State<AppState>,
    Json(request): Json<MonitorConfigRequest>,
) -> Json<Value> {
    if request.name.trim().is_empty() {
        return Json(json!({"success": false, "message": "name is required"}));
    }
    match state.monitor_store.create_config(&request.into()).await {
        Ok(id) => Json(json!({"success": true, "message": "ok", "config_id": id})),
        Err(e) => Json(json!({"success": false, "message": e.to_string()})),
    }
}

/// `GET /monitors` — list saved configs.
pub async fn list_configs(State(state): State<AppState>) -> Json<Value> {
    match state.monitor_store.list_configs().await {
        Ok(configs) => {
            let rows: Vec<Value> = configs
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "name": c.name,
                        "enabled": c.enabled,
                        "keywords": c.keywords,
                        "channel_ids": c.channel_ids,
                        "schedule_type": c.schedule_type,
                        "schedule_interval_minutes": c.schedule_interval_minutes,
                        "auto_add_to_tasks": c.auto_add_to_tasks,
                        "last_run_time": c.last_run_time,
                    })
                })
                .collect();
            Json(json!({"success": true, "configs": rows}))
        }
        Err(e) => Json(json!({"success": false, "message": e.to_string()})),
    }
}

/// `POST /monitors/{id}` — replace a config in place.
pub async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<MonitorConfigRequest>,
) -> Json<Value> {
    match state.monitor_store.update_config(id, &request.into()).await {
        Ok(()) => Json(json!({"success": true, "message": "ok"})),
        Err(e) => Json(json!({"success": false, "message": e.to_string()})),
    }
}

/// `POST /monitors/{id}/delete` — remove a config and its history.
pub async fn delete_config(State(state): State<AppState>, Path(id): Path<i64>) -> Json<Value> {
    match state.monitor_store.delete_config(id).await {
        Ok(true) => Json(json!({"success": true, "message": "ok"})),
        Ok(false) => Json(json!({"success": false, "message": "config not found"})),
        Err(e) => Json(json!({"success": false, "message": e.to_string()})),
    }
}

/// `POST /monitors/{id}/run` — execute a config immediately.
pub async fn run_config(State(state): State<AppState>, Path(id): Path<i64>) -> Json<Value> {
    match state.discovery.run_config(id).await {
        Ok(report) => Json(json!({
            "success": true,
            "candidates": report.candidates,
            "matched": report.matched,
            "new_videos": report.new_videos,
            "enqueued": report.enqueued,
            "rate_limited": report.aborted_at_rate_limit,
        })),
        Err(e) => Json(json!({"success": false, "message": e.to_string()})),
    }
}

/// `GET /monitors/history` — recent discovery history.
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    match state
        .monitor_store
        .history(query.config_id, query.limit.clamp(1, 1000))
        .await
    {
        Ok(rows) => {
            let rows: Vec<Value> = rows
                .iter()
                .map(|h| {
                    json!({
                        "config_id": h.config_id,
                        "video_id": h.video_id,
                        "video_title": h.video_title,
                        "channel_title": h.channel_title,
                        "view_count": h.view_count,
                        "added_to_tasks": h.added_to_tasks,
                        "published_at": h.published_at,
                    })
                })
                .collect();
            Json(json!({"success": true, "history": rows}))
        }
        Err(e) => Json(json!({"success": false, "message": e.to_string()})),
    }
}
