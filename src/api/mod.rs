//! HTTP JSON boundary.
//!
//! Task submission and control, cookie-jar synchronization and the login
//! gate. This is deliberately thin: no sessions, no templates; every
//! route returns `{success, message, ...}` JSON and the engine does the
//! actual work.

use crate::config::{AppPaths, ConfigService};
use crate::core::engine::PipelineEngine;
use crate::core::housekeeping::Housekeeper;
use crate::services::monitor::DiscoveryScheduler;
use crate::store::MonitorStore;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub mod cookies;
pub mod monitors;
pub mod security;
pub mod tasks;

pub use cookies::CookieHintState;
pub use security::LoginGate;

/// Shared state for every route handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PipelineEngine>,
    pub housekeeper: Arc<Housekeeper>,
    pub config_service: Arc<dyn ConfigService>,
    pub paths: AppPaths,
    pub cookie_hints: Arc<CookieHintState>,
    pub login_gate: Arc<LoginGate>,
    pub monitor_store: MonitorStore,
    pub discovery: Arc<DiscoveryScheduler>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/tasks/{id}/start", post(tasks::start_task))
        .route("/tasks/{id}/delete", post(tasks::delete_task))
        .route("/tasks/{id}/abandon", post(tasks::abandon_task))
        .route("/tasks/{id}/force_upload", post(tasks::force_upload))
        .route("/tasks/clear_all", post(tasks::clear_all))
        .route("/tasks/reset_stuck", post(tasks::reset_stuck))
        .route("/logs/clear", post(tasks::clear_logs))
        .route(
            "/monitors",
            post(monitors::create_config).get(monitors::list_configs),
        )
        .route("/monitors/history", get(monitors::history))
        .route("/monitors/{id}", post(monitors::update_config))
        .route("/monitors/{id}/delete", post(monitors::delete_config))
        .route("/monitors/{id}/run", post(monitors::run_config))
        .route("/api/cookies/sync", post(cookies::sync_cookies))
        .route("/api/cookies/status", get(cookies::cookie_status))
        .route(
            "/api/cookies/refresh-needed",
            post(cookies::refresh_needed),
        )
        .route("/login", post(security::login))
        .with_state(state)
}
