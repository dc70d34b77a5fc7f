//! Cookie-jar synchronization routes and the refresh-hint store.
//!
//! A browser extension pushes the source-site cookie jar through
//! `POST /api/cookies/sync`; the downloader records a refresh hint when
//! it detects anti-bot gating, and the UI polls it to prompt the user.

use super::AppState;
use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Mutex;

/// One recorded refresh hint.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshHint {
    pub reason: String,
    pub video_url: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Process-wide store of the latest cookie refresh hint.
#[derive(Default)]
pub struct CookieHintState {
    inner: Mutex<Option<RefreshHint>>,
}

impl CookieHintState {
    /// Record (replacing) the current hint.
    pub fn record(&self, reason: &str, video_url: Option<String>) {
        warn!("Cookie refresh hint recorded: {}", reason);
        *self.inner.lock().unwrap() = Some(RefreshHint {
            reason: reason.to_string(),
            video_url,
            recorded_at: Utc::now(),
        });
    }

    /// The current hint, if any.
    pub fn current(&self) -> Option<RefreshHint> {
        self.inner.lock().unwrap().clone()
    }

    /// Clear the hint (after a successful sync).
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub source: Option<String>,
    pub timestamp: Option<i64>,
    /// Netscape-format jar content.
    pub cookies: String,
    #[serde(rename = "cookieCount")]
    pub cookie_count: Option<u64>,
    #[serde(rename = "userAgent")]
    pub user_agent: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshNeededRequest {
    pub reason: String,
    pub video_url: Option<String>,
}

/// `POST /api/cookies/sync` — write the jar to `cookies/yt_cookies.txt`.
pub async fn sync_cookies(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> Json<Value> {
    let dir = state.paths.cookies_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        return Json(json!({"success": false, "message": e.to_string()}));
    }
    let path = dir.join("yt_cookies.txt");
    match std::fs::write(&path, request.cookies.as_bytes()) {
        Ok(()) => {
            info!(
                "Cookie jar synced from {} ({} cookies)",
                request.source.as_deref().unwrap_or("unknown"),
                request.cookie_count.unwrap_or(0)
            );
            state.cookie_hints.clear();
            Json(json!({"success": true, "message": "cookies saved"}))
        }
        Err(e) => Json(json!({"success": false, "message": e.to_string()})),
    }
}

/// `GET /api/cookies/status` — jar file metadata plus the pending hint.
pub async fn cookie_status(State(state): State<AppState>) -> Json<Value> {
    let path = state.paths.cookies_dir().join("yt_cookies.txt");
    let metadata = std::fs::metadata(&path).ok();
    let modified = metadata
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
    Json(json!({
        "success": true,
        "exists": metadata.is_some(),
        "size": metadata.map(|m| m.len()).unwrap_or(0),
        "modified": modified,
        "refresh_hint": state.cookie_hints.current(),
    }))
}

/// `POST /api/cookies/refresh-needed` — record a hint for the UI.
pub async fn refresh_needed(
    State(state): State<AppState>,
    Json(request): Json<RefreshNeededRequest>,
) -> Json<Value> {
    state
        .cookie_hints
        .record(&request.reason, request.video_url);
    Json(json!({"success": true, "message": "hint recorded"}))
}
