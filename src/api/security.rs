//! Login gate: failed-attempt counting with lockout.
//!
//! The boundary's only auth model is a boolean gate. State is a flat
//! JSON record (`db/security_state.json`) so lockouts survive restarts;
//! after the configured number of failures further attempts are refused
//! until the lockout window passes.

use super::AppState;
use crate::Result;
use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Mutex;

/// Persisted gate state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginSecurityState {
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
}

/// Attempt-counting gate over the flat state file.
pub struct LoginGate {
    path: PathBuf,
    state: Mutex<LoginSecurityState>,
    max_failed_attempts: u32,
    lockout_minutes: u64,
}

impl LoginGate {
    /// Load (or initialize) the gate from its state file.
    pub fn load(path: PathBuf, max_failed_attempts: u32, lockout_minutes: u64) -> Self {
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
            max_failed_attempts,
            lockout_minutes,
        }
    }

    fn persist(&self, state: &LoginSecurityState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }

    /// Whether attempts are currently refused.
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .locked_until
            .map(|until| Utc::now() < until)
            .unwrap_or(false)
    }

    /// Record a failed attempt; locks after the configured count.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.failed_attempts += 1;
        state.last_attempt = Some(Utc::now());
        if state.failed_attempts >= self.max_failed_attempts {
            let until = Utc::now() + ChronoDuration::minutes(self.lockout_minutes as i64);
            state.locked_until = Some(until);
            warn!(
                "Login locked after {} failures, until {}",
                state.failed_attempts, until
            );
        }
        let _ = self.persist(&state);
    }

    /// Record a success: counters reset.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.failed_attempts = 0;
        state.locked_until = None;
        state.last_attempt = Some(Utc::now());
        let _ = self.persist(&state);
    }

    /// Snapshot for status responses.
    pub fn snapshot(&self) -> LoginSecurityState {
        self.state.lock().unwrap().clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

/// `POST /login` — the boolean gate.
///
/// The expected password lives in the raw config store under
/// `LOGIN_PASSWORD`; with no password configured the gate is open.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Json<Value> {
    let gate = &state.login_gate;
    if gate.is_locked() {
        return Json(json!({
            "success": false,
            "message": "too many failed attempts, try again later",
            "locked": true,
        }));
    }
    let expected = state
        .config_service
        .get_value("LOGIN_PASSWORD")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    if expected.is_empty() || request.password == expected {
        gate.record_success();
        info!("Login accepted");
        Json(json!({"success": true, "message": "ok"}))
    } else {
        gate.record_failure();
        Json(json!({"success": false, "message": "invalid credentials"}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lockout_after_max_failures() {
        let dir = TempDir::new().unwrap();
        let gate = LoginGate::load(dir.path().join("security_state.json"), 3, 15);
        assert!(!gate.is_locked());
        gate.record_failure();
        gate.record_failure();
        assert!(!gate.is_locked());
        gate.record_failure();
        assert!(gate.is_locked());

        // Lockout state survives a reload.
        let reloaded = LoginGate::load(dir.path().join("security_state.json"), 3, 15);
        assert!(reloaded.is_locked());
    }

    #[test]
    fn test_success_resets_counters() {
        let dir = TempDir::new().unwrap();
        let gate = LoginGate::load(dir.path().join("security_state.json"), 5, 15);
        gate.record_failure();
        gate.record_failure();
        gate.record_success();
        assert_eq!(gate.snapshot().failed_attempts, 0);
        assert!(!gate.is_locked());
    }
}
