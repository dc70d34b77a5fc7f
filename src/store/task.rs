//! Task records and status transitions.
//!
//! The `tasks` table is the single source of truth for pipeline progress.
//! Status values are stored as their legacy wire strings so databases
//! written by earlier deployments stay readable.

use crate::config::AppPaths;
use crate::{Result, error::RetubeError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use uuid::Uuid;

/// Task lifecycle states.
///
/// The enum is closed: every row in the database maps to exactly one
/// variant, and `match` sites are exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Created, waiting for a task permit.
    Pending,
    /// Metadata fetch in flight.
    FetchingInfo,
    /// Metadata fetch finished.
    InfoFetched,
    /// Title/description translation in flight.
    Translating,
    /// Tag generation in flight.
    Tagging,
    /// Category classification in flight.
    Partitioning,
    /// Text moderation in flight.
    Moderating,
    /// Moderation rejected; waiting for a human decision.
    AwaitingManualReview,
    /// Media download in flight.
    Downloading,
    /// Media download finished.
    Downloaded,
    /// Speech recognition in flight.
    AsrTranscribing,
    /// Subtitle translation in flight.
    TranslatingSubtitle,
    /// Subtitle burn-in in flight.
    EncodingVideo,
    /// All processing done; waiting for an upload permit.
    ReadyForUpload,
    /// Chunked upload in flight.
    Uploading,
    /// Published successfully. Terminal.
    Completed,
    /// Failed; `error_message` carries the short reason. Terminal.
    Failed,
}

impl TaskStatus {
    /// Legacy wire string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::FetchingInfo => "fetching_info",
            Self::InfoFetched => "info_fetched",
            Self::Translating => "translating",
            Self::Tagging => "tagging",
            Self::Partitioning => "partitioning",
            Self::Moderating => "moderating",
            Self::AwaitingManualReview => "awaiting_manual_review",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::AsrTranscribing => "asr_transcribing",
            Self::TranslatingSubtitle => "translating_subtitle",
            Self::EncodingVideo => "encoding_video",
            Self::ReadyForUpload => "ready_for_upload",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a wire string.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => Self::Pending,
            "fetching_info" => Self::FetchingInfo,
            "info_fetched" => Self::InfoFetched,
            "translating" => Self::Translating,
            "tagging" => Self::Tagging,
            "partitioning" => Self::Partitioning,
            "moderating" => Self::Moderating,
            "awaiting_manual_review" => Self::AwaitingManualReview,
            "downloading" => Self::Downloading,
            "downloaded" => Self::Downloaded,
            "asr_transcribing" => Self::AsrTranscribing,
            "translating_subtitle" => Self::TranslatingSubtitle,
            "encoding_video" => Self::EncodingVideo,
            "ready_for_upload" => Self::ReadyForUpload,
            "uploading" => Self::Uploading,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => {
                return Err(RetubeError::task_state(format!(
                    "unknown task status '{}'",
                    other
                )));
            }
        })
    }

    /// Terminal states carry no scheduled background work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States counted against the task-permit cap by the pending scanner.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::FetchingInfo
                | Self::InfoFetched
                | Self::Translating
                | Self::Tagging
                | Self::Partitioning
                | Self::Moderating
                | Self::Downloading
                | Self::Downloaded
                | Self::AsrTranscribing
                | Self::TranslatingSubtitle
                | Self::EncodingVideo
                | Self::Uploading
        )
    }

    /// States eligible for the stuck-task timeout reset.
    pub fn is_stuck_candidate(&self) -> bool {
        matches!(
            self,
            Self::FetchingInfo
                | Self::Translating
                | Self::Downloading
                | Self::AsrTranscribing
                | Self::TranslatingSubtitle
                | Self::EncodingVideo
                | Self::Uploading
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted task row.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Opaque 128-bit identifier (UUID v4, hyphenated).
    pub id: String,
    /// Source URL, immutable after creation.
    pub source_url: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last transition timestamp; monotonic.
    pub updated_at: DateTime<Utc>,
    pub title_original: Option<String>,
    pub title_translated: Option<String>,
    pub description_original: Option<String>,
    pub description_translated: Option<String>,
    /// Generated tags, at most six short strings.
    pub tags_generated: Vec<String>,
    pub recommended_category_id: Option<String>,
    pub selected_category_id: Option<String>,
    pub cover_path: Option<String>,
    pub video_path: Option<String>,
    pub metadata_path: Option<String>,
    pub subtitle_original_path: Option<String>,
    pub subtitle_translated_path: Option<String>,
    pub subtitle_language_detected: Option<String>,
    /// Structured moderation outcome (overall pass + label details).
    pub moderation_result: Option<serde_json::Value>,
    /// Short free-form progress string for the UI; not a state.
    pub upload_progress: Option<String>,
    /// Structured upload result on success.
    pub upload_response: Option<serde_json::Value>,
    /// Short reason of the last failure.
    pub error_message: Option<String>,
}

impl TaskRecord {
    /// Category id used for the upload: selected overrides recommended.
    pub fn effective_category_id(&self) -> Option<&str> {
        self.selected_category_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                self.recommended_category_id
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
            })
    }
}

/// Partial update for one task row.
///
/// Only the fields set on the patch are written; `updated_at` is always
/// bumped by the store.
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub title_original: Option<String>,
    pub title_translated: Option<String>,
    pub description_original: Option<String>,
    pub description_translated: Option<String>,
    pub tags_generated: Option<Vec<String>>,
    pub recommended_category_id: Option<String>,
    pub selected_category_id: Option<String>,
    pub cover_path: Option<String>,
    pub video_path: Option<String>,
    pub metadata_path: Option<String>,
    pub subtitle_original_path: Option<String>,
    pub subtitle_translated_path: Option<String>,
    pub subtitle_language_detected: Option<String>,
    pub moderation_result: Option<serde_json::Value>,
    pub upload_progress: Option<String>,
    pub upload_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl TaskPatch {
    /// Patch that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Patch moving the task to `failed` with the given short reason.
    pub fn failed<S: Into<String>>(reason: S) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error_message: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Patch that only updates the progress string.
    pub fn progress<S: Into<String>>(progress: S) -> Self {
        Self {
            upload_progress: Some(progress.into()),
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.title_original.is_none()
            && self.title_translated.is_none()
            && self.description_original.is_none()
            && self.description_translated.is_none()
            && self.tags_generated.is_none()
            && self.recommended_category_id.is_none()
            && self.selected_category_id.is_none()
            && self.cover_path.is_none()
            && self.video_path.is_none()
            && self.metadata_path.is_none()
            && self.subtitle_original_path.is_none()
            && self.subtitle_translated_path.is_none()
            && self.subtitle_language_detected.is_none()
            && self.moderation_result.is_none()
            && self.upload_progress.is_none()
            && self.upload_response.is_none()
            && self.error_message.is_none()
    }
}

/// Durable task store over `db/tasks.db`.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    paths: AppPaths,
}

const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    source_url TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// Columns added since the first schema revision; each is applied with an
/// idempotent `ALTER TABLE`, so rows written by any older deployment load
/// with NULLs in the new fields.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("title_original", "TEXT"),
    ("title_translated", "TEXT"),
    ("description_original", "TEXT"),
    ("description_translated", "TEXT"),
    ("tags_generated", "TEXT"),
    ("recommended_category_id", "TEXT"),
    ("selected_category_id", "TEXT"),
    ("cover_path", "TEXT"),
    ("video_path", "TEXT"),
    ("metadata_path", "TEXT"),
    ("subtitle_original_path", "TEXT"),
    ("subtitle_translated_path", "TEXT"),
    ("subtitle_language_detected", "TEXT"),
    ("moderation_result", "TEXT"),
    ("upload_progress", "TEXT"),
    ("upload_response", "TEXT"),
    ("error_message", "TEXT"),
];

impl TaskStore {
    /// Open the task store and run additive migrations.
    pub async fn open(pool: SqlitePool, paths: AppPaths) -> Result<Self> {
        sqlx::query(BASE_SCHEMA).execute(&pool).await?;
        for (column, decl) in ADDITIVE_COLUMNS {
            super::ensure_column(&pool, "tasks", column, decl).await?;
        }
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks(updated_at)")
            .execute(&pool)
            .await?;
        Ok(Self { pool, paths })
    }

    /// Create a new `pending` task for the given source URL.
    pub async fn create(&self, source_url: &str) -> Result<TaskRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO tasks (id, source_url, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(source_url)
        .bind(TaskStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        info!("Task {} created for {}", &id[..8], source_url);
        self.get(&id).await
    }

    /// Fetch one task by id.
    pub async fn get(&self, id: &str) -> Result<TaskRecord> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RetubeError::task_state(format!("task {} not found", id)))?;
        row_to_record(&row)
    }

    /// Fetch one task by id, returning `None` when the row is gone.
    pub async fn try_get(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    /// List all tasks, newest first.
    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// List tasks in one status, oldest first.
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Count of rows currently in an in-progress state.
    pub async fn count_in_progress(&self) -> Result<u32> {
        let placeholders = in_progress_placeholders();
        let sql = format!(
            "SELECT COUNT(*) FROM tasks WHERE status IN ({})",
            placeholders.0
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for s in placeholders.1 {
            query = query.bind(s);
        }
        Ok(query.fetch_one(&self.pool).await? as u32)
    }

    /// The oldest `pending` row, if any.
    pub async fn oldest_pending(&self) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    /// Apply a partial update to one row, bumping `updated_at`.
    ///
    /// Returns the updated record, or `None` when the row was deleted
    /// concurrently (the caller then stops touching the task). Progress
    /// counters pass `silent = true` so they don't spam the log.
    pub async fn update(
        &self,
        id: &str,
        patch: TaskPatch,
        silent: bool,
    ) -> Result<Option<TaskRecord>> {
        if patch.is_empty() {
            return self.try_get(id).await;
        }
        let Some(current) = self.try_get(id).await? else {
            debug!("Task {} vanished before update; ignoring write", id);
            return Ok(None);
        };

        // Monotonic clock guard: a transition never moves updated_at
        // backwards, and a status change is strictly greater.
        let mut now = Utc::now();
        if now <= current.updated_at {
            now = current.updated_at + ChronoDuration::milliseconds(1);
        }

        let mut sets: Vec<String> = vec!["updated_at = ?".into()];
        let mut binds: Vec<String> = vec![now.to_rfc3339()];
        macro_rules! set_field {
            ($field:ident, $column:literal) => {
                if let Some(v) = &patch.$field {
                    sets.push(concat!($column, " = ?").into());
                    binds.push(v.clone());
                }
            };
        }
        if let Some(status) = patch.status {
            sets.push("status = ?".into());
            binds.push(status.as_str().to_string());
        }
        set_field!(title_original, "title_original");
        set_field!(title_translated, "title_translated");
        set_field!(description_original, "description_original");
        set_field!(description_translated, "description_translated");
        if let Some(tags) = &patch.tags_generated {
            sets.push("tags_generated = ?".into());
            binds.push(serde_json::to_string(tags)?);
        }
        set_field!(recommended_category_id, "recommended_category_id");
        set_field!(selected_category_id, "selected_category_id");
        set_field!(cover_path, "cover_path");
        set_field!(video_path, "video_path");
        set_field!(metadata_path, "metadata_path");
        set_field!(subtitle_original_path, "subtitle_original_path");
        set_field!(subtitle_translated_path, "subtitle_translated_path");
        set_field!(subtitle_language_detected, "subtitle_language_detected");
        if let Some(m) = &patch.moderation_result {
            sets.push("moderation_result = ?".into());
            binds.push(serde_json::to_string(m)?);
        }
        set_field!(upload_progress, "upload_progress");
        if let Some(r) = &patch.upload_response {
            sets.push("upload_response = ?".into());
            binds.push(serde_json::to_string(r)?);
        }
        set_field!(error_message, "error_message");

        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let result = query.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            debug!("Task {} deleted during update; write dropped", id);
            return Ok(None);
        }
        if !silent {
            if let Some(status) = patch.status {
                info!("Task {} -> {}", &id[..8.min(id.len())], status);
            } else {
                debug!("Task {} fields updated", &id[..8.min(id.len())]);
            }
        }
        self.try_get(id).await
    }

    /// Delete one task; `drop_files` also removes its working directory
    /// and per-task log.
    pub async fn delete(&self, id: &str, drop_files: bool) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let existed = result.rows_affected() > 0;
        if drop_files {
            let dir = self.paths.task_dir(id);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!("Failed to remove task dir {:?}: {}", dir, e);
                }
            }
            let log = self.paths.task_log(id);
            if log.exists() {
                let _ = std::fs::remove_file(log);
            }
        }
        if existed {
            info!("Task {} deleted (drop_files={})", &id[..8.min(id.len())], drop_files);
        }
        Ok(existed)
    }

    /// Delete every task; `drop_files` removes all working directories.
    pub async fn clear_all(&self, drop_files: bool) -> Result<u64> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM tasks")
            .fetch_all(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM tasks").execute(&self.pool).await?;
        if drop_files {
            for id in &ids {
                let dir = self.paths.task_dir(id);
                if dir.exists() {
                    let _ = std::fs::remove_dir_all(&dir);
                }
            }
        }
        info!("Cleared {} tasks", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Move in-progress rows untouched for strictly more than the timeout
    /// to `failed` with a `timeout reset` reason. Returns the reset count.
    pub async fn reset_stuck(&self, timeout_minutes: i64) -> Result<u32> {
        let cutoff = Utc::now() - ChronoDuration::minutes(timeout_minutes);
        let all = self.list().await?;
        let mut reset = 0u32;
        for task in all {
            if task.status.is_stuck_candidate() && task.updated_at < cutoff {
                let reason = format!("timeout reset (prev={})", task.status);
                warn!(
                    "Resetting stuck task {} from {} (idle since {})",
                    &task.id[..8],
                    task.status,
                    task.updated_at
                );
                self.update(&task.id, TaskPatch::failed(reason), false).await?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Working directory for a task, creating it if absent.
    pub fn ensure_task_dir(&self, id: &str) -> Result<std::path::PathBuf> {
        let dir = self.paths.task_dir(id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// App path layout shared with the engine.
    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Raw pool handle (integration tests and migrations).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn in_progress_placeholders() -> (String, Vec<&'static str>) {
    let states = [
        TaskStatus::FetchingInfo,
        TaskStatus::InfoFetched,
        TaskStatus::Translating,
        TaskStatus::Tagging,
        TaskStatus::Partitioning,
        TaskStatus::Moderating,
        TaskStatus::Downloading,
        TaskStatus::Downloaded,
        TaskStatus::AsrTranscribing,
        TaskStatus::TranslatingSubtitle,
        TaskStatus::EncodingVideo,
        TaskStatus::Uploading,
    ];
    let placeholders = vec!["?"; states.len()].join(", ");
    (placeholders, states.iter().map(|s| s.as_str()).collect())
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
    let status_str: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let tags_json: Option<String> = row.try_get("tags_generated")?;
    let moderation_json: Option<String> = row.try_get("moderation_result")?;
    let response_json: Option<String> = row.try_get("upload_response")?;
    Ok(TaskRecord {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        status: TaskStatus::parse(&status_str)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        title_original: row.try_get("title_original")?,
        title_translated: row.try_get("title_translated")?,
        description_original: row.try_get("description_original")?,
        description_translated: row.try_get("description_translated")?,
        tags_generated: tags_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
        recommended_category_id: row.try_get("recommended_category_id")?,
        selected_category_id: row.try_get("selected_category_id")?,
        cover_path: row.try_get("cover_path")?,
        video_path: row.try_get("video_path")?,
        metadata_path: row.try_get("metadata_path")?,
        subtitle_original_path: row.try_get("subtitle_original_path")?,
        subtitle_translated_path: row.try_get("subtitle_translated_path")?,
        subtitle_language_detected: row.try_get("subtitle_language_detected")?,
        moderation_result: moderation_json.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        upload_progress: row.try_get("upload_progress")?,
        upload_response: response_json.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        error_message: row.try_get("error_message")?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Rows written by the legacy deployment use a naive local format.
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .map_err(|e| RetubeError::task_state(format!("bad timestamp '{}': {}", s, e)))
}
