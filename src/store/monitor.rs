//! Discovery configuration and history persistence.
//!
//! `db/youtube_monitor.db` keeps the saved catalog queries and the
//! per-config record of every video already seen, so re-discovery of the
//! same video never creates a duplicate task.

use crate::{Result, error::RetubeError};
use chrono::Utc;
use log::info;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;

/// One saved discovery query with thresholds, schedule and rate limit.
#[derive(Debug, Clone)]
pub struct MonitorConfigRecord {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Catalog region code (e.g. "US").
    pub region_code: String,
    /// Catalog category id; "0" means all.
    pub category_id: String,
    /// Look-back window in days when `start_date` is empty.
    pub time_period_days: i64,
    pub max_results: i64,
    pub min_view_count: i64,
    pub min_like_count: i64,
    pub min_comment_count: i64,
    /// Free-text search keywords; empty switches to trending mode.
    pub keywords: String,
    /// Comma-separated keywords that exclude a candidate.
    pub exclude_keywords: String,
    /// Comma-separated channel ids to monitor directly.
    pub channel_ids: String,
    /// Comma-separated channel ids to exclude.
    pub exclude_channel_ids: String,
    /// Minimum duration in seconds; 0 disables.
    pub min_duration: i64,
    /// Maximum duration in seconds; 0 disables.
    pub max_duration: i64,
    /// `manual` or `auto`.
    pub schedule_type: String,
    /// Interval between auto runs, minutes.
    pub schedule_interval_minutes: i64,
    /// `viewCount` (popularity) or `date` (recency).
    pub order_by: String,
    /// Explicit cutoff date (RFC 3339 or `YYYY-MM-DD`); overrides the window.
    pub start_date: String,
    /// Max catalog API calls per window.
    pub rate_limit_requests: i64,
    /// Rate-limit window in seconds.
    pub rate_limit_window: i64,
    /// Enqueue filtered results as tasks immediately.
    pub auto_add_to_tasks: bool,
    pub last_run_time: Option<String>,
}

impl MonitorConfigRecord {
    /// Split a comma-separated field into trimmed non-empty entries.
    pub fn split_list(field: &str) -> Vec<String> {
        field
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Editable fields for creating or updating a config.
#[derive(Debug, Clone)]
pub struct MonitorConfigInput {
    pub name: String,
    pub enabled: bool,
    pub region_code: String,
    pub category_id: String,
    pub time_period_days: i64,
    pub max_results: i64,
    pub min_view_count: i64,
    pub min_like_count: i64,
    pub min_comment_count: i64,
    pub keywords: String,
    pub exclude_keywords: String,
    pub channel_ids: String,
    pub exclude_channel_ids: String,
    pub min_duration: i64,
    pub max_duration: i64,
    pub schedule_type: String,
    pub schedule_interval_minutes: i64,
    pub order_by: String,
    pub start_date: String,
    pub rate_limit_requests: i64,
    pub rate_limit_window: i64,
    pub auto_add_to_tasks: bool,
}

impl Default for MonitorConfigInput {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            region_code: "US".into(),
            category_id: "0".into(),
            time_period_days: 7,
            max_results: 10,
            min_view_count: 1000,
            min_like_count: 0,
            min_comment_count: 0,
            keywords: String::new(),
            exclude_keywords: String::new(),
            channel_ids: String::new(),
            exclude_channel_ids: String::new(),
            min_duration: 0,
            max_duration: 0,
            schedule_type: "manual".into(),
            schedule_interval_minutes: 60,
            order_by: "viewCount".into(),
            start_date: String::new(),
            rate_limit_requests: 100,
            rate_limit_window: 60,
            auto_add_to_tasks: false,
        }
    }
}

/// One discovered video under one config.
#[derive(Debug, Clone)]
pub struct MonitorHistoryRecord {
    pub id: i64,
    pub config_id: i64,
    pub video_id: String,
    pub video_title: Option<String>,
    pub channel_title: Option<String>,
    pub view_count: i64,
    pub like_count: i64,
    pub comment_count: i64,
    /// ISO 8601 duration string as returned by the catalog.
    pub duration: Option<String>,
    pub published_at: Option<String>,
    pub added_to_tasks: bool,
}

/// Store over `db/youtube_monitor.db`.
#[derive(Clone)]
pub struct MonitorStore {
    pool: SqlitePool,
}

const CONFIG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS monitor_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    enabled INTEGER DEFAULT 1,
    region_code TEXT DEFAULT 'US',
    category_id TEXT DEFAULT '0',
    time_period INTEGER DEFAULT 7,
    max_results INTEGER DEFAULT 10,
    min_view_count INTEGER DEFAULT 1000,
    min_like_count INTEGER DEFAULT 0,
    min_comment_count INTEGER DEFAULT 0,
    keywords TEXT DEFAULT '',
    exclude_keywords TEXT DEFAULT '',
    channel_ids TEXT DEFAULT '',
    exclude_channel_ids TEXT DEFAULT '',
    min_duration INTEGER DEFAULT 0,
    max_duration INTEGER DEFAULT 0,
    schedule_type TEXT DEFAULT 'manual',
    schedule_interval INTEGER DEFAULT 60,
    order_by TEXT DEFAULT 'viewCount',
    start_date TEXT DEFAULT '',
    rate_limit_requests INTEGER DEFAULT 100,
    rate_limit_window INTEGER DEFAULT 60,
    auto_add_to_tasks INTEGER DEFAULT 0,
    last_run_time TEXT,
    created_time TEXT,
    updated_time TEXT
)";

const HISTORY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS monitor_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id INTEGER,
    video_id TEXT NOT NULL,
    video_title TEXT,
    channel_title TEXT,
    view_count INTEGER DEFAULT 0,
    like_count INTEGER DEFAULT 0,
    comment_count INTEGER DEFAULT 0,
    duration TEXT,
    published_at TEXT,
    added_to_tasks INTEGER DEFAULT 0,
    run_time TEXT,
    UNIQUE(config_id, video_id)
)";

impl MonitorStore {
    /// Open the store and run migrations.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CONFIG_SCHEMA).execute(&pool).await?;
        sqlx::query(HISTORY_SCHEMA).execute(&pool).await?;
        super::ensure_column(&pool, "monitor_configs", "auto_add_to_tasks", "INTEGER DEFAULT 0")
            .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_history_config_video
             ON monitor_history(config_id, video_id)",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Insert a new config, returning its id.
    pub async fn create_config(&self, input: &MonitorConfigInput) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO monitor_configs (
                name, enabled, region_code, category_id, time_period, max_results,
                min_view_count, min_like_count, min_comment_count, keywords,
                exclude_keywords, channel_ids, exclude_channel_ids, min_duration,
                max_duration, schedule_type, schedule_interval, order_by, start_date,
                rate_limit_requests, rate_limit_window, auto_add_to_tasks,
                created_time, updated_time
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&input.name)
        .bind(input.enabled as i64)
        .bind(&input.region_code)
        .bind(&input.category_id)
        .bind(input.time_period_days)
        .bind(input.max_results)
        .bind(input.min_view_count)
        .bind(input.min_like_count)
        .bind(input.min_comment_count)
        .bind(&input.keywords)
        .bind(&input.exclude_keywords)
        .bind(&input.channel_ids)
        .bind(&input.exclude_channel_ids)
        .bind(input.min_duration)
        .bind(input.max_duration)
        .bind(&input.schedule_type)
        .bind(input.schedule_interval_minutes)
        .bind(&input.order_by)
        .bind(&input.start_date)
        .bind(input.rate_limit_requests)
        .bind(input.rate_limit_window)
        .bind(input.auto_add_to_tasks as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        info!("Monitor config {} ('{}') created", id, input.name);
        Ok(id)
    }

    /// Update an existing config in place.
    pub async fn update_config(&self, id: i64, input: &MonitorConfigInput) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE monitor_configs SET
                name = ?, enabled = ?, region_code = ?, category_id = ?,
                time_period = ?, max_results = ?, min_view_count = ?,
                min_like_count = ?, min_comment_count = ?, keywords = ?,
                exclude_keywords = ?, channel_ids = ?, exclude_channel_ids = ?,
                min_duration = ?, max_duration = ?, schedule_type = ?,
                schedule_interval = ?, order_by = ?, start_date = ?,
                rate_limit_requests = ?, rate_limit_window = ?,
                auto_add_to_tasks = ?, updated_time = ?
             WHERE id = ?",
        )
        .bind(&input.name)
        .bind(input.enabled as i64)
        .bind(&input.region_code)
        .bind(&input.category_id)
        .bind(input.time_period_days)
        .bind(input.max_results)
        .bind(input.min_view_count)
        .bind(input.min_like_count)
        .bind(input.min_comment_count)
        .bind(&input.keywords)
        .bind(&input.exclude_keywords)
        .bind(&input.channel_ids)
        .bind(&input.exclude_channel_ids)
        .bind(input.min_duration)
        .bind(input.max_duration)
        .bind(&input.schedule_type)
        .bind(input.schedule_interval_minutes)
        .bind(&input.order_by)
        .bind(&input.start_date)
        .bind(input.rate_limit_requests)
        .bind(input.rate_limit_window)
        .bind(input.auto_add_to_tasks as i64)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RetubeError::config(format!("monitor config {} not found", id)));
        }
        Ok(())
    }

    /// Delete a config and its history rows.
    pub async fn delete_config(&self, id: i64) -> Result<bool> {
        sqlx::query("DELETE FROM monitor_history WHERE config_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM monitor_configs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch one config.
    pub async fn get_config(&self, id: i64) -> Result<Option<MonitorConfigRecord>> {
        let row = sqlx::query("SELECT * FROM monitor_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| config_from_row(&r)).transpose()
    }

    /// List all configs.
    pub async fn list_configs(&self) -> Result<Vec<MonitorConfigRecord>> {
        let rows = sqlx::query("SELECT * FROM monitor_configs ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(config_from_row).collect()
    }

    /// List enabled configs on the `auto` schedule.
    pub async fn list_auto_configs(&self) -> Result<Vec<MonitorConfigRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM monitor_configs WHERE enabled = 1 AND schedule_type = 'auto'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(config_from_row).collect()
    }

    /// Stamp a config's last run time.
    pub async fn touch_last_run(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE monitor_configs SET last_run_time = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether `(config_id, video_id)` was already discovered.
    pub async fn is_seen(&self, config_id: i64, video_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM monitor_history WHERE config_id = ? AND video_id = ?",
        )
        .bind(config_id)
        .bind(video_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Record a discovered video. The unique index makes re-insertion of
    /// the same `(config_id, video_id)` a no-op; returns false in that case.
    pub async fn record_video(
        &self,
        config_id: i64,
        video_id: &str,
        video_title: &str,
        channel_title: &str,
        view_count: i64,
        like_count: i64,
        comment_count: i64,
        duration: &str,
        published_at: &str,
        added_to_tasks: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO monitor_history (
                config_id, video_id, video_title, channel_title, view_count,
                like_count, comment_count, duration, published_at,
                added_to_tasks, run_time
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(config_id)
        .bind(video_id)
        .bind(video_title)
        .bind(channel_title)
        .bind(view_count)
        .bind(like_count)
        .bind(comment_count)
        .bind(duration)
        .bind(published_at)
        .bind(added_to_tasks as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flag a history row as enqueued.
    pub async fn mark_added_to_tasks(&self, config_id: i64, video_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE monitor_history SET added_to_tasks = 1
             WHERE config_id = ? AND video_id = ?",
        )
        .bind(config_id)
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recent history, optionally scoped to a config.
    pub async fn history(
        &self,
        config_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MonitorHistoryRecord>> {
        let rows = match config_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM monitor_history WHERE config_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM monitor_history ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(history_from_row).collect()
    }
}

fn config_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MonitorConfigRecord> {
    Ok(MonitorConfigRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        region_code: row.try_get("region_code")?,
        category_id: row.try_get("category_id")?,
        time_period_days: row.try_get("time_period")?,
        max_results: row.try_get("max_results")?,
        min_view_count: row.try_get("min_view_count")?,
        min_like_count: row.try_get("min_like_count")?,
        min_comment_count: row.try_get("min_comment_count")?,
        keywords: row.try_get("keywords")?,
        exclude_keywords: row.try_get("exclude_keywords")?,
        channel_ids: row.try_get("channel_ids")?,
        exclude_channel_ids: row.try_get("exclude_channel_ids")?,
        min_duration: row.try_get("min_duration")?,
        max_duration: row.try_get("max_duration")?,
        schedule_type: row.try_get("schedule_type")?,
        schedule_interval_minutes: row.try_get("schedule_interval")?,
        order_by: row.try_get("order_by")?,
        start_date: row.try_get("start_date")?,
        rate_limit_requests: row.try_get("rate_limit_requests")?,
        rate_limit_window: row.try_get("rate_limit_window")?,
        auto_add_to_tasks: row.try_get::<i64, _>("auto_add_to_tasks")? != 0,
        last_run_time: row.try_get("last_run_time")?,
    })
}

fn history_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MonitorHistoryRecord> {
    Ok(MonitorHistoryRecord {
        id: row.try_get("id")?,
        config_id: row.try_get("config_id")?,
        video_id: row.try_get("video_id")?,
        video_title: row.try_get("video_title")?,
        channel_title: row.try_get("channel_title")?,
        view_count: row.try_get("view_count")?,
        like_count: row.try_get("like_count")?,
        comment_count: row.try_get("comment_count")?,
        duration: row.try_get("duration")?,
        published_at: row.try_get("published_at")?,
        added_to_tasks: row.try_get::<i64, _>("added_to_tasks")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_pool;
    use tempfile::TempDir;

    async fn store() -> (TempDir, MonitorStore) {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("monitor.db")).await.unwrap();
        (dir, MonitorStore::open(pool).await.unwrap())
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let (_dir, store) = store().await;
        let input = MonitorConfigInput {
            name: "weekly music".into(),
            keywords: "live concert".into(),
            min_view_count: 5000,
            schedule_type: "auto".into(),
            auto_add_to_tasks: true,
            ..Default::default()
        };
        let id = store.create_config(&input).await.unwrap();
        let config = store.get_config(id).await.unwrap().unwrap();
        assert_eq!(config.name, "weekly music");
        assert_eq!(config.min_view_count, 5000);
        assert!(config.auto_add_to_tasks);

        let autos = store.list_auto_configs().await.unwrap();
        assert_eq!(autos.len(), 1);
    }

    #[tokio::test]
    async fn test_history_dedup_is_unique_per_config() {
        let (_dir, store) = store().await;
        let id = store.create_config(&MonitorConfigInput::default()).await.unwrap();

        let first = store
            .record_video(id, "vid1", "t", "c", 100, 5, 1, "PT3M", "2026-01-01T00:00:00Z", false)
            .await
            .unwrap();
        assert!(first);
        // Re-discovery of the same video under the same config is a no-op.
        let second = store
            .record_video(id, "vid1", "t", "c", 200, 9, 2, "PT3M", "2026-01-01T00:00:00Z", false)
            .await
            .unwrap();
        assert!(!second);
        assert!(store.is_seen(id, "vid1").await.unwrap());

        let rows = store.history(Some(id), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].view_count, 100);
    }

    #[tokio::test]
    async fn test_split_list() {
        assert_eq!(
            MonitorConfigRecord::split_list(" a, b ,,c "),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(MonitorConfigRecord::split_list("").is_empty());
    }
}
