//! Durable state: task records, discovery configs and history.
//!
//! One process owns both SQLite databases. Writes serialize through the
//! SQLite single-writer lock; reads are snapshots. Schema evolution is
//! additive only — new columns are bolted on with `ALTER TABLE` and old
//! rows read them as NULL.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

pub mod monitor;
pub mod task;

pub use monitor::{MonitorConfigRecord, MonitorHistoryRecord, MonitorStore};
pub use task::{TaskPatch, TaskRecord, TaskStatus, TaskStore};

/// Open (creating if missing) a SQLite pool for the given database file.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // WAL keeps readers unblocked while the single writer commits.
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Add a column if the table does not have it yet.
///
/// SQLite has no `ADD COLUMN IF NOT EXISTS`; this inspects `table_info`
/// first so the migration stays idempotent across restarts.
pub(crate) async fn ensure_column(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as(&format!("SELECT cid, name FROM pragma_table_info('{}')", table))
            .fetch_all(pool)
            .await?;
    if rows.iter().any(|(_, name)| name == column) {
        return Ok(());
    }
    sqlx::query(&format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table, column, decl
    ))
    .execute(pool)
    .await?;
    log::info!("Added column {}.{}", table, column);
    Ok(())
}
