//! Retention sweeps and stuck-task recovery.
//!
//! Two periodic sweeps (log retention, download retention), one periodic
//! stuck-task reset, and the one-shot clear-current-logs operation. All of
//! them are passive janitors: they only touch files older than the
//! retention window and rows idle past the stuck threshold.

use crate::config::{AppPaths, ConfigService};
use crate::store::TaskStore;
use crate::Result;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Rows idle in an in-progress state for strictly more than this are
/// reset to `failed`.
pub const STUCK_TIMEOUT_MINUTES: i64 = 30;

/// Periodic janitor over logs, downloads and stuck rows.
pub struct Housekeeper {
    paths: AppPaths,
    store: TaskStore,
    config_service: Arc<dyn ConfigService>,
}

impl Housekeeper {
    /// Create a housekeeper over the app layout.
    pub fn new(paths: AppPaths, store: TaskStore, config_service: Arc<dyn ConfigService>) -> Self {
        Self {
            paths,
            store,
            config_service,
        }
    }

    /// Spawn the recurring sweep loops onto the runtime.
    ///
    /// Each sweep has its own interval; the stuck-task reset runs on the
    /// shorter of the two so a restarted process recovers orphans quickly.
    pub fn spawn(self: Arc<Self>) {
        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = this.store.reset_stuck(STUCK_TIMEOUT_MINUTES).await {
                    warn!("Stuck-task sweep failed: {}", e);
                }
            }
        });

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                let config = this.config_service.get_config().ok();
                let (enabled, retention_hours, interval_hours) = config
                    .map(|c| {
                        (
                            c.retention.log_cleanup_enabled,
                            c.retention.log_retention_hours,
                            c.retention.log_interval_hours,
                        )
                    })
                    .unwrap_or((false, 72, 6));
                if enabled {
                    if let Err(e) = this.sweep_logs(retention_hours) {
                        warn!("Log retention sweep failed: {}", e);
                    }
                }
                tokio::time::sleep(Duration::from_secs(interval_hours.max(1) * 3600)).await;
            }
        });

        let this = self;
        tokio::spawn(async move {
            loop {
                let config = this.config_service.get_config().ok();
                let (enabled, retention_hours, interval_hours) = config
                    .map(|c| {
                        (
                            c.retention.download_cleanup_enabled,
                            c.retention.download_retention_hours,
                            c.retention.download_interval_hours,
                        )
                    })
                    .unwrap_or((false, 48, 6));
                if enabled {
                    if let Err(e) = this.sweep_downloads(retention_hours) {
                        warn!("Download retention sweep failed: {}", e);
                    }
                }
                tokio::time::sleep(Duration::from_secs(interval_hours.max(1) * 3600)).await;
            }
        });
    }

    /// Delete files in the logs directory older than the retention window.
    pub fn sweep_logs(&self, retention_hours: u64) -> Result<u64> {
        let dir = self.paths.logs_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now() - Duration::from_secs(retention_hours * 3600);
        let mut removed = 0u64;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if is_older_than(&path, cutoff) {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!("Removed stale log {:?}", path);
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to remove log {:?}: {}", path, e),
                }
            }
        }
        if removed > 0 {
            info!("Log sweep removed {} files (> {}h old)", removed, retention_hours);
        }
        Ok(removed)
    }

    /// Delete task directories (and stray files) in the downloads root
    /// older than the retention window. Returns bytes reclaimed.
    ///
    /// Directory age is the newest mtime underneath it, so an old task
    /// that was recently re-encoded is not swept.
    pub fn sweep_downloads(&self, retention_hours: u64) -> Result<u64> {
        let root = self.paths.downloads_dir();
        if !root.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now() - Duration::from_secs(retention_hours * 3600);
        let mut reclaimed = 0u64;
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                let (newest, size) = dir_newest_and_size(&path);
                if newest.map(|t| t < cutoff).unwrap_or(false) {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => {
                            info!("Removed stale download dir {:?} ({} bytes)", path, size);
                            reclaimed += size;
                        }
                        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
                    }
                }
            } else if is_older_than(&path, cutoff) {
                let size = path.metadata().map(|m| m.len()).unwrap_or(0);
                if std::fs::remove_file(&path).is_ok() {
                    reclaimed += size;
                }
            }
        }
        Ok(reclaimed)
    }

    /// App path layout this janitor sweeps.
    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Truncate the two long-lived logs in place and delete per-task logs.
    pub fn clear_current_logs(&self) -> Result<u64> {
        let dir = self.paths.logs_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut cleared = 0u64;
        for name in ["app.log", "task_manager.log"] {
            let path = dir.join(name);
            if path.exists() {
                // Truncate rather than delete so open handles keep working.
                if std::fs::write(&path, b"").is_ok() {
                    cleared += 1;
                }
            }
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_file() && name.starts_with("task_") && name.ends_with(".log") {
                if std::fs::remove_file(&path).is_ok() {
                    cleared += 1;
                }
            }
        }
        info!("Cleared {} log files", cleared);
        Ok(cleared)
    }
}

fn is_older_than(path: &Path, cutoff: SystemTime) -> bool {
    path.metadata()
        .and_then(|m| m.modified())
        .map(|t| t < cutoff)
        .unwrap_or(false)
}

/// Newest mtime and total size of everything under a directory.
fn dir_newest_and_size(dir: &Path) -> (Option<SystemTime>, u64) {
    let mut newest: Option<SystemTime> = None;
    let mut size = 0u64;
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                size += meta.len();
            }
            if let Ok(modified) = meta.modified() {
                newest = Some(match newest {
                    Some(current) => current.max(modified),
                    None => modified,
                });
            }
        }
    }
    (newest, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestConfigService;
    use crate::store::open_pool;
    use filetime_shim::set_old_mtime;
    use tempfile::TempDir;

    // Backdating helper; std has no utime, so rewrite via filetime-free
    // approach: create the file, then adjust with the platform `touch`.
    mod filetime_shim {
        use std::path::Path;
        use std::process::Command;

        pub fn set_old_mtime(path: &Path, hours_ago: u64) {
            let when = format!("-{} hours", hours_ago);
            let _ = Command::new("touch")
                .arg("-d")
                .arg(&when)
                .arg(path)
                .status();
        }
    }

    async fn housekeeper() -> (TempDir, Arc<Housekeeper>) {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::new(dir.path());
        std::fs::create_dir_all(paths.logs_dir()).unwrap();
        std::fs::create_dir_all(paths.downloads_dir()).unwrap();
        let pool = open_pool(&paths.tasks_db()).await.unwrap();
        let store = TaskStore::open(pool, paths.clone()).await.unwrap();
        let hk = Housekeeper::new(
            paths,
            store,
            Arc::new(TestConfigService::with_defaults()),
        );
        (dir, Arc::new(hk))
    }

    #[tokio::test]
    async fn test_log_sweep_removes_only_old_files() {
        let (_dir, hk) = housekeeper().await;
        let logs = hk.paths().logs_dir();
        let old = logs.join("task_old.log");
        let fresh = logs.join("task_fresh.log");
        std::fs::write(&old, "x").unwrap();
        std::fs::write(&fresh, "x").unwrap();
        set_old_mtime(&old, 100);

        let removed = hk.sweep_logs(72).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_download_sweep_removes_stale_dirs() {
        let (_dir, hk) = housekeeper().await;
        let downloads = hk.paths().downloads_dir();
        let stale = downloads.join("stale-task");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("video.mp4"), vec![0u8; 1024]).unwrap();
        set_old_mtime(&stale.join("video.mp4"), 100);
        set_old_mtime(&stale, 100);

        let live = downloads.join("live-task");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("video.mp4"), "y").unwrap();

        let reclaimed = hk.sweep_downloads(48).unwrap();
        assert!(reclaimed >= 1024);
        assert!(!stale.exists());
        assert!(live.exists());
    }

    #[tokio::test]
    async fn test_clear_current_logs_truncates_in_place() {
        let (_dir, hk) = housekeeper().await;
        let logs = hk.paths().logs_dir();
        std::fs::write(logs.join("app.log"), "lots of content").unwrap();
        std::fs::write(logs.join("task_abc.log"), "trace").unwrap();

        hk.clear_current_logs().unwrap();
        assert_eq!(std::fs::read_to_string(logs.join("app.log")).unwrap(), "");
        assert!(!logs.join("task_abc.log").exists());
    }
}
