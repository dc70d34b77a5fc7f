//! Task pipeline engine: state machine, permits and scheduling.
//!
//! One engine owns all task execution. Tasks acquire a global task permit
//! before running and release it in a guaranteed-release scope; the
//! upload stage additionally holds an upload permit (strictly subordinate
//! to the task permit). A pending scanner promotes the oldest `pending`
//! row whenever the in-progress count sits below the effective cap, and a
//! short-delay trigger re-runs the scan after every terminal transition
//! and on submission.

use crate::api::cookies::CookieHintState;
use crate::config::{AppPaths, ConfigService};
use crate::services::downloader::{self, SourceDownloader};
use crate::services::memory_pressure_high;
use crate::services::monitor::TaskSubmitter;
use crate::store::{TaskPatch, TaskRecord, TaskStatus, TaskStore};
use crate::{Result, error::RetubeError};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

mod stages;

/// Append-only per-task trace file.
///
/// The task row only carries short status strings; everything verbose
/// lands here. Write failures are swallowed, a broken trace must never
/// fail a pipeline stage.
#[derive(Clone)]
pub struct TaskLog {
    path: PathBuf,
}

impl TaskLog {
    /// Open (creating directories for) a task's log file.
    pub fn open(paths: &AppPaths, task_id: &str) -> Self {
        let path = paths.task_log(task_id);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self { path }
    }

    fn write(&self, level: &str, message: &str) {
        let line = format!(
            "{} - {} - {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            message
        );
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn info(&self, message: &str) {
        self.write("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.write("WARNING", message);
    }

    pub fn error(&self, message: &str) {
        self.write("ERROR", message);
    }
}

struct Permits {
    capacity: u32,
    semaphore: Arc<Semaphore>,
}

/// The stateful, concurrent pipeline orchestrator.
pub struct PipelineEngine {
    pub(crate) store: TaskStore,
    pub(crate) config_service: Arc<dyn ConfigService>,
    pub(crate) paths: AppPaths,
    pub(crate) cookie_hints: Arc<CookieHintState>,
    task_permits: RwLock<Permits>,
    upload_permits: RwLock<Permits>,
    scan_tx: mpsc::Sender<()>,
    scan_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    running: AtomicU32,
    // Weak back-reference so &self methods can hand owned clones to
    // spawned pipelines.
    self_ref: RwLock<Weak<PipelineEngine>>,
}

impl PipelineEngine {
    /// Create an engine; call [`PipelineEngine::spawn_scanner`] afterwards.
    pub fn new(
        store: TaskStore,
        config_service: Arc<dyn ConfigService>,
        paths: AppPaths,
        cookie_hints: Arc<CookieHintState>,
    ) -> Arc<Self> {
        let config = config_service.get_config().unwrap_or_default();
        let task_cap = config.concurrency.max_concurrent_tasks.max(1);
        let upload_cap = config.concurrency.max_concurrent_uploads.max(1);
        let (scan_tx, scan_rx) = mpsc::channel(16);
        let engine = Arc::new(Self {
            store,
            config_service,
            paths,
            cookie_hints,
            task_permits: RwLock::new(Permits {
                capacity: task_cap,
                semaphore: Arc::new(Semaphore::new(task_cap as usize)),
            }),
            upload_permits: RwLock::new(Permits {
                capacity: upload_cap,
                semaphore: Arc::new(Semaphore::new(upload_cap as usize)),
            }),
            scan_tx,
            scan_rx: tokio::sync::Mutex::new(scan_rx),
            running: AtomicU32::new(0),
            self_ref: RwLock::new(Weak::new()),
        });
        *engine.self_ref.write().unwrap() = Arc::downgrade(&engine);
        engine
    }

    /// Owned handle to this engine; `None` only during teardown.
    fn self_arc(&self) -> Option<Arc<Self>> {
        self.self_ref.read().unwrap().upgrade()
    }

    /// Submit a source URL: playlist URLs expand to one task per video.
    ///
    /// Returns the created task ids. Tasks start immediately only in auto
    /// mode; otherwise they sit in `pending` for the scanner or an
    /// explicit start.
    pub async fn submit_url(&self, source_url: &str) -> Result<Vec<String>> {
        let config = self.config_service.get_config()?;
        let mut ids = Vec::new();
        if downloader::is_playlist_url(source_url) {
            let adapter = SourceDownloader::new(config.downloader.clone(), self.paths.clone());
            let video_ids = adapter.expand_playlist(source_url).await?;
            if video_ids.is_empty() {
                return Err(RetubeError::download("playlist resolved to no videos", false));
            }
            for video_id in video_ids {
                let task = self
                    .store
                    .create(&downloader::canonical_video_url(&video_id))
                    .await?;
                ids.push(task.id);
            }
        } else {
            let task = self.store.create(source_url).await?;
            ids.push(task.id);
        }
        self.trigger_scan();
        Ok(ids)
    }

    /// Explicitly start one task. Legal only from `pending` or `failed`.
    pub async fn start_task(&self, task_id: &str) -> Result<()> {
        let task = self.store.get(task_id).await?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Failed) {
            return Err(RetubeError::task_state(format!(
                "task {} is {}, cannot start",
                &task_id[..8.min(task_id.len())],
                task.status
            )));
        }
        if task.status == TaskStatus::Failed {
            // Restart resets to pending first so the row reads sanely if
            // scheduling races with a delete.
            self.store
                .update(task_id, TaskPatch::status(TaskStatus::Pending), false)
                .await?;
        }
        let Some(engine) = self.self_arc() else {
            return Ok(());
        };
        let id = task_id.to_string();
        tokio::spawn(async move {
            engine.run_task(&id).await;
        });
        Ok(())
    }

    /// Force the upload stage for a task, regardless of auto mode.
    ///
    /// This is the exit from `awaiting_manual_review`; it also accepts
    /// `ready_for_upload` and even `completed` (re-upload, legacy parity).
    pub async fn force_upload(&self, task_id: &str) -> Result<()> {
        let task = self.store.get(task_id).await?;
        match task.status {
            TaskStatus::AwaitingManualReview
            | TaskStatus::ReadyForUpload
            | TaskStatus::Completed => {}
            other => {
                return Err(RetubeError::task_state(format!(
                    "task {} is {}, cannot force upload",
                    &task_id[..8.min(task_id.len())],
                    other
                )));
            }
        }
        let Some(engine) = self.self_arc() else {
            return Ok(());
        };
        let id = task_id.to_string();
        tokio::spawn(async move {
            let log = TaskLog::open(&engine.paths, &id);
            log.info("Force upload requested");
            let permits = engine.task_semaphore();
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            engine.running.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = engine.run_upload_stage(&id, &log).await {
                log.error(&format!("Force upload failed: {}", e));
                let _ = engine
                    .store
                    .update(&id, TaskPatch::failed(e.task_reason()), false)
                    .await;
            }
            engine.running.fetch_sub(1, Ordering::SeqCst);
            engine.trigger_scan();
        });
        Ok(())
    }

    /// Mark a task abandoned (terminal `failed` without deleting files).
    pub async fn abandon_task(&self, task_id: &str) -> Result<()> {
        self.store
            .update(task_id, TaskPatch::failed("abandoned by operator"), false)
            .await?;
        self.trigger_scan();
        Ok(())
    }

    /// Delete a task row and, optionally, its working directory.
    ///
    /// There is no per-task cancel: an in-flight task finishes its
    /// current step and observes the missing row on the next write.
    pub async fn delete_task(&self, task_id: &str, drop_files: bool) -> Result<bool> {
        let existed = self.store.delete(task_id, drop_files).await?;
        self.trigger_scan();
        Ok(existed)
    }

    /// Task store shared with the HTTP boundary.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Fire the delayed re-scan trigger.
    pub fn trigger_scan(&self) {
        let _ = self.scan_tx.try_send(());
    }

    /// Count of tasks currently holding a permit in this process.
    pub fn running_count(&self) -> u32 {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the pending-scanner loop.
    ///
    /// Each pass re-reads the configured cap, so runtime changes to
    /// `MAX_CONCURRENT_TASKS` take effect on the next scheduling
    /// decision; memory pressure halves the effective target for that
    /// decision only.
    pub fn spawn_scanner(&self) {
        let Some(engine) = self.self_arc() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                let interval = engine
                    .config_service
                    .get_config()
                    .map(|c| c.concurrency.scan_interval_clamped())
                    .unwrap_or(30);
                let mut rx = engine.scan_rx.lock().await;
                let triggered = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => false,
                    received = rx.recv() => received.is_some(),
                };
                drop(rx);
                if triggered {
                    // Submission/terminal triggers run after a short
                    // settle delay so the row state is visible.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                if let Err(e) = engine.scan_pending().await {
                    warn!("Pending scan failed: {}", e);
                }
            }
        });
    }

    /// One scanner pass: promote the oldest `pending` when below the cap.
    pub async fn scan_pending(&self) -> Result<()> {
        let config = self.config_service.get_config()?;
        self.refresh_permits(&config);
        let mut cap = config.concurrency.max_concurrent_tasks.max(1);
        if memory_pressure_high() {
            cap = (cap / 2).max(1);
            info!("High memory usage, effective task cap lowered to {}", cap);
        }
        let in_progress = self.store.count_in_progress().await?;
        if in_progress >= cap {
            debug!("{} tasks in progress, cap {}, not promoting", in_progress, cap);
            return Ok(());
        }
        let Some(next) = self.store.oldest_pending().await? else {
            return Ok(());
        };
        info!(
            "Scanner promoting task {} ({})",
            &next.id[..8],
            &next.source_url
        );
        let Some(engine) = self.self_arc() else {
            return Ok(());
        };
        tokio::spawn(async move {
            engine.run_task(&next.id).await;
        });
        Ok(())
    }

    /// Rebuild semaphores when the configured capacities changed.
    fn refresh_permits(&self, config: &crate::config::Config) {
        let task_cap = config.concurrency.max_concurrent_tasks.max(1);
        {
            let mut permits = self.task_permits.write().unwrap();
            if permits.capacity != task_cap {
                info!("Task permit capacity {} -> {}", permits.capacity, task_cap);
                permits.capacity = task_cap;
                permits.semaphore = Arc::new(Semaphore::new(task_cap as usize));
            }
        }
        let upload_cap = config.concurrency.max_concurrent_uploads.max(1);
        {
            let mut permits = self.upload_permits.write().unwrap();
            if permits.capacity != upload_cap {
                info!(
                    "Upload permit capacity {} -> {}",
                    permits.capacity, upload_cap
                );
                permits.capacity = upload_cap;
                permits.semaphore = Arc::new(Semaphore::new(upload_cap as usize));
            }
        }
    }

    pub(crate) fn task_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.task_permits.read().unwrap().semaphore)
    }

    pub(crate) fn upload_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.upload_permits.read().unwrap().semaphore)
    }

    /// Run the full pipeline for one task under a task permit.
    pub async fn run_task(&self, task_id: &str) {
        let log = TaskLog::open(&self.paths, task_id);
        let semaphore = self.task_semaphore();
        log.info("Waiting for a task permit");
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };
        self.running.fetch_add(1, Ordering::SeqCst);
        log.info("Task permit acquired, pipeline starting");

        // The permit releases on every exit path: _permit drops here.
        let outcome = self.process_task(task_id, &log).await;
        if let Err(e) = outcome {
            error!("Task {} failed: {}", &task_id[..8.min(task_id.len())], e);
            log.error(&format!("Pipeline error: {}", e));
            if e.needs_cookie_refresh() {
                self.cookie_hints
                    .record("bot_detection", Some(task_id.to_string()));
            }
            let _ = self
                .store
                .update(task_id, TaskPatch::failed(e.task_reason()), false)
                .await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.trigger_scan();
    }

    /// Fetch the task row mid-pipeline; `None` means it was deleted and
    /// the pipeline should stop silently.
    pub(crate) async fn checkpoint(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.store.try_get(task_id).await
    }
}

#[async_trait]
impl TaskSubmitter for PipelineEngineHandle {
    async fn submit(&self, source_url: &str) -> Result<String> {
        let task = self.engine.store.create(source_url).await?;
        let id = task.id.clone();
        self.engine.start_task(&id).await?;
        Ok(id)
    }
}

/// Cloneable handle implementing [`TaskSubmitter`] for the discovery
/// scheduler.
pub struct PipelineEngineHandle {
    pub engine: Arc<PipelineEngine>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TestConfigService};
    use crate::store::open_pool;
    use tempfile::TempDir;

    async fn engine_fixture(config: Config) -> (TempDir, Arc<PipelineEngine>) {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::new(dir.path());
        let pool = open_pool(&paths.tasks_db()).await.unwrap();
        let store = TaskStore::open(pool, paths.clone()).await.unwrap();
        let engine = PipelineEngine::new(
            store,
            Arc::new(TestConfigService::new(config)),
            paths,
            Arc::new(CookieHintState::default()),
        );
        (dir, engine)
    }

    #[tokio::test]
    async fn test_submit_single_url_creates_pending() {
        let (_dir, engine) = engine_fixture(Config::default()).await;
        let ids = engine
            .submit_url("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        let task = engine.store.get(&ids[0]).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_start_rejects_wrong_state() {
        let (_dir, engine) = engine_fixture(Config::default()).await;
        let ids = engine
            .submit_url("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        engine
            .store
            .update(&ids[0], TaskPatch::status(TaskStatus::Uploading), false)
            .await
            .unwrap();
        assert!(engine.start_task(&ids[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_failed_resets_to_pending() {
        let (_dir, engine) = engine_fixture(Config::default()).await;
        let ids = engine
            .submit_url("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        engine
            .store
            .update(&ids[0], TaskPatch::failed("boom"), false)
            .await
            .unwrap();
        // Hold every permit so the scheduled pipeline cannot run yet;
        // start_task flips failed -> pending before scheduling.
        let semaphore = engine.task_semaphore();
        let _blocked = semaphore.acquire_many(3).await.unwrap();
        engine.start_task(&ids[0]).await.unwrap();
        let task = engine.store.get(&ids[0]).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_abandon_sets_failed() {
        let (_dir, engine) = engine_fixture(Config::default()).await;
        let ids = engine
            .submit_url("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        engine.abandon_task(&ids[0]).await.unwrap();
        let task = engine.store.get(&ids[0]).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("abandoned by operator"));
    }

    #[tokio::test]
    async fn test_force_upload_rejects_pending() {
        let (_dir, engine) = engine_fixture(Config::default()).await;
        let ids = engine
            .submit_url("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        assert!(engine.force_upload(&ids[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_permit_capacity_refresh() {
        let (_dir, engine) = engine_fixture(Config::default()).await;
        assert_eq!(engine.task_permits.read().unwrap().capacity, 3);
        let mut config = Config::default();
        config.concurrency.max_concurrent_tasks = 7;
        engine.refresh_permits(&config);
        assert_eq!(engine.task_permits.read().unwrap().capacity, 7);
        assert_eq!(engine.task_semaphore().available_permits(), 7);
    }

    #[tokio::test]
    async fn test_task_log_appends() {
        let (dir, engine) = engine_fixture(Config::default()).await;
        let log = TaskLog::open(&engine.paths, "abc123");
        log.info("first line");
        log.error("second line");
        let content =
            std::fs::read_to_string(dir.path().join("logs").join("task_abc123.log")).unwrap();
        assert!(content.contains("INFO - first line"));
        assert!(content.contains("ERROR - second line"));
    }
}
