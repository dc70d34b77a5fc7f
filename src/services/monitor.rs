//! Discovery: periodic catalog queries that auto-enqueue new tasks.
//!
//! Each saved `MonitorConfig` describes one query against the external
//! video catalog (search by keywords, per-channel uploads, or the
//! trending chart), thresholds to filter candidates, a schedule, and a
//! rate-limit window. Candidates surviving the filters are recorded in
//! the per-config history — the `(config_id, video_id)` unique key makes
//! re-discovery a no-op — and optionally submitted as tasks.

use crate::config::MonitorApiConfig;
use crate::services::downloader::canonical_video_url;
use crate::store::MonitorStore;
use crate::store::monitor::MonitorConfigRecord;
use crate::{Result, error::RetubeError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Submits a discovered URL as a task and starts it.
///
/// Implemented by the pipeline engine; the trait keeps the scheduler free
/// of a direct engine dependency.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Create a task for the URL and schedule it.
    async fn submit(&self, source_url: &str) -> Result<String>;
}

/// One candidate video with the statistics the filters need.
#[derive(Debug, Clone, Default)]
pub struct CandidateVideo {
    pub video_id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_title: String,
    pub published_at: String,
    pub view_count: i64,
    pub like_count: i64,
    pub comment_count: i64,
    /// ISO 8601 duration string from the catalog.
    pub duration: String,
}

/// Sliding-window call counter for the catalog API.
///
/// The window is coarse (whole-run granularity): calls are counted from
/// the first call of the run; hitting the cap aborts the remaining work.
pub struct CallBudget {
    max_calls: i64,
    used: AtomicI64,
}

impl CallBudget {
    /// Budget of `max_calls` per run window.
    pub fn new(max_calls: i64) -> Self {
        Self {
            max_calls: max_calls.max(1),
            used: AtomicI64::new(0),
        }
    }

    /// Consume one call; false when the cap is reached.
    pub fn try_acquire(&self) -> bool {
        self.used.fetch_add(1, Ordering::SeqCst) < self.max_calls
    }

    /// Calls consumed so far.
    pub fn used(&self) -> i64 {
        self.used.load(Ordering::SeqCst).min(self.max_calls)
    }
}

/// Thin client over the external catalog API.
pub struct CatalogClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl CatalogClient {
    /// Create a client; fails without an API key so discovery can be
    /// skipped with a log line instead of failing at call time.
    pub fn from_config(config: &MonitorApiConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .as_ref()
            .ok_or_else(|| RetubeError::config("catalog API key not configured"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RetubeError::catalog_api(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            api_key: api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        let mut query: Vec<(String, String)> = query.to_vec();
        query.push(("key".into(), self.api_key.clone()));
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .query(&query)
            .send()
            .await
            .map_err(|e| RetubeError::catalog_api(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RetubeError::catalog_api(format!(
                "catalog returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RetubeError::catalog_api(format!("response unparseable: {}", e)))
    }

    /// Keyword search returning bare video ids.
    pub async fn search_video_ids(
        &self,
        config: &MonitorConfigRecord,
        published_after: &str,
    ) -> Result<Vec<String>> {
        let mut query: Vec<(String, String)> = vec![
            ("part".into(), "id".into()),
            ("type".into(), "video".into()),
            ("q".into(), config.keywords.clone()),
            ("order".into(), order_param(&config.order_by).into()),
            ("maxResults".into(), config.max_results.clamp(1, 50).to_string()),
            ("publishedAfter".into(), published_after.into()),
        ];
        if !config.region_code.trim().is_empty() {
            query.push(("regionCode".into(), config.region_code.clone()));
        }
        if !config.category_id.trim().is_empty() && config.category_id != "0" {
            query.push(("videoCategoryId".into(), config.category_id.clone()));
        }
        let value = self.get_json("search", &query).await?;
        Ok(items_of(&value)
            .iter()
            .filter_map(|item| item["id"]["videoId"].as_str().map(str::to_string))
            .collect())
    }

    /// Resolve a channel's uploads playlist.
    pub async fn channel_uploads_playlist(&self, channel_id: &str) -> Result<Option<String>> {
        let value = self
            .get_json(
                "channels",
                &[
                    ("part".into(), "contentDetails".into()),
                    ("id".into(), channel_id.into()),
                ],
            )
            .await?;
        Ok(items_of(&value)
            .first()
            .and_then(|item| {
                item["contentDetails"]["relatedPlaylists"]["uploads"]
                    .as_str()
                    .map(str::to_string)
            }))
    }

    /// Latest items of a playlist, filtered by publish cutoff.
    pub async fn playlist_video_ids(
        &self,
        playlist_id: &str,
        published_after: &str,
        max_results: i64,
    ) -> Result<Vec<String>> {
        let value = self
            .get_json(
                "playlistItems",
                &[
                    ("part".into(), "contentDetails".into()),
                    ("playlistId".into(), playlist_id.into()),
                    ("maxResults".into(), max_results.clamp(1, 50).to_string()),
                ],
            )
            .await?;
        let cutoff = parse_time(published_after);
        Ok(items_of(&value)
            .iter()
            .filter(|item| {
                match (
                    cutoff,
                    item["contentDetails"]["videoPublishedAt"]
                        .as_str()
                        .and_then(|s| parse_time(s)),
                ) {
                    (Some(cutoff), Some(published)) => published >= cutoff,
                    _ => true,
                }
            })
            .filter_map(|item| {
                item["contentDetails"]["videoId"].as_str().map(str::to_string)
            })
            .collect())
    }

    /// Trending chart for a region/category.
    pub async fn trending_videos(&self, config: &MonitorConfigRecord) -> Result<Vec<CandidateVideo>> {
        let mut query: Vec<(String, String)> = vec![
            ("part".into(), "snippet,statistics,contentDetails".into()),
            ("chart".into(), "mostPopular".into()),
            ("maxResults".into(), config.max_results.clamp(1, 50).to_string()),
        ];
        if !config.region_code.trim().is_empty() {
            query.push(("regionCode".into(), config.region_code.clone()));
        }
        if !config.category_id.trim().is_empty() && config.category_id != "0" {
            query.push(("videoCategoryId".into(), config.category_id.clone()));
        }
        let value = self.get_json("videos", &query).await?;
        Ok(items_of(&value).iter().filter_map(candidate_from_item).collect())
    }

    /// Stats and content details for a batch of video ids.
    pub async fn video_details(&self, video_ids: &[String]) -> Result<Vec<CandidateVideo>> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .get_json(
                "videos",
                &[
                    ("part".into(), "snippet,statistics,contentDetails".into()),
                    ("id".into(), video_ids.join(",")),
                ],
            )
            .await?;
        Ok(items_of(&value).iter().filter_map(candidate_from_item).collect())
    }
}

fn items_of(value: &Value) -> Vec<Value> {
    value["items"].as_array().cloned().unwrap_or_default()
}

fn candidate_from_item(item: &Value) -> Option<CandidateVideo> {
    let video_id = item["id"]
        .as_str()
        .or_else(|| item["id"]["videoId"].as_str())?
        .to_string();
    let snippet = &item["snippet"];
    let stats = &item["statistics"];
    Some(CandidateVideo {
        video_id,
        title: snippet["title"].as_str().unwrap_or("").to_string(),
        channel_id: snippet["channelId"].as_str().unwrap_or("").to_string(),
        channel_title: snippet["channelTitle"].as_str().unwrap_or("").to_string(),
        published_at: snippet["publishedAt"].as_str().unwrap_or("").to_string(),
        view_count: count_of(&stats["viewCount"]),
        like_count: count_of(&stats["likeCount"]),
        comment_count: count_of(&stats["commentCount"]),
        duration: item["contentDetails"]["duration"]
            .as_str()
            .unwrap_or("")
            .to_string(),
    })
}

fn count_of(value: &Value) -> i64 {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value.as_i64())
        .unwrap_or(0)
}

fn order_param(order_by: &str) -> &'static str {
    match order_by {
        "date" => "date",
        _ => "viewCount",
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

/// Parse an ISO 8601 duration (`PT1H2M3S`) into seconds.
pub fn parse_iso8601_duration(s: &str) -> i64 {
    let mut seconds = 0i64;
    let mut number = String::new();
    let mut in_time = false;
    for ch in s.chars() {
        match ch {
            'P' => {}
            'T' => in_time = true,
            '0'..='9' => number.push(ch),
            'D' => {
                seconds += number.parse::<i64>().unwrap_or(0) * 86_400;
                number.clear();
            }
            'H' if in_time => {
                seconds += number.parse::<i64>().unwrap_or(0) * 3600;
                number.clear();
            }
            'M' if in_time => {
                seconds += number.parse::<i64>().unwrap_or(0) * 60;
                number.clear();
            }
            'S' => {
                seconds += number.parse::<i64>().unwrap_or(0);
                number.clear();
            }
            _ => number.clear(),
        }
    }
    seconds
}

/// Outcome of one discovery run.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub candidates: usize,
    pub matched: usize,
    pub new_videos: usize,
    pub enqueued: usize,
    pub aborted_at_rate_limit: bool,
}

/// Drives saved discovery configs against the catalog.
pub struct DiscoveryScheduler {
    store: MonitorStore,
    submitter: Arc<dyn TaskSubmitter>,
    api_config: MonitorApiConfig,
}

impl DiscoveryScheduler {
    /// Create a scheduler.
    pub fn new(
        store: MonitorStore,
        submitter: Arc<dyn TaskSubmitter>,
        api_config: MonitorApiConfig,
    ) -> Self {
        Self {
            store,
            submitter,
            api_config,
        }
    }

    /// Spawn the recurring schedule loop.
    ///
    /// One poll loop stands in for per-config jobs: each tick re-reads
    /// the `auto` configs, so edits add, replace and remove schedules
    /// without any registration bookkeeping.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let configs = match self.store.list_auto_configs().await {
                    Ok(configs) => configs,
                    Err(e) => {
                        warn!("Failed to list discovery configs: {}", e);
                        continue;
                    }
                };
                for config in configs {
                    if !config_is_due(&config) {
                        continue;
                    }
                    info!("Running discovery config {} ('{}')", config.id, config.name);
                    if let Err(e) = self.run_config(config.id).await {
                        warn!("Discovery run {} failed: {}", config.id, e);
                    }
                }
            }
        });
    }

    /// Execute one config immediately.
    pub async fn run_config(&self, config_id: i64) -> Result<RunReport> {
        let config = self
            .store
            .get_config(config_id)
            .await?
            .ok_or_else(|| RetubeError::config(format!("monitor config {} not found", config_id)))?;
        let client = CatalogClient::from_config(&self.api_config)?;
        let budget = CallBudget::new(config.rate_limit_requests);
        let report = self.run_with_client(&config, &client, &budget).await;
        self.store.touch_last_run(config_id).await?;
        report
    }

    async fn run_with_client(
        &self,
        config: &MonitorConfigRecord,
        client: &CatalogClient,
        budget: &CallBudget,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        let published_after = published_after_cutoff(config).to_rfc3339();

        // Candidate collection: channels > keyword search > trending.
        let channel_ids = MonitorConfigRecord::split_list(&config.channel_ids);
        let candidates: Vec<CandidateVideo> = if !channel_ids.is_empty() {
            let mut ids: Vec<String> = Vec::new();
            for channel in &channel_ids {
                if !budget.try_acquire() {
                    report.aborted_at_rate_limit = true;
                    break;
                }
                let playlist = match client.channel_uploads_playlist(channel).await? {
                    Some(p) => p,
                    None => continue,
                };
                if !budget.try_acquire() {
                    report.aborted_at_rate_limit = true;
                    break;
                }
                ids.extend(
                    client
                        .playlist_video_ids(&playlist, &published_after, config.max_results)
                        .await?,
                );
            }
            self.details_for(client, budget, &mut report, ids).await?
        } else if !config.keywords.trim().is_empty() {
            if budget.try_acquire() {
                let ids = client.search_video_ids(config, &published_after).await?;
                self.details_for(client, budget, &mut report, ids).await?
            } else {
                report.aborted_at_rate_limit = true;
                Vec::new()
            }
        } else {
            if budget.try_acquire() {
                client.trending_videos(config).await?
            } else {
                report.aborted_at_rate_limit = true;
                Vec::new()
            }
        };
        report.candidates = candidates.len();

        let matched: Vec<CandidateVideo> = candidates
            .into_iter()
            .filter(|c| meets_criteria(c, config))
            .collect();
        report.matched = matched.len();
        debug!(
            "Discovery config {}: {} candidates, {} matched",
            config.id, report.candidates, report.matched
        );

        for video in matched {
            if self.store.is_seen(config.id, &video.video_id).await? {
                continue;
            }
            let inserted = self
                .store
                .record_video(
                    config.id,
                    &video.video_id,
                    &video.title,
                    &video.channel_title,
                    video.view_count,
                    video.like_count,
                    video.comment_count,
                    &video.duration,
                    &video.published_at,
                    false,
                )
                .await?;
            if !inserted {
                continue;
            }
            report.new_videos += 1;

            if config.auto_add_to_tasks {
                let url = canonical_video_url(&video.video_id);
                match self.submitter.submit(&url).await {
                    Ok(task_id) => {
                        info!(
                            "Discovered video {} enqueued as task {}",
                            video.video_id,
                            &task_id[..8.min(task_id.len())]
                        );
                        self.store
                            .mark_added_to_tasks(config.id, &video.video_id)
                            .await?;
                        report.enqueued += 1;
                    }
                    Err(e) => warn!("Failed to enqueue {}: {}", video.video_id, e),
                }
            }
        }
        if report.aborted_at_rate_limit {
            warn!(
                "Discovery config {} stopped at rate cap ({} calls)",
                config.id,
                budget.used()
            );
        }
        Ok(report)
    }

    async fn details_for(
        &self,
        client: &CatalogClient,
        budget: &CallBudget,
        report: &mut RunReport,
        ids: Vec<String>,
    ) -> Result<Vec<CandidateVideo>> {
        let mut out = Vec::new();
        for chunk in ids.chunks(50) {
            if !budget.try_acquire() {
                report.aborted_at_rate_limit = true;
                break;
            }
            out.extend(client.video_details(chunk).await?);
        }
        Ok(out)
    }
}

fn config_is_due(config: &MonitorConfigRecord) -> bool {
    let Some(last) = config.last_run_time.as_deref().and_then(parse_time) else {
        return true;
    };
    let interval = ChronoDuration::minutes(config.schedule_interval_minutes.max(1));
    Utc::now() >= last + interval
}

fn published_after_cutoff(config: &MonitorConfigRecord) -> DateTime<Utc> {
    if let Some(explicit) = parse_time(config.start_date.trim()) {
        return explicit;
    }
    Utc::now() - ChronoDuration::days(config.time_period_days.max(1))
}

/// Threshold and exclusion filters over one candidate.
pub fn meets_criteria(video: &CandidateVideo, config: &MonitorConfigRecord) -> bool {
    if video.view_count < config.min_view_count
        || video.like_count < config.min_like_count
        || video.comment_count < config.min_comment_count
    {
        return false;
    }
    let duration_s = parse_iso8601_duration(&video.duration);
    if config.min_duration > 0 && duration_s < config.min_duration {
        return false;
    }
    if config.max_duration > 0 && duration_s > config.max_duration {
        return false;
    }
    let title_lower = video.title.to_lowercase();
    for keyword in MonitorConfigRecord::split_list(&config.exclude_keywords) {
        if title_lower.contains(&keyword.to_lowercase()) {
            return false;
        }
    }
    for channel in MonitorConfigRecord::split_list(&config.exclude_channel_ids) {
        if video.channel_id == channel {
            return false;
        }
    }
    if let Some(cutoff) = parse_time(config.start_date.trim()) {
        if let Some(published) = parse_time(&video.published_at) {
            if published < cutoff {
                return false;
            }
        }
    }
    true
}
