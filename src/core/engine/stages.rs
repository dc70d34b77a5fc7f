//! Pipeline stages: the per-task state machine body.
//!
//! Within one task everything is strictly sequential. Core-path stage
//! failures abort the task; the subtitle phase is non-fatal end to end,
//! the worst outcome there is uploading the video without burned-in
//! subtitles. Every stage re-reads the row before writing so a deleted
//! task is observed at the next transition and the pipeline stops
//! silently.

use super::{PipelineEngine, TaskLog};
use crate::config::Config;
use crate::core::subtitle::{self, Cue, SrtTransform, TransformConfig, srt, vtt};
use crate::services::asr::{AsrClient, SegmentJob, audio};
use crate::services::downloader::SourceDownloader;
use crate::services::encoder::VideoEncoder;
use crate::services::ffmpeg;
use crate::services::llm::{CategoryCatalog, ChatClient, Enhancer};
use crate::services::moderation::ModerationClient;
use crate::services::qc::SubtitleQc;
use crate::services::translator::SubtitleTranslator;
use crate::services::uploader::{ChunkedUploader, PublishRequest, UploadProgressFn};
use crate::services::vad::VadProcessor;
use crate::store::{TaskPatch, TaskRecord, TaskStatus};
use crate::{Result, error::RetubeError};
use log::warn;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Minimum rendered cues for an ASR result to count as usable subtitles.
const MIN_USABLE_CUES: usize = 5;

impl PipelineEngine {
    /// Drive one task through every enabled stage.
    pub(crate) async fn process_task(&self, task_id: &str, log: &TaskLog) -> Result<()> {
        let config = self.config_service.get_config()?;
        let Some(task) = self.checkpoint(task_id).await? else {
            return Ok(());
        };
        if task.status.is_terminal() && task.status != TaskStatus::Failed {
            log.warn(&format!("Task is already {}, nothing to do", task.status));
            return Ok(());
        }

        self.stage_fetch_info(task_id, &config, log).await?;
        let Some(_) = self.checkpoint(task_id).await? else {
            return Ok(());
        };

        self.stage_enhance(task_id, &config, log).await?;

        if config.features.content_moderation_enabled {
            let passed = self.stage_moderate(task_id, &config, log).await?;
            if !passed {
                log.info("Content flagged for manual review, pipeline paused");
                return Ok(());
            }
        }

        let Some(_) = self.checkpoint(task_id).await? else {
            return Ok(());
        };
        self.stage_download(task_id, &config, log).await?;

        // The whole subtitle phase is best-effort.
        let subtitle_wanted = config.features.subtitle_translation_enabled
            || config.features.speech_recognition_enabled;
        if subtitle_wanted {
            if let Err(e) = self.stage_subtitles(task_id, &config, log).await {
                warn!("Subtitle phase failed for {}: {}", &task_id[..8], e);
                log.warn(&format!(
                    "Subtitle phase failed, continuing without burn-in: {}",
                    e
                ));
            }
        }

        if config.features.auto_mode_enabled {
            self.run_upload_stage(task_id, log).await?;
        }

        // Final status: completed only after a confirmed upload.
        if let Some(task) = self.checkpoint(task_id).await? {
            if !task.status.is_terminal() {
                if task.upload_response.is_some() && config.features.auto_mode_enabled {
                    self.store
                        .update(task_id, TaskPatch::status(TaskStatus::Completed), false)
                        .await?;
                    log.info("Task completed");
                } else {
                    self.store
                        .update(task_id, TaskPatch::status(TaskStatus::ReadyForUpload), false)
                        .await?;
                    log.info("Task processed, ready for upload");
                }
            }
        }
        Ok(())
    }

    /// `fetching_info` -> `info_fetched`: metadata, cover, embedded subs.
    async fn stage_fetch_info(&self, task_id: &str, config: &Config, log: &TaskLog) -> Result<()> {
        let Some(task) = self.advance(task_id, TaskStatus::FetchingInfo).await? else {
            return Ok(());
        };
        log.info(&format!("Fetching info for {}", task.source_url));
        let task_dir = self.store.ensure_task_dir(task_id)?;
        let adapter = SourceDownloader::new(config.downloader.clone(), self.paths.clone());

        // A failing probe with anti-bot fingerprints surfaces the cookie
        // hint; other probe failures are advisory only.
        if let Ok(binary) = adapter.locate_binary().await {
            if let Err(e) = adapter.probe_formats(&binary, &task.source_url).await {
                if e.needs_cookie_refresh() {
                    return Err(e);
                }
                log.warn(&format!("Format probe failed (continuing): {}", e));
            }
        }

        let fetched = adapter.fetch_info(&task.source_url, &task_dir).await?;
        let mut patch = TaskPatch::status(TaskStatus::InfoFetched);
        patch.title_original = fetched.title.clone();
        patch.description_original = fetched.description.clone();
        patch.metadata_path = fetched.metadata_path.map(path_string);
        patch.cover_path = fetched.cover_path.map(path_string);
        patch.subtitle_original_path = pick_subtitle(&fetched.subtitle_paths).map(path_string);
        self.store.update(task_id, patch, false).await?;
        log.info(&format!(
            "Info fetched: title='{}', {} embedded subtitle file(s)",
            fetched.title.as_deref().unwrap_or(""),
            fetched.subtitle_paths.len()
        ));
        Ok(())
    }

    /// `translating` -> `tagging` -> `partitioning`.
    ///
    /// The statuses always advance so the ordering stays observable; the
    /// work inside each is gated by its feature flag (and by the LLM
    /// actually being configured).
    async fn stage_enhance(&self, task_id: &str, config: &Config, log: &TaskLog) -> Result<()> {
        let needs_llm = config.features.translate_title
            || config.features.translate_description
            || config.features.generate_tags
            || config.features.recommend_partition;
        let enhancer = if needs_llm {
            match ChatClient::from_config(&config.llm) {
                Ok(client) => Some(Enhancer::new(client, config.llm.target_language.clone())),
                Err(e) => {
                    // Missing key disables the features with a warning;
                    // the task itself keeps going.
                    warn!("LLM unavailable, enhancement skipped: {}", e);
                    log.warn(&format!("LLM unavailable, enhancement skipped: {}", e));
                    None
                }
            }
        } else {
            None
        };

        let Some(task) = self.advance(task_id, TaskStatus::Translating).await? else {
            return Ok(());
        };
        if config.features.translate_title || config.features.translate_description {
            if let Some(enhancer) = &enhancer {
                let mut patch = TaskPatch::default();
                if config.features.translate_title {
                    if let Some(title) = task.title_original.as_deref() {
                        patch.title_translated = enhancer.translate(title, true).await;
                    }
                }
                if config.features.translate_description {
                    if let Some(desc) = task.description_original.as_deref() {
                        patch.description_translated = enhancer.translate(desc, false).await;
                    }
                }
                self.store.update(task_id, patch, false).await?;
                log.info("Title/description translated");
            }
        }

        let Some(task) = self.advance(task_id, TaskStatus::Tagging).await? else {
            return Ok(());
        };
        if config.features.generate_tags {
            if let Some(enhancer) = &enhancer {
                let title = task
                    .title_translated
                    .as_deref()
                    .or(task.title_original.as_deref())
                    .unwrap_or("");
                let description = task
                    .description_translated
                    .as_deref()
                    .or(task.description_original.as_deref())
                    .unwrap_or("");
                let tags = enhancer.generate_tags(title, description).await;
                if !tags.is_empty() {
                    let mut patch = TaskPatch::default();
                    patch.tags_generated = Some(tags);
                    self.store.update(task_id, patch, false).await?;
                    log.info("Tags generated");
                }
            }
        }

        let Some(task) = self.advance(task_id, TaskStatus::Partitioning).await? else {
            return Ok(());
        };
        if config.features.recommend_partition {
            if let Some(enhancer) = &enhancer {
                let catalog = match CategoryCatalog::load(&self.paths.category_catalog()) {
                    Ok(catalog) => catalog,
                    Err(e) => {
                        log.warn(&format!("Category catalog unavailable: {}", e));
                        CategoryCatalog::default()
                    }
                };
                let title = task
                    .title_translated
                    .as_deref()
                    .or(task.title_original.as_deref())
                    .unwrap_or("");
                let description = task
                    .description_translated
                    .as_deref()
                    .or(task.description_original.as_deref())
                    .unwrap_or("");
                if let Some(category_id) = enhancer
                    .recommend_category(
                        title,
                        description,
                        &catalog,
                        config.uploader.fixed_partition_id.as_deref(),
                    )
                    .await
                {
                    let mut patch = TaskPatch::default();
                    patch.recommended_category_id = Some(category_id.clone());
                    // The recommendation becomes the selection unless the
                    // operator already chose one.
                    if task.selected_category_id.as_deref().unwrap_or("").is_empty() {
                        patch.selected_category_id = Some(category_id.clone());
                    }
                    self.store.update(task_id, patch, false).await?;
                    log.info(&format!("Category recommended: {}", category_id));
                }
            }
        }
        Ok(())
    }

    /// `moderating`; returns false when the task entered manual review.
    async fn stage_moderate(&self, task_id: &str, config: &Config, log: &TaskLog) -> Result<bool> {
        let Some(task) = self.advance(task_id, TaskStatus::Moderating).await? else {
            return Ok(true);
        };
        let client = match ModerationClient::from_config(&config.moderation) {
            Ok(client) => client,
            Err(e) => {
                warn!("Moderation not configured, stage skipped: {}", e);
                log.warn("Moderation not configured, stage skipped");
                return Ok(true);
            }
        };
        let title = task
            .title_translated
            .as_deref()
            .or(task.title_original.as_deref())
            .unwrap_or("");
        let description = task
            .description_translated
            .as_deref()
            .or(task.description_original.as_deref())
            .unwrap_or("");

        let title_result = client
            .moderate_text(title, &config.moderation.service_type)
            .await?;
        let description_result = client
            .moderate_text(description, &config.moderation.service_type)
            .await?;
        let overall_pass = title_result.pass && description_result.pass;
        let result_json = json!({
            "overall_pass": overall_pass,
            "title": title_result,
            "description": description_result,
        });
        let mut patch = TaskPatch::default();
        patch.moderation_result = Some(result_json);
        if overall_pass {
            self.store.update(task_id, patch, false).await?;
            log.info("Moderation passed");
            Ok(true)
        } else {
            patch.status = Some(TaskStatus::AwaitingManualReview);
            self.store.update(task_id, patch, false).await?;
            log.warn("Moderation rejected, awaiting manual review");
            Ok(false)
        }
    }

    /// `downloading` -> `downloaded`: media only, metadata preserved.
    async fn stage_download(&self, task_id: &str, config: &Config, log: &TaskLog) -> Result<()> {
        let Some(task) = self.advance(task_id, TaskStatus::Downloading).await? else {
            return Ok(());
        };
        let task_dir = self.store.ensure_task_dir(task_id)?;
        let adapter = SourceDownloader::new(config.downloader.clone(), self.paths.clone());

        // Percent flows to the row through silent updates; the log would
        // otherwise drown in progress lines.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<f64>();
        let store = self.store.clone();
        let id = task_id.to_string();
        let progress_writer = tokio::spawn(async move {
            let mut last_written = -1.0f64;
            while let Some(percent) = rx.recv().await {
                if (percent - last_written).abs() >= 1.0 {
                    last_written = percent;
                    let _ = store
                        .update(&id, TaskPatch::progress(format!("下载中 {:.1}%", percent)), true)
                        .await;
                }
            }
        });

        let video_path = adapter
            .download_video(&task.source_url, &task_dir, {
                let tx = tx.clone();
                move |progress| {
                    let _ = tx.send(progress.percent);
                }
            })
            .await;
        drop(tx);
        let _ = progress_writer.await;
        let video_path = video_path?;

        let mut patch = TaskPatch::status(TaskStatus::Downloaded);
        patch.video_path = Some(path_string(video_path.clone()));
        patch.upload_progress = Some("下载完成".into());
        self.store.update(task_id, patch, false).await?;
        log.info(&format!("Video downloaded to {:?}", video_path));
        Ok(())
    }

    /// The subtitle phase: ASR synthesis, translation, QC, burn-in.
    ///
    /// Runs only when subtitles were downloaded or speech recognition is
    /// enabled. Any failure here is caught by the caller; the pipeline
    /// proceeds to upload the clean video.
    async fn stage_subtitles(
        &self,
        task_id: &str,
        config: &Config,
        log: &TaskLog,
    ) -> Result<()> {
        let Some(task) = self.checkpoint(task_id).await? else {
            return Ok(());
        };
        let task_dir = self.store.ensure_task_dir(task_id)?;
        let video_path = task
            .video_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .ok_or_else(|| RetubeError::task_state("video file missing before subtitle phase"))?;

        // Source selection: downloaded subtitles first, ASR synthesis
        // second.
        let mut subtitle_path = task
            .subtitle_original_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.exists());
        let mut detected_language = task.subtitle_language_detected.clone();

        if subtitle_path.is_none() && config.features.speech_recognition_enabled {
            subtitle_path = self
                .stage_asr(task_id, config, &video_path, &task_dir, log)
                .await?;
            if let Some(task) = self.checkpoint(task_id).await? {
                detected_language = task.subtitle_language_detected;
            }
        }
        let Some(subtitle_path) = subtitle_path else {
            log.info("No subtitles available, phase skipped");
            return Ok(());
        };

        // Normalize to SRT cues.
        let content = subtitle::read_subtitle_file(&subtitle_path)?;
        let cues = if subtitle_path.extension().and_then(|e| e.to_str()) == Some("vtt") {
            vtt::parse_vtt(&content)
        } else {
            srt::parse_srt(&content, 0.0)
        };
        if cues.is_empty() {
            log.warn("Subtitle file parsed to zero cues, phase skipped");
            return Ok(());
        }
        if detected_language.is_none() {
            let joined: String = cues.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n");
            detected_language = subtitle::detect_language(&joined).map(str::to_string);
            if let Some(lang) = &detected_language {
                let mut patch = TaskPatch::default();
                patch.subtitle_language_detected = Some(lang.clone());
                self.store.update(task_id, patch, true).await?;
            }
        }

        // Translation, unless the subtitles are already in the target
        // language.
        let already_target = matches!(detected_language.as_deref(), Some("zh"));
        let mut final_cues: Vec<Cue> = cues.clone();
        let mut burn_path = subtitle_path.clone();
        if config.features.subtitle_translation_enabled && !already_target {
            if let Some(translated) = self
                .stage_translate_subtitles(task_id, config, &cues, log)
                .await?
            {
                final_cues = translated;
                let translated_path = task_dir.join(format!("translated_{}.srt", task_id));
                if let Some(rendered) = srt::render_srt(&final_cues) {
                    std::fs::write(&translated_path, rendered)?;
                    let mut patch = TaskPatch::default();
                    patch.subtitle_translated_path =
                        Some(path_string(translated_path.clone()));
                    self.store.update(task_id, patch, false).await?;
                    burn_path = translated_path;
                }
                if !config.features.subtitle_keep_original && subtitle_path != burn_path {
                    let _ = std::fs::remove_file(&subtitle_path);
                }
            }
        }

        // Quality gate: a reject skips burn-in but keeps the SRT around.
        if config.features.subtitle_embed_in_video {
            let qc_client = self.subtitle_chat_client(config);
            let qc = SubtitleQc::new(qc_client, config.qc.clone());
            let verdict = qc.check(&final_cues).await;
            if !verdict.passed {
                log.warn(&format!(
                    "Subtitle QC rejected (score {:.2}: {}), burn-in skipped",
                    verdict.score, verdict.reason
                ));
                return Ok(());
            }
            self.stage_encode(task_id, config, &video_path, &burn_path, &task_dir, log)
                .await?;
        }
        Ok(())
    }

    /// `asr_transcribing`: VAD windows, concurrent transcription, global
    /// calibration. Returns the written SRT path, or `None` when the
    /// result was too thin to count as subtitles.
    async fn stage_asr(
        &self,
        task_id: &str,
        config: &Config,
        video_path: &Path,
        task_dir: &Path,
        log: &TaskLog,
    ) -> Result<Option<PathBuf>> {
        if self.advance(task_id, TaskStatus::AsrTranscribing).await?.is_none() {
            return Ok(None);
        }
        let ffmpeg_bin = ffmpeg::find_ffmpeg(config.encoder.ffmpeg_path.as_deref()).await?;
        let ffprobe_bin = ffmpeg::find_ffprobe(config.encoder.ffmpeg_path.as_deref()).await?;
        let media = ffmpeg::probe_media(&ffprobe_bin, video_path).await?;

        let vad = VadProcessor::new(config.vad.clone())?;
        let windows = vad
            .detect_speech_windows(&ffmpeg_bin, video_path, media.duration_s)
            .await?;
        if windows.is_empty() {
            log.info("VAD found no speech, ASR skipped");
            return Ok(None);
        }
        log.info(&format!("VAD produced {} speech windows", windows.len()));

        // Cut one clip per window; failures skip the window.
        let clips_dir = tempfile::TempDir::new()?;
        let wav = clips_dir.path().join("audio.wav");
        audio::extract_speech_wav(&ffmpeg_bin, video_path, &wav).await?;
        let mut jobs: Vec<SegmentJob> = Vec::new();
        for (i, window) in windows.iter().enumerate() {
            let clip = clips_dir.path().join(format!("segment_{}.wav", i));
            if let Some(path) = audio::cut_wav_clip(
                &ffmpeg_bin,
                &wav,
                window.start_s,
                window.duration(),
                &clip,
            )
            .await?
            {
                jobs.push(SegmentJob {
                    offset_s: window.start_s,
                    duration_s: window.duration(),
                    wav_path: path,
                });
            }
        }
        if jobs.is_empty() {
            log.warn("No usable audio clips for ASR");
            return Ok(None);
        }

        let asr = Arc::new(AsrClient::new(config.asr.clone())?);
        if jobs.len() >= 2 {
            if let Some(lang) = asr.detect_language(&jobs[0], &jobs[jobs.len() - 1]).await {
                asr.set_language_hint(&lang);
                let mut patch = TaskPatch::default();
                patch.subtitle_language_detected = Some(lang);
                self.store.update(task_id, patch, true).await?;
            }
        }
        let results = Arc::clone(&asr).transcribe_segments_concurrent(jobs).await?;

        let transform = SrtTransform::new(TransformConfig {
            max_line_length: config.subtitle.max_chars_per_line,
            max_lines: config.subtitle.max_lines_per_cue,
            normalize_punctuation: config.subtitle.space_after_punctuation,
            min_cue_duration_s: config.subtitle.min_cue_duration_s,
            merge_gap_s: config.subtitle.merge_gap_s,
            min_text_length: config.subtitle.min_text_length,
            ..TransformConfig::default()
        });
        let cues = transform.transform(&results, media.duration_s);
        if cues.len() < MIN_USABLE_CUES {
            log.warn(&format!(
                "ASR produced only {} cues, discarded as no subtitles",
                cues.len()
            ));
            return Ok(None);
        }
        let srt_path = task_dir.join(format!("asr_{}.srt", task_id));
        let rendered = srt::render_srt(&cues)
            .ok_or_else(|| RetubeError::audio_processing("ASR rendered empty SRT"))?;
        std::fs::write(&srt_path, rendered)?;
        let mut patch = TaskPatch::default();
        patch.subtitle_original_path = Some(path_string(srt_path.clone()));
        self.store.update(task_id, patch, false).await?;
        log.info(&format!("ASR produced {} cues", cues.len()));
        Ok(Some(srt_path))
    }

    /// `translating_subtitle`: batched translation with repairs.
    async fn stage_translate_subtitles(
        &self,
        task_id: &str,
        config: &Config,
        cues: &[Cue],
        log: &TaskLog,
    ) -> Result<Option<Vec<Cue>>> {
        if self
            .advance(task_id, TaskStatus::TranslatingSubtitle)
            .await?
            .is_none()
        {
            return Ok(None);
        }
        let Some(client) = self.subtitle_chat_client(config) else {
            log.warn("Subtitle translation has no usable LLM endpoint, skipped");
            return Ok(None);
        };
        let translator = SubtitleTranslator::new(
            client,
            config.subtitle.clone(),
            config.llm.target_language.clone(),
            config.concurrency.effective_subtitle_workers(),
        );
        let store = self.store.clone();
        let id = task_id.to_string();
        let translated = translator
            .translate_cues(
                cues,
                Some(Box::new(move |done, total| {
                    let store = store.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        let _ = store
                            .update(
                                &id,
                                TaskPatch::progress(format!("字幕翻译 {}/{}", done, total)),
                                true,
                            )
                            .await;
                    });
                })),
            )
            .await?;
        log.info(&format!("Subtitle translation finished ({} cues)", translated.len()));
        Ok(Some(translated))
    }

    /// `encoding_video`: burn-in with progress surfaced to the row.
    async fn stage_encode(
        &self,
        task_id: &str,
        config: &Config,
        video_path: &Path,
        subtitle_path: &Path,
        task_dir: &Path,
        log: &TaskLog,
    ) -> Result<()> {
        if self.advance(task_id, TaskStatus::EncodingVideo).await?.is_none() {
            return Ok(());
        }
        let output = task_dir.join("video_with_subtitle.mp4");
        let encoder = VideoEncoder::new(config.encoder.clone(), &self.paths.bundled_font());
        let store = self.store.clone();
        let id = task_id.to_string();
        let result = encoder
            .burn_subtitles(
                video_path,
                subtitle_path,
                &output,
                Some(Box::new(move |percent| {
                    let store = store.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        let _ = store
                            .update(
                                &id,
                                TaskPatch::progress(format!("转码中 {:.1}%", percent)),
                                true,
                            )
                            .await;
                    });
                })),
            )
            .await?;
        let mut patch = TaskPatch::default();
        patch.video_path = Some(path_string(result.clone()));
        patch.upload_progress = Some("转码完成".into());
        self.store.update(task_id, patch, false).await?;
        log.info(&format!("Subtitles burned into {:?}", result));
        Ok(())
    }

    /// `uploading` -> `completed`, under an upload permit.
    pub(crate) async fn run_upload_stage(&self, task_id: &str, log: &TaskLog) -> Result<()> {
        let config = self.config_service.get_config()?;
        let Some(task) = self.checkpoint(task_id).await? else {
            return Ok(());
        };
        let video_path = task
            .video_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .ok_or_else(|| RetubeError::task_state("video file missing before upload"))?;
        let cover_path = task
            .cover_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .ok_or_else(|| RetubeError::task_state("cover file missing before upload"))?;
        // Invariant: a category must be selected before uploading; the
        // engine preempts rather than letting the service reject.
        let category_id = task
            .effective_category_id()
            .ok_or_else(|| RetubeError::task_state("no category selected before upload"))?
            .to_string();

        if self.advance(task_id, TaskStatus::Uploading).await?.is_none() {
            return Ok(());
        }
        log.info("Waiting for an upload permit");
        let upload_semaphore = self.upload_semaphore();
        let _upload_permit = upload_semaphore
            .acquire()
            .await
            .map_err(|_| RetubeError::upload("permit", "upload semaphore closed"))?;
        log.info("Upload permit acquired");

        let cookies = Some(self.paths.resolve(&config.uploader.cookies_file));
        let uploader = ChunkedUploader::new(config.uploader.clone(), cookies)?;
        let (uploader_name, upload_date) = read_provenance(task.metadata_path.as_deref());
        let request = PublishRequest {
            title: task
                .title_translated
                .clone()
                .or(task.title_original.clone())
                .unwrap_or_default(),
            description: task
                .description_translated
                .clone()
                .or(task.description_original.clone())
                .unwrap_or_default(),
            tags: task.tags_generated.clone(),
            category_id,
            original_url: Some(task.source_url.clone()),
            original_uploader: uploader_name,
            original_upload_date: upload_date,
        };

        let store = self.store.clone();
        let id = task_id.to_string();
        let progress: UploadProgressFn = Arc::new(move |status: String| {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _ = store.update(&id, TaskPatch::progress(status), true).await;
            });
        });

        let response = uploader
            .upload_video(&video_path, &cover_path, &request, Some(progress))
            .await?;
        let mut patch = TaskPatch::status(TaskStatus::Completed);
        patch.upload_response = Some(serde_json::to_value(&response)?);
        patch.upload_progress = Some("上传完成".into());
        self.store.update(task_id, patch, false).await?;
        log.info(&format!("Upload complete, post id {}", response.ac_number));
        Ok(())
    }

    /// Transition to a stage status, returning the fresh row; `None`
    /// means the task vanished and the pipeline should wind down.
    async fn advance(&self, task_id: &str, status: TaskStatus) -> Result<Option<TaskRecord>> {
        self.store.update(task_id, TaskPatch::status(status), false).await
    }

    /// Chat client for subtitle translation and QC, honoring the
    /// endpoint overrides before the main LLM settings.
    fn subtitle_chat_client(&self, config: &Config) -> Option<ChatClient> {
        let base_url = config
            .subtitle
            .base_url_override
            .clone()
            .unwrap_or_else(|| config.llm.base_url.clone());
        let api_key = config
            .subtitle
            .api_key_override
            .clone()
            .or_else(|| config.llm.api_key.clone())?;
        let model = config
            .subtitle
            .model_override
            .clone()
            .unwrap_or_else(|| config.llm.model.clone());
        ChatClient::new(
            base_url,
            api_key,
            model,
            config.llm.temperature,
            config.llm.retry_attempts,
            config.llm.retry_delay_ms,
        )
        .ok()
    }
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

/// Pick the subtitle file to carry forward: SRT beats VTT, then
/// lexicographic order for stability.
fn pick_subtitle(paths: &[PathBuf]) -> Option<PathBuf> {
    paths
        .iter()
        .find(|p| p.extension().and_then(|e| e.to_str()) == Some("srt"))
        .or_else(|| paths.first())
        .cloned()
}

/// Original uploader and upload date out of the metadata JSON.
fn read_provenance(metadata_path: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(path) = metadata_path else {
        return (None, None);
    };
    let Ok(content) = std::fs::read_to_string(path) else {
        return (None, None);
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(&content) else {
        return (None, None);
    };
    (
        json["uploader"].as_str().map(str::to_string),
        json["upload_date"].as_str().map(str::to_string),
    )
}
