//! Configuration management module for retube.
//!
//! The on-disk format is the legacy flat key/value JSON store
//! (`config/config.json`, keys like `MAX_CONCURRENT_TASKS`); this module
//! surfaces it as a typed [`Config`] snapshot behind the [`ConfigService`]
//! trait so components receive configuration by injection instead of
//! reading files themselves.
//!
//! # Key Components
//!
//! - [`Config`] - Main configuration structure containing all settings
//! - [`ConfigService`] - Service interface for configuration management
//! - [`ProductionConfigService`] - Production implementation with file I/O
//! - [`TestConfigService`] - Test implementation with controlled behavior
//!
//! Concurrent readers always see a consistent snapshot: the production
//! service keeps one cached `Config` behind a lock and replaces it wholesale
//! on `reload`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub mod service;
pub mod validation;

pub use service::{ConfigService, ProductionConfigService, TestConfigService};
use validation::{kv_bool, kv_f64, kv_string, kv_u32, kv_u64};

// ============================================================================
// Configuration Type Definitions
// ============================================================================

/// Full application configuration for retube.
///
/// Aggregates feature flags, concurrency limits, per-service tunables and
/// retention policy. Built from (and saved back to) the flat key/value
/// store; unknown keys in the file are preserved on save.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Pipeline feature flags.
    pub features: FeatureFlags,
    /// Concurrency limits and scheduler cadence.
    pub concurrency: ConcurrencyConfig,
    /// LLM chat-completions settings (translation, tagging, classification).
    pub llm: LlmConfig,
    /// Subtitle translation and transform tunables.
    pub subtitle: SubtitleConfig,
    /// Speech-recognition client settings.
    pub asr: AsrConfig,
    /// Remote VAD service settings.
    pub vad: VadConfig,
    /// Subtitle quality-control gate settings.
    pub qc: QcConfig,
    /// Video encoder backend selection.
    pub encoder: EncoderConfig,
    /// Text moderation service settings.
    pub moderation: ModerationConfig,
    /// Source downloader settings (proxy, threads, cookies).
    pub downloader: DownloaderConfig,
    /// Sink platform credentials.
    pub uploader: UploaderConfig,
    /// Discovery catalog API settings.
    pub monitor: MonitorApiConfig,
    /// Log / download retention sweeps.
    pub retention: RetentionConfig,
    /// Login gate tunables.
    pub security: SecurityConfig,
}

/// Pipeline feature flags.
///
/// Disabled phases are skipped but the stage ordering is preserved.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FeatureFlags {
    /// Start tasks automatically as soon as they are created.
    pub auto_mode_enabled: bool,
    /// Translate the video title.
    pub translate_title: bool,
    /// Translate the video description.
    pub translate_description: bool,
    /// Generate tags from title/description.
    pub generate_tags: bool,
    /// Infer the target category.
    pub recommend_partition: bool,
    /// Run text moderation on translated fields.
    pub content_moderation_enabled: bool,
    /// Translate subtitles.
    pub subtitle_translation_enabled: bool,
    /// Burn translated subtitles into the video.
    pub subtitle_embed_in_video: bool,
    /// Keep the original-language subtitle file after translation.
    pub subtitle_keep_original: bool,
    /// Synthesize subtitles via ASR when none were downloaded.
    pub speech_recognition_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            auto_mode_enabled: false,
            translate_title: true,
            translate_description: true,
            generate_tags: true,
            recommend_partition: true,
            content_moderation_enabled: false,
            subtitle_translation_enabled: false,
            subtitle_embed_in_video: true,
            subtitle_keep_original: true,
            speech_recognition_enabled: false,
        }
    }
}

/// Concurrency limits and scheduler cadence.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConcurrencyConfig {
    /// Global task permit count.
    pub max_concurrent_tasks: u32,
    /// Global upload permit count.
    pub max_concurrent_uploads: u32,
    /// Subtitle translation worker cap (0 = auto from CPU count).
    pub subtitle_max_workers: u32,
    /// Pending scanner interval in seconds (lower bound 5).
    pub pending_scan_interval_seconds: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_concurrent_uploads: 1,
            subtitle_max_workers: 0,
            pending_scan_interval_seconds: 30,
        }
    }
}

impl ConcurrencyConfig {
    /// Scanner interval with the documented lower bound applied.
    pub fn scan_interval_clamped(&self) -> u64 {
        self.pending_scan_interval_seconds.max(5)
    }

    /// Effective subtitle worker cap (auto = half the cores, at least 2).
    pub fn effective_subtitle_workers(&self) -> usize {
        if self.subtitle_max_workers == 0 {
            (num_cpus::get() / 2).max(2)
        } else {
            self.subtitle_max_workers as usize
        }
    }
}

/// LLM chat-completions settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    /// API base URL (OpenAI-compatible).
    pub base_url: String,
    /// API key; absent disables dependent features with a warning.
    pub api_key: Option<String>,
    /// Model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Target language for title/description translation.
    pub target_language: String,
    /// Retries per request.
    pub retry_attempts: u32,
    /// Delay between retries in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4.1-mini".to_string(),
            temperature: 0.3,
            target_language: "zh-CN".to_string(),
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Subtitle translation and transform tunables.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubtitleConfig {
    /// Cues per translation batch.
    pub batch_size: usize,
    /// Retries per batch.
    pub max_retries: u32,
    /// Fixed delay between batch retries, seconds.
    pub retry_delay_s: f64,
    /// Optional base URL override for the translation endpoint.
    pub base_url_override: Option<String>,
    /// Optional API key override for the translation endpoint.
    pub api_key_override: Option<String>,
    /// Optional model override for the translation endpoint.
    pub model_override: Option<String>,
    /// Maximum characters per rendered line.
    pub max_chars_per_line: usize,
    /// Maximum lines per cue.
    pub max_lines_per_cue: usize,
    /// Minimum visible cue duration, seconds.
    pub min_cue_duration_s: f64,
    /// Gap below which adjacent short cues merge, seconds.
    pub merge_gap_s: f64,
    /// Text shorter than this counts as a fragment for merging.
    pub min_text_length: usize,
    /// Insert a space after sentence punctuation during normalization.
    pub space_after_punctuation: bool,
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_retries: 3,
            retry_delay_s: 2.0,
            base_url_override: None,
            api_key_override: None,
            model_override: None,
            max_chars_per_line: 42,
            max_lines_per_cue: 2,
            min_cue_duration_s: 1.0,
            merge_gap_s: 0.5,
            min_text_length: 4,
            space_after_punctuation: true,
        }
    }
}

/// Speech-recognition client settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AsrConfig {
    /// Whisper-compatible API base URL.
    pub base_url: String,
    /// API key.
    pub api_key: Option<String>,
    /// Model name sent with each request.
    pub model: String,
    /// Forced language (empty = auto-detect from probes).
    pub language: String,
    /// Optional domain prompt forwarded to the API.
    pub prompt: String,
    /// Concurrent segment workers.
    pub max_workers: u32,
    /// Transient-error retries per segment.
    pub max_retries: u32,
    /// Base retry delay, seconds (exponential, capped at 30).
    pub retry_delay_s: f64,
    /// Per-request timeout, seconds.
    pub timeout_seconds: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            language: String::new(),
            prompt: String::new(),
            max_workers: 3,
            max_retries: 3,
            retry_delay_s: 2.0,
            timeout_seconds: 120,
        }
    }
}

/// Remote VAD service settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VadConfig {
    /// Silero-compatible service URL.
    pub service_url: String,
    /// Analysis window, seconds.
    pub window_s: f64,
    /// Overlap between adjacent windows, seconds.
    pub overlap_s: f64,
    /// Gaps below this merge adjacent segments, seconds.
    pub min_gap_s: f64,
    /// Segments below this are absorbed into a neighbor, seconds.
    pub min_duration_s: f64,
    /// Segments above max(this, 60) are split, seconds.
    pub max_duration_s: f64,
    /// Padding applied to each side of a speech region, milliseconds.
    pub pad_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            service_url: "http://127.0.0.1:8001/vad".to_string(),
            window_s: 25.0,
            overlap_s: 0.2,
            min_gap_s: 1.0,
            min_duration_s: 1.0,
            max_duration_s: 60.0,
            pad_ms: 500,
        }
    }
}

/// Subtitle quality-control gate settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QcConfig {
    /// Rule-score pass threshold when the LLM judge abstains.
    pub threshold: f64,
    /// Maximum sampled items for the LLM judge.
    pub sample_items: usize,
    /// Maximum sampled characters for the LLM judge.
    pub sample_chars: usize,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            threshold: 0.35,
            sample_items: 100,
            sample_chars: 12_000,
        }
    }
}

/// Video encoder backend.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncoderBackend {
    /// Software x264.
    Cpu,
    /// NVIDIA NVENC HEVC.
    Nvenc,
    /// Intel QuickSync HEVC.
    Qsv,
    /// AMD AMF HEVC.
    Amf,
}

impl EncoderBackend {
    /// Parse the config value, defaulting to CPU on unknown input.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "nvenc" => Self::Nvenc,
            "qsv" => Self::Qsv,
            "amf" => Self::Amf,
            _ => Self::Cpu,
        }
    }

    /// Config wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Nvenc => "nvenc",
            Self::Qsv => "qsv",
            Self::Amf => "amf",
        }
    }
}

/// Video encoder configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EncoderConfig {
    /// Selected backend; hardware backends fall back to CPU on failure.
    pub backend: EncoderBackend,
    /// Explicit ffmpeg path; empty uses the locator chain.
    pub ffmpeg_path: Option<String>,
    /// Default encode timeout, minutes.
    pub timeout_minutes: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend: EncoderBackend::Cpu,
            ffmpeg_path: None,
            timeout_minutes: 60,
        }
    }
}

/// Text moderation service settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModerationConfig {
    /// Service endpoint.
    pub endpoint: String,
    /// Access key id.
    pub access_key_id: Option<String>,
    /// Access key secret.
    pub access_key_secret: Option<String>,
    /// Provider service type parameter (e.g. "comment_detection").
    pub service_type: String,
}

/// Source downloader settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DownloaderConfig {
    /// Whether to route downloads through a proxy.
    pub proxy_enabled: bool,
    /// Proxy URL (http/socks), without credentials.
    pub proxy_url: String,
    /// Proxy username merged into the URL authority.
    pub proxy_username: String,
    /// Proxy password merged into the URL authority.
    pub proxy_password: String,
    /// Downloader fragment threads.
    pub download_threads: u32,
    /// Optional throttled-rate hint passed to the downloader.
    pub throttled_rate: String,
    /// Source-site cookie jar path relative to the app root.
    pub cookies_file: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            proxy_enabled: false,
            proxy_url: String::new(),
            proxy_username: String::new(),
            proxy_password: String::new(),
            download_threads: 4,
            throttled_rate: String::new(),
            cookies_file: "cookies/yt_cookies.txt".to_string(),
        }
    }
}

/// Sink platform credentials.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UploaderConfig {
    /// Account name for the form login.
    pub username: String,
    /// Account password for the form login.
    pub password: String,
    /// Sink-site cookie jar path relative to the app root.
    pub cookies_file: String,
    /// Cover fit mode: "crop" or "pad".
    pub cover_mode: String,
    /// Fixed category id that short-circuits classification.
    pub fixed_partition_id: Option<String>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            cookies_file: "cookies/ac_cookies.txt".to_string(),
            cover_mode: "crop".to_string(),
            fixed_partition_id: None,
        }
    }
}

/// Discovery catalog API settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MonitorApiConfig {
    /// Catalog API key.
    pub api_key: Option<String>,
    /// Catalog API base URL.
    pub base_url: String,
}

/// Log / download retention sweeps.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Enable the log retention sweep.
    pub log_cleanup_enabled: bool,
    /// Log retention, hours.
    pub log_retention_hours: u64,
    /// Log sweep interval, hours.
    pub log_interval_hours: u64,
    /// Enable the download retention sweep.
    pub download_cleanup_enabled: bool,
    /// Download retention, hours.
    pub download_retention_hours: u64,
    /// Download sweep interval, hours.
    pub download_interval_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            log_cleanup_enabled: false,
            log_retention_hours: 72,
            log_interval_hours: 6,
            download_cleanup_enabled: false,
            download_retention_hours: 48,
            download_interval_hours: 6,
        }
    }
}

/// Login gate tunables.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    /// Whether the boundary requires a login at all.
    pub login_required: bool,
    /// Failed attempts before lockout.
    pub max_failed_attempts: u32,
    /// Lockout duration, minutes.
    pub lockout_minutes: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            login_required: false,
            max_failed_attempts: 5,
            lockout_minutes: 15,
        }
    }
}

// ============================================================================
// Flat key/value mapping (legacy wire format)
// ============================================================================

impl Config {
    /// Build a typed snapshot from the flat key/value map.
    ///
    /// Missing keys take their defaults; booleans accept the legacy
    /// `true/false/on/off/yes/no/1/0` spellings.
    pub fn from_kv(map: &Map<String, Value>) -> Self {
        let d = Config::default();
        Config {
            features: FeatureFlags {
                auto_mode_enabled: kv_bool(map, "AUTO_MODE_ENABLED", d.features.auto_mode_enabled),
                translate_title: kv_bool(map, "TRANSLATE_TITLE", d.features.translate_title),
                translate_description: kv_bool(
                    map,
                    "TRANSLATE_DESCRIPTION",
                    d.features.translate_description,
                ),
                generate_tags: kv_bool(map, "GENERATE_TAGS", d.features.generate_tags),
                recommend_partition: kv_bool(
                    map,
                    "RECOMMEND_PARTITION",
                    d.features.recommend_partition,
                ),
                content_moderation_enabled: kv_bool(
                    map,
                    "CONTENT_MODERATION_ENABLED",
                    d.features.content_moderation_enabled,
                ),
                subtitle_translation_enabled: kv_bool(
                    map,
                    "SUBTITLE_TRANSLATION_ENABLED",
                    d.features.subtitle_translation_enabled,
                ),
                subtitle_embed_in_video: kv_bool(
                    map,
                    "SUBTITLE_EMBED_IN_VIDEO",
                    d.features.subtitle_embed_in_video,
                ),
                subtitle_keep_original: kv_bool(
                    map,
                    "SUBTITLE_KEEP_ORIGINAL",
                    d.features.subtitle_keep_original,
                ),
                speech_recognition_enabled: kv_bool(
                    map,
                    "SPEECH_RECOGNITION_ENABLED",
                    d.features.speech_recognition_enabled,
                ),
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_tasks: kv_u32(
                    map,
                    "MAX_CONCURRENT_TASKS",
                    d.concurrency.max_concurrent_tasks,
                ),
                max_concurrent_uploads: kv_u32(
                    map,
                    "MAX_CONCURRENT_UPLOADS",
                    d.concurrency.max_concurrent_uploads,
                ),
                subtitle_max_workers: kv_u32(
                    map,
                    "SUBTITLE_MAX_WORKERS",
                    d.concurrency.subtitle_max_workers,
                ),
                pending_scan_interval_seconds: kv_u64(
                    map,
                    "PENDING_SCAN_INTERVAL_SECONDS",
                    d.concurrency.pending_scan_interval_seconds,
                ),
            },
            llm: LlmConfig {
                base_url: kv_string(map, "OPENAI_BASE_URL", &d.llm.base_url),
                api_key: kv_opt_string(map, "OPENAI_API_KEY"),
                model: kv_string(map, "OPENAI_MODEL", &d.llm.model),
                temperature: kv_f64(map, "OPENAI_TEMPERATURE", d.llm.temperature as f64) as f32,
                target_language: kv_string(map, "TARGET_LANGUAGE", &d.llm.target_language),
                retry_attempts: kv_u32(map, "OPENAI_RETRY_ATTEMPTS", d.llm.retry_attempts),
                retry_delay_ms: kv_u64(map, "OPENAI_RETRY_DELAY_MS", d.llm.retry_delay_ms),
            },
            subtitle: SubtitleConfig {
                batch_size: kv_u32(map, "SUBTITLE_BATCH_SIZE", d.subtitle.batch_size as u32)
                    .max(1) as usize,
                max_retries: kv_u32(map, "SUBTITLE_MAX_RETRIES", d.subtitle.max_retries),
                retry_delay_s: kv_f64(map, "SUBTITLE_RETRY_DELAY", d.subtitle.retry_delay_s),
                base_url_override: kv_opt_string(map, "SUBTITLE_TRANSLATION_BASE_URL"),
                api_key_override: kv_opt_string(map, "SUBTITLE_TRANSLATION_API_KEY"),
                model_override: kv_opt_string(map, "SUBTITLE_TRANSLATION_MODEL"),
                max_chars_per_line: kv_u32(
                    map,
                    "SUBTITLE_MAX_CHARS_PER_LINE",
                    d.subtitle.max_chars_per_line as u32,
                ) as usize,
                max_lines_per_cue: kv_u32(
                    map,
                    "SUBTITLE_MAX_LINES_PER_CUE",
                    d.subtitle.max_lines_per_cue as u32,
                ) as usize,
                min_cue_duration_s: kv_f64(
                    map,
                    "SUBTITLE_MIN_CUE_DURATION",
                    d.subtitle.min_cue_duration_s,
                ),
                merge_gap_s: kv_f64(map, "SUBTITLE_MERGE_GAP", d.subtitle.merge_gap_s),
                min_text_length: kv_u32(
                    map,
                    "SUBTITLE_MIN_TEXT_LENGTH",
                    d.subtitle.min_text_length as u32,
                ) as usize,
                space_after_punctuation: kv_bool(
                    map,
                    "SUBTITLE_SPACE_AFTER_PUNCTUATION",
                    d.subtitle.space_after_punctuation,
                ),
            },
            asr: AsrConfig {
                base_url: kv_string(map, "ASR_BASE_URL", &d.asr.base_url),
                api_key: kv_opt_string(map, "ASR_API_KEY"),
                model: kv_string(map, "ASR_MODEL", &d.asr.model),
                language: kv_string(map, "ASR_LANGUAGE", &d.asr.language),
                prompt: kv_string(map, "ASR_PROMPT", &d.asr.prompt),
                max_workers: kv_u32(map, "ASR_MAX_WORKERS", d.asr.max_workers),
                max_retries: kv_u32(map, "ASR_MAX_RETRIES", d.asr.max_retries),
                retry_delay_s: kv_f64(map, "ASR_RETRY_DELAY", d.asr.retry_delay_s),
                timeout_seconds: kv_u64(map, "ASR_TIMEOUT_SECONDS", d.asr.timeout_seconds),
            },
            vad: VadConfig {
                service_url: kv_string(map, "VAD_SERVICE_URL", &d.vad.service_url),
                window_s: kv_f64(map, "VAD_WINDOW_SECONDS", d.vad.window_s),
                overlap_s: kv_f64(map, "VAD_OVERLAP_SECONDS", d.vad.overlap_s),
                min_gap_s: kv_f64(map, "VAD_MIN_GAP_SECONDS", d.vad.min_gap_s),
                min_duration_s: kv_f64(map, "VAD_MIN_DURATION_SECONDS", d.vad.min_duration_s),
                max_duration_s: kv_f64(map, "VAD_MAX_DURATION_SECONDS", d.vad.max_duration_s),
                pad_ms: kv_u64(map, "VAD_PAD_MS", d.vad.pad_ms),
            },
            qc: QcConfig {
                threshold: kv_f64(map, "SUBTITLE_QC_THRESHOLD", d.qc.threshold),
                sample_items: kv_u32(map, "SUBTITLE_QC_SAMPLE_ITEMS", d.qc.sample_items as u32)
                    as usize,
                sample_chars: kv_u32(map, "SUBTITLE_QC_SAMPLE_CHARS", d.qc.sample_chars as u32)
                    as usize,
            },
            encoder: EncoderConfig {
                backend: EncoderBackend::parse(&kv_string(map, "VIDEO_ENCODER", "cpu")),
                ffmpeg_path: kv_opt_string(map, "FFMPEG_PATH"),
                timeout_minutes: kv_u64(map, "ENCODE_TIMEOUT_MINUTES", d.encoder.timeout_minutes),
            },
            moderation: ModerationConfig {
                endpoint: kv_string(map, "MODERATION_ENDPOINT", &d.moderation.endpoint),
                access_key_id: kv_opt_string(map, "MODERATION_ACCESS_KEY_ID"),
                access_key_secret: kv_opt_string(map, "MODERATION_ACCESS_KEY_SECRET"),
                service_type: kv_string(map, "MODERATION_SERVICE_TYPE", "comment_detection"),
            },
            downloader: DownloaderConfig {
                proxy_enabled: kv_bool(map, "YOUTUBE_PROXY_ENABLED", d.downloader.proxy_enabled),
                proxy_url: kv_string(map, "YOUTUBE_PROXY_URL", &d.downloader.proxy_url),
                proxy_username: kv_string(
                    map,
                    "YOUTUBE_PROXY_USERNAME",
                    &d.downloader.proxy_username,
                ),
                proxy_password: kv_string(
                    map,
                    "YOUTUBE_PROXY_PASSWORD",
                    &d.downloader.proxy_password,
                ),
                download_threads: kv_u32(
                    map,
                    "YOUTUBE_DOWNLOAD_THREADS",
                    d.downloader.download_threads,
                ),
                throttled_rate: kv_string(
                    map,
                    "YOUTUBE_THROTTLED_RATE",
                    &d.downloader.throttled_rate,
                ),
                cookies_file: kv_string(map, "YOUTUBE_COOKIES_FILE", &d.downloader.cookies_file),
            },
            uploader: UploaderConfig {
                username: kv_string(map, "ACFUN_USERNAME", &d.uploader.username),
                password: kv_string(map, "ACFUN_PASSWORD", &d.uploader.password),
                cookies_file: kv_string(map, "ACFUN_COOKIES_FILE", &d.uploader.cookies_file),
                cover_mode: kv_string(map, "COVER_MODE", &d.uploader.cover_mode),
                fixed_partition_id: kv_opt_string(map, "FIXED_PARTITION_ID"),
            },
            monitor: MonitorApiConfig {
                api_key: kv_opt_string(map, "YOUTUBE_API_KEY"),
                base_url: kv_string(
                    map,
                    "YOUTUBE_API_BASE_URL",
                    "https://www.googleapis.com/youtube/v3",
                ),
            },
            retention: RetentionConfig {
                log_cleanup_enabled: kv_bool(
                    map,
                    "LOG_CLEANUP_ENABLED",
                    d.retention.log_cleanup_enabled,
                ),
                log_retention_hours: kv_u64(
                    map,
                    "LOG_RETENTION_HOURS",
                    d.retention.log_retention_hours,
                ),
                log_interval_hours: kv_u64(
                    map,
                    "LOG_CLEAN_INTERVAL_HOURS",
                    d.retention.log_interval_hours,
                ),
                download_cleanup_enabled: kv_bool(
                    map,
                    "DOWNLOAD_CLEANUP_ENABLED",
                    d.retention.download_cleanup_enabled,
                ),
                download_retention_hours: kv_u64(
                    map,
                    "DOWNLOAD_RETENTION_HOURS",
                    d.retention.download_retention_hours,
                ),
                download_interval_hours: kv_u64(
                    map,
                    "DOWNLOAD_CLEAN_INTERVAL_HOURS",
                    d.retention.download_interval_hours,
                ),
            },
            security: SecurityConfig {
                login_required: kv_bool(map, "LOGIN_REQUIRED", d.security.login_required),
                max_failed_attempts: kv_u32(
                    map,
                    "LOGIN_MAX_FAILED_ATTEMPTS",
                    d.security.max_failed_attempts,
                ),
                lockout_minutes: kv_u64(map, "LOGIN_LOCKOUT_MINUTES", d.security.lockout_minutes),
            },
        }
    }
}

fn kv_opt_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    let s = kv_string(map, key, "");
    if s.trim().is_empty() { None } else { Some(s) }
}

// ============================================================================
// Filesystem layout
// ============================================================================

/// App-root-relative on-disk layout.
///
/// Every component receives paths through this struct; nothing else decides
/// where files live.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Application root directory.
    pub root: PathBuf,
}

impl AppPaths {
    /// Create the layout anchored at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// `db/` directory.
    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    /// Task database file.
    pub fn tasks_db(&self) -> PathBuf {
        self.db_dir().join("tasks.db")
    }

    /// Discovery database file.
    pub fn monitor_db(&self) -> PathBuf {
        self.db_dir().join("youtube_monitor.db")
    }

    /// Login gate state file.
    pub fn security_state(&self) -> PathBuf {
        self.db_dir().join("security_state.json")
    }

    /// Downloads root.
    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    /// Working directory for one task.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.downloads_dir().join(task_id)
    }

    /// Logs directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Per-task trace file.
    pub fn task_log(&self, task_id: &str) -> PathBuf {
        self.logs_dir().join(format!("task_{}.log", task_id))
    }

    /// Cookies directory.
    pub fn cookies_dir(&self) -> PathBuf {
        self.root.join("cookies")
    }

    /// Key/value config file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config").join("config.json")
    }

    /// Category catalog file.
    pub fn category_catalog(&self) -> PathBuf {
        self.root.join("acfunid").join("id_mapping.json")
    }

    /// Bundled burn-in font.
    pub fn bundled_font(&self) -> PathBuf {
        self.root.join("fonts").join("SourceHanSansHWSC-VF.otf")
    }

    /// Resolve a config-relative path against the root.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kv(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.concurrency.max_concurrent_tasks, 3);
        assert_eq!(config.concurrency.max_concurrent_uploads, 1);
        assert_eq!(config.subtitle.batch_size, 3);
        assert!(config.features.subtitle_embed_in_video);
        assert!(config.features.subtitle_keep_original);
        assert!(!config.features.auto_mode_enabled);
        assert_eq!(config.encoder.backend, EncoderBackend::Cpu);
    }

    #[test]
    fn test_from_kv_flexible_booleans() {
        let map = kv(&[
            ("AUTO_MODE_ENABLED", json!("on")),
            ("TRANSLATE_TITLE", json!("0")),
            ("SUBTITLE_EMBED_IN_VIDEO", json!(false)),
            ("SPEECH_RECOGNITION_ENABLED", json!("Yes")),
        ]);
        let config = Config::from_kv(&map);
        assert!(config.features.auto_mode_enabled);
        assert!(!config.features.translate_title);
        assert!(!config.features.subtitle_embed_in_video);
        assert!(config.features.speech_recognition_enabled);
    }

    #[test]
    fn test_from_kv_numbers_accept_strings() {
        let map = kv(&[
            ("MAX_CONCURRENT_TASKS", json!("5")),
            ("PENDING_SCAN_INTERVAL_SECONDS", json!(2)),
            ("SUBTITLE_QC_THRESHOLD", json!("0.5")),
        ]);
        let config = Config::from_kv(&map);
        assert_eq!(config.concurrency.max_concurrent_tasks, 5);
        // Lower bound is applied by the accessor, not the parser.
        assert_eq!(config.concurrency.pending_scan_interval_seconds, 2);
        assert_eq!(config.concurrency.scan_interval_clamped(), 5);
        assert!((config.qc.threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_encoder_backend_parse() {
        assert_eq!(EncoderBackend::parse("nvenc"), EncoderBackend::Nvenc);
        assert_eq!(EncoderBackend::parse("QSV"), EncoderBackend::Qsv);
        assert_eq!(EncoderBackend::parse("bogus"), EncoderBackend::Cpu);
    }

    #[test]
    fn test_app_paths_layout() {
        let paths = AppPaths::new("/srv/retube");
        assert_eq!(
            paths.task_dir("abc").to_string_lossy(),
            "/srv/retube/downloads/abc"
        );
        assert_eq!(
            paths.task_log("abc").to_string_lossy(),
            "/srv/retube/logs/task_abc.log"
        );
        assert!(paths.resolve("/abs/path").is_absolute());
        assert_eq!(
            paths.resolve("cookies/yt_cookies.txt").to_string_lossy(),
            "/srv/retube/cookies/yt_cookies.txt"
        );
    }
}
