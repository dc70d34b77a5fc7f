//! Whisper-compatible ASR client with response-format degradation.
//!
//! The client prefers `verbose_json` and falls back to `srt`. When both
//! are rejected with a format-support error the batch is aborted with a
//! fatal "API incompatible" signal and never retried. The first format
//! that succeeds is cached process-wide; a later empty or format-error
//! response invalidates the cache and the full sequence is retried once.
//!
//! A FireRed-style `/v1/process_all` endpoint is also supported for
//! whole-file transcription.

use crate::config::AsrConfig;
use crate::core::subtitle::srt::format_timestamp;
use crate::{Result, error::RetubeError};
use log::{debug, info, warn};
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};

pub mod audio;

/// Supported response formats in order of preference.
const SUPPORTED_FORMATS: &[&str] = &["verbose_json", "srt"];

/// Back-off cap for transient retries.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Process-wide cache of the first response format that worked.
static FORMAT_CACHE: Mutex<Option<String>> = Mutex::new(None);

/// Reset the format cache (tests and config reloads).
pub fn refresh_format_cache() {
    *FORMAT_CACHE.lock().unwrap() = None;
}

/// One transcription segment job: the clip plus its global offset.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    /// Offset of the clip on the global timeline, seconds.
    pub offset_s: f64,
    /// Clip duration, seconds.
    pub duration_s: f64,
    /// Path of the 16 kHz mono WAV clip.
    pub wav_path: PathBuf,
}

/// Whisper-compatible transcription client.
pub struct AsrClient {
    client: Client,
    config: AsrConfig,
    language_hint: Mutex<Option<String>>,
}

impl AsrClient {
    /// Create a client from configuration.
    pub fn new(config: AsrConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(10)))
            .build()
            .map_err(|e| RetubeError::asr_api(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            config,
            language_hint: Mutex::new(None),
        })
    }

    /// Set the language hint used for subsequent calls.
    ///
    /// Empty and "unknown" hints are discarded.
    pub fn set_language_hint(&self, lang: &str) {
        let lang = lang.trim().to_lowercase();
        if lang.is_empty() || lang == "unknown" {
            return;
        }
        info!("ASR language hint set to '{}'", lang);
        *self.language_hint.lock().unwrap() = Some(lang);
    }

    fn effective_language(&self) -> Option<String> {
        self.language_hint
            .lock()
            .unwrap()
            .clone()
            .or_else(|| {
                let configured = self.config.language.trim();
                (!configured.is_empty()).then(|| configured.to_string())
            })
    }

    /// Transcribe one clip, returning SRT text on the clip-local timeline.
    ///
    /// Implements the degradation chain with caching and transient
    /// retries. `Ok(None)` means the API succeeded but heard nothing.
    pub async fn transcribe_segment(&self, job: &SegmentJob) -> Result<Option<String>> {
        let mut attempt = 0u32;
        loop {
            match self.transcribe_once(job).await {
                Ok(result) => return Ok(result),
                Err(e @ RetubeError::AsrIncompatible(_)) => return Err(e),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_secs_f64(
                        self.config.retry_delay_s * 2f64.powi(attempt as i32 - 1),
                    )
                    .min(MAX_BACKOFF);
                    warn!(
                        "ASR segment at {:.1}s failed ({}), retry {}/{} in {:?}",
                        job.offset_s, e, attempt, self.config.max_retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One pass of the format-degradation state machine.
    async fn transcribe_once(&self, job: &SegmentJob) -> Result<Option<String>> {
        let cached = FORMAT_CACHE.lock().unwrap().clone();
        let using_cache = cached.is_some();
        let formats: Vec<String> = match cached {
            Some(fmt) => vec![fmt],
            None => SUPPORTED_FORMATS.iter().map(|s| s.to_string()).collect(),
        };

        let mut format_errors = 0usize;
        let mut last_error: Option<RetubeError> = None;
        for fmt in &formats {
            match self.try_format(job, fmt).await {
                Ok(Some(srt)) => {
                    let mut cache = FORMAT_CACHE.lock().unwrap();
                    if cache.is_none() {
                        info!("ASR using '{}' response format", fmt);
                    }
                    *cache = Some(fmt.clone());
                    return Ok(Some(srt));
                }
                Ok(None) => {
                    if using_cache {
                        // The cached format silently stopped producing
                        // output; forget it and re-negotiate everything.
                        warn!("Cached ASR format '{}' returned empty, re-negotiating", fmt);
                        refresh_format_cache();
                        return Box::pin(self.transcribe_once(job)).await;
                    }
                    return Ok(None);
                }
                Err(e) => {
                    if is_format_error(&e) {
                        format_errors += 1;
                        debug!("Format '{}' rejected: {}", fmt, e);
                        if using_cache {
                            warn!("Cached ASR format '{}' no longer supported", fmt);
                            refresh_format_cache();
                            return Box::pin(self.transcribe_once(job)).await;
                        }
                    } else {
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }

        if format_errors == formats.len() && !using_cache {
            return Err(RetubeError::AsrIncompatible(
                "no supported response format (tried verbose_json, srt)".into(),
            ));
        }
        Err(last_error.unwrap_or_else(|| RetubeError::asr_api("transcription failed")))
    }

    /// Issue one request with a specific response format.
    async fn try_format(&self, job: &SegmentJob, fmt: &str) -> Result<Option<String>> {
        let file = File::open(&job.wav_path).await.map_err(|e| {
            RetubeError::audio_processing(format!("failed to open clip: {}", e))
        })?;
        let stream = FramedRead::new(file, BytesCodec::new());
        let body = reqwest::Body::wrap_stream(stream);
        let filename = job
            .wav_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.wav".to_string());

        let mut form = Form::new()
            .text("model", self.config.model.clone())
            .text("response_format", fmt.to_string())
            .part(
                "file",
                Part::stream(body).file_name(filename).mime_str("audio/wav")?,
            );
        if let Some(lang) = self.effective_language() {
            form = form.text("language", lang);
        }
        if !self.config.prompt.trim().is_empty() {
            form = form.text("prompt", self.config.prompt.clone());
        }

        let mut request = self
            .client
            .post(format!(
                "{}/audio/transcriptions",
                self.config.base_url.trim_end_matches('/')
            ))
            .multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let response = request
            .send()
            .await
            .map_err(|e| RetubeError::asr_api(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RetubeError::asr_api(format!(
                "API error {}: {}",
                status,
                text.chars().take(300).collect::<String>()
            )));
        }

        if fmt == "srt" {
            let text = response.text().await?;
            let trimmed = text.trim();
            return Ok((!trimmed.is_empty()).then(|| trimmed.to_string()));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| RetubeError::asr_api(format!("verbose_json unparseable: {}", e)))?;
        Ok(verbose_json_to_srt(&value, job.duration_s))
    }

    /// Probe the language of one clip via a verbose_json request.
    pub async fn probe_language(&self, job: &SegmentJob) -> Result<Option<String>> {
        let file = File::open(&job.wav_path).await.map_err(|e| {
            RetubeError::audio_processing(format!("failed to open clip: {}", e))
        })?;
        let stream = FramedRead::new(file, BytesCodec::new());
        let form = Form::new()
            .text("model", self.config.model.clone())
            .text("response_format", "verbose_json")
            .part(
                "file",
                Part::stream(reqwest::Body::wrap_stream(stream))
                    .file_name("probe.wav")
                    .mime_str("audio/wav")?,
            );
        let mut request = self
            .client
            .post(format!(
                "{}/audio/transcriptions",
                self.config.base_url.trim_end_matches('/')
            ))
            .multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let value: Value = match response.json().await {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        Ok(value["language"]
            .as_str()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty() && s != "unknown"))
    }

    /// Detect the clip language by probing the first and last segments;
    /// the result is adopted only when both probes agree.
    pub async fn detect_language(&self, first: &SegmentJob, last: &SegmentJob) -> Option<String> {
        let head = self.probe_language(first).await.ok().flatten();
        let tail = self.probe_language(last).await.ok().flatten();
        match (head, tail) {
            (Some(a), Some(b)) if a == b => {
                info!("Language probes agree on '{}'", a);
                Some(a)
            }
            (a, b) => {
                debug!("Language probes disagree ({:?} vs {:?}), keeping auto", a, b);
                None
            }
        }
    }

    /// Whole-file transcription through the FireRed-style endpoint.
    pub async fn transcribe_process_all(&self, wav_path: &Path) -> Result<Option<String>> {
        let file = File::open(wav_path).await.map_err(|e| {
            RetubeError::audio_processing(format!("failed to open audio: {}", e))
        })?;
        let stream = FramedRead::new(file, BytesCodec::new());
        let form = Form::new().part(
            "file",
            Part::stream(reqwest::Body::wrap_stream(stream))
                .file_name("audio.wav")
                .mime_str("audio/wav")?,
        );
        let mut request = self
            .client
            .post(format!(
                "{}/v1/process_all",
                self.config.base_url.trim_end_matches('/')
            ))
            .multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(RetubeError::asr_api(format!("process_all returned {}", status)));
        }
        let value: Value = response.json().await.map_err(|e| {
            RetubeError::asr_api(format!("process_all response unparseable: {}", e))
        })?;
        let srt = value["srt"]
            .as_str()
            .or_else(|| value["result"].as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(srt)
    }

    /// Transcribe many segments on a fixed worker pool.
    ///
    /// Returns `(offset, Some(srt)|None)` per job, in input order. When
    /// failures exceed `max(5, total/2)` the remaining jobs are cancelled
    /// and the batch fails; an `AsrIncompatible` error aborts immediately.
    pub async fn transcribe_segments_concurrent(
        self: Arc<Self>,
        jobs: Vec<SegmentJob>,
    ) -> Result<Vec<(f64, Option<String>)>> {
        let total = jobs.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let workers = (self.config.max_workers.max(1)) as usize;
        let failure_cap = 5usize.max(total / 2);
        info!(
            "Transcribing {} segments with {} workers (failure cap {})",
            total, workers, failure_cap
        );

        let semaphore = Arc::new(tokio::sync::Semaphore::new(workers));
        let failures = Arc::new(AtomicUsize::new(0));
        let incompatible = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(total);
        for (index, job) in jobs.into_iter().enumerate() {
            let client = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let failures = Arc::clone(&failures);
            let incompatible = Arc::clone(&incompatible);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if failures.load(Ordering::SeqCst) > failure_cap
                    || incompatible.load(Ordering::SeqCst) > 0
                {
                    // Batch already doomed; skip without burning the API.
                    return None;
                }
                match client.transcribe_segment(&job).await {
                    Ok(srt) => Some((index, job.offset_s, srt)),
                    Err(RetubeError::AsrIncompatible(msg)) => {
                        warn!("ASR incompatible: {}", msg);
                        incompatible.store(1, Ordering::SeqCst);
                        None
                    }
                    Err(e) => {
                        warn!("Segment at {:.1}s failed permanently: {}", job.offset_s, e);
                        failures.fetch_add(1, Ordering::SeqCst);
                        Some((index, job.offset_s, None))
                    }
                }
            }));
        }

        let mut results: Vec<(usize, f64, Option<String>)> = Vec::new();
        for handle in handles {
            if let Ok(Some(result)) = handle.await {
                results.push(result);
            }
        }
        if incompatible.load(Ordering::SeqCst) > 0 {
            return Err(RetubeError::AsrIncompatible(
                "no supported response format (tried verbose_json, srt)".into(),
            ));
        }
        let failed = failures.load(Ordering::SeqCst);
        if failed > failure_cap {
            return Err(RetubeError::asr_api(format!(
                "{}/{} segments failed, batch abandoned",
                failed, total
            )));
        }
        results.sort_by_key(|(index, _, _)| *index);
        Ok(results
            .into_iter()
            .map(|(_, offset, srt)| (offset, srt))
            .collect())
    }
}

/// Whether an error text indicates the response format is unsupported.
fn is_format_error(error: &RetubeError) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("response_format")
        || text.contains("invalid response format")
        || text.contains("unsupported format")
        || (text.contains("format") && (text.contains("not supported") || text.contains("invalid")))
}

/// Convert a verbose_json response to clip-local SRT.
///
/// Servers disagree about timestamp units; given the clip's known
/// duration, the multiplier in {1, 0.001, 0.01} whose scaled max-end
/// lands inside `[0.5·d, 1.5·d]` wins, closest otherwise. Only non-empty
/// segments get cue numbers; a flat-text-only response becomes one cue
/// spanning the clip.
pub fn verbose_json_to_srt(value: &Value, clip_duration_s: f64) -> Option<String> {
    let segments = value["segments"].as_array();
    let Some(segments) = segments.filter(|s| !s.is_empty()) else {
        let text = value["text"].as_str().map(str::trim).unwrap_or("");
        if text.is_empty() {
            return None;
        }
        let duration = value["duration"]
            .as_f64()
            .filter(|d| *d > 0.0)
            .or(Some(clip_duration_s).filter(|d| *d > 0.0))
            .unwrap_or(1.0);
        return Some(format!(
            "1\n00:00:00,000 --> {}\n{}\n",
            format_timestamp(duration),
            text
        ));
    };

    let scale = infer_timestamp_scale(segments, clip_duration_s);
    if (scale - 1.0).abs() > f64::EPSILON {
        debug!("ASR timestamps scaled by {} to match clip duration", scale);
    }

    let mut lines: Vec<String> = Vec::new();
    let mut cue_number = 1usize;
    for seg in segments {
        let text = seg["text"].as_str().map(str::trim).unwrap_or("");
        if text.is_empty() {
            continue;
        }
        let start = seg["start"].as_f64().unwrap_or(0.0) * scale;
        let end = seg["end"].as_f64().unwrap_or(0.0) * scale;
        lines.push(cue_number.to_string());
        lines.push(format!(
            "{} --> {}",
            format_timestamp(start),
            format_timestamp(end)
        ));
        lines.push(text.to_string());
        lines.push(String::new());
        cue_number += 1;
    }
    if cue_number == 1 {
        return None;
    }
    Some(format!("{}\n", lines.join("\n").trim_end()))
}

/// Pick the timestamp multiplier that best matches the known duration.
fn infer_timestamp_scale(segments: &[Value], clip_duration_s: f64) -> f64 {
    if clip_duration_s <= 0.0 {
        return 1.0;
    }
    let max_end = segments
        .iter()
        .filter_map(|seg| seg["end"].as_f64())
        .fold(0.0f64, f64::max);
    if max_end <= 0.0 {
        return 1.0;
    }
    const CANDIDATES: [f64; 3] = [1.0, 0.001, 0.01];
    for scale in CANDIDATES {
        let scaled = max_end * scale;
        if scaled >= 0.5 * clip_duration_s && scaled <= 1.5 * clip_duration_s {
            return scale;
        }
    }
    // Nothing landed in the window; take the closest.
    CANDIDATES
        .into_iter()
        .min_by(|a, b| {
            let da = (max_end * a - clip_duration_s).abs();
            let db = (max_end * b - clip_duration_s).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // The format cache is process-global; tests touching it serialize
    // through this lock.
    static CACHE_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_scale_inference_seconds() {
        let segments = json!([{"start": 0.0, "end": 24.0, "text": "a"}]);
        assert_eq!(infer_timestamp_scale(segments.as_array().unwrap(), 25.0), 1.0);
    }

    #[test]
    fn test_scale_inference_milliseconds() {
        let segments = json!([{"start": 0.0, "end": 24000.0, "text": "a"}]);
        assert_eq!(
            infer_timestamp_scale(segments.as_array().unwrap(), 25.0),
            0.001
        );
    }

    #[test]
    fn test_scale_inference_centiseconds() {
        let segments = json!([{"start": 0.0, "end": 2400.0, "text": "a"}]);
        assert_eq!(
            infer_timestamp_scale(segments.as_array().unwrap(), 25.0),
            0.01
        );
    }

    #[test]
    fn test_verbose_json_to_srt_basic() {
        let value = json!({
            "segments": [
                {"start": 0.0, "end": 2.0, "text": " hello "},
                {"start": 2.0, "end": 3.0, "text": ""},
                {"start": 3.0, "end": 5.0, "text": "world"}
            ]
        });
        let srt = verbose_json_to_srt(&value, 10.0).unwrap();
        // Empty segments are skipped and numbering stays sequential.
        assert!(srt.contains("1\n00:00:00,000 --> 00:00:02,000\nhello"));
        assert!(srt.contains("2\n00:00:03,000 --> 00:00:05,000\nworld"));
        assert!(!srt.contains("3\n"));
    }

    #[test]
    fn test_verbose_json_flat_text_fallback() {
        let value = json!({"text": "just words"});
        let srt = verbose_json_to_srt(&value, 7.5).unwrap();
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:07,500\njust words"));
        assert!(verbose_json_to_srt(&json!({"text": "  "}), 5.0).is_none());
    }

    #[test]
    fn test_is_format_error_detection() {
        assert!(is_format_error(&RetubeError::asr_api(
            "API error 400: response_format srt is not allowed"
        )));
        assert!(is_format_error(&RetubeError::asr_api(
            "API error 400: format verbose_json not supported"
        )));
        assert!(!is_format_error(&RetubeError::asr_api(
            "API error 500: internal server error"
        )));
    }

    #[tokio::test]
    async fn test_transcribe_segment_degrades_to_srt() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, Request, ResponseTemplate};
        let _guard = CACHE_TEST_LOCK.lock().unwrap();
        refresh_format_cache();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .respond_with(move |req: &Request| {
                let body = String::from_utf8_lossy(&req.body);
                if body.contains("verbose_json") {
                    ResponseTemplate::new(400)
                        .set_body_string("response_format verbose_json not supported")
                } else {
                    ResponseTemplate::new(200)
                        .set_body_string("1\n00:00:00,000 --> 00:00:01,000\nhi\n")
                }
            })
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let wav = dir.path().join("clip.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&wav, spec).unwrap();
        for _ in 0..1600 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let client = AsrClient::new(AsrConfig {
            base_url: server.uri(),
            max_retries: 0,
            ..Default::default()
        })
        .unwrap();
        let job = SegmentJob {
            offset_s: 0.0,
            duration_s: 1.0,
            wav_path: wav,
        };
        let srt = client.transcribe_segment(&job).await.unwrap().unwrap();
        assert!(srt.contains("hi"));
        // The working format is cached for subsequent calls.
        assert_eq!(FORMAT_CACHE.lock().unwrap().as_deref(), Some("srt"));
        refresh_format_cache();
    }

    #[tokio::test]
    async fn test_both_formats_rejected_is_fatal() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};
        let _guard = CACHE_TEST_LOCK.lock().unwrap();
        refresh_format_cache();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string("response_format not supported"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let wav = dir.path().join("clip.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&wav, spec).unwrap();
        for _ in 0..1600 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let client = AsrClient::new(AsrConfig {
            base_url: server.uri(),
            max_retries: 3,
            ..Default::default()
        })
        .unwrap();
        let job = SegmentJob {
            offset_s: 0.0,
            duration_s: 1.0,
            wav_path: wav,
        };
        // Fatal on the first pass despite max_retries.
        let err = client.transcribe_segment(&job).await.unwrap_err();
        assert!(matches!(err, RetubeError::AsrIncompatible(_)));
        refresh_format_cache();
    }

    #[test]
    fn test_language_hint_discards_unknown() {
        let client = AsrClient::new(AsrConfig::default()).unwrap();
        client.set_language_hint("unknown");
        assert!(client.language_hint.lock().unwrap().is_none());
        client.set_language_hint("  ");
        assert!(client.language_hint.lock().unwrap().is_none());
        client.set_language_hint("En");
        assert_eq!(client.language_hint.lock().unwrap().as_deref(), Some("en"));
    }
}
