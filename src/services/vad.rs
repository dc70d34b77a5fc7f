//! Broad, high-recall voice activity detection.
//!
//! Produces search windows for the ASR stage, not subtitle cues. Audio is
//! decoded to 16 kHz mono PCM by ffmpeg; the float32 samples go to a
//! remote Silero-compatible JSON service. Long audio is processed in
//! overlapping windows with per-chunk results shifted to the global
//! timeline, then post-processed with deliberately lenient constraints:
//! generous padding, aggressive merging, and hard splits only for
//! extremely long regions.
//!
//! The remote client is a process singleton behind a mutex; `refresh`
//! replaces it (used by tests and config reloads).

use crate::config::VadConfig;
use crate::services::asr::audio;
use crate::{Result, error::RetubeError};
use log::{debug, info, warn};
use reqwest::Client;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

static SHARED_CLIENT: Mutex<Option<Arc<VadClient>>> = Mutex::new(None);

/// One detected speech region on the global timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechWindow {
    pub start_s: f64,
    pub end_s: f64,
}

impl SpeechWindow {
    pub fn duration(&self) -> f64 {
        self.end_s - self.start_s
    }
}

/// HTTP client for the remote VAD service.
pub struct VadClient {
    client: Client,
    service_url: String,
}

impl VadClient {
    fn new(service_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| RetubeError::vad_api(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            service_url,
        })
    }

    /// Shared per-process instance.
    pub fn shared(config: &VadConfig) -> Result<Arc<Self>> {
        let mut guard = SHARED_CLIENT.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            if existing.service_url == config.service_url {
                return Ok(Arc::clone(existing));
            }
        }
        let fresh = Arc::new(Self::new(config.service_url.clone())?);
        *guard = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Drop the shared instance; the next call rebuilds it.
    pub fn refresh() {
        *SHARED_CLIENT.lock().unwrap() = None;
    }

    /// Detect speech in one clip of float32 samples.
    ///
    /// Timestamps in the reply are relative to the submitted clip.
    async fn detect(&self, samples: &[f32], config: &VadConfig) -> Result<Vec<SpeechWindow>> {
        let body = json!({
            "samples": samples,
            "sample_rate": audio::SPEECH_SAMPLE_RATE,
            "speech_pad_ms": config.pad_ms,
            "return_seconds": true,
        });
        let response = self
            .client
            .post(&self.service_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RetubeError::vad_api(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(RetubeError::vad_api(format!("service returned {}", status)));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| RetubeError::vad_api(format!("response unparseable: {}", e)))?;
        let segments = value["segments"]
            .as_array()
            .or_else(|| value["timestamps"].as_array())
            .or_else(|| value.as_array())
            .ok_or_else(|| RetubeError::vad_api("no segments array in response"))?;
        Ok(segments
            .iter()
            .filter_map(|seg| {
                let start = seg["start"].as_f64()?;
                let end = seg["end"].as_f64()?;
                (end > start).then_some(SpeechWindow {
                    start_s: start,
                    end_s: end,
                })
            })
            .collect())
    }
}

/// VAD pipeline over one media file.
pub struct VadProcessor {
    config: VadConfig,
    client: Arc<VadClient>,
}

impl VadProcessor {
    /// Create a processor sharing the process-wide client.
    pub fn new(config: VadConfig) -> Result<Self> {
        let client = VadClient::shared(&config)?;
        Ok(Self { config, client })
    }

    /// Detect speech windows across a full media file.
    ///
    /// The audio track is decoded once into a temp dir; clips for each
    /// analysis window are cut from that WAV. Three consecutive chunk
    /// failures abort the run.
    pub async fn detect_speech_windows(
        &self,
        ffmpeg: &Path,
        media: &Path,
        total_duration_s: f64,
    ) -> Result<Vec<SpeechWindow>> {
        let temp = TempDir::new()?;
        let wav = temp.path().join("speech.wav");
        audio::extract_speech_wav(ffmpeg, media, &wav).await?;
        let wav_duration = audio::wav_duration_seconds(&wav)?;
        let duration = if wav_duration > 0.0 {
            wav_duration
        } else {
            total_duration_s
        };
        if duration < 0.5 {
            warn!("Audio too short ({:.3}s) for VAD", duration);
            return Ok(Vec::new());
        }

        let windows = self.analysis_windows(duration);
        info!(
            "VAD: {:.1}s audio, {} window(s) of {:.0}s with {:.1}s overlap",
            duration,
            windows.len(),
            self.config.window_s,
            self.config.overlap_s
        );

        let mut raw: Vec<SpeechWindow> = Vec::new();
        let mut consecutive_failures = 0u32;
        for (i, (win_start, win_end)) in windows.iter().enumerate() {
            let clip = temp.path().join(format!("clip_{}.wav", i));
            let clip = match audio::cut_wav_clip(ffmpeg, &wav, *win_start, win_end - win_start, &clip)
                .await?
            {
                Some(path) => path,
                None => continue,
            };
            let (samples, _) = audio::read_wav_f32(&clip)?;
            match self.client.detect(&samples, &self.config).await {
                Ok(segments) => {
                    consecutive_failures = 0;
                    raw.extend(segments.iter().map(|s| SpeechWindow {
                        start_s: s.start_s + win_start,
                        end_s: s.end_s + win_start,
                    }));
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!("VAD chunk {} failed ({}/3): {}", i, consecutive_failures, e);
                    if consecutive_failures >= 3 {
                        return Err(RetubeError::vad_api(
                            "VAD failed on 3 consecutive chunks, aborting",
                        ));
                    }
                }
            }
        }
        if raw.is_empty() {
            debug!("VAD detected no speech");
            return Ok(Vec::new());
        }
        Ok(apply_constraints(raw, &self.config, duration))
    }

    /// Overlapping analysis windows covering the clip.
    fn analysis_windows(&self, total_duration_s: f64) -> Vec<(f64, f64)> {
        let window = self.config.window_s.max(1.0);
        let overlap = self.config.overlap_s.max(0.0).min(window / 2.0);
        if total_duration_s <= window {
            return vec![(0.0, total_duration_s)];
        }
        let mut windows = Vec::new();
        let mut current = 0.0;
        while current < total_duration_s {
            let end = (current + window).min(total_duration_s);
            windows.push((current, end));
            if end >= total_duration_s {
                break;
            }
            current = end - overlap;
        }
        windows
    }
}

/// Lenient post-processing: pad, merge, absorb, split.
///
/// Padding happens first so the merges below see the padded regions; the
/// recall bias is intentional since these windows only bound where the
/// ASR will look.
fn apply_constraints(
    mut segments: Vec<SpeechWindow>,
    config: &VadConfig,
    total_duration_s: f64,
) -> Vec<SpeechWindow> {
    let raw_count = segments.len();
    let pad = (config.pad_ms.max(500)) as f64 / 1000.0;
    for seg in &mut segments {
        seg.start_s = (seg.start_s - pad).max(0.0);
        seg.end_s = (seg.end_s + pad).min(total_duration_s);
    }
    segments.sort_by(|a, b| {
        a.start_s
            .partial_cmp(&b.start_s)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Merge gaps below the threshold.
    let mut merged: Vec<SpeechWindow> = Vec::new();
    for seg in segments {
        match merged.last_mut() {
            Some(last) if seg.start_s - last.end_s < config.min_gap_s => {
                last.end_s = last.end_s.max(seg.end_s);
            }
            _ => merged.push(seg),
        }
    }

    // Absorb too-short segments into a neighbor rather than dropping them.
    let min_dur = config.min_duration_s;
    let mut filtered: Vec<SpeechWindow> = Vec::new();
    let mut i = 0;
    while i < merged.len() {
        let seg = merged[i];
        if seg.duration() < min_dur {
            if let Some(last) = filtered.last_mut() {
                last.end_s = last.end_s.max(seg.end_s);
            } else if i + 1 < merged.len() {
                merged[i + 1].start_s = seg.start_s;
            } else {
                filtered.push(seg);
            }
        } else {
            filtered.push(seg);
        }
        i += 1;
    }

    // Hard-split anything beyond the cap.
    let max_dur = config.max_duration_s.max(60.0);
    let mut final_segments = Vec::new();
    for seg in filtered {
        if seg.duration() > max_dur {
            info!("Force-splitting {:.1}s segment at {:.0}s boundaries", seg.duration(), max_dur);
            let mut t = seg.start_s;
            while t < seg.end_s {
                let end = (t + max_dur).min(seg.end_s);
                final_segments.push(SpeechWindow {
                    start_s: t,
                    end_s: end,
                });
                t = end;
            }
        } else {
            final_segments.push(seg);
        }
    }
    debug!(
        "VAD constraints: {} raw -> {} final",
        raw_count,
        final_segments.len()
    );
    final_segments
}
