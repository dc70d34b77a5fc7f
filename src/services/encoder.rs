//! Subtitle burn-in via ffmpeg.
//!
//! The encode runs inside a private temp directory with the video and
//! subtitle copied under short names; the `subtitles` filter has
//! path-escaping quirks (drive letters, colons) that relative names
//! sidestep entirely. Progress comes from the `-progress pipe:1` side
//! band, with stdout and stderr drained on separate tasks so neither
//! pipe can fill and deadlock the encoder. A hardware-backend failure
//! falls back to one CPU attempt.

use crate::config::{EncoderBackend, EncoderConfig};
use crate::core::subtitle::vtt;
use crate::services::ffmpeg::{self, MediaInfo};
use crate::{Result, error::RetubeError};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Fallback CJK families when the bundled font is unavailable.
const FONT_FALLBACKS: &[&str] = &[
    "Source Han Sans HW SC",
    "Noto Sans CJK SC",
    "Microsoft YaHei",
    "SimHei",
    "WenQuanYi Micro Hei",
];

/// Error fragments that identify a hardware-encoder failure worth a CPU
/// retry.
const HW_FAILURE_HINTS: &[&str] = &[
    "Cannot load nvcuda",
    "No NVENC capable devices",
    "Failed to initialise",
    "Error initializing output stream",
    "device creation failed",
    "No device available",
    "Error while opening encoder",
    "InitializeEncoder failed",
];

/// Progress callback: percent in 0-100.
pub type EncodeProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// Subtitle burn-in encoder.
pub struct VideoEncoder {
    config: EncoderConfig,
    /// Directory holding the bundled burn-in font, if present.
    font_dir: Option<PathBuf>,
}

impl VideoEncoder {
    /// Create an encoder; `font_path` points at the bundled font file.
    pub fn new(config: EncoderConfig, font_path: &Path) -> Self {
        let font_dir = font_path
            .exists()
            .then(|| font_path.parent().map(Path::to_path_buf))
            .flatten();
        Self { config, font_dir }
    }

    /// Burn `subtitle` into `video`, writing `output`.
    ///
    /// The subtitle may be VTT; it is converted to SRT locally first.
    /// Returns the output path on success.
    pub async fn burn_subtitles(
        &self,
        video: &Path,
        subtitle: &Path,
        output: &Path,
        on_progress: Option<EncodeProgressFn>,
    ) -> Result<PathBuf> {
        let ffmpeg_bin = ffmpeg::find_ffmpeg(self.config.ffmpeg_path.as_deref()).await?;
        let ffprobe_bin = ffmpeg::find_ffprobe(self.config.ffmpeg_path.as_deref()).await?;
        let media = ffmpeg::probe_media(&ffprobe_bin, video).await?;
        if media.duration_s <= 0.0 {
            return Err(RetubeError::encode("source video has no measurable duration"));
        }

        let backend = self.resolve_backend(&ffmpeg_bin).await;
        match self
            .encode_once(&ffmpeg_bin, video, subtitle, output, &media, backend, &on_progress)
            .await
        {
            Ok(path) => Ok(path),
            Err(e) if backend != EncoderBackend::Cpu && is_hw_failure(&e) => {
                warn!("{} encode failed ({}), retrying on CPU", backend.as_str(), e);
                self.encode_once(
                    &ffmpeg_bin,
                    video,
                    subtitle,
                    output,
                    &media,
                    EncoderBackend::Cpu,
                    &on_progress,
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// Drop to CPU upfront when the configured hardware encoder is not in
    /// ffmpeg's encoder list.
    async fn resolve_backend(&self, ffmpeg_bin: &Path) -> EncoderBackend {
        let wanted = self.config.backend;
        if wanted == EncoderBackend::Cpu {
            return wanted;
        }
        let encoder_name = match wanted {
            EncoderBackend::Nvenc => "hevc_nvenc",
            EncoderBackend::Qsv => "hevc_qsv",
            EncoderBackend::Amf => "hevc_amf",
            EncoderBackend::Cpu => unreachable!(),
        };
        match ffmpeg::list_encoders(ffmpeg_bin).await {
            Ok(encoders) if encoders.iter().any(|e| e == encoder_name) => wanted,
            Ok(_) => {
                warn!("{} not available in this ffmpeg build, using CPU", encoder_name);
                EncoderBackend::Cpu
            }
            Err(e) => {
                warn!("Encoder probe failed ({}), using CPU", e);
                EncoderBackend::Cpu
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn encode_once(
        &self,
        ffmpeg_bin: &Path,
        video: &Path,
        subtitle: &Path,
        output: &Path,
        media: &MediaInfo,
        backend: EncoderBackend,
        on_progress: &Option<EncodeProgressFn>,
    ) -> Result<PathBuf> {
        // Private working directory; removed on every exit path by Drop.
        let workdir = TempDir::new()?;
        let video_ext = video
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let local_video = workdir.path().join(format!("input.{}", video_ext));
        std::fs::copy(video, &local_video)?;

        let local_srt = workdir.path().join("subs.srt");
        if subtitle.extension().and_then(|e| e.to_str()) == Some("vtt") {
            let content = crate::core::subtitle::read_subtitle_file(subtitle)?;
            let srt_text = vtt::vtt_to_srt(&content)
                .ok_or_else(|| RetubeError::encode("VTT subtitle converted to zero cues"))?;
            std::fs::write(&local_srt, srt_text)?;
        } else {
            std::fs::copy(subtitle, &local_srt)?;
        }

        let filter = self.subtitles_filter();
        let gop = (media.fps.unwrap_or(24.0) * 2.0).round().max(24.0) as u32;
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            format!("input.{}", video_ext),
            "-vf".into(),
            filter,
            "-g".into(),
            gop.to_string(),
        ];
        args.extend(encoder_args(backend, media.is_10bit()));
        args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "320k".into()]);
        if let Some(rate) = media.audio_sample_rate {
            args.extend(["-ar".into(), rate.to_string()]);
        }
        args.extend([
            "-progress".into(),
            "pipe:1".into(),
            "-nostats".into(),
            "out.mp4".into(),
        ]);

        info!(
            "Burn-in with {} ({}), GOP {}, timeout {:?}",
            backend.as_str(),
            if media.is_10bit() { "10-bit" } else { "8-bit" },
            gop,
            self.encode_timeout(media.duration_s)
        );
        debug!("ffmpeg args: {:?}", args);

        let mut child = Command::new(ffmpeg_bin)
            .args(&args)
            .current_dir(workdir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RetubeError::encode("ffmpeg stdout unavailable"))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tail.push(line);
                    if tail.len() > 40 {
                        tail.remove(0);
                    }
                }
            }
            tail.join("\n")
        });

        let total_duration = media.duration_s;
        let callback = on_progress.as_deref();
        let progress_task = {
            let mut lines = BufReader::new(stdout).lines();
            async move {
                let mut percent = 0.0f64;
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(value) = line.strip_prefix("out_time_us=") {
                        if let Ok(us) = value.trim().parse::<f64>() {
                            percent = (us / 1_000_000.0 / total_duration * 100.0).clamp(0.0, 100.0);
                            if let Some(cb) = callback {
                                cb(percent);
                            }
                        }
                    }
                }
                percent
            }
        };

        let timeout = self.encode_timeout(media.duration_s);
        let wait = async {
            // Progress parsing and child exit race together; the pipe
            // closes when ffmpeg exits, so join order is safe.
            let (progress, status) = tokio::join!(progress_task, child.wait());
            (progress, status)
        };

        let (final_percent, status) = match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                terminate_child(&mut child).await;
                return Err(RetubeError::encode(format!(
                    "encode timed out after {:?}",
                    timeout
                )));
            }
        };
        let status = status?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(RetubeError::encode(format!(
                "ffmpeg exited with {} at {:.0}%: {}",
                status,
                final_percent,
                stderr_tail.lines().last().unwrap_or("")
            )));
        }

        let produced = workdir.path().join("out.mp4");
        if !produced.exists() {
            return Err(RetubeError::encode("ffmpeg succeeded but produced no output"));
        }
        std::fs::copy(&produced, output)?;
        info!("Burn-in complete: {:?}", output);
        Ok(output.to_path_buf())
    }

    /// The `subtitles` filter line with font configuration.
    fn subtitles_filter(&self) -> String {
        let family = FONT_FALLBACKS[0];
        match &self.font_dir {
            Some(dir) => format!(
                "subtitles=subs.srt:fontsdir='{}':force_style='FontName={}'",
                dir.display(),
                family
            ),
            None => format!("subtitles=subs.srt:force_style='FontName={}'", family),
        }
    }

    /// Timeout scaled with source duration.
    ///
    /// `min(max(30 min, 3 x duration capped at 3 h), configured default)`.
    fn encode_timeout(&self, duration_s: f64) -> Duration {
        let three_x = Duration::from_secs_f64((duration_s * 3.0).min(3.0 * 3600.0));
        let floor = Duration::from_secs(30 * 60);
        let candidate = three_x.max(floor);
        let configured = Duration::from_secs(self.config.timeout_minutes.max(1) * 60);
        candidate.min(configured)
    }
}

/// Per-backend video-codec arguments.
fn encoder_args(backend: EncoderBackend, is_10bit: bool) -> Vec<String> {
    let args: &[&str] = match (backend, is_10bit) {
        (EncoderBackend::Cpu, _) => &[
            "-c:v", "libx264", "-crf", "18", "-preset", "slow", "-profile:v", "high",
            "-level", "4.2",
        ],
        (EncoderBackend::Nvenc, false) => &[
            "-c:v", "hevc_nvenc", "-preset", "p6", "-cq", "20", "-rc-lookahead", "32",
        ],
        (EncoderBackend::Nvenc, true) => &[
            "-c:v", "hevc_nvenc", "-preset", "p6", "-cq", "20", "-rc-lookahead", "32",
            "-profile:v", "main10", "-pix_fmt", "p010le",
        ],
        (EncoderBackend::Qsv, false) => &[
            "-c:v", "hevc_qsv", "-preset", "slow", "-global_quality", "20",
        ],
        (EncoderBackend::Qsv, true) => &[
            "-c:v", "hevc_qsv", "-preset", "slow", "-global_quality", "20",
            "-profile:v", "main10", "-pix_fmt", "p010le",
        ],
        (EncoderBackend::Amf, false) => &[
            "-c:v", "hevc_amf", "-quality", "quality", "-rc", "cqp", "-qp_i", "20",
            "-qp_p", "20",
        ],
        (EncoderBackend::Amf, true) => &[
            "-c:v", "hevc_amf", "-quality", "quality", "-rc", "cqp", "-qp_i", "20",
            "-qp_p", "20", "-profile:v", "main10", "-pix_fmt", "p010le",
        ],
    };
    args.iter().map(|s| s.to_string()).collect()
}

/// Whether an encode error looks like a hardware-backend failure.
fn is_hw_failure(error: &RetubeError) -> bool {
    let text = error.to_string();
    HW_FAILURE_HINTS.iter().any(|hint| text.contains(hint))
        || matches!(error, RetubeError::Encode(msg) if msg.contains("exited with"))
}

/// SIGTERM, five seconds of grace, then SIGKILL.
async fn terminate_child(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_args_cpu() {
        let args = encoder_args(EncoderBackend::Cpu, false);
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"18".to_string()));
        // 10-bit makes no difference on the CPU path.
        assert_eq!(args, encoder_args(EncoderBackend::Cpu, true));
    }

    #[test]
    fn test_encoder_args_nvenc_10bit() {
        let args = encoder_args(EncoderBackend::Nvenc, true);
        assert!(args.contains(&"hevc_nvenc".to_string()));
        assert!(args.contains(&"main10".to_string()));
        assert!(args.contains(&"p010le".to_string()));
    }

    #[test]
    fn test_encode_timeout_formula() {
        let encoder = VideoEncoder::new(
            EncoderConfig {
                timeout_minutes: 60,
                ..Default::default()
            },
            Path::new("/nonexistent/font.otf"),
        );
        // Short video: the 30-minute floor applies, capped by config.
        assert_eq!(encoder.encode_timeout(60.0), Duration::from_secs(30 * 60));
        // Long video: 3x duration, but never beyond the configured hour.
        assert_eq!(encoder.encode_timeout(7200.0), Duration::from_secs(3600));
    }

    #[test]
    fn test_hw_failure_detection() {
        assert!(is_hw_failure(&RetubeError::encode(
            "ffmpeg exited with exit status: 1 at 0%: Cannot load nvcuda.dll"
        )));
        assert!(is_hw_failure(&RetubeError::encode(
            "ffmpeg exited with exit status: 1 at 0%: unknown"
        )));
        assert!(!is_hw_failure(&RetubeError::encode("encode timed out after 3600s")));
    }

    #[test]
    fn test_subtitles_filter_contains_font() {
        let encoder = VideoEncoder::new(EncoderConfig::default(), Path::new("/nope.otf"));
        let filter = encoder.subtitles_filter();
        assert!(filter.starts_with("subtitles=subs.srt"));
        assert!(filter.contains("FontName=Source Han Sans HW SC"));
    }
}
