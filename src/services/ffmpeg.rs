//! ffmpeg/ffprobe resolution and media probing.
//!
//! Resolution priority: configured absolute path, bundled directory next
//! to the executable, Windows-only auto-provisioning into the bundled
//! directory, PATH lookup. A candidate only counts when `-version` exits
//! cleanly within five seconds. The result is memoized per process until
//! `refresh` is called; ffprobe resolves alongside ffmpeg first, then on
//! PATH.

use crate::{Result, error::RetubeError};
use log::{debug, info, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

static LOCATOR_CACHE: Mutex<Option<ResolvedTools>> = Mutex::new(None);

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const FFPROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct ResolvedTools {
    ffmpeg: PathBuf,
    ffprobe: Option<PathBuf>,
}

/// Resolve the ffmpeg binary, memoized for the process lifetime.
pub async fn find_ffmpeg(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(cached) = LOCATOR_CACHE.lock().unwrap().as_ref() {
        return Ok(cached.ffmpeg.clone());
    }
    let resolved = resolve(configured).await?;
    let ffmpeg = resolved.ffmpeg.clone();
    *LOCATOR_CACHE.lock().unwrap() = Some(resolved);
    Ok(ffmpeg)
}

/// Resolve ffprobe: alongside the resolved ffmpeg first, then PATH.
pub async fn find_ffprobe(configured_ffmpeg: Option<&str>) -> Result<PathBuf> {
    {
        let cache = LOCATOR_CACHE.lock().unwrap();
        if let Some(tools) = cache.as_ref() {
            if let Some(probe) = &tools.ffprobe {
                return Ok(probe.clone());
            }
        }
    }
    let ffmpeg = find_ffmpeg(configured_ffmpeg).await?;
    let sibling = ffmpeg.with_file_name(exe_name("ffprobe"));
    let probe = if verify_binary(&sibling).await {
        sibling
    } else if verify_binary(Path::new("ffprobe")).await {
        PathBuf::from("ffprobe")
    } else {
        return Err(RetubeError::external_binary(
            "ffprobe not found alongside ffmpeg or on PATH",
        ));
    };
    if let Some(tools) = LOCATOR_CACHE.lock().unwrap().as_mut() {
        tools.ffprobe = Some(probe.clone());
    }
    Ok(probe)
}

/// Drop the memoized resolution; the next lookup re-runs the chain.
pub fn refresh() {
    *LOCATOR_CACHE.lock().unwrap() = None;
}

async fn resolve(configured: Option<&str>) -> Result<ResolvedTools> {
    // (i) configured absolute path
    if let Some(path) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        let candidate = PathBuf::from(path);
        if verify_binary(&candidate).await {
            info!("Using configured ffmpeg at {:?}", candidate);
            return Ok(ResolvedTools {
                ffmpeg: candidate,
                ffprobe: None,
            });
        }
        warn!("Configured ffmpeg {:?} is not usable, falling through", path);
    }

    // (ii) bundled directory next to the application
    if let Some(bundled) = bundled_dir() {
        let candidate = bundled.join(exe_name("ffmpeg"));
        if verify_binary(&candidate).await {
            info!("Using bundled ffmpeg at {:?}", candidate);
            return Ok(ResolvedTools {
                ffmpeg: candidate,
                ffprobe: None,
            });
        }
        // (iii) auto-provision, Windows only; other platforms fail closed
        // and fall through to PATH.
        #[cfg(windows)]
        if let Ok(downloaded) = provision_bundled(&bundled).await {
            return Ok(ResolvedTools {
                ffmpeg: downloaded,
                ffprobe: None,
            });
        }
    }

    // (iv) PATH lookup
    let candidate = PathBuf::from(exe_name("ffmpeg"));
    if verify_binary(&candidate).await {
        debug!("Using ffmpeg from PATH");
        return Ok(ResolvedTools {
            ffmpeg: candidate,
            ffprobe: None,
        });
    }

    Err(RetubeError::external_binary(
        "ffmpeg not found: configure FFMPEG_PATH, bundle it next to the app, or add it to PATH",
    ))
}

fn bundled_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("ffmpeg")))
}

fn exe_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", base)
    } else {
        base.to_string()
    }
}

/// Run `<binary> -version` with the probe timeout; usable means exit 0.
async fn verify_binary(path: &Path) -> bool {
    let result = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        Command::new(path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await;
    matches!(result, Ok(Ok(status)) if status.success())
}

#[cfg(windows)]
async fn provision_bundled(dir: &Path) -> Result<PathBuf> {
    // Windows deployments frequently lack ffmpeg entirely; fetch a static
    // build into the bundled directory once and reuse it afterwards.
    use std::io::Write;
    const FFMPEG_ZIP_URL: &str =
        "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";
    std::fs::create_dir_all(dir)?;
    info!("Downloading ffmpeg bundle from {}", FFMPEG_ZIP_URL);
    let bytes = reqwest::get(FFMPEG_ZIP_URL).await?.bytes().await?;
    let archive_path = dir.join("ffmpeg-release.zip");
    let mut f = std::fs::File::create(&archive_path)?;
    f.write_all(&bytes)?;
    drop(f);
    // Extraction is delegated to the platform shell to avoid carrying an
    // archive dependency for a Windows-only path.
    let status = std::process::Command::new("powershell")
        .args([
            "-NoProfile",
            "-Command",
            &format!(
                "Expand-Archive -Force '{}' '{}'",
                archive_path.display(),
                dir.display()
            ),
        ])
        .status()?;
    if !status.success() {
        return Err(RetubeError::external_binary("ffmpeg bundle extraction failed"));
    }
    let candidate = dir.join("ffmpeg.exe");
    if verify_binary(&candidate).await {
        Ok(candidate)
    } else {
        Err(RetubeError::external_binary("provisioned ffmpeg is not usable"))
    }
}

// ============================================================================
// ffprobe helpers
// ============================================================================

/// Media properties the encoder and subtitle pipeline care about.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    /// Container duration in seconds.
    pub duration_s: f64,
    /// Video frame rate, when a video stream is present.
    pub fps: Option<f64>,
    /// Pixel format of the first video stream.
    pub pix_fmt: Option<String>,
    /// Sample rate of the first audio stream.
    pub audio_sample_rate: Option<u32>,
}

impl MediaInfo {
    /// 10-bit sources need the hardware encoders' main10 profile.
    pub fn is_10bit(&self) -> bool {
        self.pix_fmt
            .as_deref()
            .map(|p| p.contains("10le") || p.contains("10be") || p.contains("p010"))
            .unwrap_or(false)
    }
}

/// Probe a media file with ffprobe.
pub async fn probe_media(ffprobe: &Path, media: &Path) -> Result<MediaInfo> {
    let output = tokio::time::timeout(
        FFPROBE_TIMEOUT,
        Command::new(ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration:stream=codec_type,avg_frame_rate,pix_fmt,sample_rate",
                "-of",
                "json",
            ])
            .arg(media)
            .output(),
    )
    .await
    .map_err(|_| RetubeError::external_binary("ffprobe timed out"))??;

    if !output.status.success() {
        return Err(RetubeError::external_binary(format!(
            "ffprobe failed on {:?}: {}",
            media,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let json: Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| RetubeError::external_binary(format!("ffprobe output unparseable: {}", e)))?;
    let mut info = MediaInfo {
        duration_s: json["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0),
        ..Default::default()
    };
    if let Some(streams) = json["streams"].as_array() {
        for stream in streams {
            match stream["codec_type"].as_str() {
                Some("video") if info.fps.is_none() => {
                    info.fps = stream["avg_frame_rate"].as_str().and_then(parse_frame_rate);
                    info.pix_fmt = stream["pix_fmt"].as_str().map(str::to_string);
                }
                Some("audio") if info.audio_sample_rate.is_none() => {
                    info.audio_sample_rate =
                        stream["sample_rate"].as_str().and_then(|s| s.parse().ok());
                }
                _ => {}
            }
        }
    }
    debug!("Probed {:?}: {:?}", media, info);
    Ok(info)
}

/// List encoder names ffmpeg reports as available.
pub async fn list_encoders(ffmpeg: &Path) -> Result<Vec<String>> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .filter_map(|line| {
            // Listing lines look like " V....D libx264  H.264 ...".
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            if !flags.starts_with('V') && !flags.starts_with('A') {
                return None;
            }
            parts.next().map(str::to_string)
        })
        .collect())
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let mut parts = s.splitn(2, '/');
    let num: f64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some(den) => {
            let den: f64 = den.parse().ok()?;
            if den == 0.0 { None } else { Some(num / den) }
        }
        None => Some(num),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30000/1001"), Some(29.97002997002997));
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("24"), Some(24.0));
    }

    #[test]
    fn test_is_10bit() {
        let mut info = MediaInfo::default();
        assert!(!info.is_10bit());
        info.pix_fmt = Some("yuv420p10le".into());
        assert!(info.is_10bit());
        info.pix_fmt = Some("yuv420p".into());
        assert!(!info.is_10bit());
    }

    #[tokio::test]
    async fn test_verify_binary_rejects_missing() {
        assert!(!verify_binary(Path::new("/definitely/not/a/binary")).await);
    }

    #[tokio::test]
    async fn test_refresh_clears_cache() {
        refresh();
        assert!(LOCATOR_CACHE.lock().unwrap().is_none());
    }
}
