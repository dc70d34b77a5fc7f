//! Audio extraction helpers shared by the VAD and ASR stages.
//!
//! All decoding is delegated to ffmpeg; this module only shells out and
//! reads the resulting 16 kHz mono PCM WAV files back with `hound`.

use crate::{Result, error::RetubeError};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(600);
const CLIP_TIMEOUT: Duration = Duration::from_secs(120);

/// Target sample rate for speech processing.
pub const SPEECH_SAMPLE_RATE: u32 = 16_000;

/// Decode any media file to 16 kHz mono s16le WAV.
pub async fn extract_speech_wav(ffmpeg: &Path, input: &Path, output: &Path) -> Result<()> {
    let status = tokio::time::timeout(
        EXTRACT_TIMEOUT,
        Command::new(ffmpeg)
            .args(["-y", "-i"])
            .arg(input)
            .args([
                "-vn",
                "-ac",
                "1",
                "-ar",
                "16000",
                "-acodec",
                "pcm_s16le",
                "-f",
                "wav",
            ])
            .arg(output)
            .output(),
    )
    .await
    .map_err(|_| RetubeError::audio_processing("audio extraction timed out"))??;

    if !status.status.success() {
        return Err(RetubeError::audio_processing(format!(
            "ffmpeg audio extraction failed: {}",
            String::from_utf8_lossy(&status.stderr)
                .lines()
                .last()
                .unwrap_or("")
        )));
    }
    debug!("Extracted speech WAV to {:?}", output);
    Ok(())
}

/// Cut a `[start, start+dur)` clip out of a WAV file into `output`.
///
/// Returns `None` (not an error) when the resulting clip is shorter than
/// 100 ms; such slivers confuse both the VAD service and the ASR API.
pub async fn cut_wav_clip(
    ffmpeg: &Path,
    wav: &Path,
    start_s: f64,
    duration_s: f64,
    output: &Path,
) -> Result<Option<PathBuf>> {
    let duration_s = duration_s.max(0.01);
    let result = tokio::time::timeout(
        CLIP_TIMEOUT,
        Command::new(ffmpeg)
            .args(["-y", "-ss", &format!("{:.3}", start_s), "-t", &format!("{:.3}", duration_s), "-i"])
            .arg(wav)
            .args(["-ac", "1", "-ar", "16000", "-acodec", "pcm_s16le", "-f", "wav"])
            .arg(output)
            .output(),
    )
    .await
    .map_err(|_| RetubeError::audio_processing("clip extraction timed out"))??;

    if !result.status.success() || !output.exists() {
        warn!(
            "Clip extraction failed for {:.3}-{:.3}s: {}",
            start_s,
            start_s + duration_s,
            String::from_utf8_lossy(&result.stderr)
                .lines()
                .last()
                .unwrap_or("")
        );
        return Ok(None);
    }
    match wav_duration_seconds(output) {
        Ok(actual) if actual >= 0.1 => Ok(Some(output.to_path_buf())),
        Ok(actual) => {
            warn!("Extracted clip too short ({:.3}s), skipping", actual);
            Ok(None)
        }
        Err(e) => {
            warn!("Extracted clip unreadable: {}", e);
            Ok(None)
        }
    }
}

/// Read a 16-bit PCM WAV into normalized f32 samples in `[-1, 1]`.
pub fn read_wav_f32(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| RetubeError::audio_processing(format!("WAV open failed: {}", e)))?;
    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(RetubeError::audio_processing(format!(
            "expected mono audio, got {} channels",
            spec.channels
        )));
    }
    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .filter_map(|s| s.ok())
            .map(|s| s as f32 / 32768.0)
            .collect(),
        (hound::SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .filter_map(|s| s.ok())
            .map(|s| s as f32 / 2_147_483_648.0)
            .collect(),
        (hound::SampleFormat::Float, 32) => {
            reader.samples::<f32>().filter_map(|s| s.ok()).collect()
        }
        (format, bits) => {
            return Err(RetubeError::audio_processing(format!(
                "unsupported WAV sample format {:?}/{} bits",
                format, bits
            )));
        }
    };
    Ok((samples, spec.sample_rate))
}

/// Duration of a WAV file in seconds.
pub fn wav_duration_seconds(path: &Path) -> Result<f64> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| RetubeError::audio_processing(format!("WAV open failed: {}", e)))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Ok(0.0);
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_test_wav(path: &Path, seconds: f64, sample_rate: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let total = (seconds * sample_rate as f64) as usize;
        for i in 0..total {
            let t = i as f32 / sample_rate as f32;
            let sample = (t * 440.0 * 2.0 * std::f32::consts::PI).sin();
            writer.write_sample((sample * 16384.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_read_wav_f32_normalizes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 0.5, SPEECH_SAMPLE_RATE);
        let (samples, rate) = read_wav_f32(&path).unwrap();
        assert_eq!(rate, SPEECH_SAMPLE_RATE);
        assert_eq!(samples.len(), 8000);
        assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(samples.iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn test_wav_duration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 2.0, SPEECH_SAMPLE_RATE);
        let duration = wav_duration_seconds(&path).unwrap();
        assert!((duration - 2.0).abs() < 0.01);
    }
}
