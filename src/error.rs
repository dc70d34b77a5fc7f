//! Error types for the retube pipeline service.
//!
//! This module defines the `RetubeError` enum covering all error conditions
//! that can occur while driving a task through the pipeline: downloader and
//! ffmpeg invocations, LLM and moderation calls, subtitle processing, the
//! chunked upload protocol, and persistence.
//!
//! It also provides helper methods to construct errors and classify them for
//! the engine's continue/abort decisions.
use thiserror::Error;

/// Represents all possible errors in the retube application.
///
/// Each variant provides specific context to facilitate debugging and the
/// short `error_message` stored on a failed task row.
#[derive(Error, Debug)]
pub enum RetubeError {
    /// I/O operation failed during file system access.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error due to invalid or missing settings.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error
        message: String,
    },

    /// Task or monitor database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Subtitle parsing or rendering error.
    ///
    /// Provides the subtitle format and detailed message.
    #[error("Subtitle format error [{format}]: {message}")]
    SubtitleFormat {
        /// The subtitle format that caused the error (e.g., "SRT", "VTT")
        format: String,
        /// Detailed error message describing the issue
        message: String,
    },

    /// LLM service call failed (translation, tagging, classification, QC).
    #[error("LLM service error: {0}")]
    LlmService(String),

    /// API request error with specified source.
    #[error("API error [{source:?}]: {message}")]
    Api {
        /// Error message from the API
        message: String,
        /// Which remote API produced the error
        source: ApiErrorSource,
    },

    /// The ASR endpoint rejected every supported response format.
    ///
    /// This is fatal for the transcription stage and is never retried.
    #[error("ASR API incompatible: {0}")]
    AsrIncompatible(String),

    /// Audio extraction or clip preparation failed.
    #[error("Audio processing error: {message}")]
    AudioProcessing {
        /// Description of the audio processing error
        message: String,
    },

    /// Source downloader invocation failed.
    #[error("Download error: {message}")]
    Download {
        /// Description of the downloader failure
        message: String,
        /// True when the failure pattern indicates stale cookies
        cookies_refresh_needed: bool,
    },

    /// Chunked upload protocol failure.
    #[error("Upload error [{step}]: {message}")]
    Upload {
        /// Protocol step that failed (e.g. "get_token", "fragment 3")
        step: String,
        /// Failure detail
        message: String,
    },

    /// Video encoding (subtitle burn-in) failed.
    #[error("Encode error: {0}")]
    Encode(String),

    /// A required external binary is missing or not executable.
    #[error("External binary unavailable: {0}")]
    ExternalBinary(String),

    /// An operation was attempted in an illegal task state.
    #[error("Invalid task state: {0}")]
    TaskState(String),

    /// The specified file was not found.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

// Convert reqwest errors to API errors with a transport source
impl From<reqwest::Error> for RetubeError {
    fn from(err: reqwest::Error) -> Self {
        RetubeError::Api {
            message: err.to_string(),
            source: ApiErrorSource::Http,
        }
    }
}

impl From<serde_json::Error> for RetubeError {
    fn from(err: serde_json::Error) -> Self {
        RetubeError::Config {
            message: format!("JSON serialization/deserialization error: {}", err),
        }
    }
}

impl From<walkdir::Error> for RetubeError {
    fn from(err: walkdir::Error) -> Self {
        RetubeError::Io(err.into())
    }
}

/// Specialized `Result` type for retube operations.
pub type RetubeResult<T> = Result<T, RetubeError>;

impl RetubeError {
    /// Create a configuration error with the given message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        RetubeError::Config {
            message: message.into(),
        }
    }

    /// Create a subtitle format error for the given format and message.
    pub fn subtitle_format<S1, S2>(format: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        RetubeError::SubtitleFormat {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Create an LLM service error with the given message.
    pub fn llm_service<S: Into<String>>(message: S) -> Self {
        RetubeError::LlmService(message.into())
    }

    /// Create an audio processing error with the given message.
    pub fn audio_processing<S: Into<String>>(message: S) -> Self {
        RetubeError::AudioProcessing {
            message: message.into(),
        }
    }

    /// Create a downloader error, optionally flagging a cookie refresh hint.
    pub fn download<S: Into<String>>(message: S, cookies_refresh_needed: bool) -> Self {
        RetubeError::Download {
            message: message.into(),
            cookies_refresh_needed,
        }
    }

    /// Create an upload protocol error for the given step.
    pub fn upload<S1, S2>(step: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        RetubeError::Upload {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create an encoding error with the given message.
    pub fn encode<S: Into<String>>(message: S) -> Self {
        RetubeError::Encode(message.into())
    }

    /// Create an external binary error with the given message.
    pub fn external_binary<S: Into<String>>(message: S) -> Self {
        RetubeError::ExternalBinary(message.into())
    }

    /// Create an invalid task state error with the given message.
    pub fn task_state<S: Into<String>>(message: S) -> Self {
        RetubeError::TaskState(message.into())
    }

    /// Create a Whisper/ASR API error.
    pub fn asr_api<T: Into<String>>(message: T) -> Self {
        Self::Api {
            message: message.into(),
            source: ApiErrorSource::Asr,
        }
    }

    /// Create a remote VAD service error.
    pub fn vad_api<T: Into<String>>(message: T) -> Self {
        Self::Api {
            message: message.into(),
            source: ApiErrorSource::Vad,
        }
    }

    /// Create a moderation service error.
    pub fn moderation_api<T: Into<String>>(message: T) -> Self {
        Self::Api {
            message: message.into(),
            source: ApiErrorSource::Moderation,
        }
    }

    /// Create a catalog (discovery) API error.
    pub fn catalog_api<T: Into<String>>(message: T) -> Self {
        Self::Api {
            message: message.into(),
            source: ApiErrorSource::Catalog,
        }
    }

    /// The short reason stored in a failed task's `error_message` column.
    ///
    /// Full traces belong in the per-task log; the row only carries the
    /// first line of context.
    pub fn task_reason(&self) -> String {
        match self {
            RetubeError::Download { message, .. } => format!("download failed: {}", message),
            RetubeError::Upload { step, message } => {
                format!("upload failed at {}: {}", step, message)
            }
            RetubeError::AsrIncompatible(msg) => format!("API incompatible: {}", msg),
            RetubeError::ExternalBinary(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error indicates the download cookies need refreshing.
    pub fn needs_cookie_refresh(&self) -> bool {
        matches!(
            self,
            RetubeError::Download {
                cookies_refresh_needed: true,
                ..
            }
        )
    }
}

/// API error source enumeration.
///
/// Specifies the remote service that produced an error to help with
/// diagnosis and retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum ApiErrorSource {
    /// Generic HTTP transport failure
    #[error("HTTP")]
    Http,
    /// LLM chat-completions endpoint
    #[error("LLM")]
    Llm,
    /// Whisper-compatible transcription endpoint
    #[error("ASR")]
    Asr,
    /// Remote voice-activity-detection service
    #[error("VAD")]
    Vad,
    /// Cloud text moderation service
    #[error("Moderation")]
    Moderation,
    /// External video catalog API
    #[error("Catalog")]
    Catalog,
    /// Chunked upload endpoints
    #[error("Uploader")]
    Uploader,
}

// Unit test: RetubeError error types and helper methods
#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = RetubeError::config("test config error");
        assert!(matches!(error, RetubeError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: test config error");
    }

    #[test]
    fn test_subtitle_format_error_creation() {
        let error = RetubeError::subtitle_format("SRT", "invalid format");
        assert!(matches!(error, RetubeError::SubtitleFormat { .. }));
        let msg = error.to_string();
        assert!(msg.contains("SRT"));
        assert!(msg.contains("invalid format"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let retube_error: RetubeError = io_error.into();
        assert!(matches!(retube_error, RetubeError::Io(_)));
    }

    #[test]
    fn test_download_error_cookie_hint() {
        let plain = RetubeError::download("network unreachable", false);
        assert!(!plain.needs_cookie_refresh());
        let gated = RetubeError::download("Sign in to confirm you're not a bot", true);
        assert!(gated.needs_cookie_refresh());
    }

    #[test]
    fn test_task_reason_shortening() {
        let err = RetubeError::upload("fragment 3", "HTTP 500");
        assert_eq!(err.task_reason(), "upload failed at fragment 3: HTTP 500");
        let err = RetubeError::AsrIncompatible("no supported response format".into());
        assert!(err.task_reason().starts_with("API incompatible"));
    }
}
