//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;
use vclip_models::ErrorKind;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        /// Last lines of captured stderr, per the adapter's stderr-to-file
        /// contract (never piped, to avoid the deadlock a full pipe buffer
        /// causes on a long encode).
        stderr_tail: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr_tail: Option<String>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("Zero-copy concat failed PTS verification: {0}")]
    StreamCopyConcatFailed(String),

    #[error("Watermark required but could not be applied: {0}")]
    WatermarkRequired(String),

    #[error("Project file is locked by another process")]
    Busy,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr_tail: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr_tail,
            exit_code,
        }
    }

    pub fn timeout(stage: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            stage: stage.into(),
            secs,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Tag this error with the recovery-policy kind callers should match
    /// on, per the shared `ErrorKind` table (spec.md §7).
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediaError::FfmpegNotFound
            | MediaError::FfprobeNotFound
            | MediaError::FfmpegFailed { .. }
            | MediaError::FfprobeFailed { .. }
            | MediaError::Internal(_)
            | MediaError::Io(_) => ErrorKind::ToolchainFailure,
            MediaError::InvalidInput(_) | MediaError::InvalidVideo(_) | MediaError::JsonParse(_) => {
                ErrorKind::InvalidInput
            }
            MediaError::FileNotFound(_) => ErrorKind::MissingInput,
            MediaError::Cancelled => ErrorKind::Cancelled,
            MediaError::Timeout { .. } => ErrorKind::Timeout,
            MediaError::StreamCopyConcatFailed(_) => ErrorKind::StreamCopyConcatFailed,
            MediaError::WatermarkRequired(_) => ErrorKind::WatermarkRequired,
            MediaError::Busy => ErrorKind::Busy,
        }
    }
}
