//! Error kind tags shared across the render core.
//!
//! These are tags, not type names: every crate-local error type exposes
//! a `kind() -> ErrorKind` accessor so callers can match on recovery
//! policy without matching every concrete variant.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad segment times, missing file. Not recovered locally.
    InvalidInput,
    /// Encoder/probe non-zero exit. Not recovered locally.
    ToolchainFailure,
    /// A stage-appropriate timeout elapsed. Not recovered locally.
    Timeout,
    /// Font, subtitle, or optional BGM file missing. Recovered with a warning.
    MissingInput,
    /// Zero-copy concat failed PTS verification. Recovered by re-encode concat.
    StreamCopyConcatFailed,
    /// Watermark required for the tier but application failed. Not recovered.
    WatermarkRequired,
    /// Project file lock contention. Recovered with retry for up to 5s.
    Busy,
    /// Job cancelled by user request. Not recovered.
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind is recoverable without failing the whole job.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::MissingInput | ErrorKind::StreamCopyConcatFailed | ErrorKind::Busy
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ToolchainFailure => "toolchain_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::StreamCopyConcatFailed => "stream_copy_concat_failed",
            ErrorKind::WatermarkRequired => "watermark_required",
            ErrorKind::Busy => "busy",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}
