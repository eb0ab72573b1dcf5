//! Render job state and the worker's line-delimited progress protocol.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error_kind::ErrorKind;
use crate::ids::{JobId, VideoLayerId};

/// Encoder quality preset requested for a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Lossless,
    High,
    Balanced,
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Balanced
    }
}

/// Whether the export renders one video or the combined multi-video timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExportType {
    Single,
    Combined,
}

/// Subscription tier, consumed only to decide whether a watermark is
/// mandatory (§4.5 watermark stage). Tier enforcement itself — pricing,
/// entitlement checks — is an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Free,
    Pro,
    Studio,
}

impl UserTier {
    pub fn requires_watermark(&self) -> bool {
        matches!(self, UserTier::Free)
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Export pipeline stage tags, matching the stage machine in §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocessing,
    Fonts,
    Tts,
    Segments,
    Combining,
    Voiceover,
    Subtitles,
    Bgm,
    Watermark,
    Done,
    Error,
}

/// Parameters accepted by `POST /export/start`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExportRequest {
    pub project_name: String,
    pub export_type: ExportType,
    #[serde(default)]
    pub video_id: Option<VideoLayerId>,
    pub config: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExportConfig {
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "default_true")]
    pub include_subtitles: bool,
    #[serde(default)]
    pub background_music_path: Option<String>,
    #[serde(default)]
    pub output_filename: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub user_tier: UserTier,
}

impl Default for UserTier {
    fn default() -> Self {
        UserTier::Free
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExportStartResponse {
    pub export_id: JobId,
    pub status: JobStatus,
    pub output_path: String,
    pub bgm_tracks: Vec<String>,
    pub bgm_tracks_count: usize,
}

/// In-memory orchestrator record for one render job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RenderJob {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub stage: Option<Stage>,
    pub output_path: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RenderJob {
    pub fn new(id: JobId, output_path: impl Into<String>) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            progress: 0,
            stage: None,
            output_path: output_path.into(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    pub fn apply_progress(&mut self, record: &ProgressRecord) {
        if let ProgressRecord::Progress { stage, progress, .. } = record {
            self.stage = Some(*stage);
            self.progress = self.progress.max(*progress);
        }
    }

    pub fn complete(&mut self, output_path: impl Into<String>) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.stage = Some(Stage::Done);
        self.output_path = output_path.into();
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.stage = Some(Stage::Error);
        self.error = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.fail("Cancelled by user");
    }
}

/// One line of the worker's line-delimited stdout protocol (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressRecord {
    Progress {
        stage: Stage,
        message: String,
        progress: u8,
        #[serde(default)]
        current_step: Option<u32>,
        #[serde(default)]
        total_steps: Option<u32>,
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        eta_seconds: Option<f64>,
        #[serde(default)]
        eta_formatted: Option<String>,
        #[serde(default)]
        processing_speed: Option<f64>,
        #[serde(default)]
        ffmpeg_progress: Option<f64>,
    },
    Error {
        message: String,
        #[serde(default)]
        kind: Option<ErrorKind>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_lifecycle_transitions() {
        let mut job = RenderJob::new(JobId::new(), "/tmp/out.mp4");
        assert_eq!(job.status, JobStatus::Queued);

        job.start();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        job.apply_progress(&ProgressRecord::Progress {
            stage: Stage::Segments,
            message: "extracting".to_string(),
            progress: 40,
            current_step: None,
            total_steps: None,
            detail: None,
            eta_seconds: None,
            eta_formatted: None,
            processing_speed: None,
            ffmpeg_progress: None,
        });
        assert_eq!(job.progress, 40);
        assert_eq!(job.stage, Some(Stage::Segments));

        job.complete("/tmp/out.mp4");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn progress_never_regresses() {
        let mut job = RenderJob::new(JobId::new(), "/tmp/out.mp4");
        job.start();
        job.apply_progress(&ProgressRecord::Progress {
            stage: Stage::Combining,
            message: "x".into(),
            progress: 60,
            current_step: None,
            total_steps: None,
            detail: None,
            eta_seconds: None,
            eta_formatted: None,
            processing_speed: None,
            ffmpeg_progress: None,
        });
        job.apply_progress(&ProgressRecord::Progress {
            stage: Stage::Combining,
            message: "stale retry".into(),
            progress: 55,
            current_step: None,
            total_steps: None,
            detail: None,
            eta_seconds: None,
            eta_formatted: None,
            processing_speed: None,
            ffmpeg_progress: None,
        });
        assert_eq!(job.progress, 60);
    }

    #[test]
    fn cancel_sets_reason() {
        let mut job = RenderJob::new(JobId::new(), "/tmp/out.mp4");
        job.start();
        job.cancel();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Cancelled by user"));
    }
}
