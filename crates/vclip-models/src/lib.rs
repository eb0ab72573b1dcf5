//! Shared data models for the render core.
//!
//! This crate provides the Serde-serializable types shared across the
//! Layer Compositor, Export Pipeline, Render Worker, and Job Orchestrator:
//! - The project data model (videos, narration segments, BGM tracks)
//! - Derived compositor output (visibility segments, placements)
//! - Render job state and the worker's progress-record protocol
//! - Error kind tags

pub mod compositor_types;
pub mod error_kind;
pub mod ids;
pub mod project;
pub mod render_job;

pub use compositor_types::{BgmPlacement, SegmentPlacement, VisibilitySegment};
pub use error_kind::ErrorKind;
pub use ids::{BgmTrackId, JobId, ProjectId, SegmentId, VideoLayerId};
pub use project::{sanitize_name, BgmTrack, NarrationSegment, Project, SubtitleStyle, VideoLayer};
pub use render_job::{
    ExportConfig, ExportRequest, ExportStartResponse, ExportType, JobStatus, ProgressRecord,
    Quality, RenderJob, Stage, UserTier,
};
