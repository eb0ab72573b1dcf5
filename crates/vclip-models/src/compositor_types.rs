//! Derived types produced by the Layer Compositor (§4.4). Built fresh on
//! every render and discarded after; never persisted.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ids::{BgmTrackId, SegmentId, VideoLayerId};

/// A maximal interval during which exactly one layer is visible.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VisibilitySegment {
    pub video_id: VideoLayerId,
    pub video_path: String,
    pub timeline_start: f64,
    pub timeline_end: f64,
    pub source_start: f64,
    pub source_end: f64,
    /// Stable per-video index, assigned by first appearance in the map.
    pub video_index: u32,
}

impl VisibilitySegment {
    pub fn duration(&self) -> f64 {
        self.timeline_end - self.timeline_start
    }
}

/// A contiguous slice of one narration segment pinned to one visibility
/// segment. A segment crossing N visibility boundaries produces N
/// placements.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SegmentPlacement {
    pub segment_id: SegmentId,
    pub original_video_id: Option<VideoLayerId>,
    pub timeline_start: f64,
    pub timeline_end: f64,
    #[serde(default)]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub subtitle_path: Option<String>,
    pub is_continuation: bool,
    pub continues_into_next: bool,
    /// Seconds of the referenced audio already played by earlier
    /// placements of the same segment.
    pub audio_offset: f64,
}

impl SegmentPlacement {
    pub fn duration(&self) -> f64 {
        self.timeline_end - self.timeline_start
    }
}

/// Timeline placement of one BGM track, with loop/fade parameters resolved.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BgmPlacement {
    pub track_id: BgmTrackId,
    pub track_path: String,
    pub timeline_start: f64,
    pub timeline_end: f64,
    pub volume: f64,
    pub fade_in: f64,
    pub fade_out: f64,
    pub needs_loop: bool,
    pub loop_count: u32,
    pub audio_offset: f64,
}

impl BgmPlacement {
    pub fn duration(&self) -> f64 {
        self.timeline_end - self.timeline_start
    }
}
