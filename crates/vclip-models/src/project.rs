//! The persisted project description consumed by the render core.
//!
//! A project is read-only for the duration of a render: the compositor
//! takes `&Project` and produces derived placements without mutating it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ids::{BgmTrackId, SegmentId, VideoLayerId};

fn default_volume() -> f64 {
    100.0
}

/// One placement of a source video on the output timeline.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VideoLayer {
    pub id: VideoLayerId,
    pub name: String,
    pub source_path: String,

    /// Stack priority. Lower sorts on top.
    pub order: i32,

    /// Absolute placement on the output timeline. `None` means "lay out
    /// sequentially by `order`" (see the compositor's Stage 1).
    #[serde(default)]
    pub timeline_start: Option<f64>,
    #[serde(default)]
    pub timeline_end: Option<f64>,

    /// Trim range within the source file.
    #[serde(default)]
    pub source_start: f64,
    #[serde(default)]
    pub source_end: f64,

    /// Narration segments local to this video; `start_time`/`end_time`
    /// are measured from the trimmed clip start (source time
    /// `source_start + start_time`).
    #[serde(default)]
    pub segments: Vec<NarrationSegment>,
}

/// A timed narration segment: video-local (carried on a [`VideoLayer`]) or
/// generic (carried on [`Project::generic_segments`] with absolute
/// timeline positions). The shape is identical; only the owner decides
/// how `start_time`/`end_time` are interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NarrationSegment {
    pub id: SegmentId,
    pub start_time: f64,
    pub end_time: f64,

    pub text: String,
    pub language: String,
    pub voice_id: String,
    #[serde(default)]
    pub voice_sample_id: Option<String>,
    #[serde(default = "default_volume")]
    pub rate: f64,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default)]
    pub pitch: f64,

    /// Populated by the TTS cache once synthesis has happened.
    #[serde(default)]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub subtitle_path: Option<String>,

    #[serde(default = "default_true")]
    pub subtitle_enabled: bool,
    #[serde(default)]
    pub style: SubtitleStyle,

    /// When true, `end_time` may exceed the owning clip and the segment
    /// continues into the next layer in sequence.
    #[serde(default)]
    pub extends_to_next_video: bool,
}

fn default_true() -> bool {
    true
}

/// Per-segment subtitle styling, the source of the 23-field `Style:` line.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct SubtitleStyle {
    pub font: String,
    pub size: f64,
    pub primary_color: String,
    pub outline_color: String,
    pub shadow_color: String,
    pub outline_width: f64,
    pub shadow: f64,
    pub border_style: u8,
    /// Vertical margin, reference-resolution relative (see §4.2 scaling).
    pub position: f64,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font: "Roboto".to_string(),
            size: 20.0,
            primary_color: "&H00FFFFFF".to_string(),
            outline_color: "&H00000000".to_string(),
            shadow_color: "&H80000000".to_string(),
            outline_width: 0.5,
            shadow: 0.0,
            border_style: 1,
            position: 30.0,
        }
    }
}

/// A background-music track with absolute timeline positions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BgmTrack {
    pub id: BgmTrackId,
    pub path: String,
    #[serde(default)]
    pub start_time: f64,
    /// `0` means "until the total output duration".
    #[serde(default)]
    pub end_time: f64,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default)]
    pub fade_in: f64,
    #[serde(default)]
    pub fade_out: f64,
    #[serde(rename = "loop", default)]
    pub loop_: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub audio_offset: f64,
}

/// The full, read-only project description.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub videos: Vec<VideoLayer>,
    #[serde(default)]
    pub generic_segments: Vec<NarrationSegment>,
    #[serde(default)]
    pub bgm_tracks: Vec<BgmTrack>,
    #[serde(default = "default_volume")]
    pub global_tts_volume: f64,
    #[serde(default = "default_volume")]
    pub global_bgm_volume: f64,
}

/// Sanitise a user-provided project/file name so it cannot be used for
/// path traversal when it is interpolated into a filesystem path.
pub fn sanitize_name(name: &str) -> Result<String, &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }

    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if "/\\<>:\"|?*".contains(c) || (c as u32) < 0x20 {
                '_'
            } else {
                c
            }
        })
        .collect();

    sanitized = sanitized.trim_matches(|c| c == '.' || c == ' ').to_string();

    while sanitized.contains("..") {
        sanitized = sanitized.replace("..", "_");
    }

    if sanitized.len() > 100 {
        sanitized.truncate(100);
    }

    if sanitized.is_empty() {
        return Err("name contains only invalid characters");
    }

    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_strips_path_traversal() {
        let sanitized = sanitize_name("../../etc/passwd").unwrap();
        assert!(!sanitized.contains(".."));
        assert!(!sanitized.contains('/'));
        assert_eq!(sanitize_name("normal_name").unwrap(), "normal_name");
    }

    #[test]
    fn sanitize_name_rejects_empty_result() {
        assert!(sanitize_name("").is_err());
        assert!(sanitize_name("...").is_err());
    }

    #[test]
    fn sanitize_name_truncates_long_names() {
        let long = "a".repeat(200);
        assert_eq!(sanitize_name(&long).unwrap().len(), 100);
    }
}
