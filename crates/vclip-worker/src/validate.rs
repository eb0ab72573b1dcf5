//! Pre-flight project validation (§4.6), run once before any stage of the
//! export pipeline begins. Mirrors the layout-integrity checks the original
//! performs ad hoc at render start, collected here into one pass so a bad
//! project fails fast instead of partway through an expensive stage.

use std::path::Path;

use tracing::warn;
use vclip_models::Project;

use crate::error::{WorkerError, WorkerResult};

fn exists(path: &str) -> bool {
    Path::new(path).exists()
}

/// Validate `project` in place, dropping BGM tracks whose source file is
/// missing (non-fatal, per §4.6) and returning an error for anything else
/// that would make the render incoherent.
pub fn preflight(project: &mut Project) -> WorkerResult<()> {
    for video in &project.videos {
        if !exists(&video.source_path) {
            return Err(WorkerError::validation(format!(
                "video layer {} references missing source {}",
                video.id, video.source_path
            )));
        }

        for segment in &video.segments {
            validate_segment_times(segment.start_time, segment.end_time, &segment.id.to_string())?;
            validate_segment_audio(segment.audio_path.as_deref(), &segment.id.to_string())?;
        }
    }

    for segment in &project.generic_segments {
        validate_segment_times(segment.start_time, segment.end_time, &segment.id.to_string())?;
        validate_segment_audio(segment.audio_path.as_deref(), &segment.id.to_string())?;
    }

    for track in &project.bgm_tracks {
        if track.end_time > 0.0 && track.end_time <= track.start_time {
            return Err(WorkerError::validation(format!(
                "bgm track {} has end_time <= start_time",
                track.id
            )));
        }
    }

    project.bgm_tracks.retain(|track| {
        if exists(&track.path) {
            true
        } else {
            warn!(track = %track.id, path = %track.path, "bgm track file missing, dropping");
            false
        }
    });

    Ok(())
}

fn validate_segment_times(start: f64, end: f64, segment_id: &str) -> WorkerResult<()> {
    if start < 0.0 || start >= end {
        return Err(WorkerError::validation(format!(
            "segment {segment_id} has invalid times (start={start}, end={end})"
        )));
    }
    Ok(())
}

fn validate_segment_audio(audio_path: Option<&str>, segment_id: &str) -> WorkerResult<()> {
    if let Some(path) = audio_path {
        if !exists(path) {
            return Err(WorkerError::validation(format!(
                "segment {segment_id} references missing audio {path}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vclip_models::{BgmTrack, BgmTrackId, NarrationSegment, SegmentId, SubtitleStyle, VideoLayer, VideoLayerId};

    fn sample_segment(start: f64, end: f64) -> NarrationSegment {
        NarrationSegment {
            id: SegmentId::new(),
            start_time: start,
            end_time: end,
            text: "hi".to_string(),
            language: "en".to_string(),
            voice_id: "v1".to_string(),
            voice_sample_id: None,
            rate: 100.0,
            volume: 100.0,
            pitch: 0.0,
            audio_path: None,
            subtitle_path: None,
            subtitle_enabled: true,
            style: SubtitleStyle::default(),
            extends_to_next_video: false,
        }
    }

    fn sample_project() -> Project {
        Project {
            name: "p".to_string(),
            videos: Vec::new(),
            generic_segments: Vec::new(),
            bgm_tracks: Vec::new(),
            global_tts_volume: 100.0,
            global_bgm_volume: 100.0,
        }
    }

    #[test]
    fn rejects_video_with_missing_source() {
        let mut project = sample_project();
        project.videos.push(VideoLayer {
            id: VideoLayerId::new(),
            name: "clip".to_string(),
            source_path: "/nonexistent/clip.mp4".to_string(),
            order: 0,
            timeline_start: None,
            timeline_end: None,
            source_start: 0.0,
            source_end: 1.0,
            segments: Vec::new(),
        });

        assert!(preflight(&mut project).is_err());
    }

    #[test]
    fn rejects_segment_with_inverted_times() {
        let mut project = sample_project();
        project.generic_segments.push(sample_segment(5.0, 2.0));
        assert!(preflight(&mut project).is_err());
    }

    #[test]
    fn drops_bgm_track_with_missing_file_and_keeps_others() {
        let mut project = sample_project();
        project.bgm_tracks.push(BgmTrack {
            id: BgmTrackId::new(),
            path: "/nonexistent/bgm.mp3".to_string(),
            start_time: 0.0,
            end_time: 0.0,
            volume: 50.0,
            fade_in: 0.0,
            fade_out: 0.0,
            loop_: false,
            muted: false,
            audio_offset: 0.0,
        });

        preflight(&mut project).unwrap();
        assert!(project.bgm_tracks.is_empty());
    }

    #[test]
    fn rejects_bgm_track_with_bad_range_even_if_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bgm.mp3");
        std::fs::write(&path, b"not really audio").unwrap();

        let mut project = sample_project();
        project.bgm_tracks.push(BgmTrack {
            id: BgmTrackId::new(),
            path: path.to_string_lossy().to_string(),
            start_time: 10.0,
            end_time: 5.0,
            volume: 50.0,
            fade_in: 0.0,
            fade_out: 0.0,
            loop_: false,
            muted: false,
            audio_offset: 0.0,
        });

        assert!(preflight(&mut project).is_err());
    }
}
