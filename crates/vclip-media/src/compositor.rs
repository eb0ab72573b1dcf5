//! Layer Compositor (§4.4): turns a [`Project`]'s overlapping video layers,
//! narration segments and BGM tracks into a flat visibility map and the
//! placements the Export Pipeline consumes. Ported field-for-field from
//! `LayerCompositor` in `examples/original_source/core/layer_compositor.py`.

use std::collections::HashMap;

use tracing::debug;
use vclip_models::{
    BgmPlacement, BgmTrack, BgmTrackId, NarrationSegment, Project, SegmentPlacement, VideoLayer,
    VideoLayerId, VisibilitySegment,
};

/// Minimum gap enforced between a clamped `source_start`/`source_end` pair,
/// guarding against a degenerate zero-length layer from a malformed project.
const MIN_SOURCE_GAP: f64 = 0.1;

/// Segments separated by less than this are treated as contiguous when
/// merging same-video visibility runs.
const MERGE_GAP_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone)]
struct ResolvedLayer {
    id: VideoLayerId,
    path: String,
    order: i32,
    timeline_start: f64,
    timeline_end: f64,
    source_start: f64,
    source_end: f64,
}

/// Built visibility map and derived placements for one project render.
/// Constructed once per render and discarded after.
#[derive(Debug, Clone)]
pub struct LayerCompositor {
    visibility: Vec<VisibilitySegment>,
    segment_placements: Vec<SegmentPlacement>,
    bgm_placements: Vec<BgmPlacement>,
    total_duration: f64,
}

fn clamp_source_range(source_start: f64, source_end: f64, source_duration: f64) -> (f64, f64) {
    let mut start = source_start.clamp(0.0, source_duration);
    let mut end = source_end.clamp(0.0, source_duration);
    if end <= start {
        end = (start + MIN_SOURCE_GAP).min(source_duration);
        start = (end - MIN_SOURCE_GAP).max(0.0);
    }
    (start, end)
}

/// Source durations keyed by layer id, needed to clamp trim ranges and to
/// lay out layers with no explicit `timeline_start`. Resolved by the
/// caller via the toolchain adapter's `probe_duration` before `build` runs.
pub type SourceDurations = HashMap<VideoLayerId, f64>;

/// BGM track source file durations keyed by track id, needed to compute how
/// many times a short track must loop to cover its placement. Resolved the
/// same way as [`SourceDurations`], via `probe_duration` before `build` runs.
pub type BgmSourceDurations = HashMap<BgmTrackId, f64>;

impl LayerCompositor {
    /// Build the compositor state from a project. `source_durations` must
    /// contain an entry for every `VideoLayer::id` in `project.videos`, and
    /// `bgm_source_durations` an entry for every looping `BgmTrack::id`.
    pub fn build(
        project: &Project,
        source_durations: &SourceDurations,
        bgm_source_durations: &BgmSourceDurations,
    ) -> Self {
        let resolved = resolve_layers(&project.videos, source_durations);
        let visibility = build_visibility_map(&resolved);

        let total_duration = visibility
            .iter()
            .map(|seg| seg.timeline_end)
            .fold(0.0_f64, f64::max);

        let segment_placements = build_segment_placements(project, &resolved, &visibility);
        let bgm_placements = build_bgm_placements(&project.bgm_tracks, total_duration, bgm_source_durations);

        let compositor = Self {
            visibility,
            segment_placements,
            bgm_placements,
            total_duration,
        };

        debug!(
            visibility_segments = compositor.visibility.len(),
            segment_placements = compositor.segment_placements.len(),
            bgm_placements = compositor.bgm_placements.len(),
            total_duration = compositor.total_duration,
            "layer compositor built"
        );

        compositor
    }

    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    pub fn visibility_segments(&self) -> &[VisibilitySegment] {
        &self.visibility
    }

    pub fn segment_placements(&self) -> &[SegmentPlacement] {
        &self.segment_placements
    }

    pub fn bgm_placements(&self) -> &[BgmPlacement] {
        &self.bgm_placements
    }

    /// The visibility segment active at `t`, if any.
    pub fn get_visible_video_at(&self, t: f64) -> Option<&VisibilitySegment> {
        self.visibility
            .iter()
            .find(|seg| t >= seg.timeline_start && t < seg.timeline_end)
    }

    /// All narration-segment placements active at `t`.
    pub fn get_segments_at(&self, t: f64) -> Vec<&SegmentPlacement> {
        self.segment_placements
            .iter()
            .filter(|p| t >= p.timeline_start && t < p.timeline_end)
            .collect()
    }

    /// All BGM placements active at `t`.
    pub fn get_bgm_at(&self, t: f64) -> Vec<&BgmPlacement> {
        self.bgm_placements
            .iter()
            .filter(|p| t >= p.timeline_start && t < p.timeline_end)
            .collect()
    }

    /// Every distinct source video path referenced by the visibility map,
    /// in first-appearance order.
    pub fn get_unique_video_paths(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut paths = Vec::new();
        for seg in &self.visibility {
            if seen.insert(seg.video_path.clone()) {
                paths.push(seg.video_path.clone());
            }
        }
        paths
    }

    /// Indented diagnostic dump of layers, the visibility map and
    /// placements. Named `get_debug_info` in the original.
    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        out.push_str("Visibility segments:\n");
        for seg in &self.visibility {
            out.push_str(&format!(
                "  [{:.3}, {:.3}) video={} source=[{:.3}, {:.3})\n",
                seg.timeline_start, seg.timeline_end, seg.video_path, seg.source_start, seg.source_end
            ));
        }
        out.push_str("Segment placements:\n");
        for p in &self.segment_placements {
            out.push_str(&format!(
                "  [{:.3}, {:.3}) segment={} continuation={} continues_into_next={}\n",
                p.timeline_start, p.timeline_end, p.segment_id, p.is_continuation, p.continues_into_next
            ));
        }
        out.push_str("BGM placements:\n");
        for p in &self.bgm_placements {
            out.push_str(&format!(
                "  [{:.3}, {:.3}) track={} volume={:.1} loop={}\n",
                p.timeline_start, p.timeline_end, p.track_id, p.volume, p.needs_loop
            ));
        }
        out
    }
}

/// Sequential layout: lay out layers with no explicit `timeline_start` back
/// to back in `order`, ties broken by input position (stable sort).
fn resolve_layers(videos: &[VideoLayer], source_durations: &SourceDurations) -> Vec<ResolvedLayer> {
    let mut ordered: Vec<usize> = (0..videos.len()).collect();
    ordered.sort_by_key(|&i| videos[i].order);

    let mut resolved = Vec::with_capacity(videos.len());
    let mut cursor = 0.0_f64;

    for &i in &ordered {
        let layer = &videos[i];
        let source_duration = source_durations.get(&layer.id).copied().unwrap_or(0.0);
        let (source_start, source_end) = clamp_source_range(layer.source_start, layer.source_end, source_duration);
        let clip_duration = source_end - source_start;

        let (timeline_start, timeline_end) = match (layer.timeline_start, layer.timeline_end) {
            (Some(start), Some(end)) => (start, end),
            (Some(start), None) => (start, start + clip_duration),
            _ => {
                let start = cursor;
                (start, start + clip_duration)
            }
        };

        cursor = cursor.max(timeline_end);

        resolved.push(ResolvedLayer {
            id: layer.id.clone(),
            path: layer.source_path.clone(),
            order: layer.order,
            timeline_start,
            timeline_end,
            source_start,
            source_end,
        });
    }

    resolved
}

/// Build the flat visibility map: at every point in time, the
/// lowest-`order` layer covering it wins. Adjacent same-video runs with a
/// gap under [`MERGE_GAP_TOLERANCE`] are merged.
fn build_visibility_map(layers: &[ResolvedLayer]) -> Vec<VisibilitySegment> {
    if layers.is_empty() {
        return Vec::new();
    }

    let mut boundaries: Vec<f64> = layers
        .iter()
        .flat_map(|l| [l.timeline_start, l.timeline_end])
        .collect();
    boundaries.sort_by(|a, b| a.partial_cmp(b).unwrap());
    boundaries.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);

    let mut video_index = HashMap::new();
    let mut next_index = 0u32;

    let mut raw = Vec::new();
    for window in boundaries.windows(2) {
        let (start, end) = (window[0], window[1]);
        if end <= start {
            continue;
        }
        let mid = (start + end) / 2.0;
        let winner = layers
            .iter()
            .filter(|l| mid >= l.timeline_start && mid < l.timeline_end)
            .min_by_key(|l| l.order);

        if let Some(layer) = winner {
            let index = *video_index.entry(layer.id.clone()).or_insert_with(|| {
                let i = next_index;
                next_index += 1;
                i
            });

            let offset_into_layer = start - layer.timeline_start;
            let source_start = layer.source_start + offset_into_layer;
            let source_end = source_start + (end - start);

            raw.push(VisibilitySegment {
                video_id: layer.id.clone(),
                video_path: layer.path.clone(),
                timeline_start: start,
                timeline_end: end,
                source_start,
                source_end,
                video_index: index,
            });
        }
    }

    merge_visibility_segments(raw)
}

fn merge_visibility_segments(segments: Vec<VisibilitySegment>) -> Vec<VisibilitySegment> {
    let mut merged: Vec<VisibilitySegment> = Vec::with_capacity(segments.len());

    for seg in segments {
        if let Some(last) = merged.last_mut() {
            let contiguous = last.video_id == seg.video_id
                && (seg.timeline_start - last.timeline_end).abs() < MERGE_GAP_TOLERANCE;
            if contiguous {
                last.timeline_end = seg.timeline_end;
                last.source_end = seg.source_end;
                continue;
            }
        }
        merged.push(seg);
    }

    merged
}

/// Resolve every narration segment (video-local and generic) into one or
/// more placements, splitting at visibility-segment boundaries when a
/// segment with `extends_to_next_video` crosses into the next layer.
fn build_segment_placements(
    project: &Project,
    layers: &[ResolvedLayer],
    visibility: &[VisibilitySegment],
) -> Vec<SegmentPlacement> {
    let mut placements = Vec::new();

    for layer in layers {
        for segment in &layer.source_path_segments(project) {
            place_segment(segment, layer.timeline_start, visibility, &mut placements);
        }
    }

    for segment in &project.generic_segments {
        place_segment(segment, 0.0, visibility, &mut placements);
    }

    placements.sort_by(|a, b| a.timeline_start.partial_cmp(&b.timeline_start).unwrap());
    placements
}

impl ResolvedLayer {
    fn source_path_segments<'a>(&self, project: &'a Project) -> Vec<&'a NarrationSegment> {
        project
            .videos
            .iter()
            .find(|v| v.id == self.id)
            .map(|v| v.segments.iter().collect())
            .unwrap_or_default()
    }
}

fn place_segment(
    segment: &NarrationSegment,
    layer_timeline_start: f64,
    visibility: &[VisibilitySegment],
    out: &mut Vec<SegmentPlacement>,
) {
    let abs_start = layer_timeline_start + segment.start_time;
    let abs_end = layer_timeline_start + segment.end_time;

    let overlapping: Vec<&VisibilitySegment> = visibility
        .iter()
        .filter(|v| v.timeline_start < abs_end && v.timeline_end > abs_start)
        .collect();

    if overlapping.is_empty() {
        out.push(SegmentPlacement {
            segment_id: segment.id.clone(),
            original_video_id: None,
            timeline_start: abs_start,
            timeline_end: abs_end,
            audio_path: segment.audio_path.clone(),
            subtitle_path: segment.subtitle_path.clone(),
            is_continuation: false,
            continues_into_next: false,
            audio_offset: 0.0,
        });
        return;
    }

    let mut audio_offset = 0.0;
    for (i, v) in overlapping.iter().enumerate() {
        let piece_start = abs_start.max(v.timeline_start);
        let piece_end = abs_end.min(v.timeline_end);
        if piece_end <= piece_start {
            continue;
        }

        out.push(SegmentPlacement {
            segment_id: segment.id.clone(),
            original_video_id: Some(v.video_id.clone()),
            timeline_start: piece_start,
            timeline_end: piece_end,
            audio_path: segment.audio_path.clone(),
            subtitle_path: segment.subtitle_path.clone(),
            is_continuation: i > 0,
            continues_into_next: segment.extends_to_next_video && i + 1 < overlapping.len(),
            audio_offset,
        });

        audio_offset += piece_end - piece_start;
    }
}

fn build_bgm_placements(
    tracks: &[BgmTrack],
    total_duration: f64,
    bgm_source_durations: &BgmSourceDurations,
) -> Vec<BgmPlacement> {
    tracks
        .iter()
        .filter(|t| !t.muted)
        .map(|t| {
            let end_time = if t.end_time > 0.0 { t.end_time } else { total_duration };
            let duration = (end_time - t.start_time).max(0.0);
            let needs_loop = t.loop_;
            let loop_count = if !needs_loop {
                0
            } else {
                let source_duration = bgm_source_durations.get(&t.id).copied().unwrap_or(0.0);
                if source_duration > 0.0 {
                    (duration / source_duration).ceil().max(1.0) as u32
                } else {
                    1
                }
            };
            BgmPlacement {
                track_id: t.id.clone(),
                track_path: t.path.clone(),
                timeline_start: t.start_time,
                timeline_end: end_time,
                volume: t.volume,
                fade_in: t.fade_in,
                fade_out: t.fade_out,
                needs_loop,
                loop_count,
                audio_offset: t.audio_offset,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vclip_models::{BgmTrackId, SegmentId, VideoLayerId};

    fn layer(id: &str, order: i32, start: Option<f64>, end: Option<f64>, src_end: f64) -> VideoLayer {
        VideoLayer {
            id: VideoLayerId::from(id),
            name: id.to_string(),
            source_path: format!("{id}.mp4"),
            order,
            timeline_start: start,
            timeline_end: end,
            source_start: 0.0,
            source_end: src_end,
            segments: Vec::new(),
        }
    }

    #[test]
    fn sequential_layout_sums_prior_durations() {
        let videos = vec![layer("a", 0, None, None, 5.0), layer("b", 1, None, None, 3.0)];
        let mut durations = SourceDurations::new();
        durations.insert(VideoLayerId::from("a"), 5.0);
        durations.insert(VideoLayerId::from("b"), 3.0);

        let project = Project {
            name: "p".to_string(),
            videos,
            generic_segments: Vec::new(),
            bgm_tracks: Vec::new(),
            global_tts_volume: 100.0,
            global_bgm_volume: 100.0,
        };

        let compositor = LayerCompositor::build(&project, &durations, &BgmSourceDurations::new());
        assert!((compositor.total_duration() - 8.0).abs() < 1e-6);
    }

    #[test]
    fn lower_order_wins_overlap() {
        let videos = vec![
            layer("a", 1, Some(0.0), Some(10.0), 10.0),
            layer("b", 0, Some(4.0), Some(6.0), 10.0),
        ];
        let mut durations = SourceDurations::new();
        durations.insert(VideoLayerId::from("a"), 10.0);
        durations.insert(VideoLayerId::from("b"), 10.0);

        let project = Project {
            name: "p".to_string(),
            videos,
            generic_segments: Vec::new(),
            bgm_tracks: Vec::new(),
            global_tts_volume: 100.0,
            global_bgm_volume: 100.0,
        };

        let compositor = LayerCompositor::build(&project, &durations, &BgmSourceDurations::new());
        let at_five = compositor.get_visible_video_at(5.0).unwrap();
        assert_eq!(at_five.video_path, "b.mp4");
    }

    #[test]
    fn clamp_source_range_enforces_min_gap() {
        let (start, end) = clamp_source_range(5.0, 5.0, 10.0);
        assert!(end - start >= MIN_SOURCE_GAP - 1e-9);
    }

    #[test]
    fn bgm_placement_inherits_total_duration_when_end_time_zero() {
        let tracks = vec![BgmTrack {
            id: BgmTrackId::new(),
            path: "bgm.mp3".to_string(),
            start_time: 0.0,
            end_time: 0.0,
            volume: 50.0,
            fade_in: 0.0,
            fade_out: 0.0,
            loop_: false,
            muted: false,
            audio_offset: 0.0,
        }];
        let placements = build_bgm_placements(&tracks, 42.0, &BgmSourceDurations::new());
        assert!((placements[0].timeline_end - 42.0).abs() < 1e-9);
    }

    #[test]
    fn bgm_loop_count_derives_from_actual_source_duration() {
        let track_id = BgmTrackId::new();
        let tracks = vec![BgmTrack {
            id: track_id.clone(),
            path: "bgm.mp3".to_string(),
            start_time: 0.0,
            end_time: 100.0,
            volume: 50.0,
            fade_in: 0.0,
            fade_out: 0.0,
            loop_: true,
            muted: false,
            audio_offset: 0.0,
        }];
        let mut source_durations = BgmSourceDurations::new();
        source_durations.insert(track_id, 8.0);

        let placements = build_bgm_placements(&tracks, 100.0, &source_durations);
        assert_eq!(placements[0].loop_count, 13);
    }

    #[test]
    fn generic_segment_splits_across_visibility_boundary() {
        let videos = vec![layer("a", 0, Some(0.0), Some(5.0), 5.0), layer("b", 1, Some(5.0), Some(10.0), 5.0)];
        let mut durations = SourceDurations::new();
        durations.insert(VideoLayerId::from("a"), 5.0);
        durations.insert(VideoLayerId::from("b"), 5.0);

        let mut project = Project {
            name: "p".to_string(),
            videos,
            generic_segments: Vec::new(),
            bgm_tracks: Vec::new(),
            global_tts_volume: 100.0,
            global_bgm_volume: 100.0,
        };
        project.generic_segments.push(NarrationSegment {
            id: SegmentId::new(),
            start_time: 3.0,
            end_time: 7.0,
            text: "spans the cut".to_string(),
            language: "en".to_string(),
            voice_id: "v1".to_string(),
            voice_sample_id: None,
            rate: 100.0,
            volume: 100.0,
            pitch: 0.0,
            audio_path: None,
            subtitle_path: None,
            subtitle_enabled: true,
            style: Default::default(),
            extends_to_next_video: true,
        });

        let compositor = LayerCompositor::build(&project, &durations, &BgmSourceDurations::new());
        assert_eq!(compositor.segment_placements().len(), 2);
        assert!(compositor.segment_placements()[1].is_continuation);
    }
}
