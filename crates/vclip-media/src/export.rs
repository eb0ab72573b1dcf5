//! Export Pipeline (§4.5): the stage machine that drives the toolchain
//! adapter from a built [`LayerCompositor`] to a finished export. Ambient
//! execution model (iterate in timeline order, accumulate stage-local
//! progress) grounded in `vclip-worker`'s clip-processing loop; stage-
//! boundary cleanup via `scopeguard::guard`, the same idiom `vclip-api`
//! uses for its websocket connection counter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use vclip_models::{ExportConfig, Project, Quality, Stage, UserTier};

use crate::command::{video_encoder_args, EncoderSettings, FfmpegCommand, FfmpegRunner};
use crate::compositor::{BgmSourceDurations, LayerCompositor, SourceDurations};
use crate::config::RenderConfig;
use crate::error::{MediaError, MediaResult};
use crate::filters::{ass_burn_filter, atrim_reset_pts, bgm_mix_filter, scale_pad_fps_setsar, trim_reset_pts};
use crate::subtitle::{self, PlacementSubtitles, RenderPlatform};
use crate::tts_cache::{TtsCache, TtsRequest};
use crate::watermark::{apply_watermark, apply_watermark_if_available, WatermarkConfig};

/// External font installation boundary (§6). Failure is non-fatal.
#[async_trait]
pub trait FontProvider: Send + Sync {
    async fn ensure_font(&self, family_name: &str) -> bool;
}

/// A `FontProvider` that always reports success without installing
/// anything, for deployments where every font is already bundled.
pub struct NoopFontProvider;

#[async_trait]
impl FontProvider for NoopFontProvider {
    async fn ensure_font(&self, _family_name: &str) -> bool {
        true
    }
}

/// Fixed parameters for one export run.
pub struct ExportContext {
    pub job_id: String,
    pub work_dir: PathBuf,
    pub output_path: PathBuf,
    pub render_config: RenderConfig,
    pub quality: Quality,
    pub user_tier: UserTier,
    pub watermark: WatermarkConfig,
    pub output_width: u32,
    pub output_height: u32,
    pub output_fps: f64,
    pub platform: RenderPlatform,
}

/// Collaborators the pipeline needs but does not own.
pub struct ExportDeps<'a> {
    pub tts_cache: &'a TtsCache,
    pub font_provider: &'a dyn FontProvider,
    pub encoder: EncoderSettings,
}

/// One line of stage progress, handed to whatever reports it upstream
/// (the render worker's stdout protocol, §4.6).
pub type ProgressFn = dyn Fn(Stage, u8, &str) + Send + Sync;

fn temp_path(ctx: &ExportContext, name: &str) -> PathBuf {
    ctx.work_dir.join(format!("export_{}_{name}", ctx.job_id))
}

/// Per-segment style lookup, since [`SegmentPlacement`](vclip_models::SegmentPlacement)
/// carries a segment id but not its originating style.
fn segment_styles(project: &Project) -> std::collections::HashMap<vclip_models::SegmentId, vclip_models::SubtitleStyle> {
    let mut map = std::collections::HashMap::new();
    for video in &project.videos {
        for segment in &video.segments {
            map.insert(segment.id.clone(), segment.style.clone());
        }
    }
    for segment in &project.generic_segments {
        map.insert(segment.id.clone(), segment.style.clone());
    }
    map
}

async fn silent_audio_track(duration: f64, ctx: &ExportContext, temp_files: &mut Vec<PathBuf>) -> MediaResult<PathBuf> {
    let out = temp_path(ctx, &format!("silence_{:.3}.wav", duration));
    let cmd = FfmpegCommand::new("anullsrc=r=44100:cl=stereo", &out)
        .input_args(["-f", "lavfi"])
        .duration(duration)
        .output_args(["-c:a", "pcm_s16le"]);
    FfmpegRunner::new()
        .with_timeout(ctx.render_config.timeouts.segment)
        .run(&cmd)
        .await?;
    temp_files.push(out.clone());
    Ok(out)
}

/// **preprocessing**: give every referenced source video an audio stream,
/// muxing in a silent track where one is missing. Returns the path each
/// visibility segment should actually read from.
async fn preprocessing_stage(
    paths: &[String],
    ctx: &ExportContext,
    temp_files: &mut Vec<PathBuf>,
) -> MediaResult<std::collections::HashMap<String, PathBuf>> {
    let mut resolved = std::collections::HashMap::new();

    for path in paths {
        let has_audio = crate::probe::has_audio(path, ctx.render_config.timeouts.probe)
            .await
            .unwrap_or(true);

        if has_audio {
            resolved.insert(path.clone(), PathBuf::from(path));
            continue;
        }

        let duration = crate::probe::probe_duration(path, ctx.render_config.timeouts.probe).await?;
        let silence = silent_audio_track(duration, ctx, temp_files).await?;
        let muxed = temp_path(ctx, &format!("silenced_{}.mp4", sanitize_component(path)));

        let cmd = FfmpegCommand::new(path, &muxed)
            .output_args(["-i".to_string(), silence.to_string_lossy().into_owned()])
            .output_args(["-c:v", "copy", "-c:a", "aac", "-shortest"]);
        FfmpegRunner::new()
            .with_timeout(ctx.render_config.timeouts.segment)
            .run(&cmd)
            .await?;

        temp_files.push(muxed.clone());
        resolved.insert(path.clone(), muxed);
    }

    Ok(resolved)
}

fn sanitize_component(path: &str) -> String {
    path.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect()
}

/// **fonts**: best-effort install of every distinct declared font.
async fn fonts_stage(project: &Project, font_provider: &dyn FontProvider) {
    let mut seen = std::collections::HashSet::new();
    for video in &project.videos {
        for segment in &video.segments {
            if seen.insert(segment.style.font.clone()) && !font_provider.ensure_font(&segment.style.font).await {
                warn!(font = %segment.style.font, "font install failed, falling back to system default");
            }
        }
    }
    for segment in &project.generic_segments {
        if seen.insert(segment.style.font.clone()) && !font_provider.ensure_font(&segment.style.font).await {
            warn!(font = %segment.style.font, "font install failed, falling back to system default");
        }
    }
}

/// **tts**: fill in any missing `audio_path`/`subtitle_path` on a cloned
/// project, synthesising through the cache. The caller persists the
/// returned project so later renders are warm-cached.
async fn tts_stage(mut project: Project, tts_cache: &TtsCache) -> MediaResult<Project> {
    for video in &mut project.videos {
        for segment in &mut video.segments {
            if segment.audio_path.is_some() {
                continue;
            }
            let request = TtsRequest {
                text: segment.text.clone(),
                voice_id: segment.voice_id.clone(),
                language: segment.language.clone(),
                rate: segment.rate,
                volume: segment.volume,
                pitch: segment.pitch,
                voice_sample_id: segment.voice_sample_id.clone(),
            };
            let entry = tts_cache.get_or_synthesise(&request).await?;
            segment.audio_path = Some(entry.audio_path.to_string_lossy().to_string());
            segment.subtitle_path = Some(entry.subtitle_path.to_string_lossy().to_string());
        }
    }
    Ok(project)
}

/// **segments**: extract each visibility segment to a normalized,
/// keyframe-at-zero temp file.
async fn segments_stage(
    compositor: &LayerCompositor,
    source_paths: &std::collections::HashMap<String, PathBuf>,
    ctx: &ExportContext,
    temp_files: &mut Vec<PathBuf>,
) -> MediaResult<Vec<PathBuf>> {
    let mut outputs = Vec::new();

    for (i, seg) in compositor.visibility_segments().iter().enumerate() {
        if seg.duration() < 1.0 / ctx.output_fps {
            continue;
        }

        let source = source_paths
            .get(&seg.video_path)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(&seg.video_path));
        let out = temp_path(ctx, &format!("segment_{i}.mp4"));

        let video_filter = format!(
            "{};{}",
            trim_reset_pts("0:v", "trimmed", seg.source_start, seg.source_end),
            scale_pad_fps_setsar("trimmed", "vout", ctx.output_width, ctx.output_height, ctx.output_fps)
        );
        let audio_filter = atrim_reset_pts("0:a", "aout", seg.source_start, seg.source_end);

        let cmd = FfmpegCommand::new(&source, &out)
            .filter_complex(format!("{video_filter};{audio_filter}"))
            .output_args(["-map", "[vout]", "-map", "[aout]"])
            .output_args(video_encoder_args(&ctx_encoder_for(ctx)))
            .output_args(["-force_key_frames", "expr:eq(n,0)"]);

        FfmpegRunner::new()
            .with_timeout(ctx.render_config.timeouts.segment)
            .with_total_duration_secs(seg.duration())
            .run(&cmd)
            .await?;

        temp_files.push(out.clone());
        outputs.push(out);
    }

    Ok(outputs)
}

fn ctx_encoder_for(ctx: &ExportContext) -> EncoderSettings {
    // Software fallback used only for the segments stage's internal
    // normalization pass; the final export quality is applied by the
    // caller-supplied encoder at the combining/bgm/watermark stages.
    let _ = ctx.quality;
    EncoderSettings {
        codec: "libx264".to_string(),
        audio_bitrate: "192k".to_string(),
        profile: Some("high".to_string()),
        pix_fmt: "yuv420p".to_string(),
        crf: Some(18),
        preset: Some("veryfast".to_string()),
        encoder_args: Vec::new(),
    }
}

/// **combining**: concatenate segment outputs via the stream-copy concat
/// demuxer, falling back to a filter-graph concat on PTS drift.
async fn combining_stage(
    segment_outputs: &[PathBuf],
    ctx: &ExportContext,
    temp_files: &mut Vec<PathBuf>,
) -> MediaResult<PathBuf> {
    if segment_outputs.is_empty() {
        return Err(MediaError::InvalidInput("no segments to combine".to_string()));
    }

    let list_path = temp_path(ctx, "concat_list.txt");
    let mut list = String::new();
    for path in segment_outputs {
        list.push_str(&format!("file '{}'\n", crate::command::escape_concat_path(path)?));
    }
    tokio::fs::write(&list_path, list).await?;
    temp_files.push(list_path.clone());

    let combined = temp_path(ctx, "combined.mp4");
    let cmd = FfmpegCommand::new(&list_path, &combined)
        .input_args(["-f", "concat", "-safe", "0"])
        .output_args(["-c", "copy"]);

    FfmpegRunner::new()
        .with_timeout(ctx.render_config.timeouts.concat)
        .run(&cmd)
        .await?;

    let info = crate::probe::probe_video(&combined, ctx.render_config.timeouts.probe).await;
    if info.is_err() {
        warn!("stream-copy concat produced unreadable output, falling back to re-encode concat");
        let _ = tokio::fs::remove_file(&combined).await;
        return reencode_concat(segment_outputs, ctx, temp_files).await;
    }

    temp_files.push(combined.clone());
    Ok(combined)
}

async fn reencode_concat(segment_outputs: &[PathBuf], ctx: &ExportContext, temp_files: &mut Vec<PathBuf>) -> MediaResult<PathBuf> {
    let combined = temp_path(ctx, "combined_reencoded.mp4");

    // FfmpegCommand carries exactly one "primary" input (appended after
    // input_args, right before the output args); every other input must be
    // threaded through input_args so indices line up with the filtergraph.
    // The last segment becomes the primary; all others precede it.
    let (last, leading) = segment_outputs.split_last().expect("non-empty, checked by caller");
    let mut inputs = Vec::new();
    let mut filter = String::new();
    for path in leading {
        inputs.push("-i".to_string());
        inputs.push(path.to_string_lossy().to_string());
    }
    for i in 0..segment_outputs.len() {
        filter.push_str(&format!("[{i}:v][{i}:a]"));
    }
    filter.push_str(&format!("concat=n={}:v=1:a=1[vout][aout]", segment_outputs.len()));

    let cmd = FfmpegCommand::new(last, &combined)
        .input_args(inputs)
        .filter_complex(filter)
        .output_args(["-map", "[vout]", "-map", "[aout]"]);

    FfmpegRunner::new()
        .with_timeout(ctx.render_config.timeouts.concat)
        .run(&cmd)
        .await
        .map_err(|e| MediaError::StreamCopyConcatFailed(e.to_string()))?;

    temp_files.push(combined.clone());
    Ok(combined)
}

/// The combined video's own internal t=0 sits at the first visibility
/// segment's timeline start, not at the project timeline's t=0. Every
/// audio track placed relative to the project timeline (voiceover, BGM)
/// needs this subtracted before it can be expressed as a delay against
/// the combined video.
fn video_start_offset(compositor: &LayerCompositor) -> f64 {
    compositor.visibility_segments().first().map(|s| s.timeline_start).unwrap_or(0.0)
}

/// **voiceover**: mix every segment placement's narration audio into the
/// combined video at its timeline offset.
async fn voiceover_stage(
    combined: &Path,
    compositor: &LayerCompositor,
    ctx: &ExportContext,
    temp_files: &mut Vec<PathBuf>,
) -> MediaResult<PathBuf> {
    let placements: Vec<_> = compositor
        .segment_placements()
        .iter()
        .filter(|p| p.audio_path.is_some())
        .collect();

    if placements.is_empty() {
        return Ok(combined.to_path_buf());
    }

    let out = temp_path(ctx, "with_voiceover.mp4");
    let video_start_offset = video_start_offset(compositor);

    // Narration tracks precede the combined video in input order (indices
    // 0..N-1); the video itself is the primary input, so it lands at index
    // N once FfmpegCommand appends it after input_args.
    let mut inputs = Vec::new();
    let mut voice_filters = Vec::new();
    let mut voice_labels = Vec::new();

    for (i, placement) in placements.iter().enumerate() {
        let audio_path = placement.audio_path.as_ref().unwrap();
        inputs.push("-i".to_string());
        inputs.push(audio_path.clone());

        let delay_ms = ((placement.timeline_start - video_start_offset) * 1000.0).max(0.0) as u64;
        let label = format!("voice{i}");
        voice_filters.push(format!(
            "[{i}:a]atrim=start={:.3}:duration={:.3},asetpts=PTS-STARTPTS,volume=6dB,adelay={delay_ms}|{delay_ms}[{label}]",
            placement.audio_offset,
            placement.duration(),
        ));
        voice_labels.push(label);
    }

    let video_index = placements.len();
    let mix_inputs: String = std::iter::once(format!("[{video_index}:a]volume=0.7[origaudio]"))
        .chain(voice_filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(";");

    let amix_sources: String = std::iter::once("[origaudio]".to_string())
        .chain(voice_labels.iter().map(|l| format!("[{l}]")))
        .collect();

    let filter = format!(
        "{mix_inputs};{amix_sources}amix=inputs={}:duration=first:dropout_transition=0[aout]",
        voice_labels.len() + 1
    );

    let cmd = FfmpegCommand::new(combined, &out)
        .input_args(inputs)
        .filter_complex(filter)
        .output_args(["-map", &format!("{video_index}:v"), "-map", "[aout]", "-c:v", "copy"]);

    FfmpegRunner::new()
        .with_timeout(ctx.render_config.timeouts.overall)
        .run(&cmd)
        .await?;

    temp_files.push(out.clone());
    Ok(out)
}

/// **subtitles**: build the combined ASS file from every placement with a
/// subtitle, then burn it in.
async fn subtitles_stage(
    video: &Path,
    project: &Project,
    compositor: &LayerCompositor,
    ctx: &ExportContext,
    temp_files: &mut Vec<PathBuf>,
) -> MediaResult<PathBuf> {
    let styles_by_segment = segment_styles(project);

    // Collect owned (short_id, style, cues) triples first so PlacementSubtitles
    // can borrow from a Vec that outlives the `combine` call below.
    let mut owned = Vec::new();

    for placement in compositor.segment_placements() {
        let Some(subtitle_path) = &placement.subtitle_path else { continue };
        let Some(style) = styles_by_segment.get(&placement.segment_id) else { continue };
        let contents = match tokio::fs::read_to_string(subtitle_path).await {
            Ok(c) => c,
            Err(_) => {
                warn!(path = %subtitle_path, "subtitle file missing, skipping placement");
                continue;
            }
        };

        let is_ass = subtitle_path.ends_with(".ass");
        let cues = if is_ass {
            subtitle::parse_ass_dialogues(&contents)
        } else {
            subtitle::parse_srt(&contents)
        };

        let shifted: Vec<_> = cues
            .into_iter()
            .filter_map(|mut c| {
                c.start = (c.start - placement.audio_offset + placement.timeline_start).max(placement.timeline_start);
                c.end = (c.end - placement.audio_offset + placement.timeline_start).min(placement.timeline_end);
                (c.end > c.start).then_some(c)
            })
            .collect();

        if !shifted.is_empty() {
            owned.push((placement.segment_id.to_string(), style.clone(), shifted));
        }
    }

    if owned.is_empty() {
        return Ok(video.to_path_buf());
    }

    let placements_subs: Vec<PlacementSubtitles> = owned
        .iter()
        .map(|(short_id, style, cues)| PlacementSubtitles {
            short_id: short_id.as_str(),
            style,
            cues: cues.clone(),
        })
        .collect();

    let combined_ass = subtitle::combine(ctx.output_width, ctx.output_height, ctx.platform, &placements_subs);
    let ass_path = temp_path(ctx, "combined_subtitles.ass");
    tokio::fs::write(&ass_path, combined_ass).await?;
    temp_files.push(ass_path.clone());

    let out = temp_path(ctx, "with_subtitles.mp4");
    let cmd = FfmpegCommand::new(video, &out)
        .video_filter(ass_burn_filter(&ass_path.to_string_lossy()))
        .output_args(["-c:a", "copy"]);

    FfmpegRunner::new()
        .with_timeout(ctx.render_config.timeouts.overall)
        .run(&cmd)
        .await?;

    temp_files.push(out.clone());
    Ok(out)
}

/// **bgm**: mix zero, one, or many background tracks into the export.
async fn bgm_stage(
    video: &Path,
    compositor: &LayerCompositor,
    ctx: &ExportContext,
    temp_files: &mut Vec<PathBuf>,
) -> MediaResult<PathBuf> {
    let tracks = compositor.bgm_placements();
    if tracks.is_empty() {
        return Ok(video.to_path_buf());
    }

    let out = temp_path(ctx, "with_bgm.mp4");
    let video_start_offset = video_start_offset(compositor);

    // BGM tracks precede the video in input order (indices 0..N-1); the
    // video is the primary input and lands at index N.
    let mut inputs = Vec::new();
    let mut chains = Vec::new();
    let mut labels = Vec::new();
    let mut dialogue_label = "origaudio".to_string();

    for (i, track) in tracks.iter().enumerate() {
        inputs.push("-i".to_string());
        inputs.push(track.track_path.clone());

        let label = format!("bgm{i}_mixed");
        let fade_out_start = (track.duration() - track.fade_out).max(0.0);
        let delay_ms = ((track.timeline_start - video_start_offset) * 1000.0).max(0.0) as u64;
        let filter = bgm_mix_filter(
            &dialogue_label,
            &format!("{i}:a"),
            &label,
            track.volume,
            track.loop_count,
            44100,
            track.fade_in,
            fade_out_start,
            track.fade_out,
            delay_ms,
            track.duration(),
        );
        chains.push(filter);
        dialogue_label = label.clone();
        labels.push(label);
    }

    let video_index = tracks.len();
    let filter = format!("[{video_index}:a]anull[origaudio];{}", chains.join(";"));

    let cmd = FfmpegCommand::new(video, &out)
        .input_args(inputs)
        .filter_complex(filter)
        .output_args([
            "-map",
            &format!("{video_index}:v"),
            "-map",
            &format!("[{}]", labels.last().unwrap()),
            "-c:v",
            "copy",
        ]);

    FfmpegRunner::new()
        .with_timeout(ctx.render_config.timeouts.bgm_mix)
        .run(&cmd)
        .await?;

    temp_files.push(out.clone());
    Ok(out)
}

/// Drive the full stage machine and return the final output path.
/// Temp artifacts registered during any stage are removed on every exit
/// path, success or failure.
pub async fn run_export(
    mut project: Project,
    source_durations: SourceDurations,
    bgm_source_durations: BgmSourceDurations,
    config: &ExportConfig,
    ctx: &ExportContext,
    deps: &ExportDeps<'_>,
    on_progress: &ProgressFn,
) -> MediaResult<PathBuf> {
    let mut temp_files = scopeguard::guard(Vec::<PathBuf>::new(), |paths| {
        for path in paths {
            let _ = std::fs::remove_file(&path);
        }
    });

    on_progress(Stage::Preprocessing, 0, "normalizing source audio");
    let provisional_compositor = LayerCompositor::build(&project, &source_durations, &bgm_source_durations);
    let unique_paths = provisional_compositor.get_unique_video_paths();
    let resolved_sources = preprocessing_stage(&unique_paths, ctx, &mut temp_files).await?;

    on_progress(Stage::Fonts, 5, "ensuring fonts");
    fonts_stage(&project, deps.font_provider).await;

    on_progress(Stage::Tts, 10, "synthesising narration");
    project = tts_stage(project, deps.tts_cache).await?;

    let compositor = LayerCompositor::build(&project, &source_durations, &bgm_source_durations);

    on_progress(Stage::Segments, 20, "extracting visibility segments");
    let segment_outputs = segments_stage(&compositor, &resolved_sources, ctx, &mut temp_files).await?;

    on_progress(Stage::Combining, 45, "combining segments");
    let combined = combining_stage(&segment_outputs, ctx, &mut temp_files).await?;

    on_progress(Stage::Voiceover, 60, "mixing voiceover");
    let with_voiceover = voiceover_stage(&combined, &compositor, ctx, &mut temp_files).await?;

    let with_subtitles = if config.include_subtitles {
        on_progress(Stage::Subtitles, 75, "burning subtitles");
        subtitles_stage(&with_voiceover, &project, &compositor, ctx, &mut temp_files).await?
    } else {
        with_voiceover
    };

    on_progress(Stage::Bgm, 85, "mixing background music");
    let with_bgm = bgm_stage(&with_subtitles, &compositor, ctx, &mut temp_files).await?;

    on_progress(Stage::Watermark, 95, "applying watermark");
    if ctx.user_tier.requires_watermark() {
        apply_watermark(&with_bgm, &ctx.watermark, &deps.encoder, ctx.render_config.timeouts.overall).await?;
    } else {
        let _ = apply_watermark_if_available(&with_bgm, &ctx.watermark, &deps.encoder, ctx.render_config.timeouts.overall).await;
    }

    tokio::fs::rename(&with_bgm, &ctx.output_path).await?;
    info!(output = %ctx.output_path.display(), "export complete");
    on_progress(Stage::Done, 100, "done");

    Ok(ctx.output_path.clone())
}

#[allow(dead_code)]
fn assert_font_provider_object_safe(_p: Arc<dyn FontProvider>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_font_provider_always_succeeds() {
        assert!(NoopFontProvider.ensure_font("Roboto").await);
    }

    #[test]
    fn sanitize_component_strips_path_separators() {
        assert_eq!(sanitize_component("/tmp/a b.mp4"), "_tmp_a_b_mp4");
    }
}
