//! FFmpeg filter-graph fragment builders for the Layer Compositor and
//! Export Pipeline. These are data-only string builders; they carry no
//! subprocess or I/O concerns.

use crate::command::escape_filter_path;
use crate::volume::percent_to_db;

/// Video trim to `[start, end)` with timestamps reset to zero, so the
/// extracted clip starts at PTS 0 regardless of where it sat in the source.
pub fn trim_reset_pts(label_in: &str, label_out: &str, start: f64, end: f64) -> String {
    format!(
        "[{label_in}]trim=start={start:.6}:end={end:.6},setpts=PTS-STARTPTS[{label_out}]"
    )
}

/// Audio counterpart of [`trim_reset_pts`].
pub fn atrim_reset_pts(label_in: &str, label_out: &str, start: f64, end: f64) -> String {
    format!(
        "[{label_in}]atrim=start={start:.6}:end={end:.6},asetpts=PTS-STARTPTS[{label_out}]"
    )
}

/// Scale a visibility segment's source frame to the output canvas:
/// scale down/up preserving aspect ratio, pad to center, normalize frame
/// rate and sample aspect ratio so concatenated segments agree on format.
pub fn scale_pad_fps_setsar(label_in: &str, label_out: &str, width: u32, height: u32, fps: f64) -> String {
    format!(
        "[{label_in}]scale={width}:{height}:force_original_aspect_ratio=decrease,\
         pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,fps={fps},setsar=1[{label_out}]"
    )
}

/// Burn an ASS subtitle file into the video stream via the `ass` filter.
pub fn ass_burn_filter(subtitle_path: &str) -> String {
    format!("ass={}", escape_filter_path(subtitle_path))
}

/// Build the BGM mix filter-graph fragment: volume gain, optional loop to
/// cover the output duration, optional fade-in, fade-out, trim to duration,
/// optional delay to the track's timeline position, then mixed with the
/// dialogue track. Ported from `add_background_music`'s filter_complex
/// construction in `ffmpeg_utils.py`. The intermediate pad is derived from
/// `output_label` so chaining several tracks in one `-filter_complex` (one
/// call per track, joined with `;`) never reuses a labeled output pad.
#[allow(clippy::too_many_arguments)]
pub fn bgm_mix_filter(
    dialogue_label: &str,
    bgm_label: &str,
    output_label: &str,
    bgm_volume_percent: f64,
    loop_count: u32,
    bgm_sample_rate: u32,
    fade_in_duration: f64,
    fade_out_start: f64,
    fade_out_duration: f64,
    delay_ms: u64,
    output_duration: f64,
) -> String {
    let gain_db = percent_to_db(bgm_volume_percent);
    let pre_mix_label = format!("{output_label}_pre");
    let mut chain = format!("[{bgm_label}]");

    if loop_count > 0 {
        chain.push_str(&format!(
            "aloop=loop={loop_count}:size={size},",
            size = (bgm_sample_rate as f64 * output_duration) as u64
        ));
    }

    if gain_db.is_finite() {
        chain.push_str(&format!("volume={gain_db:.4}dB,"));
    } else {
        chain.push_str("volume=0,");
    }

    if fade_in_duration > 0.0 {
        chain.push_str(&format!("afade=t=in:st=0:d={fade_in_duration:.3},"));
    }

    chain.push_str(&format!(
        "afade=t=out:st={fade_out_start:.3}:d={fade_out_duration:.3},atrim=duration={output_duration:.3}"
    ));

    if delay_ms > 0 {
        chain.push_str(&format!(",adelay={delay_ms}|{delay_ms}"));
    }

    chain.push_str(&format!("[{pre_mix_label}]"));

    format!(
        "{chain};[{dialogue_label}][{pre_mix_label}]amix=inputs=2:duration=first:dropout_transition=0[{output_label}]"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_reset_pts_has_expected_shape() {
        let f = trim_reset_pts("0:v", "seg0", 1.5, 4.25);
        assert_eq!(f, "[0:v]trim=start=1.500000:end=4.250000,setpts=PTS-STARTPTS[seg0]");
    }

    #[test]
    fn ass_burn_filter_escapes_colons() {
        let f = ass_burn_filter("/tmp/sub:1.ass");
        assert_eq!(f, "ass=/tmp/sub\\:1.ass");
    }

    #[test]
    fn bgm_mix_filter_mutes_at_zero_volume() {
        let f = bgm_mix_filter("dlg", "bgm", "out", 0.0, 0, 44100, 0.0, 10.0, 2.0, 0, 12.0);
        assert!(f.contains("volume=0,"));
    }

    #[test]
    fn bgm_mix_filter_loops_when_requested() {
        let f = bgm_mix_filter("dlg", "bgm", "out", 100.0, 3, 44100, 0.0, 10.0, 2.0, 0, 12.0);
        assert!(f.contains("aloop=loop=3"));
    }

    #[test]
    fn bgm_mix_filter_adds_fade_in_when_requested() {
        let f = bgm_mix_filter("dlg", "bgm", "out", 100.0, 0, 44100, 1.5, 10.0, 2.0, 0, 12.0);
        assert!(f.contains("afade=t=in:st=0:d=1.500"));
    }

    #[test]
    fn bgm_mix_filter_omits_fade_in_by_default() {
        let f = bgm_mix_filter("dlg", "bgm", "out", 100.0, 0, 44100, 0.0, 10.0, 2.0, 0, 12.0);
        assert!(!f.contains("afade=t=in"));
    }

    #[test]
    fn bgm_mix_filter_delays_track_to_its_timeline_position() {
        let f = bgm_mix_filter("dlg", "bgm", "out", 100.0, 0, 44100, 0.0, 10.0, 2.0, 3000, 12.0);
        assert!(f.contains("adelay=3000|3000"));
    }

    #[test]
    fn bgm_mix_filter_keeps_intermediate_pad_unique_per_output_label() {
        let a = bgm_mix_filter("dlg", "bgm0:a", "bgm0_mixed", 100.0, 0, 44100, 0.0, 10.0, 2.0, 0, 12.0);
        let b = bgm_mix_filter("bgm0_mixed", "bgm1:a", "bgm1_mixed", 100.0, 0, 44100, 0.0, 10.0, 2.0, 0, 12.0);
        assert!(!a.contains("bgm1_mixed_pre"));
        assert!(a.contains("bgm0_mixed_pre"));
        assert!(b.contains("bgm1_mixed_pre"));
    }
}
