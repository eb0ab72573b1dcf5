//! Subtitle Engine (§4.2): ASS style-line generation, SRT/ASS timing
//! adjustment, and combining per-placement cues into one ASS file for the
//! final burn-in. Grounded in `SubtitleUtils`
//! (`examples/original_source/backend/subtitle_utils.py`) and
//! `_create_combined_ass_file` in `export_pipeline.py`.

use vclip_models::SubtitleStyle;

/// Reference resolution (height) the original's scaling constants were
/// authored against; style metrics scale as `value * play_res_y /
/// REFERENCE_PLAYRES_HEIGHT`.
pub const REFERENCE_PLAYRES_HEIGHT: f64 = 288.0;

/// One subtitle cue with absolute timeline start/end, already shifted.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Which platform the encoder ultimately runs on, used only to resolve the
/// fallback for unmapped private font names. Read from adapter config, not
/// `cfg(target_os)`, since the encoder may run on a different host than
/// the Rust process in containerized deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPlatform {
    MacOs,
    Other,
}

/// Resolve a platform-private font name (dot-prefixed, or a known Apple
/// face) to a portable equivalent.
pub fn resolve_font(name: &str, platform: RenderPlatform) -> String {
    match name {
        ".Apple SD Gothic NeoI" | "Apple SD Gothic Neo" => "Apple SD Gothic Neo".to_string(),
        ".AppleSystemUIFont" | ".SF NS" | ".SF NS Text" | ".SF NS Display" => match platform {
            RenderPlatform::MacOs => "Helvetica Neue".to_string(),
            RenderPlatform::Other => "Arial".to_string(),
        },
        ".Helvetica Neue DeskInterface" | "Helvetica Neue" | "Helvetica" => "Helvetica Neue".to_string(),
        other if other.starts_with('.') => match platform {
            RenderPlatform::MacOs => "Helvetica Neue".to_string(),
            RenderPlatform::Other => "Arial".to_string(),
        },
        other => other.to_string(),
    }
}

fn scale(value: f64, play_res_y: f64) -> f64 {
    value * play_res_y / REFERENCE_PLAYRES_HEIGHT
}

/// Render the 23-field `Style:` line for one named style, scaled for the
/// output resolution. Field order and the fixed (non-overridable) values
/// match `SubtitleUtils.create_custom_ass_style`'s `default_style` dict.
pub fn apply_style(name: &str, style: &SubtitleStyle, platform: RenderPlatform, play_res_y: f64) -> String {
    let font = resolve_font(&style.font, platform);
    let font_size = scale(style.size, play_res_y);
    let outline = scale(style.outline_width, play_res_y);
    let shadow = scale(style.shadow, play_res_y);
    let margin_v = scale(style.position, play_res_y);

    format!(
        "Style: {name},{font},{fontsize:.0},{primary},&H000000FF,{outline_colour},{shadow_colour},\
         -1,0,0,0,100,100,0,0,{border_style},{outline:.2},{shadow:.2},2,10,10,{margin_v:.0},0",
        name = name,
        font = font,
        fontsize = font_size,
        primary = style.primary_color,
        outline_colour = style.outline_color,
        shadow_colour = style.shadow_color,
        border_style = style.border_style,
        outline = outline,
        shadow = shadow,
        margin_v = margin_v,
    )
}

fn parse_srt_time(s: &str) -> Option<f64> {
    let s = s.trim().replace(',', ".");
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn format_srt_time(mut seconds: f64) -> String {
    if seconds < 0.0 {
        seconds = 0.0;
    }
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds % 3600.0) / 60.0) as u64;
    let secs = seconds % 60.0;
    format!("{hours:02}:{minutes:02}:{secs:06.3}").replace('.', ",")
}

fn parse_ass_time(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn format_ass_time(mut seconds: f64) -> String {
    if seconds < 0.0 {
        seconds = 0.0;
    }
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds % 3600.0) / 60.0) as u64;
    let secs = seconds % 60.0;
    format!("{hours}:{minutes:02}:{secs:05.2}")
}

/// Render one `.srt` block (`index`, timing line, text, trailing blank
/// line) for `cue`.
pub fn format_srt_cue(index: usize, cue: &Cue) -> String {
    format!(
        "{index}\n{} --> {}\n{}\n\n",
        format_srt_time(cue.start),
        format_srt_time(cue.end),
        cue.text
    )
}

/// Shift every cue's start/end by `-audio_offset`, dropping cues that end
/// at or before zero and clamping the rest to `[0, new_duration)`. Ported
/// from `_adjust_srt_timing`/`_adjust_ass_timing`.
pub fn shift(content: &str, audio_offset: f64, new_duration: f64, is_ass: bool) -> Option<String> {
    if is_ass {
        shift_ass(content, audio_offset, new_duration)
    } else {
        shift_srt(content, audio_offset, new_duration)
    }
}

fn shift_srt(content: &str, audio_offset: f64, new_duration: f64) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    let mut out = Vec::new();
    let mut index = 1usize;
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i].trim();
        if !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()) && i + 1 < lines.len() {
            if let Some((start_str, end_str)) = lines[i + 1].split_once("-->") {
                if let (Some(start), Some(end)) = (parse_srt_time(start_str), parse_srt_time(end_str)) {
                    let new_start = start - audio_offset;
                    let new_end = end - audio_offset;

                    if new_end <= 0.0 || new_start >= new_duration {
                        i += 2;
                        while i < lines.len() && !lines[i].trim().is_empty() {
                            i += 1;
                        }
                        continue;
                    }

                    let clamped_start = new_start.max(0.0);
                    let clamped_end = new_end.min(new_duration);

                    out.push(index.to_string());
                    out.push(format!(
                        "{} --> {}",
                        format_srt_time(clamped_start),
                        format_srt_time(clamped_end)
                    ));
                    index += 1;
                    i += 2;
                    while i < lines.len() && !lines[i].trim().is_empty() {
                        out.push(lines[i].to_string());
                        i += 1;
                    }
                    out.push(String::new());
                    continue;
                }
            }
        }
        i += 1;
    }

    if out.is_empty() {
        None
    } else {
        Some(out.join("\n"))
    }
}

fn shift_ass(content: &str, audio_offset: f64, new_duration: f64) -> Option<String> {
    let mut out = Vec::new();

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Dialogue:") {
            let fields: Vec<&str> = rest.splitn(10, ',').collect();
            if fields.len() >= 3 {
                if let (Some(start), Some(end)) =
                    (parse_ass_time(fields[1]), parse_ass_time(fields[2]))
                {
                    let new_start = start - audio_offset;
                    let new_end = end - audio_offset;

                    if new_end <= 0.0 || new_start >= new_duration {
                        continue;
                    }

                    let clamped_start = new_start.max(0.0);
                    let clamped_end = new_end.min(new_duration);

                    let mut rebuilt = format!(
                        "Dialogue:{},{},{}",
                        fields[0],
                        format_ass_time(clamped_start),
                        format_ass_time(clamped_end)
                    );
                    for field in &fields[3..] {
                        rebuilt.push(',');
                        rebuilt.push_str(field);
                    }
                    out.push(rebuilt);
                    continue;
                }
            }
        }
        out.push(line.to_string());
    }

    Some(out.join("\n"))
}

/// Parse `.srt` blocks into cues.
pub fn parse_srt(content: &str) -> Vec<Cue> {
    let lines: Vec<&str> = content.lines().collect();
    let mut cues = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i].trim();
        if !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()) && i + 1 < lines.len() {
            if let Some((start_str, end_str)) = lines[i + 1].split_once("-->") {
                if let (Some(start), Some(end)) = (parse_srt_time(start_str), parse_srt_time(end_str)) {
                    i += 2;
                    let mut text_lines = Vec::new();
                    while i < lines.len() && !lines[i].trim().is_empty() {
                        text_lines.push(lines[i].trim());
                        i += 1;
                    }
                    cues.push(Cue {
                        start,
                        end,
                        text: text_lines.join("\\N"),
                    });
                    continue;
                }
            }
        }
        i += 1;
    }

    cues
}

/// Parse `Dialogue:` lines from an `.ass` file into cues. Splits on the
/// first 9 commas so commas embedded in the cue text are preserved.
pub fn parse_ass_dialogues(content: &str) -> Vec<Cue> {
    let mut cues = Vec::new();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Dialogue:") {
            let fields: Vec<&str> = rest.splitn(10, ',').collect();
            if fields.len() == 10 {
                if let (Some(start), Some(end)) = (parse_ass_time(fields[1]), parse_ass_time(fields[2])) {
                    cues.push(Cue {
                        start,
                        end,
                        text: fields[9].to_string(),
                    });
                }
            }
        }
    }
    cues
}

/// One placement's resolved style and cues, ready to be combined into one
/// ASS file for the final burn-in.
pub struct PlacementSubtitles<'a> {
    pub short_id: &'a str,
    pub style: &'a SubtitleStyle,
    pub cues: Vec<Cue>,
}

/// Combine multiple placements' subtitles into one ASS file, each
/// placement getting its own uniquely-named style. Ported from
/// `_create_combined_ass_file`.
pub fn combine(
    output_width: u32,
    output_height: u32,
    platform: RenderPlatform,
    placements: &[PlacementSubtitles],
) -> String {
    let play_res_y = output_height as f64;
    let mut seen_names = std::collections::HashSet::new();
    let mut style_lines = Vec::new();
    let mut dialogue_lines = Vec::new();

    for (n, placement) in placements.iter().enumerate() {
        let mut style_name = format!("Seg{n}");
        if !seen_names.insert(style_name.clone()) {
            style_name = format!("Seg{n}_{}", placement.short_id);
            seen_names.insert(style_name.clone());
        }

        style_lines.push(apply_style(&style_name, placement.style, platform, play_res_y));

        for cue in &placement.cues {
            dialogue_lines.push(format!(
                "Dialogue: 0,{},{},{},,0,0,0,,{}",
                format_ass_time(cue.start),
                format_ass_time(cue.end),
                style_name,
                cue.text
            ));
        }
    }

    let mut out = String::new();
    out.push_str("[Script Info]\n");
    out.push_str("ScriptType: v4.00+\n");
    out.push_str(&format!("PlayResX: {output_width}\n"));
    out.push_str(&format!("PlayResY: {output_height}\n\n"));
    out.push_str("[V4+ Styles]\n");
    out.push_str("Format: Name,Fontname,Fontsize,PrimaryColour,SecondaryColour,OutlineColour,BackColour,Bold,Italic,Underline,StrikeOut,ScaleX,ScaleY,Spacing,Angle,BorderStyle,Outline,Shadow,Alignment,MarginL,MarginR,MarginV,Encoding\n");
    for line in &style_lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out.push_str("[Events]\n");
    out.push_str("Format: Layer,Start,End,Style,Name,MarginL,MarginR,MarginV,Effect,Text\n");
    for line in &dialogue_lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn style() -> SubtitleStyle {
        SubtitleStyle::default()
    }

    #[test]
    fn apply_style_emits_23_fields_after_style_tag() {
        let line = apply_style("Default", &style(), RenderPlatform::Other, REFERENCE_PLAYRES_HEIGHT);
        let rest = line.strip_prefix("Style: ").unwrap();
        assert_eq!(rest.split(',').count(), 23);
    }

    #[test]
    fn apply_style_scales_with_resolution() {
        let unscaled = apply_style("Default", &style(), RenderPlatform::Other, REFERENCE_PLAYRES_HEIGHT);
        let scaled = apply_style("Default", &style(), RenderPlatform::Other, REFERENCE_PLAYRES_HEIGHT * 2.0);
        assert_ne!(unscaled, scaled);
    }

    #[test]
    fn resolve_font_maps_private_apple_names() {
        assert_eq!(resolve_font(".AppleSystemUIFont", RenderPlatform::MacOs), "Helvetica Neue");
        assert_eq!(resolve_font(".AppleSystemUIFont", RenderPlatform::Other), "Arial");
        assert_eq!(resolve_font("Roboto", RenderPlatform::Other), "Roboto");
    }

    #[test]
    fn shift_srt_drops_cues_ending_before_zero() {
        let srt = "1\n00:00:01,000 --> 00:00:02,000\nHello\n\n2\n00:00:10,000 --> 00:00:12,000\nLater\n";
        let shifted = shift(srt, 5.0, 20.0, false).unwrap();
        assert!(!shifted.contains("Hello"));
        assert!(shifted.contains("Later"));
    }

    #[test]
    fn shift_srt_clamps_to_new_duration() {
        let srt = "1\n00:00:01,000 --> 00:00:09,000\nHello\n\n";
        let shifted = shift(srt, 0.0, 5.0, false).unwrap();
        assert!(shifted.contains("00:00:05,000"));
    }

    #[test]
    fn shift_ass_preserves_non_dialogue_lines() {
        let ass = "[Script Info]\nPlayResY: 1920\nDialogue: 0,0:00:01.00,0:00:03.00,Default,,0,0,0,,Hi\n";
        let shifted = shift(ass, 0.0, 60.0, true).unwrap();
        assert!(shifted.contains("PlayResY: 1920"));
        assert!(shifted.contains("Dialogue"));
    }

    #[test]
    fn parse_srt_round_trips_basic_cue() {
        let srt = "1\n00:00:01,000 --> 00:00:02,500\nHello world\n\n";
        let cues = parse_srt(srt);
        assert_eq!(cues.len(), 1);
        assert!((cues[0].start - 1.0).abs() < 1e-6);
        assert!((cues[0].end - 2.5).abs() < 1e-6);
        assert_eq!(cues[0].text, "Hello world");
    }

    #[test]
    fn combine_assigns_unique_style_names() {
        let style = style();
        let placements = vec![
            PlacementSubtitles {
                short_id: "a1",
                style: &style,
                cues: vec![Cue { start: 0.0, end: 1.0, text: "one".to_string() }],
            },
            PlacementSubtitles {
                short_id: "b2",
                style: &style,
                cues: vec![Cue { start: 1.0, end: 2.0, text: "two".to_string() }],
            },
        ];
        let combined = combine(1080, 1920, RenderPlatform::Other, &placements);
        assert!(combined.contains("PlayResX: 1080"));
        assert!(combined.contains("Style: Seg0,"));
        assert!(combined.contains("Style: Seg1,"));
    }
}
