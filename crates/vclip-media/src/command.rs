//! FFmpeg command builder, runner, hardware-encoder detection and quality
//! presets, grounded in `FFmpegUtils` (`examples/original_source/backend/ffmpeg_utils.py`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, instrument, warn};
use vclip_models::Quality;

use crate::error::{MediaError, MediaResult};
use crate::progress::FfmpegProgress;

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    input_args: Vec<String>,
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{:.3}", seconds))
    }

    pub fn duration(self, seconds: f64) -> Self {
        self.input_arg("-t").input_arg(format!("{:.3}", seconds))
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn filter_complex(self, filter: impl Into<String>) -> Self {
        self.output_arg("-filter_complex").output_arg(filter)
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        args.push("-progress".to_string());
        args.push("pipe:2".to_string());

        args.extend(self.input_args.clone());

        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        args.extend(self.output_args.clone());

        args.push(self.output.to_string_lossy().to_string());

        args
    }
}

/// Runner for FFmpeg commands with progress tracking, cancellation and a
/// stage-appropriate timeout.
pub struct FfmpegRunner {
    cancel_rx: Option<watch::Receiver<bool>>,
    timeout: Option<Duration>,
    /// Expected output duration, used to normalize `out_time_ms` into 0-100.
    total_duration_secs: Option<f64>,
    /// Minimum interval between progress callbacks (§5 backpressure rule).
    progress_interval: Duration,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self {
            cancel_rx: None,
            timeout: None,
            total_duration_secs: None,
            progress_interval: Duration::from_millis(500),
        }
    }

    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_total_duration_secs(mut self, secs: f64) -> Self {
        self.total_duration_secs = Some(secs);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        self.run_with_progress(cmd, |_| {}).await
    }

    /// Run an FFmpeg command. Stderr is captured to a temp file, never
    /// piped, so a long encode can't deadlock on a full pipe buffer; the
    /// file is tailed for the progress parser and, on failure, for the
    /// error's `stderr_tail`.
    #[instrument(skip(self, cmd, progress_callback))]
    pub async fn run_with_progress<F>(&self, cmd: &FfmpegCommand, progress_callback: F) -> MediaResult<()>
    where
        F: Fn(FfmpegProgress) + Send + 'static,
    {
        which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)?;

        let stderr_file = tempfile::NamedTempFile::new()?;
        let stderr_path = stderr_file.path().to_path_buf();

        let args = cmd.build_args();
        debug!(args = %args.join(" "), "running ffmpeg");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr_file.reopen()?)
            .spawn()?;

        let total_duration_secs = self.total_duration_secs;
        let progress_interval = self.progress_interval;
        let progress_handle = tokio::spawn(async move {
            tail_progress(&stderr_path, total_duration_secs, progress_interval, progress_callback).await;
        });

        let result = self.wait_for_completion(&mut child, &stderr_file).await;
        progress_handle.abort();

        result
    }

    async fn wait_for_completion(
        &self,
        child: &mut Child,
        stderr_file: &tempfile::NamedTempFile,
    ) -> MediaResult<()> {
        let wait_future = child.wait();

        let status = if let Some(timeout) = self.timeout {
            match tokio::time::timeout(timeout, wait_future).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(secs = timeout.as_secs(), "ffmpeg timed out, killing process");
                    let _ = child.kill().await;
                    return Err(MediaError::timeout("ffmpeg", timeout.as_secs()));
                }
            }
        } else {
            wait_future.await?
        };

        if let Some(ref cancel_rx) = self.cancel_rx {
            if *cancel_rx.borrow() {
                info!("ffmpeg cancelled, killing process");
                let _ = child.kill().await;
                return Err(MediaError::Cancelled);
            }
        }

        if status.success() {
            Ok(())
        } else {
            let tail = read_tail(stderr_file.path(), 20).await;
            Err(MediaError::ffmpeg_failed(
                "ffmpeg exited with non-zero status",
                tail,
                status.code(),
            ))
        }
    }
}

async fn tail_progress<F>(
    path: &Path,
    total_duration_secs: Option<f64>,
    min_interval: Duration,
    callback: F,
) where
    F: Fn(FfmpegProgress) + Send + 'static,
{
    let Ok(file) = tokio::fs::File::open(path).await else {
        return;
    };
    let mut reader = BufReader::new(file).lines();
    let mut current = FfmpegProgress::default();
    let mut last_emit = tokio::time::Instant::now() - min_interval;

    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if let Some(progress) = parse_progress_line(&line, &mut current) {
                    let now = tokio::time::Instant::now();
                    let is_final = progress.is_complete;
                    if is_final || now.duration_since(last_emit) >= min_interval {
                        last_emit = now;
                        let _ = total_duration_secs;
                        callback(progress);
                    }
                }
            }
            Ok(None) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(_) => break,
        }
    }
}

async fn read_tail(path: &Path, lines: usize) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let tail: Vec<&str> = contents.lines().rev().take(lines).collect();
    Some(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
}

/// Parse a progress line from FFmpeg's `-progress` output.
fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> Option<FfmpegProgress> {
    let line = line.trim();

    if let Some((key, value)) = line.split_once('=') {
        match key {
            "out_time_ms" | "out_time_us" => {
                if let Ok(us) = value.parse::<i64>() {
                    current.out_time_ms = if key == "out_time_us" { us / 1000 } else { us };
                }
            }
            "out_time" => current.out_time = value.to_string(),
            "frame" => {
                if let Ok(frame) = value.parse() {
                    current.frame = frame;
                }
            }
            "fps" => {
                if let Ok(fps) = value.parse() {
                    current.fps = fps;
                }
            }
            "speed" => {
                if value != "N/A" {
                    if let Some(speed_str) = value.strip_suffix('x') {
                        if let Ok(speed) = speed_str.trim().parse() {
                            current.speed = speed;
                        }
                    }
                }
            }
            "progress" => {
                if value == "end" {
                    current.is_complete = true;
                }
                return Some(current.clone());
            }
            _ => {}
        }
    }

    None
}

pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}

// ---------------------------------------------------------------------
// Hardware encoder detection and quality presets
// ---------------------------------------------------------------------

/// Priority order for hardware encoder detection, ported verbatim from
/// `FFmpegUtils.ENCODER_PRIORITY`.
const ENCODER_PRIORITY: &[&str] = &[
    "h264_videotoolbox",
    "h264_nvenc",
    "h264_qsv",
    "h264_amf",
    "h264_vaapi",
];

static DETECTED_ENCODER: OnceCell<Option<String>> = OnceCell::const_new();

/// Resolved encoder settings for one quality tier, software or hardware.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub codec: String,
    pub audio_bitrate: String,
    pub profile: Option<String>,
    pub pix_fmt: String,
    pub crf: Option<u8>,
    pub preset: Option<String>,
    pub encoder_args: Vec<String>,
}

fn software_preset(quality: Quality) -> EncoderSettings {
    let (crf, preset, audio_bitrate) = match quality {
        Quality::Lossless => (1, "veryslow", "320k"),
        Quality::High => (18, "slow", "256k"),
        Quality::Balanced => (23, "medium", "192k"),
    };
    EncoderSettings {
        codec: "libx264".to_string(),
        audio_bitrate: audio_bitrate.to_string(),
        profile: Some("high".to_string()),
        pix_fmt: "yuv420p".to_string(),
        crf: Some(crf),
        preset: Some(preset.to_string()),
        encoder_args: Vec::new(),
    }
}

fn hardware_preset(encoder: &str, quality: Quality) -> Option<EncoderSettings> {
    let pix_fmt = if encoder == "h264_qsv" {
        "nv12"
    } else if encoder == "h264_vaapi" {
        "vaapi"
    } else {
        "yuv420p"
    };

    let (audio_bitrate, args): (&str, Vec<&str>) = match (encoder, quality) {
        ("h264_videotoolbox", Quality::Lossless) => {
            ("320k", vec!["-b:v", "100M", "-maxrate", "120M", "-bufsize", "200M", "-allow_sw", "1"])
        }
        ("h264_videotoolbox", Quality::High) => {
            ("256k", vec!["-b:v", "50M", "-maxrate", "60M", "-bufsize", "100M", "-allow_sw", "1"])
        }
        ("h264_videotoolbox", Quality::Balanced) => {
            ("192k", vec!["-b:v", "25M", "-maxrate", "30M", "-bufsize", "50M", "-allow_sw", "1"])
        }
        ("h264_nvenc", Quality::Lossless) => {
            ("320k", vec!["-preset", "p7", "-tune", "hq", "-rc", "constqp", "-qp", "1"])
        }
        ("h264_nvenc", Quality::High) => {
            ("256k", vec!["-preset", "p5", "-tune", "hq", "-rc", "vbr", "-cq", "19"])
        }
        ("h264_nvenc", Quality::Balanced) => {
            ("192k", vec!["-preset", "p4", "-tune", "hq", "-rc", "vbr", "-cq", "23"])
        }
        ("h264_qsv", Quality::Lossless) => ("320k", vec!["-preset", "veryslow", "-global_quality", "1"]),
        ("h264_qsv", Quality::High) => ("256k", vec!["-preset", "slow", "-global_quality", "18"]),
        ("h264_qsv", Quality::Balanced) => ("192k", vec!["-preset", "medium", "-global_quality", "23"]),
        ("h264_amf", Quality::Lossless) => {
            ("320k", vec!["-quality", "quality", "-rc", "cqp", "-qp_i", "1", "-qp_p", "1"])
        }
        ("h264_amf", Quality::High) => {
            ("256k", vec!["-quality", "quality", "-rc", "vbr_peak", "-qp_i", "18", "-qp_p", "20"])
        }
        ("h264_amf", Quality::Balanced) => {
            ("192k", vec!["-quality", "balanced", "-rc", "vbr_peak", "-qp_i", "23", "-qp_p", "25"])
        }
        ("h264_vaapi", Quality::Lossless) => ("320k", vec!["-qp", "1"]),
        ("h264_vaapi", Quality::High) => ("256k", vec!["-qp", "18"]),
        ("h264_vaapi", Quality::Balanced) => ("192k", vec!["-qp", "23"]),
        _ => return None,
    };

    Some(EncoderSettings {
        codec: encoder.to_string(),
        audio_bitrate: audio_bitrate.to_string(),
        profile: Some("high".to_string()),
        pix_fmt: pix_fmt.to_string(),
        crf: None,
        preset: None,
        encoder_args: args.into_iter().map(str::to_string).collect(),
    })
}

/// Detect the best available hardware encoder, verified with a 1-frame
/// dummy encode. Result is memoized process-wide.
#[instrument]
pub async fn detect_hardware_encoder(test_timeout: Duration) -> Option<String> {
    DETECTED_ENCODER
        .get_or_init(|| async move {
            let output = match Command::new("ffmpeg")
                .args(["-hide_banner", "-encoders"])
                .output()
                .await
            {
                Ok(o) if o.status.success() => o,
                _ => {
                    warn!("could not query ffmpeg encoders, using software encoding");
                    return None;
                }
            };
            let available = String::from_utf8_lossy(&output.stdout);

            for encoder in ENCODER_PRIORITY {
                if available.contains(encoder) && test_encoder(encoder, test_timeout).await {
                    info!(encoder = %encoder, "hardware encoder detected");
                    return Some(encoder.to_string());
                }
            }
            info!("no hardware encoder available, using software encoding");
            None
        })
        .await
        .clone()
}

async fn test_encoder(encoder: &str, timeout: Duration) -> bool {
    let run = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-f",
            "lavfi",
            "-i",
            "color=black:s=64x64:d=0.04",
            "-c:v",
            encoder,
            "-f",
            "null",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output();

    matches!(tokio::time::timeout(timeout, run).await, Ok(Ok(o)) if o.status.success())
}

/// Resolve encoder settings for `quality`, preferring the detected hardware
/// encoder and falling back to software when none is available or the
/// quality key is absent from its table.
pub async fn get_quality_preset(quality: Quality, test_timeout: Duration) -> EncoderSettings {
    if let Some(encoder) = detect_hardware_encoder(test_timeout).await {
        if let Some(settings) = hardware_preset(&encoder, quality) {
            debug!(encoder = %encoder, ?quality, "using hardware encoder");
            return settings;
        }
    }
    debug!(?quality, "using software encoder libx264");
    software_preset(quality)
}

/// Build the `-c:v ... -profile:v ... -pix_fmt ... [-preset -crf | encoder_args]`
/// argument sequence from resolved settings.
pub fn video_encoder_args(settings: &EncoderSettings) -> Vec<String> {
    let mut args = vec!["-c:v".to_string(), settings.codec.clone()];

    if let Some(profile) = &settings.profile {
        if settings.codec != "h264_vaapi" {
            args.push("-profile:v".to_string());
            args.push(profile.clone());
        }
    }

    if settings.codec != "h264_vaapi" {
        args.push("-pix_fmt".to_string());
        args.push(settings.pix_fmt.clone());
    }

    if !settings.encoder_args.is_empty() {
        args.extend(settings.encoder_args.clone());
    } else {
        if let Some(preset) = &settings.preset {
            args.push("-preset".to_string());
            args.push(preset.clone());
        }
        if let Some(crf) = settings.crf {
            args.push("-crf".to_string());
            args.push(crf.to_string());
        }
    }

    args
}

/// Escape a path for an FFmpeg filter expression. Order matters: backslash
/// first, then the filtergraph metacharacters.
pub fn escape_filter_path(path: &str) -> String {
    path.replace('\\', "\\\\\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
        .replace('[', "\\[")
        .replace(']', "\\]")
        .replace(';', "\\;")
        .replace(',', "\\,")
}

/// Escape an absolute path for a concat-demuxer file list entry
/// (`file '<escaped>'`).
pub fn escape_concat_path(path: &Path) -> MediaResult<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let as_forward_slash = absolute.to_string_lossy().replace('\\', "/");
    Ok(as_forward_slash.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = FfmpegCommand::new("input.mp4", "output.mp4")
            .seek(10.0)
            .duration(30.0);

        let args = cmd.build_args();
        assert!(args.contains(&"-ss".to_string()));
        assert!(args.contains(&"10.000".to_string()));
    }

    #[test]
    fn test_progress_parsing() {
        let mut progress = FfmpegProgress::default();

        parse_progress_line("out_time_ms=5000000", &mut progress);
        assert_eq!(progress.out_time_ms, 5000000);

        parse_progress_line("speed=1.5x", &mut progress);
        assert!((progress.speed - 1.5).abs() < 0.01);

        let result = parse_progress_line("progress=end", &mut progress);
        assert!(result.is_some());
        assert!(progress.is_complete);
    }

    #[test]
    fn escape_filter_path_escapes_in_order() {
        let escaped = escape_filter_path("/tmp/a:b'c[d]e;f,g");
        assert_eq!(escaped, "/tmp/a\\:b\\'c\\[d\\]e\\;f\\,g");
    }

    #[test]
    fn escape_concat_path_quotes_single_quotes() {
        let escaped = escape_concat_path(Path::new("/tmp/it's.mp4")).unwrap();
        assert!(escaped.contains("it'\\''s.mp4"));
    }

    #[test]
    fn software_preset_matches_known_crf_table() {
        assert_eq!(software_preset(Quality::Lossless).crf, Some(1));
        assert_eq!(software_preset(Quality::High).crf, Some(18));
        assert_eq!(software_preset(Quality::Balanced).crf, Some(23));
    }

    #[test]
    fn video_encoder_args_uses_preset_and_crf_for_software() {
        let settings = software_preset(Quality::Balanced);
        let args = video_encoder_args(&settings);
        assert!(args.contains(&"-crf".to_string()));
        assert!(args.contains(&"-preset".to_string()));
    }

    #[test]
    fn video_encoder_args_uses_encoder_args_for_hardware() {
        let settings = hardware_preset("h264_nvenc", Quality::High).unwrap();
        let args = video_encoder_args(&settings);
        assert!(!args.contains(&"-crf".to_string()));
        assert!(args.contains(&"-rc".to_string()));
    }
}
