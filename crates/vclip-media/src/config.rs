//! Runtime-tunable values for the toolchain adapter and export pipeline.

use std::time::Duration;

/// Per-stage timeout budget (§5). Each field is independent: a long
/// `segment` stage does not borrow time from `concat`.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub probe: Duration,
    pub hw_encoder_test: Duration,
    pub segment: Duration,
    pub concat: Duration,
    pub bgm_mix: Duration,
    pub overall: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(5),
            hw_encoder_test: Duration::from_secs(5),
            segment: Duration::from_secs(300),
            concat: Duration::from_secs(600),
            bgm_mix: Duration::from_secs(900),
            overall: Duration::from_secs(3600),
        }
    }
}

/// Configuration for the media toolchain adapter and export pipeline,
/// constructed the same way as the binaries' own `*Config` structs:
/// a `Default` plus a `from_env()` that overlays environment variables.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub temp_root: String,
    pub watermark_path: String,
    pub timeouts: StageTimeouts,
    /// Default gain applied when no per-segment/per-track volume is set.
    /// Open Question (spec.md §9): the original's two conflicting volume
    /// baselines are not modelled; this is the single configurable default,
    /// neutral (0 dB) unless overridden.
    pub default_gain_db: f64,
    /// Minimum interval between progress callbacks (§5 backpressure rule).
    pub progress_interval: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            temp_root: "/tmp/vclip-render".to_string(),
            watermark_path: "/app/assets/watermark.png".to_string(),
            timeouts: StageTimeouts::default(),
            default_gain_db: 0.0,
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl RenderConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or(default.ffmpeg_path),
            ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or(default.ffprobe_path),
            temp_root: std::env::var("RENDER_TEMP_ROOT").unwrap_or(default.temp_root),
            watermark_path: std::env::var("WATERMARK_PATH").unwrap_or(default.watermark_path),
            timeouts: default.timeouts,
            default_gain_db: std::env::var("RENDER_DEFAULT_GAIN_DB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.default_gain_db),
            progress_interval: default.progress_interval,
        }
    }
}
