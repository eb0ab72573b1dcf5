//! Watermark overlay for the free tier (§4.5 watermark stage).

use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::command::{video_encoder_args, EncoderSettings};
use crate::error::{MediaError, MediaResult};

pub const DEFAULT_WATERMARK_PATH: &str = "/app/assets/watermark.png";

#[derive(Debug, Clone)]
pub struct WatermarkConfig {
    pub image_path: String,
    pub offset_x: u32,
    pub offset_y: u32,
    pub opacity: f32,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            image_path: DEFAULT_WATERMARK_PATH.to_string(),
            offset_x: 20,
            offset_y: 20,
            opacity: 0.7,
        }
    }
}

impl WatermarkConfig {
    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = path.into();
        self
    }

    pub fn with_offset(mut self, x: u32, y: u32) -> Self {
        self.offset_x = x;
        self.offset_y = y;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn is_available(&self) -> bool {
        Path::new(&self.image_path).exists()
    }
}

fn build_overlay_filter(config: &WatermarkConfig) -> String {
    if config.opacity < 1.0 {
        format!(
            "[1:v]format=rgba,colorchannelmixer=aa={:.2}[wm];[0:v][wm]overlay=W-w-{}:H-h-{}:format=auto",
            config.opacity, config.offset_x, config.offset_y
        )
    } else {
        format!(
            "[0:v][1:v]overlay=W-w-{}:H-h-{}:format=auto",
            config.offset_x, config.offset_y
        )
    }
}

/// Apply the watermark overlay to `video_path`, writing to a fixed
/// `<video_path>.prewatermark.mp4` temp name first (so a crash mid-stage
/// leaves a discoverable artifact, not a random-suffix one), then
/// atomically renaming over `video_path`. On `ErrorKind::WatermarkRequired`
/// both the prewatermark file and any partial output are removed before
/// the error surfaces, so a crash never leaves an unwatermarked video in
/// the tier's output path.
pub async fn apply_watermark(
    video_path: &Path,
    config: &WatermarkConfig,
    encoder: &EncoderSettings,
    timeout: Duration,
) -> MediaResult<()> {
    if !config.is_available() {
        return Err(MediaError::WatermarkRequired(format!(
            "watermark image not found: {}",
            config.image_path
        )));
    }

    let temp_output = video_path.with_extension("prewatermark.mp4");

    info!(
        video = %video_path.display(),
        watermark = %config.image_path,
        "applying watermark overlay"
    );

    let filter_complex = build_overlay_filter(config);
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-i".to_string(),
        video_path.to_string_lossy().to_string(),
        "-i".to_string(),
        config.image_path.clone(),
        "-filter_complex".to_string(),
        filter_complex,
    ];
    args.extend(video_encoder_args(encoder));
    args.extend([
        "-c:a".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        temp_output.to_string_lossy().to_string(),
    ]);

    let run = tokio::process::Command::new("ffmpeg").args(&args).output();
    let output = match tokio::time::timeout(timeout, run).await {
        Ok(Ok(o)) => o,
        Ok(Err(e)) => {
            let _ = tokio::fs::remove_file(&temp_output).await;
            return Err(MediaError::WatermarkRequired(format!("failed to spawn ffmpeg: {e}")));
        }
        Err(_) => {
            let _ = tokio::fs::remove_file(&temp_output).await;
            return Err(MediaError::WatermarkRequired("watermark overlay timed out".to_string()));
        }
    };

    if !output.status.success() {
        let _ = tokio::fs::remove_file(&temp_output).await;
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaError::WatermarkRequired(format!(
            "watermark overlay failed: {}",
            stderr.lines().rev().take(20).collect::<Vec<_>>().join("\n")
        )));
    }

    tokio::fs::rename(&temp_output, video_path).await.map_err(|e| {
        MediaError::WatermarkRequired(format!("failed to replace video with watermarked version: {e}"))
    })?;

    info!(video = %video_path.display(), "watermark applied successfully");
    Ok(())
}

/// Apply the watermark if available, skipping gracefully otherwise. Used
/// only for tiers that do not mandate a watermark (`UserTier::requires_watermark`
/// false); free-tier exports must call [`apply_watermark`] directly so a
/// missing asset surfaces as `ErrorKind::WatermarkRequired`, not a silent skip.
pub async fn apply_watermark_if_available(
    video_path: &Path,
    config: &WatermarkConfig,
    encoder: &EncoderSettings,
    timeout: Duration,
) -> MediaResult<bool> {
    if !video_path.exists() {
        warn!(video = %video_path.display(), "skipping watermark: video file not found");
        return Ok(false);
    }
    if !config.is_available() {
        debug!(watermark = %config.image_path, "skipping watermark: asset not found");
        return Ok(false);
    }
    apply_watermark(video_path, config, encoder, timeout).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WatermarkConfig::default();
        assert_eq!(config.offset_x, 20);
        assert!((config.opacity - 0.7).abs() < 0.01);
    }

    #[test]
    fn test_opacity_clamping() {
        let config = WatermarkConfig::default().with_opacity(1.5);
        assert!((config.opacity - 1.0).abs() < 0.01);
        let config = WatermarkConfig::default().with_opacity(-0.5);
        assert!((config.opacity - 0.0).abs() < 0.01);
    }

    #[test]
    fn test_overlay_filter_with_opacity() {
        let config = WatermarkConfig::default();
        let filter = build_overlay_filter(&config);
        assert!(filter.contains("colorchannelmixer"));
    }

    #[test]
    fn test_overlay_filter_full_opacity() {
        let config = WatermarkConfig::default().with_opacity(1.0);
        let filter = build_overlay_filter(&config);
        assert!(!filter.contains("colorchannelmixer"));
    }

    #[test]
    fn test_is_available_false_for_missing() {
        let config = WatermarkConfig::default().with_image_path("/nonexistent/path.png");
        assert!(!config.is_available());
    }
}
