#![deny(unreachable_patterns)]
//! Media toolchain adapter for the rendering core.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building and a progress-tracking runner
//! - Hardware-encoder detection and quality presets
//! - FFprobe-backed video inspection
//! - Filter-graph fragment builders for the layer compositor and export pipeline
//! - Volume-to-dB conversion shared by BGM and voiceover mixing
//! - The subtitle engine (ASS style generation, SRT/ASS timing shift, combining)
//! - The TTS cache (content-addressed narration audio/subtitle store)
//! - The layer compositor (visibility map, segment and BGM placements)
//! - Advisory project-file locking and atomic project writes
//! - Free-tier watermark overlay
//! - The export pipeline: the staged orchestration that drives all of the
//!   above from a project into a finished rendered file

pub mod command;
pub mod compositor;
pub mod config;
pub mod error;
pub mod export;
pub mod filters;
pub mod fs_utils;
pub mod lock;
pub mod probe;
pub mod progress;
pub mod subtitle;
pub mod tts_cache;
pub mod volume;
pub mod watermark;

pub use command::{
    check_ffmpeg, check_ffprobe, detect_hardware_encoder, escape_concat_path, escape_filter_path,
    get_quality_preset, video_encoder_args, EncoderSettings, FfmpegCommand, FfmpegRunner,
};
pub use compositor::{BgmSourceDurations, LayerCompositor, SourceDurations};
pub use export::{
    run_export, ExportContext, ExportDeps, FontProvider, NoopFontProvider, ProgressFn,
};
pub use config::{RenderConfig, StageTimeouts};
pub use error::{MediaError, MediaResult};
pub use lock::{read_project, write_project_atomic, ProjectLock};
pub use probe::{has_audio, probe_duration, probe_video, VideoInfo};
pub use progress::{FfmpegProgress, ProgressCallback};
pub use subtitle::{
    apply_style, combine, format_srt_cue, parse_ass_dialogues, parse_srt, resolve_font, shift,
    Cue, PlacementSubtitles, RenderPlatform,
};
pub use tts_cache::{fingerprint, CacheEntry, Fingerprint, SynthesisResult, SynthesisedCue, TtsCache, TtsProvider, TtsRequest};
pub use volume::{percent_to_db, volume_filter_arg};
pub use watermark::{
    apply_watermark, apply_watermark_if_available, WatermarkConfig, DEFAULT_WATERMARK_PATH,
};
