//! Render worker binary (§4.6): a standalone process invoked once per
//! export. Arguments and stdout protocol mirror `export_worker.py`'s
//! contract exactly; everything downstream (compositor, export pipeline)
//! lives in `vclip-media`.
//!
//! Invocation: `render_worker <project_name> <output_path> <quality>
//! <include_subtitles> <export_type> [video_id|None] [bgm_path|None]
//! [user_tier]`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vclip_media::{
    read_project, BgmSourceDurations, ExportContext, ExportDeps, FontProvider, NoopFontProvider,
    ProjectLock, RenderConfig, SourceDurations, TtsCache, TtsProvider,
};
use vclip_models::{ExportConfig, ExportType, JobId, Quality, Stage, UserTier};
use vclip_ml_client::{FontClientConfig, HttpFontClient, TtsClientConfig, HttpTtsClient};
use vclip_worker::{validate, WorkerConfig, WorkerError, WorkerResult};

fn usage_error() -> ! {
    emit_error("usage: render_worker <project_name> <output_path> <quality> <include_subtitles> <export_type> [video_id|None] [bgm_path|None] [user_tier]");
    std::process::exit(1);
}

/// Line-delimited JSON on stdout, flushed after every write (§4.6). A
/// `Mutex` around stdout keeps concurrent writers (progress callback plus
/// the final error path) from interleaving partial lines.
struct StdoutSink(Mutex<std::io::Stdout>);

impl StdoutSink {
    fn new() -> Self {
        Self(Mutex::new(std::io::stdout()))
    }

    fn write_record(&self, record: &vclip_models::ProgressRecord) {
        let mut out = self.0.lock().expect("stdout mutex poisoned");
        if serde_json::to_writer(&mut *out, record).is_ok() {
            let _ = writeln!(out);
            let _ = out.flush();
        }
    }
}

fn emit_error(message: &str) {
    let record = vclip_models::ProgressRecord::Error {
        message: message.to_string(),
        kind: None,
    };
    let mut out = std::io::stdout();
    if serde_json::to_writer(&mut out, &record).is_ok() {
        let _ = writeln!(out);
        let _ = out.flush();
    }
}

fn parse_quality(s: &str) -> Quality {
    match s {
        "lossless" => Quality::Lossless,
        "high" => Quality::High,
        _ => Quality::Balanced,
    }
}

fn parse_export_type(s: &str) -> ExportType {
    match s {
        "combined" => ExportType::Combined,
        _ => ExportType::Single,
    }
}

fn parse_user_tier(s: &str) -> UserTier {
    match s {
        "pro" => UserTier::Pro,
        "studio" => UserTier::Studio,
        _ => UserTier::Free,
    }
}

fn opt_arg(args: &[String], index: usize) -> Option<String> {
    args.get(index).filter(|s| s.as_str() != "None").cloned()
}

/// Tracing goes to the inherited stderr fd, written as plain text rather
/// than JSON since stderr here is a per-job log file, not a structured
/// sink some other collector tails (§4.6: the orchestrator is the one that
/// redirects this process's stderr to `render_<job_id>.log` at spawn time,
/// not this binary).
fn init_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("vclip=info".parse().unwrap()))
        .init();
}

fn project_path(work_dir: &str, project_name: &str) -> WorkerResult<PathBuf> {
    let safe_name = vclip_models::sanitize_name(project_name)
        .map_err(|e| WorkerError::validation(format!("invalid project name: {e}")))?;
    Ok(Path::new(work_dir).join("projects").join(safe_name).join("project.json"))
}

async fn run(job_id: JobId, args: Vec<String>, sink: &StdoutSink) -> WorkerResult<PathBuf> {
    if args.len() < 6 {
        usage_error();
    }

    let project_name = &args[1];
    let output_path = PathBuf::from(&args[2]);
    let quality = parse_quality(&args[3]);
    let include_subtitles = args[4].eq_ignore_ascii_case("true");
    let export_type = parse_export_type(&args[5]);
    let video_id = opt_arg(&args, 6);
    let bgm_path = opt_arg(&args, 7);
    let user_tier = opt_arg(&args, 8)
        .map(|s| parse_user_tier(&s))
        .unwrap_or_default();

    let worker_config = WorkerConfig::from_env();
    let render_config = RenderConfig::from_env();

    let project_file = project_path(&worker_config.work_dir, project_name)?;
    let _lock = ProjectLock::acquire_default(&project_file).await?;
    let mut project = read_project(&project_file).await?;

    // `bgm_path` is the legacy single-track override: the project's own
    // `bgm_tracks` take priority when present, matching the original's
    // "if project.bgm_tracks ... elif background_music_path" precedence.
    if project.bgm_tracks.is_empty() {
        if let Some(path) = &bgm_path {
            if Path::new(path).exists() {
                project.bgm_tracks.push(vclip_models::BgmTrack {
                    id: vclip_models::BgmTrackId::new(),
                    path: path.clone(),
                    start_time: 0.0,
                    end_time: 0.0,
                    volume: 100.0,
                    fade_in: 3.0,
                    fade_out: 3.0,
                    loop_: true,
                    muted: false,
                    audio_offset: 0.0,
                });
            }
        }
    }

    if export_type == ExportType::Single {
        if let Some(id) = &video_id {
            project.videos.retain(|v| &v.id.to_string() == id);
            if project.videos.is_empty() {
                return Err(WorkerError::validation(format!("video {id} not found in project")));
            }
        }
    }

    validate::preflight(&mut project)?;

    let mut source_durations = SourceDurations::new();
    for video in &project.videos {
        let duration = vclip_media::probe_duration(&video.source_path, render_config.timeouts.probe).await?;
        source_durations.insert(video.id.clone(), duration);
    }

    let mut bgm_source_durations = BgmSourceDurations::new();
    for track in &project.bgm_tracks {
        if track.loop_ {
            let duration = vclip_media::probe_duration(&track.path, render_config.timeouts.probe).await?;
            bgm_source_durations.insert(track.id.clone(), duration);
        }
    }

    let encoder = vclip_media::get_quality_preset(quality, render_config.timeouts.hw_encoder_test).await;

    let work_subdir = Path::new(&worker_config.work_dir).join(format!("export_{job_id}"));
    tokio::fs::create_dir_all(&work_subdir).await?;

    let tts_client = HttpTtsClient::new(TtsClientConfig::from_env());
    let font_client = HttpFontClient::new(FontClientConfig::from_env());
    let font_provider: Box<dyn FontProvider> = if font_client.is_available().await {
        Box::new(font_client)
    } else {
        Box::new(NoopFontProvider)
    };

    let tts_cache = TtsCache::new(
        work_subdir.join("tts_cache"),
        Arc::new(tts_client) as Arc<dyn TtsProvider>,
    );

    let ctx = ExportContext {
        job_id: job_id.to_string(),
        work_dir: work_subdir,
        output_path: output_path.clone(),
        render_config,
        quality,
        user_tier,
        watermark: vclip_media::WatermarkConfig::default(),
        output_width: 1080,
        output_height: 1920,
        output_fps: 30.0,
        platform: vclip_media::RenderPlatform::Other,
    };

    let deps = ExportDeps {
        tts_cache: &tts_cache,
        font_provider: font_provider.as_ref(),
        encoder,
    };

    let export_config = ExportConfig {
        quality,
        include_subtitles,
        background_music_path: bgm_path,
        output_filename: None,
        output_path: Some(output_path.to_string_lossy().to_string()),
        user_tier,
    };

    let last_emit = std::sync::Mutex::new(std::time::Instant::now() - std::time::Duration::from_secs(1));
    let on_progress = move |stage: Stage, progress: u8, message: &str| {
        let mut last = last_emit.lock().expect("progress mutex poisoned");
        let now = std::time::Instant::now();
        if progress < 100 && now.duration_since(*last) < std::time::Duration::from_millis(500) {
            return;
        }
        *last = now;
        sink.write_record(&vclip_models::ProgressRecord::Progress {
            stage,
            message: message.to_string(),
            progress,
            current_step: None,
            total_steps: None,
            detail: None,
            eta_seconds: None,
            eta_formatted: None,
            processing_speed: None,
            ffmpeg_progress: None,
        });
    };

    // `run_export` synthesises any missing narration audio through
    // `tts_cache` but does not hand the updated project back: the cache is
    // content-addressed, so a later render recomputes the same path from
    // the same fingerprint rather than depending on a stored `audio_path`.
    let result = vclip_media::run_export(
        project,
        source_durations,
        bgm_source_durations,
        &export_config,
        &ctx,
        &deps,
        &on_progress,
    )
    .await?;

    Ok(result)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 6 {
        usage_error();
    }

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");
    init_logging();

    let job_id = JobId::new();
    let sink = StdoutSink::new();

    match run(job_id, args, &sink).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "render worker failed");
            sink.write_record(&vclip_models::ProgressRecord::Error {
                message: e.to_string(),
                kind: None,
            });
            ExitCode::FAILURE
        }
    }
}
