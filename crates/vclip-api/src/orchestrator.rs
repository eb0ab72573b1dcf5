//! Job Orchestrator (§4.7): owns the in-memory job table, spawns
//! `render_worker` as a standalone process per export, and fans its stdout
//! out to both that table and `ProgressChannel`.
//!
//! The duplex-channel mechanism is grounded in `ws.rs`'s
//! `handle_process_socket` (bounded mpsc send-task + `tokio::select!` over
//! progress-stream/heartbeat-tick/client-message); the process lifecycle
//! (spawn into its own process group, `SIGTERM` then `SIGKILL`) has no
//! counterpart there since the teacher's worker was a long-lived Redis
//! consumer rather than a per-job child process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{info, warn};

use vclip_models::{
    ExportRequest, ExportStartResponse, ExportType, JobId, ProgressRecord, Quality, RenderJob, UserTier,
};
use vclip_queue::{ProgressChannel, ProgressEvent};

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};

/// §5: worker stdout inactivity budget before the orchestrator gives up on
/// a job and kills the child.
const STDOUT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

/// §4.7 cancel(): grace period between `SIGTERM` and `SIGKILL`.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Capacity of each subscriber's live-event channel. A slow subscriber
/// applies backpressure up to this depth before events are dropped for it
/// specifically — other subscribers and the job table are unaffected.
const SUBSCRIBER_BUFFER: usize = 64;

struct JobEntry {
    job: RenderJob,
    pid: Option<u32>,
    events: broadcast::Sender<ProgressEvent>,
}

/// Owns every render job's state for the lifetime of this process. Jobs are
/// never persisted beyond `ProgressChannel`'s own TTL-backed status cache;
/// a restart loses the in-memory table but `get_job_status` in Redis still
/// answers `GET /export/status/{id}` for jobs started before the restart.
#[derive(Clone)]
pub struct Orchestrator {
    jobs: Arc<RwLock<HashMap<JobId, JobEntry>>>,
    progress: Arc<ProgressChannel>,
    config: ApiConfig,
}

impl Orchestrator {
    pub fn new(progress: Arc<ProgressChannel>, config: ApiConfig) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            progress,
            config,
        }
    }

    /// `start(request) → job_id` (§4.7): allocates an id, resolves the
    /// output path, spawns `render_worker`, and returns immediately without
    /// waiting for the child to produce any output.
    pub async fn start(&self, request: ExportRequest) -> ApiResult<ExportStartResponse> {
        let job_id = JobId::new();
        let output_path = self.resolve_output_path(&job_id, &request)?;
        let bgm_tracks = self.preview_bgm_tracks(&request);

        let mut job = RenderJob::new(job_id.clone(), output_path.to_string_lossy().to_string());
        job.start();

        let (events_tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);

        let child = self.spawn_worker(&job_id, &request, &output_path)?;
        let pid = child.id();

        self.jobs.write().await.insert(
            job_id.clone(),
            JobEntry {
                job: job.clone(),
                pid,
                events: events_tx.clone(),
            },
        );
        self.progress.update_job_status(&job).await?;

        self.watch_child(job_id.clone(), child, events_tx);

        Ok(ExportStartResponse {
            export_id: job.id,
            status: job.status,
            output_path: job.output_path,
            bgm_tracks_count: bgm_tracks.len(),
            bgm_tracks,
        })
    }

    /// Best-effort preview of the tracks `render_worker` will actually mix
    /// in, mirroring its own project-tracks-beat-legacy-path precedence
    /// without taking the project lock — informational only, never
    /// authoritative over what the worker itself resolves.
    fn preview_bgm_tracks(&self, request: &ExportRequest) -> Vec<String> {
        let safe_project = match vclip_models::sanitize_name(&request.project_name) {
            Ok(name) => name,
            Err(_) => return Vec::new(),
        };
        let project_file = Path::new(&self.config.work_dir)
            .join("projects")
            .join(safe_project)
            .join("project.json");

        let project: vclip_models::Project = match std::fs::read_to_string(&project_file) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(p) => p,
                Err(_) => return Vec::new(),
            },
            Err(_) => return Vec::new(),
        };

        if !project.bgm_tracks.is_empty() {
            return project.bgm_tracks.into_iter().map(|t| t.path).collect();
        }
        request.config.background_music_path.clone().into_iter().collect()
    }

    fn resolve_output_path(&self, job_id: &JobId, request: &ExportRequest) -> ApiResult<PathBuf> {
        if let Some(path) = &request.config.output_path {
            return Ok(PathBuf::from(path));
        }

        let safe_project = vclip_models::sanitize_name(&request.project_name)
            .map_err(|e| ApiError::bad_request(format!("invalid project name: {e}")))?;
        let filename = request
            .config
            .output_filename
            .clone()
            .unwrap_or_else(|| format!("{job_id}.mp4"));

        Ok(Path::new(&self.config.work_dir)
            .join("projects")
            .join(safe_project)
            .join("exports")
            .join(filename))
    }

    fn spawn_worker(&self, job_id: &JobId, request: &ExportRequest, output_path: &Path) -> ApiResult<Child> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let log_path = Path::new(&self.config.work_dir).join(format!("render_{job_id}.log"));
        let log_file = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut command = Command::new(&self.config.render_worker_bin);
        command
            .arg(&request.project_name)
            .arg(output_path)
            .arg(quality_arg(request.config.quality))
            .arg(if request.config.include_subtitles { "true" } else { "false" })
            .arg(export_type_arg(request.export_type))
            .arg(request.video_id.as_ref().map(|id| id.to_string()).unwrap_or_else(|| "None".to_string()))
            .arg(request.config.background_music_path.clone().unwrap_or_else(|| "None".to_string()))
            .arg(user_tier_arg(request.config.user_tier))
            .env("WORKER_WORK_DIR", &self.config.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log_file));

        // Own process group: a SIGTERM aimed at this child (cancel()) must
        // not also land on the orchestrator itself (spec.md §4.1's
        // own-session spawn rule, mirrored here for worker processes).
        command.process_group(0);

        command.spawn().map_err(ApiError::from)
    }

    fn watch_child(&self, job_id: JobId, mut child: Child, events_tx: broadcast::Sender<ProgressEvent>) {
        let jobs = Arc::clone(&self.jobs);
        let progress = Arc::clone(&self.progress);

        tokio::spawn(async move {
            let stdout = match child.stdout.take() {
                Some(s) => s,
                None => return,
            };
            let mut lines = BufReader::new(stdout).lines();

            loop {
                match timeout(STDOUT_INACTIVITY_TIMEOUT, lines.next_line()).await {
                    Ok(Ok(Some(line))) => {
                        let Ok(record) = serde_json::from_str::<ProgressRecord>(&line) else {
                            warn!(job = %job_id, "render worker emitted a malformed progress line");
                            continue;
                        };

                        let mut table = jobs.write().await;
                        if let Some(entry) = table.get_mut(&job_id) {
                            entry.job.apply_progress(&record);
                            if let ProgressRecord::Error { message, .. } = &record {
                                entry.job.fail(message.clone());
                            }
                            let _ = progress.update_job_status(&entry.job).await;
                        }
                        drop(table);

                        let event = ProgressEvent::new(job_id.clone(), record);
                        let _ = progress.publish_with_history(&event).await;
                        let _ = events_tx.send(event);
                    }
                    Ok(Ok(None)) => break, // stdout closed: worker exited
                    Ok(Err(e)) => {
                        warn!(job = %job_id, error = %e, "error reading render worker stdout");
                        break;
                    }
                    Err(_) => {
                        warn!(job = %job_id, "render worker stdout inactivity timeout, killing");
                        let _ = child.start_kill();
                        break;
                    }
                }
            }

            let status = child.wait().await;
            let mut table = jobs.write().await;
            if let Some(entry) = table.get_mut(&job_id) {
                if !entry.job.status.is_terminal() {
                    let output_path = entry.job.output_path.clone();
                    match status {
                        Ok(status) if status.success() => entry.job.complete(output_path),
                        Ok(status) => entry.job.fail(format!("render worker exited with {status}")),
                        Err(e) => entry.job.fail(format!("render worker wait failed: {e}")),
                    }
                }
                let _ = progress.update_job_status(&entry.job).await;
            }
        });
    }

    /// `subscribe(job_id) → duplex channel` (§4.7): returns a snapshot of
    /// the job's current state plus a receiver for every subsequent event.
    /// Late subscribers get this snapshot, never a history replay — the
    /// teacher's `ProgressChannel::get_full_history` stays unused here by
    /// design (see DESIGN.md).
    pub async fn subscribe(&self, job_id: &JobId) -> ApiResult<(RenderJob, broadcast::Receiver<ProgressEvent>)> {
        let table = self.jobs.read().await;
        let entry = table.get(job_id).ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;
        Ok((entry.job.clone(), entry.events.subscribe()))
    }

    pub async fn status(&self, job_id: &JobId) -> ApiResult<RenderJob> {
        if let Some(entry) = self.jobs.read().await.get(job_id) {
            return Ok(entry.job.clone());
        }
        self.progress
            .get_job_status(job_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))
    }

    pub async fn list_active(&self) -> Vec<RenderJob> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .map(|e| e.job.clone())
            .collect()
    }

    /// `cancel(job_id)` (§4.7): `SIGTERM`, wait, `SIGKILL`. Cancellation
    /// never races the stdout reader's own terminal-status write since both
    /// go through the same job-table lock.
    pub async fn cancel(&self, job_id: &JobId) -> ApiResult<RenderJob> {
        let pid = {
            let table = self.jobs.read().await;
            let entry = table.get(job_id).ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;
            if entry.job.status.is_terminal() {
                return Ok(entry.job.clone());
            }
            entry.pid
        };

        if let Some(pid) = pid {
            signal_process_group(pid, nix::sys::signal::Signal::SIGTERM);
            tokio::time::sleep(CANCEL_GRACE).await;
            signal_process_group(pid, nix::sys::signal::Signal::SIGKILL);
        }

        let mut table = self.jobs.write().await;
        let entry = table.get_mut(job_id).ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;
        entry.job.cancel();
        self.progress.update_job_status(&entry.job).await?;
        info!(job = %job_id, "job cancelled");
        Ok(entry.job.clone())
    }
}

fn quality_arg(quality: Quality) -> &'static str {
    match quality {
        Quality::Lossless => "lossless",
        Quality::High => "high",
        Quality::Balanced => "balanced",
    }
}

fn export_type_arg(export_type: ExportType) -> &'static str {
    match export_type {
        ExportType::Combined => "combined",
        ExportType::Single => "single",
    }
}

fn user_tier_arg(tier: UserTier) -> &'static str {
    match tier {
        UserTier::Free => "free",
        UserTier::Pro => "pro",
        UserTier::Studio => "studio",
    }
}

/// Signal the whole process group the child leads, not just the child pid,
/// so any subprocess it spawned (the encoder/probe binaries) dies with it.
fn signal_process_group(pid: u32, signal: nix::sys::signal::Signal) {
    let pgid = nix::unistd::Pid::from_raw(-(pid as i32));
    if let Err(e) = nix::sys::signal::kill(pgid, signal) {
        warn!(pid, signal = ?signal, error = %e, "failed to signal render worker process group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_args_match_render_worker_parse_quality() {
        assert_eq!(quality_arg(Quality::Lossless), "lossless");
        assert_eq!(quality_arg(Quality::High), "high");
        assert_eq!(quality_arg(Quality::Balanced), "balanced");
    }

    #[test]
    fn export_type_args_match_render_worker_parse_export_type() {
        assert_eq!(export_type_arg(ExportType::Combined), "combined");
        assert_eq!(export_type_arg(ExportType::Single), "single");
    }
}
