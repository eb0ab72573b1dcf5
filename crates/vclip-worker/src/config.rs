//! Render worker configuration.
//!
//! The worker reports progress purely over stdout (§4.6); Redis relay and
//! process liveness are the job orchestrator's concern (`vclip-api`), not
//! this binary's, so the only thing configurable here is where on disk
//! projects and per-job temp state live.

/// Render worker runtime configuration, constructed the same way as the
/// other binaries' `*Config` structs: a `Default` plus a `from_env()` that
/// overlays environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root directory holding `projects/<name>/project.json` and this job's
    /// namespaced temp subdirectory (`<work_dir>/export_<job_id>/`).
    pub work_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: "/tmp/vclip".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            work_dir: std::env::var("WORKER_WORK_DIR").unwrap_or(default.work_dir),
        }
    }
}
