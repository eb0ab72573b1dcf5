//! Application state.

use std::sync::Arc;

use vclip_queue::ProgressChannel;

use crate::config::ApiConfig;
use crate::orchestrator::Orchestrator;

/// Shared application state. Authentication, tier enforcement, and
/// asset storage are out-of-scope external collaborators (§6) — this
/// workspace's `vclip-api` is the render core's job orchestrator alone.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub progress: Arc<ProgressChannel>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Create new application state.
    pub async fn new(config: ApiConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let progress = Arc::new(ProgressChannel::new(&config.redis_url)?);
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&progress), config.clone()));

        Ok(Self {
            config,
            progress,
            orchestrator,
        })
    }
}
