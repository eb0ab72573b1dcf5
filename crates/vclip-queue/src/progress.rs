//! Progress events via Redis Pub/Sub with persistence and heartbeat support.
//!
//! This module provides:
//! - Real-time progress events via Redis Pub/Sub
//! - Persistent progress history via Redis Sorted Sets (operational
//!   recovery/debugging tooling; the orchestrator's live `subscribe` path
//!   does not read from it — see `vclip-api::orchestrator`)
//! - Worker heartbeat tracking for stale job detection
//! - Job status caching for fast polling

use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use vclip_models::{JobId, ProgressRecord, RenderJob};

use crate::error::QueueResult;

// ============================================================================
// Redis Key Prefixes and TTLs
// ============================================================================

/// Prefix for worker heartbeat keys: `heartbeat:{job_id}`
const HEARTBEAT_KEY_PREFIX: &str = "heartbeat:";

/// Prefix for progress history sorted sets: `progress:history:{job_id}`
const PROGRESS_HISTORY_PREFIX: &str = "progress:history:";

/// Prefix for job status cache: `job:status:{job_id}`
const JOB_STATUS_PREFIX: &str = "job:status:";

/// Prefix for active jobs set: `jobs:active`
const ACTIVE_JOBS_KEY: &str = "jobs:active";

/// Heartbeat TTL - job considered dead after this duration without heartbeat (seconds)
pub const HEARTBEAT_TTL_SECS: u64 = 60;

/// Progress history TTL - keep progress events for recovery (seconds)
pub const PROGRESS_HISTORY_TTL_SECS: u64 = 3600; // 1 hour

/// Job status cache TTL (seconds)
pub const JOB_STATUS_TTL_SECS: u64 = 86400; // 24 hours

// ============================================================================
// Data Structures
// ============================================================================

/// Progress event published to Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub record: ProgressRecord,
    /// Event timestamp (milliseconds since epoch)
    #[serde(default = "default_timestamp")]
    pub timestamp_ms: i64,
    /// Sequence number for ordering
    #[serde(default)]
    pub seq: u64,
}

fn default_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

impl ProgressEvent {
    pub fn new(job_id: JobId, record: ProgressRecord) -> Self {
        Self {
            job_id,
            record,
            timestamp_ms: Utc::now().timestamp_millis(),
            seq: 0,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

/// Channel for publishing/subscribing to progress events.
#[derive(Clone)]
pub struct ProgressChannel {
    client: redis::Client,
}

impl ProgressChannel {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub fn channel_name(job_id: &JobId) -> String {
        format!("progress:{}", job_id)
    }

    /// Publish a progress event (Pub/Sub only, no persistence).
    ///
    /// For most use cases, prefer `publish_with_history` which also persists
    /// the event for recovery purposes.
    pub async fn publish(&self, event: &ProgressEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = Self::channel_name(&event.job_id);
        let payload = serde_json::to_string(event)?;

        debug!("Publishing progress event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }

    /// Publish a progress event with persistence to history.
    ///
    /// This performs a dual-write:
    /// 1. Pub/Sub for real-time delivery to connected clients
    /// 2. Sorted set for history/recovery (scored by timestamp)
    pub async fn publish_with_history(&self, event: &ProgressEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = Self::channel_name(&event.job_id);
        let history_key = format!("{}{}", PROGRESS_HISTORY_PREFIX, event.job_id);
        let payload = serde_json::to_string(event)?;
        let score = event.timestamp_ms as f64;

        debug!("Publishing progress event to {} with history", channel);

        redis::pipe()
            .publish(&channel, &payload)
            .ignore()
            .zadd(&history_key, &payload, score)
            .ignore()
            .expire(&history_key, PROGRESS_HISTORY_TTL_SECS as i64)
            .ignore()
            .exec_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Publish a stage progress record for a job.
    pub async fn progress(&self, job_id: &JobId, record: ProgressRecord) -> QueueResult<()> {
        self.publish_with_history(&ProgressEvent::new(job_id.clone(), record)).await
    }

    /// Subscribe to progress events for a job.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        job_id: &JobId,
    ) -> QueueResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = ProgressEvent> + Send>>> {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = Self::channel_name(job_id);

        pubsub.subscribe(&channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }

    // ========================================================================
    // Heartbeat Methods
    // ========================================================================

    /// Update worker heartbeat for a job. Workers should call this every
    /// 10 seconds during processing; the key's 60s TTL means 6 consecutive
    /// missed heartbeats marks the job stale.
    pub async fn heartbeat(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", HEARTBEAT_KEY_PREFIX, job_id);
        let now = Utc::now().timestamp();

        conn.set_ex::<_, _, ()>(&key, now, HEARTBEAT_TTL_SECS).await?;
        debug!("Updated heartbeat for job {}", job_id);

        Ok(())
    }

    pub async fn is_alive(&self, job_id: &JobId) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", HEARTBEAT_KEY_PREFIX, job_id);

        let exists: bool = conn.exists(&key).await?;
        Ok(exists)
    }

    pub async fn get_last_heartbeat(&self, job_id: &JobId) -> QueueResult<Option<i64>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", HEARTBEAT_KEY_PREFIX, job_id);

        let timestamp: Option<i64> = conn.get(&key).await?;
        Ok(timestamp)
    }

    pub async fn clear_heartbeat(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", HEARTBEAT_KEY_PREFIX, job_id);

        conn.del::<_, ()>(&key).await?;
        Ok(())
    }

    // ========================================================================
    // Progress History Methods (operational recovery/debugging only; the
    // orchestrator's live subscribe() path never calls these)
    // ========================================================================

    pub async fn get_history_since(
        &self,
        job_id: &JobId,
        since_ms: i64,
    ) -> QueueResult<Vec<ProgressEvent>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", PROGRESS_HISTORY_PREFIX, job_id);

        let events: Vec<String> = conn.zrangebyscore(&key, since_ms as f64, "+inf").await?;

        let parsed: Vec<ProgressEvent> = events
            .into_iter()
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect();

        Ok(parsed)
    }

    pub async fn get_full_history(&self, job_id: &JobId) -> QueueResult<Vec<ProgressEvent>> {
        self.get_history_since(job_id, 0).await
    }

    pub async fn get_history_count(&self, job_id: &JobId) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", PROGRESS_HISTORY_PREFIX, job_id);

        let count: u64 = conn.zcard(&key).await?;
        Ok(count)
    }

    pub async fn clear_history(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", PROGRESS_HISTORY_PREFIX, job_id);

        conn.del::<_, ()>(&key).await?;
        Ok(())
    }

    // ========================================================================
    // Job Status Cache Methods
    // ========================================================================

    /// Persist the full `RenderJob` snapshot, keyed by job id.
    pub async fn update_job_status(&self, job: &RenderJob) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", JOB_STATUS_PREFIX, job.id);
        let payload = serde_json::to_string(job)?;

        conn.set_ex::<_, _, ()>(&key, payload, JOB_STATUS_TTL_SECS).await?;
        if job.status.is_terminal() {
            self.remove_from_active_jobs(&job.id).await?;
            self.clear_heartbeat(&job.id).await?;
        } else {
            self.add_to_active_jobs(&job.id).await?;
        }
        Ok(())
    }

    pub async fn get_job_status(&self, job_id: &JobId) -> QueueResult<Option<RenderJob>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}{}", JOB_STATUS_PREFIX, job_id);

        let value: Option<String> = conn.get(&key).await?;
        Ok(value.and_then(|s| serde_json::from_str(&s).ok()))
    }

    // ========================================================================
    // Active Jobs Tracking
    // ========================================================================

    async fn add_to_active_jobs(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let score = Utc::now().timestamp_millis() as f64;

        conn.zadd::<_, _, _, ()>(ACTIVE_JOBS_KEY, job_id.to_string(), score).await?;
        Ok(())
    }

    async fn remove_from_active_jobs(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        conn.zrem::<_, _, ()>(ACTIVE_JOBS_KEY, job_id.to_string()).await?;
        Ok(())
    }

    /// Get all active jobs. Used by operational recovery tooling to check
    /// for jobs whose worker process died without a terminal status update.
    pub async fn get_active_jobs(&self) -> QueueResult<Vec<RenderJob>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let job_ids: Vec<String> = conn.zrange(ACTIVE_JOBS_KEY, 0, -1).await?;

        let mut jobs = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            if let Some(job) = self.get_job_status(&JobId::from(job_id)).await? {
                jobs.push(job);
            }
        }

        Ok(jobs)
    }

    pub async fn get_active_job_count(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.zcard(ACTIVE_JOBS_KEY).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_is_namespaced_by_job_id() {
        let job_id = JobId::new();
        let name = ProgressChannel::channel_name(&job_id);
        assert!(name.starts_with("progress:"));
        assert!(name.ends_with(job_id.as_str()));
    }

    #[test]
    fn progress_event_carries_a_monotonic_seq_when_set() {
        let event = ProgressEvent::new(JobId::new(), ProgressRecord::Error { message: "x".into() })
            .with_seq(7);
        assert_eq!(event.seq, 7);
    }
}
