//! Progress relay: Redis Pub/Sub fanout plus Sorted-Set history for the
//! render worker's line-delimited progress protocol.
//!
//! Job dispatch itself is not a Redis-queue concern in this workspace —
//! the orchestrator spawns `render_worker` directly as a child process
//! (`vclip-api::orchestrator`) rather than through a persistent consumer,
//! so this crate's surface is narrowed to the progress/heartbeat/status
//! relay alone.

pub mod error;
pub mod progress;

pub use error::{QueueError, QueueResult};
pub use progress::{
    ProgressChannel, ProgressEvent, HEARTBEAT_TTL_SECS, JOB_STATUS_TTL_SECS,
    PROGRESS_HISTORY_TTL_SECS,
};
