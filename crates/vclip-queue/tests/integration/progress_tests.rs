//! `ProgressChannel` pub/sub, history and job-status tests against a real
//! Redis instance.

use futures_util::StreamExt;
use vclip_models::{JobId, ProgressRecord, RenderJob, Stage};
use vclip_queue::ProgressChannel;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn progress_record() -> ProgressRecord {
    ProgressRecord::Progress {
        stage: Stage::Segments,
        message: "rendering segment 1".into(),
        progress: 10,
        current_step: Some(1),
        total_steps: Some(5),
        detail: None,
        eta_seconds: None,
        eta_formatted: None,
        processing_speed: None,
        ffmpeg_progress: None,
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn publish_and_subscribe_round_trip() {
    let progress = ProgressChannel::new(&redis_url()).expect("failed to create progress channel");
    let job_id = JobId::new();

    let progress_clone = progress.clone();
    let job_id_clone = job_id.clone();
    let subscriber = tokio::spawn(async move {
        let mut stream = progress_clone.subscribe(&job_id_clone).await.expect("failed to subscribe");
        tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .ok()
            .flatten()
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    progress.progress(&job_id, progress_record()).await.expect("failed to publish");

    let event = subscriber.await.expect("subscriber task panicked");
    assert!(event.is_some());
    assert_eq!(event.unwrap().job_id, job_id);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn history_persists_published_events() {
    let progress = ProgressChannel::new(&redis_url()).expect("failed to create progress channel");
    let job_id = JobId::new();

    progress.progress(&job_id, progress_record()).await.expect("failed to publish");
    progress.progress(&job_id, progress_record()).await.expect("failed to publish");

    let history = progress.get_full_history(&job_id).await.expect("failed to read history");
    assert!(history.len() >= 2);

    progress.clear_history(&job_id).await.expect("failed to clear history");
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn job_status_cache_tracks_active_jobs() {
    let progress = ProgressChannel::new(&redis_url()).expect("failed to create progress channel");
    let job_id = JobId::new();
    let mut job = RenderJob::new(job_id.clone(), "/tmp/out.mp4");
    job.start();

    progress.update_job_status(&job).await.expect("failed to update job status");
    assert!(progress.get_active_job_count().await.expect("failed to count active jobs") >= 1);

    job.complete("/tmp/out.mp4");
    progress.update_job_status(&job).await.expect("failed to update job status");

    let fetched = progress.get_job_status(&job_id).await.expect("failed to fetch job status");
    assert_eq!(fetched.expect("job status missing").status, job.status);
}
