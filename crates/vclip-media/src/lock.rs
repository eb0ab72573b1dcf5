//! Advisory project-file locking (§4.7's "Busy, retry for 5s" contract),
//! and atomic project writes. Grounded in the `fs4` crate's async
//! `AsyncFileExt`, since the original's equivalent is a plain OS-level
//! advisory lock around project reads/writes.

use std::path::Path;
use std::time::Duration;

use fs4::tokio::AsyncFileExt;
use tokio::fs::File;
use tokio::time::sleep;
use vclip_models::Project;

use crate::error::{MediaError, MediaResult};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// An exclusively-locked project file. The OS releases the advisory lock
/// when the underlying file descriptor closes, so dropping this is enough
/// to release it; no explicit unlock call is needed.
pub struct ProjectLock {
    file: File,
}

impl ProjectLock {
    /// Acquire an exclusive advisory lock on `path`, retrying for up to
    /// `timeout` before surfacing `ErrorKind::Busy`.
    pub async fn acquire(path: &Path, timeout: Duration) -> MediaResult<Self> {
        let file = File::open(path).await.map_err(|_| MediaError::FileNotFound(path.to_path_buf()))?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match file.try_lock_exclusive() {
                Ok(true) => return Ok(Self { file }),
                Ok(false) => {}
                Err(e) => return Err(MediaError::internal(format!("lock error: {e}"))),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(MediaError::Busy);
            }
            sleep(RETRY_INTERVAL).await;
        }
    }

    pub async fn acquire_default(path: &Path) -> MediaResult<Self> {
        Self::acquire(path, DEFAULT_LOCK_TIMEOUT).await
    }
}

/// Read and deserialize a project file. Unknown fields and version ≥ 1 are
/// tolerated (forward compatibility, §6).
pub async fn read_project(path: &Path) -> MediaResult<Project> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|_| MediaError::FileNotFound(path.to_path_buf()))?;
    serde_json::from_str(&contents).map_err(MediaError::from)
}

/// Write a project file atomically: serialize to a sibling temp file, then
/// rename over `path`, so a crash mid-write never leaves a truncated file.
pub async fn write_project_atomic(path: &Path, project: &Project) -> MediaResult<()> {
    let json = serde_json::to_vec_pretty(project)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    temp.write_all(&json)?;
    temp.persist(path).map_err(|e| MediaError::internal(format!("failed to persist project file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vclip_models::{BgmTrack, BgmTrackId, VideoLayer, VideoLayerId};

    fn sample_project() -> Project {
        Project {
            name: "sample".to_string(),
            videos: vec![VideoLayer {
                id: VideoLayerId::new(),
                name: "clip".to_string(),
                source_path: "clip.mp4".to_string(),
                order: 0,
                timeline_start: None,
                timeline_end: None,
                source_start: 0.0,
                source_end: 5.0,
                segments: Vec::new(),
            }],
            generic_segments: Vec::new(),
            bgm_tracks: vec![BgmTrack {
                id: BgmTrackId::new(),
                path: "bgm.mp3".to_string(),
                start_time: 0.0,
                end_time: 0.0,
                volume: 50.0,
                fade_in: 0.0,
                fade_out: 0.0,
                loop_: false,
                muted: false,
                audio_offset: 0.0,
            }],
            global_tts_volume: 100.0,
            global_bgm_volume: 100.0,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        let project = sample_project();

        write_project_atomic(&path, &project).await.unwrap();
        let read_back = read_project(&path).await.unwrap();

        assert_eq!(read_back.name, project.name);
        assert_eq!(read_back.videos.len(), 1);
    }

    #[tokio::test]
    async fn read_missing_project_is_file_not_found() {
        let err = read_project(Path::new("/nonexistent/project.json")).await.unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn lock_is_exclusive_within_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        write_project_atomic(&path, &sample_project()).await.unwrap();

        let first = ProjectLock::acquire_default(&path).await.unwrap();
        let second = ProjectLock::acquire(&path, Duration::from_millis(200)).await;
        assert!(matches!(second, Err(MediaError::Busy)));
        drop(first);
    }
}
