//! TTS Cache (§4.3): content-addressed narration audio + subtitle store,
//! with at-most-one-concurrent-build-per-fingerprint coalescing. The
//! synthesis engine itself is external and consumed through [`TtsProvider`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};
use crate::subtitle::{format_srt_cue, Cue};

/// One synthesised cue as returned by the external engine, if it segments
/// its own output; otherwise the cache derives cues itself.
#[derive(Debug, Clone)]
pub struct SynthesisedCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Raw synthesis result: encoded audio bytes plus optional cues.
pub struct SynthesisResult {
    pub audio_bytes: Vec<u8>,
    pub audio_ext: String,
    pub cues: Option<Vec<SynthesisedCue>>,
}

/// External TTS engine boundary. Implementations may be remote (HTTP) or
/// local; the cache treats this as a black box.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesise(&self, request: &TtsRequest) -> MediaResult<SynthesisResult>;
}

/// The seven canonical input fields the fingerprint is derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsRequest {
    pub text: String,
    pub voice_id: String,
    pub language: String,
    pub rate: f64,
    pub volume: f64,
    pub pitch: f64,
    pub voice_sample_id: Option<String>,
}

/// Content-addressed fingerprint of a [`TtsRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two hex characters, used as the cache directory's shard prefix.
    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }
}

/// Hash the seven canonical fields, order-sensitive, into a stable digest.
pub fn fingerprint(request: &TtsRequest) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(request.text.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.voice_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.language.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.rate.to_bits().to_le_bytes());
    hasher.update(request.volume.to_bits().to_le_bytes());
    hasher.update(request.pitch.to_bits().to_le_bytes());
    hasher.update(request.voice_sample_id.as_deref().unwrap_or("").as_bytes());
    Fingerprint(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The resolved audio/subtitle pair for a cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub audio_path: PathBuf,
    pub subtitle_path: PathBuf,
}

/// Maximum characters per subtitle line when re-deriving cues from text
/// alone, sized for a portrait (1080x1920-class) viewport.
const DEFAULT_CHARS_PER_CUE: usize = 42;

/// Content-addressed store mapping `(text, voice, language, rate, volume,
/// pitch, voice_sample_id)` to a synthesised audio/subtitle pair.
pub struct TtsCache {
    root: PathBuf,
    provider: Arc<dyn TtsProvider>,
    in_flight: Mutex<HashMap<Fingerprint, Arc<Notify>>>,
}

impl TtsCache {
    pub fn new(root: impl Into<PathBuf>, provider: Arc<dyn TtsProvider>) -> Self {
        Self {
            root: root.into(),
            provider,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn paths(&self, fp: &Fingerprint, audio_ext: &str) -> (PathBuf, PathBuf) {
        let dir = self.root.join(fp.prefix());
        (
            dir.join(format!("{}.{audio_ext}", fp.as_str())),
            dir.join(format!("{}.srt", fp.as_str())),
        )
    }

    /// Resolve `request` to an audio/subtitle pair, synthesising on miss.
    /// Concurrent lookups sharing a fingerprint coalesce onto one build.
    pub async fn get_or_synthesise(&self, request: &TtsRequest) -> MediaResult<CacheEntry> {
        let fp = fingerprint(request);

        loop {
            if let Some(entry) = self.existing_entry(&fp, request).await? {
                return Ok(entry);
            }

            let notify = {
                let mut in_flight = self.in_flight.lock().await;
                if let Some(existing) = in_flight.get(&fp) {
                    Some(existing.clone())
                } else {
                    in_flight.insert(fp.clone(), Arc::new(Notify::new()));
                    None
                }
            };

            match notify {
                Some(notify) => {
                    debug!(fingerprint = fp.as_str(), "awaiting in-flight synthesis");
                    notify.notified().await;
                    continue;
                }
                None => return self.build(&fp, request).await,
            }
        }
    }

    /// Scan the shard directory for any `<fingerprint>.<ext>` file, since
    /// the audio container extension is not fixed.
    async fn existing_entry(&self, fp: &Fingerprint, request: &TtsRequest) -> MediaResult<Option<CacheEntry>> {
        let dir = self.root.join(fp.prefix());
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(_) => return Ok(None),
        };

        let mut audio_path = None;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_prefix(fp.as_str()) {
                if stem.starts_with('.') && stem != ".srt" {
                    audio_path = Some(entry.path());
                }
            }
        }

        let Some(audio_path) = audio_path else {
            return Ok(None);
        };
        let subtitle_path = dir.join(format!("{}.srt", fp.as_str()));

        if tokio::fs::try_exists(&subtitle_path).await.unwrap_or(false) {
            return Ok(Some(CacheEntry { audio_path, subtitle_path }));
        }

        // Audio exists but subtitle does not (older cache entry): re-derive
        // from the request's text and the audio's actual duration rather
        // than re-synthesising.
        let duration = crate::probe::probe_duration(&audio_path, std::time::Duration::from_secs(5))
            .await
            .unwrap_or(0.0);
        let lines = split_into_lines(&request.text, DEFAULT_CHARS_PER_CUE);
        let cues = evenly_spaced_cues(&lines, duration);
        write_srt(&subtitle_path, &cues).await?;
        info!(fingerprint = fp.as_str(), "re-derived subtitle for audio-only cache entry");
        Ok(Some(CacheEntry { audio_path, subtitle_path }))
    }

    async fn build(&self, fp: &Fingerprint, request: &TtsRequest) -> MediaResult<CacheEntry> {
        let result = self.provider.synthesise(request).await;

        let outcome = match &result {
            Ok(synthesis) => {
                let (audio_path, subtitle_path) = self.paths(fp, &synthesis.audio_ext);
                if let Some(parent) = audio_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&audio_path, &synthesis.audio_bytes).await?;

                let cues: Vec<Cue> = match &synthesis.cues {
                    Some(cues) => cues
                        .iter()
                        .map(|c| Cue { start: c.start, end: c.end, text: c.text.clone() })
                        .collect(),
                    None => {
                        let duration = crate::probe::probe_duration(&audio_path, std::time::Duration::from_secs(5))
                            .await
                            .unwrap_or(0.0);
                        evenly_spaced_cues(&split_into_lines(&request.text, DEFAULT_CHARS_PER_CUE), duration)
                    }
                };
                write_srt(&subtitle_path, &cues).await?;

                Ok(CacheEntry { audio_path, subtitle_path })
            }
            Err(e) => {
                warn!(fingerprint = fp.as_str(), error = %e, "tts synthesis failed");
                Err(MediaError::internal(format!("tts synthesis failed: {e}")))
            }
        };

        let notify = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.remove(fp)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }

        outcome
    }
}

fn split_into_lines(text: &str, max_chars: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in words {
        if current.is_empty() {
            current.push_str(word);
        } else if current.len() + 1 + word.len() <= max_chars {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

fn evenly_spaced_cues(lines: &[String], duration: f64) -> Vec<Cue> {
    if lines.is_empty() || duration <= 0.0 {
        return Vec::new();
    }
    let per_cue = duration / lines.len() as f64;
    lines
        .iter()
        .enumerate()
        .map(|(i, text)| Cue {
            start: i as f64 * per_cue,
            end: ((i + 1) as f64 * per_cue).min(duration),
            text: text.clone(),
        })
        .collect()
}

async fn write_srt(path: &std::path::Path, cues: &[Cue]) -> MediaResult<()> {
    let mut out = String::new();
    for (i, cue) in cues.iter().enumerate() {
        out.push_str(&format_srt_cue(i + 1, cue));
    }
    tokio::fs::write(path, out).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(text: &str) -> TtsRequest {
        TtsRequest {
            text: text.to_string(),
            voice_id: "v1".to_string(),
            language: "en".to_string(),
            rate: 100.0,
            volume: 100.0,
            pitch: 0.0,
            voice_sample_id: None,
        }
    }

    #[test]
    fn fingerprint_is_order_sensitive_and_stable() {
        let a = fingerprint(&req("hello"));
        let b = fingerprint(&req("hello"));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_any_field_change() {
        let a = fingerprint(&req("hello"));
        let mut other = req("hello");
        other.pitch = 1.0;
        let b = fingerprint(&other);
        assert_ne!(a, b);
    }

    #[test]
    fn prefix_is_first_two_hex_chars() {
        let fp = fingerprint(&req("hello"));
        assert_eq!(fp.prefix().len(), 2);
        assert!(fp.as_str().starts_with(fp.prefix()));
    }

    #[test]
    fn split_into_lines_respects_budget() {
        let lines = split_into_lines("one two three four five six seven eight nine ten", 12);
        assert!(lines.iter().all(|l| l.len() <= 12 || !l.contains(' ')));
    }

    #[test]
    fn evenly_spaced_cues_cover_full_duration() {
        let lines = vec!["a".to_string(), "b".to_string()];
        let cues = evenly_spaced_cues(&lines, 10.0);
        assert_eq!(cues.len(), 2);
        assert!((cues[0].start - 0.0).abs() < 1e-9);
        assert!((cues.last().unwrap().end - 10.0).abs() < 1e-9);
    }
}
