//! HTTP client for the external text-to-speech engine.
//!
//! Implements [`vclip_media::TtsProvider`] so it plugs directly into the
//! TTS Cache; `is_available` is an inherent method (not part of that
//! trait) used by the render worker's pre-flight checks.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vclip_media::{MediaError, MediaResult, SynthesisResult, SynthesisedCue, TtsProvider, TtsRequest};

use crate::error::ClientError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TtsClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl TtsClientConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("TTS_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:9001".to_string()),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Thin wrapper around a remote TTS HTTP service.
pub struct HttpTtsClient {
    http: reqwest::Client,
    config: TtsClientConfig,
}

impl HttpTtsClient {
    pub fn new(config: TtsClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("tts http client builds");
        Self { http, config }
    }

    /// Pre-flight health check, not part of the `TtsProvider` trait
    /// since the compositor/export pipeline never needs it mid-render.
    pub async fn is_available(&self) -> bool {
        self.http
            .get(format!("{}/health", self.config.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[derive(Serialize)]
struct SynthesiseBody<'a> {
    text: &'a str,
    voice_id: &'a str,
    language: &'a str,
    rate: f64,
    volume: f64,
    pitch: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_sample_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct SynthesiseResponse {
    audio_base64: String,
    audio_ext: String,
    #[serde(default)]
    cues: Option<Vec<WireCue>>,
}

#[derive(Deserialize)]
struct WireCue {
    start: f64,
    end: f64,
    text: String,
}

#[async_trait]
impl TtsProvider for HttpTtsClient {
    async fn synthesise(&self, request: &TtsRequest) -> MediaResult<SynthesisResult> {
        let body = SynthesiseBody {
            text: &request.text,
            voice_id: &request.voice_id,
            language: &request.language,
            rate: request.rate,
            volume: request.volume,
            pitch: request.pitch,
            voice_sample_id: request.voice_sample_id.as_deref(),
        };

        let url = format!("{}/synthesise", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| to_media_error(ClientError::Request(url.clone(), e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(to_media_error(ClientError::Provider { status, body }));
        }

        let parsed: SynthesiseResponse = response
            .json()
            .await
            .map_err(|e| to_media_error(ClientError::Decode(e)))?;

        let audio_bytes = base64_decode(&parsed.audio_base64)
            .map_err(|e| MediaError::internal(format!("malformed tts audio payload: {e}")))?;

        let cues = parsed.cues.map(|cues| {
            cues.into_iter()
                .map(|c| SynthesisedCue { start: c.start, end: c.end, text: c.text })
                .collect()
        });

        Ok(SynthesisResult { audio_bytes, audio_ext: parsed.audio_ext, cues })
    }
}

fn to_media_error(e: ClientError) -> MediaError {
    MediaError::internal(format!("tts provider: {e}"))
}

/// Minimal base64 decoder so the crate doesn't need a dedicated base64
/// dependency for a single response field.
fn base64_decode(input: &str) -> Result<Vec<u8>, String> {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut reverse = [255u8; 256];
    for (i, &b) in TABLE.iter().enumerate() {
        reverse[b as usize] = i as u8;
    }

    let cleaned: Vec<u8> = input.bytes().filter(|b| *b != b'\n' && *b != b'\r').collect();
    let mut out = Vec::with_capacity(cleaned.len() / 4 * 3);
    let mut chunk = [0u8; 4];
    let mut chunk_len = 0;

    for &b in &cleaned {
        if b == b'=' {
            break;
        }
        let v = reverse[b as usize];
        if v == 255 {
            return Err(format!("invalid base64 byte {b}"));
        }
        chunk[chunk_len] = v;
        chunk_len += 1;
        if chunk_len == 4 {
            out.push((chunk[0] << 2) | (chunk[1] >> 4));
            out.push((chunk[1] << 4) | (chunk[2] >> 2));
            out.push((chunk[2] << 6) | chunk[3]);
            chunk_len = 0;
        }
    }
    match chunk_len {
        0 => {}
        2 => out.push((chunk[0] << 2) | (chunk[1] >> 4)),
        3 => {
            out.push((chunk[0] << 2) | (chunk[1] >> 4));
            out.push((chunk[1] << 4) | (chunk[2] >> 2));
        }
        _ => return Err("truncated base64 input".to_string()),
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips_ascii() {
        let decoded = base64_decode("aGVsbG8=").unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[tokio::test]
    async fn synthesise_decodes_audio_and_cues() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/synthesise"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "audio_base64": "aGVsbG8=",
                "audio_ext": "mp3",
                "cues": [{"start": 0.0, "end": 1.0, "text": "hi"}],
            })))
            .mount(&server)
            .await;

        let client = HttpTtsClient::new(TtsClientConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
        });

        let request = TtsRequest {
            text: "hi".to_string(),
            voice_id: "v1".to_string(),
            language: "en".to_string(),
            rate: 100.0,
            volume: 100.0,
            pitch: 0.0,
            voice_sample_id: None,
        };

        let result = client.synthesise(&request).await.unwrap();
        assert_eq!(result.audio_bytes, b"hello");
        assert_eq!(result.audio_ext, "mp3");
        assert_eq!(result.cues.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn synthesise_surfaces_non_success_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/synthesise"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = HttpTtsClient::new(TtsClientConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
        });

        let request = TtsRequest {
            text: "hi".to_string(),
            voice_id: "v1".to_string(),
            language: "en".to_string(),
            rate: 100.0,
            volume: 100.0,
            pitch: 0.0,
            voice_sample_id: None,
        };

        assert!(client.synthesise(&request).await.is_err());
    }
}
