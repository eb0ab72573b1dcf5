//! HTTP client for the external font provisioning service.
//!
//! Implements [`vclip_media::FontProvider`] for direct use by the export
//! pipeline's `fonts` stage; `is_available` is an inherent method used by
//! the render worker's pre-flight checks, mirroring [`crate::tts`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;
use vclip_media::FontProvider;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct FontClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl FontClientConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("FONT_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:9002".to_string()),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct HttpFontClient {
    http: reqwest::Client,
    config: FontClientConfig,
}

impl HttpFontClient {
    pub fn new(config: FontClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("font http client builds");
        Self { http, config }
    }

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
struct EnsureFontBody<'a> {
    family_name: &'a str,
}

#[async_trait]
impl FontProvider for HttpFontClient {
    async fn ensure_font(&self, family_name: &str) -> bool {
        let url = format!("{}/ensure", self.config.base_url);
        let body = EnsureFontBody { family_name };

        match self.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(family_name, status = %response.status(), "font provider rejected family");
                false
            }
            Err(e) => {
                warn!(family_name, error = %e, "font provider request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_font_true_on_success() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ensure"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpFontClient::new(FontClientConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
        });

        assert!(client.ensure_font("Roboto").await);
    }

    #[tokio::test]
    async fn ensure_font_false_on_error_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ensure"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpFontClient::new(FontClientConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
        });

        assert!(!client.ensure_font("Missing Family").await);
    }
}
