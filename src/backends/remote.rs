use super::{wav_duration_ms, BackendError, Quality, SynthesisBackend, SynthesizedAudio};
use crate::config_loader::RemoteBackendSettings;
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    /// Base64-encoded audio
    audio: String,
    #[serde(default)]
    duration_ms: Option<u64>,
}

/// Network-backed engine: a remote function endpoint taking `{text, voice}` JSON and
/// answering with base64 audio (or a raw `audio/*` body).
pub struct RemoteBackend {
    name: String,
    url: String,
    api_key: Option<String>,
    quality: Quality,
    timeout: Duration,
    client: Client,
}

impl RemoteBackend {
    pub fn new(settings: &RemoteBackendSettings, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            name: settings.name.clone(),
            url: settings.url.clone(),
            api_key: settings.api_key.clone().filter(|k| !k.is_empty()),
            quality: settings.quality,
            timeout,
            client,
        }
    }
}

fn map_reqwest(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else if err.is_connect() {
        BackendError::Network(err.to_string())
    } else {
        BackendError::Http(err)
    }
}

#[async_trait]
impl SynthesisBackend for RemoteBackend {
    async fn initialize(&self) -> Result<bool, BackendError> {
        if self.url.trim().is_empty() {
            return Ok(false);
        }
        reqwest::Url::parse(&self.url).map_err(|e| {
            BackendError::NotReady(format!("{} has invalid url '{}': {}", self.name, self.url, e))
        })?;
        Ok(true)
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SynthesizedAudio, BackendError> {
        let mut request = self.client.post(&self.url).json(&json!({
            "text": text,
            "voice": voice_id,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Remote {
                status: status.as_u16(),
                message: if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("error").to_string()
                } else {
                    body.trim().to_string()
                },
            });
        }

        let is_audio = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with("audio/"));

        if is_audio {
            let audio = response
                .bytes()
                .await
                .map_err(|e| map_reqwest(e, self.timeout))?
                .to_vec();
            let duration_ms = wav_duration_ms(&audio).unwrap_or(0);
            debug!(engine = %self.name, bytes = audio.len(), "Remote engine returned raw audio");
            return Ok(SynthesizedAudio { audio, duration_ms });
        }

        let body: RemoteResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let audio = base64::engine::general_purpose::STANDARD
            .decode(body.audio.as_bytes())
            .map_err(|e| BackendError::InvalidResponse(format!("bad base64 audio: {}", e)))?;
        if audio.is_empty() {
            return Err(BackendError::InvalidResponse(format!(
                "{} returned empty audio",
                self.name
            )));
        }
        let duration_ms = body
            .duration_ms
            .or_else(|| wav_duration_ms(&audio))
            .unwrap_or(0);

        Ok(SynthesizedAudio { audio, duration_ms })
    }

    fn quality(&self) -> Quality {
        self.quality
    }

    fn is_local(&self) -> bool {
        false
    }
}
