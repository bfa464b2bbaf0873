pub mod espeak;
pub mod piper;
pub mod process;
pub mod remote;

use crate::config_loader::Settings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Relative output quality of an engine. `Fallback` means no audio at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    High,
    Medium,
    Low,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    pub duration_ms: u64,
}

/// Failure reported by an engine adapter. The orchestrator only ever looks at the
/// `Display` text, which is what gets classified.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{engine} process failed: {message}")]
    Process { engine: String, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote engine returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("backend call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("engine not ready: {0}")]
    NotReady(String),

    #[error("voice not found: {0}")]
    VoiceNotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Contract every synthesis engine implements (cloud, local neural, OS speech command, ...).
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Probe the engine. `Ok(false)` means "installed but not usable right now".
    async fn initialize(&self) -> Result<bool, BackendError>;

    /// Returns encoded audio (usually WAV) for `text` spoken with the engine-native `voice_id`.
    async fn synthesize(&self, text: &str, voice_id: &str)
        -> Result<SynthesizedAudio, BackendError>;

    fn quality(&self) -> Quality;

    /// Local engines need no network and are the last resort before text-only output.
    fn is_local(&self) -> bool;
}

/// Engine name → adapter.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn SynthesisBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, backend: Arc<dyn SynthesisBackend>) -> Self {
        self.register(name, backend);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn SynthesisBackend>) {
        self.backends.insert(name.into(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SynthesisBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Concrete adapters described by the settings: espeak-ng, piper and every configured
    /// remote endpoint.
    pub fn from_settings(settings: &Settings) -> Self {
        let timeout = Duration::from_millis(settings.backend_timeout_ms);
        let mut registry = Self::new()
            .with(
                "espeak",
                Arc::new(espeak::EspeakBackend::new(&settings.espeak_binary, timeout)),
            )
            .with(
                "piper",
                Arc::new(piper::PiperBackend::new(
                    &settings.piper_binary,
                    settings.piper_models_dir(),
                    timeout,
                )),
            );

        for remote in &settings.remote_backends {
            registry.register(
                remote.name.clone(),
                Arc::new(remote::RemoteBackend::new(remote, timeout)),
            );
        }
        registry
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Playback length of a WAV buffer. Uses the byte count rather than the header's data
/// length, since streamed WAV output often carries a placeholder size.
pub fn wav_duration_ms(bytes: &[u8]) -> Option<u64> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).ok()?;
    let spec = reader.spec();
    let bytes_per_sec =
        spec.sample_rate as u64 * spec.channels as u64 * (spec.bits_per_sample as u64 / 8);
    if bytes_per_sec == 0 {
        return None;
    }
    let data = (bytes.len() as u64).saturating_sub(44);
    Some(data * 1000 / bytes_per_sec)
}
