use super::process::run_with_timeout;
use super::{wav_duration_ms, BackendError, Quality, SynthesisBackend, SynthesizedAudio};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// OS-level speech via the espeak-ng command. Always local, lowest quality tier.
pub struct EspeakBackend {
    binary: String,
    timeout: Duration,
}

impl EspeakBackend {
    pub fn new(binary: &str, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl SynthesisBackend for EspeakBackend {
    async fn initialize(&self) -> Result<bool, BackendError> {
        let status = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) => Ok(status.success()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SynthesizedAudio, BackendError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-v")
            .arg(voice_id)
            .arg("--stdout")
            .arg("--stdin");

        let audio = run_with_timeout("espeak-ng", command, text, self.timeout).await?;

        let duration_ms = wav_duration_ms(&audio).unwrap_or(0);
        Ok(SynthesizedAudio { audio, duration_ms })
    }

    fn quality(&self) -> Quality {
        Quality::Low
    }

    fn is_local(&self) -> bool {
        true
    }
}
