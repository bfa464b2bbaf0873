use super::process::run_with_timeout;
use super::{wav_duration_ms, BackendError, Quality, SynthesisBackend, SynthesizedAudio};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Local neural TTS through the piper CLI. Voices are `<id>.onnx` + `<id>.onnx.json`
/// pairs in the models directory.
pub struct PiperBackend {
    binary_path: String,
    models_dir: PathBuf,
    timeout: Duration,
}

impl PiperBackend {
    pub fn new(binary_path: &str, models_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.to_string(),
            models_dir,
            timeout,
        }
    }

    fn find_model_files(&self, voice_id: &str) -> Option<(PathBuf, PathBuf)> {
        let onnx = self.models_dir.join(format!("{}.onnx", voice_id));
        let config = self.models_dir.join(format!("{}.onnx.json", voice_id));

        if onnx.exists() && config.exists() {
            Some((onnx, config))
        } else {
            None
        }
    }

    /// Installed voice IDs (file stems of `.onnx` models).
    pub fn installed_voices(&self) -> Vec<String> {
        installed_models(&self.models_dir)
    }
}

fn installed_models(dir: &Path) -> Vec<String> {
    let mut voices = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("onnx") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    voices.push(stem.to_string());
                }
            }
        }
    }
    voices.sort();
    voices
}

#[async_trait]
impl SynthesisBackend for PiperBackend {
    async fn initialize(&self) -> Result<bool, BackendError> {
        Ok(!self.installed_voices().is_empty())
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SynthesizedAudio, BackendError> {
        let (onnx_path, _config_path) = self.find_model_files(voice_id).ok_or_else(|| {
            BackendError::VoiceNotFound(format!(
                "piper model for '{}' not installed in {}",
                voice_id,
                self.models_dir.display()
            ))
        })?;

        let mut command = Command::new(&self.binary_path);
        command
            .arg("-m")
            .arg(&onnx_path)
            .arg("--output_file")
            .arg("-"); // Output WAV to stdout

        let audio = run_with_timeout("piper", command, text, self.timeout).await?;

        let duration_ms = wav_duration_ms(&audio).unwrap_or(0);
        Ok(SynthesizedAudio { audio, duration_ms })
    }

    fn quality(&self) -> Quality {
        Quality::Medium
    }

    fn is_local(&self) -> bool {
        true
    }
}
