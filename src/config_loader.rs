use crate::backends::Quality;
use crate::breaker::BreakerConfig;
use crate::retry::RetryPolicy;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A network engine reachable over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBackendSettings {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_remote_quality")]
    pub quality: Quality,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Fallback chain
    #[serde(default = "default_fallback_chain")]
    pub fallback_chain: Vec<String>,
    #[serde(default = "default_local_engines")]
    pub local_engines: Vec<String>, // lowest tier last
    pub max_retries: u32,
    pub backend_timeout_ms: u64,
    // Circuit breaker
    pub failure_threshold: u32,
    pub breaker_base_timeout_secs: u64,
    pub breaker_max_timeout_secs: u64,
    // Recovery
    pub retry_base_delay_ms: u64,
    pub retry_max_attempts: u32,
    pub max_text_length: usize,
    // Bookkeeping
    pub error_history_size: usize,
    pub cache_capacity: usize,
    // Voices
    pub default_voice: String,
    #[serde(default = "default_context_voices")]
    pub context_voices: HashMap<String, String>,
    #[serde(default = "default_region_voices")]
    pub region_voices: HashMap<String, String>,
    #[serde(default)]
    pub voices_file: Option<String>, // JSON catalogue replacing the built-in one
    // Engines
    pub espeak_binary: String,
    pub piper_binary: String,
    #[serde(default)]
    pub piper_models_dir: Option<String>,
    #[serde(default = "default_remote_backends")]
    pub remote_backends: Vec<RemoteBackendSettings>,
    pub log_level: String,
}

fn default_remote_quality() -> Quality {
    Quality::High
}

fn default_fallback_chain() -> Vec<String> {
    vec!["remote".into(), "piper".into(), "espeak".into()]
}

fn default_local_engines() -> Vec<String> {
    vec!["piper".into(), "espeak".into()]
}

fn default_context_voices() -> HashMap<String, String> {
    [
        ("travel_planning", "australian_female_friendly"),
        ("financial", "british_male_authoritative"),
        ("emergency", "american_male_calm"),
        ("customer_service", "american_female_friendly"),
        ("casual", "australian_male_casual"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_region_voices() -> HashMap<String, String> {
    [
        ("US", "american_female_professional"),
        ("AU", "australian_female_friendly"),
        // No distinct NZ identity yet; the Australian one is the closest match.
        ("NZ", "australian_female_friendly"),
        ("GB", "british_female_professional"),
        ("UK", "british_female_professional"),
        ("IE", "irish_female_warm"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_remote_backends() -> Vec<RemoteBackendSettings> {
    vec![RemoteBackendSettings {
        name: "remote".to_string(),
        url: "http://127.0.0.1:5002/api/tts".to_string(),
        api_key: None,
        quality: Quality::High,
    }]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fallback_chain: default_fallback_chain(),
            local_engines: default_local_engines(),
            max_retries: 3,
            backend_timeout_ms: 15000,
            // Circuit breaker defaults
            failure_threshold: 5,
            breaker_base_timeout_secs: 60,
            breaker_max_timeout_secs: 300,
            // Recovery defaults
            retry_base_delay_ms: 500,
            retry_max_attempts: 3,
            max_text_length: 1000,
            error_history_size: 100,
            cache_capacity: 64,
            default_voice: "american_female_professional".to_string(),
            context_voices: default_context_voices(),
            region_voices: default_region_voices(),
            voices_file: None,
            espeak_binary: "espeak-ng".to_string(),
            piper_binary: "piper".to_string(),
            piper_models_dir: None,
            remote_backends: default_remote_backends(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then `./Gateway.*`, then `~/.config/speechd-gateway/Gateway.*`, then
    /// `GATEWAY_*` environment variables.
    pub fn new() -> Result<Self, config::ConfigError> {
        let user_file = format!(
            "{}/.config/speechd-gateway/Gateway",
            dirs::home_dir().unwrap_or_default().display()
        );

        let builder = Self::with_defaults()?
            // Merge with local config file (if exists)
            .add_source(File::with_name("Gateway").required(false))
            .add_source(File::with_name(&user_file).required(false))
            .add_source(Self::environment());

        Self::finish(builder)
    }

    /// Defaults, then the given file (must exist), then environment variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        let builder = Self::with_defaults()?
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(Self::environment());

        Self::finish(builder)
    }

    fn with_defaults() -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
        Config::builder()
            .set_default("max_retries", 3)?
            .set_default("backend_timeout_ms", 15000)?
            // Circuit breaker defaults
            .set_default("failure_threshold", 5)?
            .set_default("breaker_base_timeout_secs", 60)?
            .set_default("breaker_max_timeout_secs", 300)?
            // Recovery defaults
            .set_default("retry_base_delay_ms", 500)?
            .set_default("retry_max_attempts", 3)?
            .set_default("max_text_length", 1000)?
            .set_default("error_history_size", 100)?
            .set_default("cache_capacity", 64)?
            .set_default("default_voice", "american_female_professional")?
            .set_default("espeak_binary", "espeak-ng")?
            .set_default("piper_binary", "piper")?
            .set_default("log_level", "info")
    }

    // e.g. GATEWAY_MAX_RETRIES=5, GATEWAY_FALLBACK_CHAIN=piper,espeak
    fn environment() -> config::Environment {
        config::Environment::with_prefix("GATEWAY")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("fallback_chain")
            .with_list_parse_key("local_engines")
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self, config::ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.fallback_chain.is_empty() {
            return Err(config::ConfigError::Message(
                "fallback_chain must name at least one engine".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.fallback_chain.iter().find(|e| !seen.insert(e.as_str())) {
            return Err(config::ConfigError::Message(format!(
                "engine '{}' appears twice in fallback_chain",
                dup
            )));
        }
        if self.failure_threshold == 0 {
            return Err(config::ConfigError::Message(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.breaker_base_timeout_secs == 0
            || self.breaker_base_timeout_secs > self.breaker_max_timeout_secs
        {
            return Err(config::ConfigError::Message(format!(
                "Invalid breaker timeouts: base {}s, max {}s. Base must be positive and not exceed max",
                self.breaker_base_timeout_secs, self.breaker_max_timeout_secs
            )));
        }
        if self.max_retries == 0 {
            return Err(config::ConfigError::Message(
                "max_retries must be greater than 0".to_string(),
            ));
        }
        if self.backend_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "backend_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_text_length == 0 {
            return Err(config::ConfigError::Message(
                "max_text_length must be greater than 0".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for remote in &self.remote_backends {
            if remote.name.trim().is_empty() {
                return Err(config::ConfigError::Message(
                    "remote backend with an empty name".to_string(),
                ));
            }
            if !names.insert(remote.name.as_str()) {
                return Err(config::ConfigError::Message(format!(
                    "remote backend '{}' is defined twice",
                    remote.name
                )));
            }
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            base_timeout: Duration::from_secs(self.breaker_base_timeout_secs),
            max_timeout: Duration::from_secs(self.breaker_max_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_max_attempts,
        )
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn piper_models_dir(&self) -> PathBuf {
        match &self.piper_models_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share/piper/models"),
        }
    }
}
