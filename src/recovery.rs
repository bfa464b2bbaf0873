use crate::classifier::{ClassifiedError, ErrorKind};
use crate::backends::millis;
use crate::config_loader::Settings;
use crate::orchestrator::SynthesisResponse;
use crate::resolver::{fallback_voice_for, VoiceResolver};
use crate::retry::RetryPolicy;
use crate::text;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A remediation step tried in response to a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RetryWithBackoff,
    SwitchEngine,
    UseLocalEngine,
    SubstituteVoice,
    DefaultVoice,
    SanitizeText,
    TruncateText,
    SplitText,
    TextOnly,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::RetryWithBackoff => "retry_with_backoff",
            Strategy::SwitchEngine => "switch_engine",
            Strategy::UseLocalEngine => "use_local_engine",
            Strategy::SubstituteVoice => "substitute_voice",
            Strategy::DefaultVoice => "default_voice",
            Strategy::SanitizeText => "sanitize_text",
            Strategy::TruncateText => "truncate_text",
            Strategy::SplitText => "split_text",
            Strategy::TextOnly => "text_only",
        };
        f.write_str(name)
    }
}

/// Built-in strategy order per error kind, before the text-only terminal step.
pub fn default_strategies(kind: ErrorKind) -> &'static [Strategy] {
    use Strategy::*;
    match kind {
        ErrorKind::Network | ErrorKind::Timeout => &[RetryWithBackoff, SwitchEngine],
        ErrorKind::Authentication | ErrorKind::QuotaExceeded | ErrorKind::EngineUnavailable => {
            &[SwitchEngine, UseLocalEngine]
        }
        ErrorKind::VoiceNotFound => &[SubstituteVoice, DefaultVoice, SwitchEngine],
        ErrorKind::InvalidText => &[SanitizeText, TruncateText, SplitText],
        ErrorKind::Configuration | ErrorKind::System | ErrorKind::Unknown => &[SwitchEngine],
    }
}

/// Mutable working copy of a request as it moves through the fallback loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRequest {
    pub original_text: String,
    pub text: String,
    pub original_voice: String,
    /// Generic voice identity
    pub voice_id: String,
    /// Per-engine native voice forced by voice substitution.
    pub voice_overrides: HashMap<String, String>,
    /// Every engine the request started with, in priority order.
    pub engines: Vec<String>,
    /// Engines still eligible, in priority order.
    pub candidates: Vec<String>,
    /// Engine pinned for the next attempt, if any.
    pub current_engine: Option<String>,
    pub backoff_attempts: HashMap<String, u32>,
    /// Engine calls the request may still make.
    pub attempts_left: u32,
    applied: HashSet<(String, Strategy)>,
}

impl AttemptRequest {
    pub fn new(text: impl Into<String>, voice_id: impl Into<String>, candidates: Vec<String>) -> Self {
        let text = text.into();
        let voice_id = voice_id.into();
        Self {
            original_text: text.clone(),
            text,
            original_voice: voice_id.clone(),
            voice_id,
            voice_overrides: HashMap::new(),
            engines: candidates.clone(),
            candidates,
            current_engine: None,
            backoff_attempts: HashMap::new(),
            attempts_left: u32::MAX,
            applied: HashSet::new(),
        }
    }

    /// Native voice ID to send to `engine` for this attempt.
    pub fn engine_voice(&self, engine: &str, resolver: &VoiceResolver) -> String {
        if let Some(voice) = self.voice_overrides.get(engine) {
            return voice.clone();
        }
        let identity = resolver
            .registry()
            .get(&self.voice_id)
            .unwrap_or_else(|| resolver.default_identity());
        resolver.backend_voice_id(identity, engine)
    }

    /// True once text or voice differ from what the caller asked for.
    pub fn is_modified(&self) -> bool {
        self.text != self.original_text
            || self.voice_id != self.original_voice
            || !self.voice_overrides.is_empty()
    }

    fn mark(&mut self, scope: &str, strategy: Strategy) -> bool {
        self.applied.insert((scope.to_string(), strategy))
    }

    fn was_applied(&self, scope: &str, strategy: Strategy) -> bool {
        self.applied.contains(&(scope.to_string(), strategy))
    }
}

#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Try again with the modified request, after `delay` if set.
    Retry {
        request: AttemptRequest,
        strategy: Strategy,
        delay: Option<Duration>,
    },
    Terminal(SynthesisResponse),
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub retry_policy: RetryPolicy,
    /// Local engines, best first; the last one is the lowest tier.
    pub local_engines: Vec<String>,
    pub max_text_length: usize,
}

impl From<&Settings> for RecoveryConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            retry_policy: settings.retry_policy(),
            local_engines: settings.local_engines.clone(),
            max_text_length: settings.max_text_length,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Picks the first applicable strategy for a classified error.
///
/// Every strategy list ends in `TextOnly`, and each non-terminal strategy either spends a
/// bounded budget (backoff attempts, candidate engines) or applies at most once per
/// request, so repeated calls for one request always reach a terminal outcome.
pub struct RecoveryExecutor {
    config: RecoveryConfig,
    resolver: Arc<VoiceResolver>,
    overrides: HashMap<ErrorKind, Vec<Strategy>>,
}

impl RecoveryExecutor {
    pub fn new(config: RecoveryConfig, resolver: Arc<VoiceResolver>) -> Self {
        Self {
            config,
            resolver,
            overrides: HashMap::new(),
        }
    }

    /// Replace the strategy list for `kind`. Text-only fallback is still appended.
    pub fn with_override(mut self, kind: ErrorKind, strategies: Vec<Strategy>) -> Self {
        self.overrides.insert(kind, strategies);
        self
    }

    pub fn strategies_for(&self, kind: ErrorKind) -> Vec<Strategy> {
        let mut list: Vec<Strategy> = match self.overrides.get(&kind) {
            Some(custom) => custom.clone(),
            None => default_strategies(kind).to_vec(),
        };
        if list.last() != Some(&Strategy::TextOnly) {
            list.push(Strategy::TextOnly);
        }
        list
    }

    pub fn execute(&self, err: &ClassifiedError, request: &AttemptRequest) -> RecoveryOutcome {
        for strategy in self.strategies_for(err.kind) {
            if let Some(outcome) = self.apply(strategy, err, request) {
                match &outcome {
                    RecoveryOutcome::Retry { delay, .. } => info!(
                        engine = %err.engine,
                        kind = %err.kind,
                        %strategy,
                        delay_ms = delay.map(millis),
                        "Recovery strategy applied"
                    ),
                    RecoveryOutcome::Terminal(_) => info!(
                        engine = %err.engine,
                        kind = %err.kind,
                        "Recovery exhausted, degrading to text-only"
                    ),
                }
                return outcome;
            }
            debug!(%strategy, kind = %err.kind, "Strategy not applicable");
        }
        RecoveryOutcome::Terminal(self.text_only(err, request))
    }

    fn text_only(&self, err: &ClassifiedError, request: &AttemptRequest) -> SynthesisResponse {
        SynthesisResponse::text_only(
            request.original_text.clone(),
            request.voice_id.clone(),
            err.message.clone(),
        )
    }

    fn retry(request: AttemptRequest, strategy: Strategy) -> Option<RecoveryOutcome> {
        Some(RecoveryOutcome::Retry {
            request,
            strategy,
            delay: None,
        })
    }

    fn apply(
        &self,
        strategy: Strategy,
        err: &ClassifiedError,
        request: &AttemptRequest,
    ) -> Option<RecoveryOutcome> {
        let engine = err.engine.as_str();
        match strategy {
            Strategy::RetryWithBackoff => {
                // The last call goes to another engine when there is one.
                if request.attempts_left <= 1 && request.candidates.iter().any(|c| c != engine) {
                    return None;
                }
                let attempt = request.backoff_attempts.get(engine).copied().unwrap_or(0);
                let delay = self.config.retry_policy.delay_for(attempt)?;
                let mut next = request.clone();
                next.backoff_attempts.insert(engine.to_string(), attempt + 1);
                next.current_engine = Some(engine.to_string());
                Some(RecoveryOutcome::Retry {
                    request: next,
                    strategy,
                    delay: Some(delay),
                })
            }
            Strategy::SwitchEngine => {
                let remaining: Vec<String> = request
                    .candidates
                    .iter()
                    .filter(|c| c.as_str() != engine)
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    return None;
                }
                let mut next = request.clone();
                next.candidates = remaining;
                next.current_engine = None;
                Self::retry(next, strategy)
            }
            Strategy::UseLocalEngine => {
                // One last call to the lowest tier, even if it was dropped earlier.
                if request.was_applied("*", strategy) {
                    return None;
                }
                let local = self
                    .config
                    .local_engines
                    .iter()
                    .rev()
                    .find(|l| l.as_str() != engine && request.engines.contains(l))?;
                let mut next = request.clone();
                next.mark("*", strategy);
                next.candidates.retain(|c| c.as_str() != engine);
                if !next.candidates.contains(local) {
                    next.candidates.push(local.clone());
                }
                next.current_engine = Some(local.clone());
                Self::retry(next, strategy)
            }
            Strategy::SubstituteVoice => {
                let fallback = fallback_voice_for(engine);
                if request.was_applied(engine, strategy)
                    || request.engine_voice(engine, &self.resolver) == fallback
                {
                    return None;
                }
                let mut next = request.clone();
                next.mark(engine, strategy);
                next.voice_overrides
                    .insert(engine.to_string(), fallback.to_string());
                next.current_engine = Some(engine.to_string());
                Self::retry(next, strategy)
            }
            Strategy::DefaultVoice => {
                let default = self.resolver.default_identity();
                let default_native = self.resolver.backend_voice_id(default, engine);
                if request.was_applied(engine, strategy)
                    || request.engine_voice(engine, &self.resolver) == default_native
                {
                    return None;
                }
                let mut next = request.clone();
                next.mark(engine, strategy);
                next.voice_id = default.generic_id.clone();
                next.voice_overrides.remove(engine);
                next.current_engine = Some(engine.to_string());
                Self::retry(next, strategy)
            }
            Strategy::SanitizeText => {
                let mut cleaned = text::sanitize(&request.text, false);
                if cleaned == request.text {
                    cleaned = text::sanitize(&request.text, true);
                }
                self.with_text(request, engine, strategy, cleaned)
            }
            Strategy::TruncateText => {
                if request.text.chars().count() <= self.config.max_text_length {
                    return None;
                }
                let cut = text::truncate(&request.text, self.config.max_text_length);
                self.with_text(request, engine, strategy, cut)
            }
            Strategy::SplitText => {
                let limit = (self.config.max_text_length / 2).max(1);
                let head = text::leading_sentences(&request.text, limit);
                self.with_text(request, engine, strategy, head)
            }
            Strategy::TextOnly => Some(RecoveryOutcome::Terminal(self.text_only(err, request))),
        }
    }

    fn with_text(
        &self,
        request: &AttemptRequest,
        engine: &str,
        strategy: Strategy,
        new_text: String,
    ) -> Option<RecoveryOutcome> {
        if new_text.trim().is_empty() || new_text == request.text {
            return None;
        }
        let mut next = request.clone();
        next.text = new_text;
        next.current_engine = Some(engine.to_string());
        Self::retry(next, strategy)
    }
}
