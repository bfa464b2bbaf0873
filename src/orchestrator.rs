use crate::backends::{millis, BackendError, BackendRegistry};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::cache::{AudioCache, CachedAudio};
use crate::classifier::{ClassifiedError, ErrorClassifier, ErrorKind};
use crate::clock::{Clock, SystemClock};
use crate::config_loader::Settings;
use crate::health::HealthTracker;
use crate::recovery::{AttemptRequest, RecoveryConfig, RecoveryExecutor, RecoveryOutcome, Strategy};
use crate::resolver::{RequestContext, VoiceResolver};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use crate::backends::Quality;

const RECENT_ERRORS_IN_STATUS: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct SynthesisRequest {
    pub text: String,
    /// Generic ID, engine-native ID, characteristics phrase, or nothing.
    pub voice_id: Option<String>,
    pub preferred_engine: Option<String>,
    /// Total attempt budget across all engines. `None` uses the configured default.
    pub max_retries: Option<u32>,
    pub context: RequestContext,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice_id = Some(voice.into());
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.preferred_engine = Some(engine.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisResponse {
    /// Encoded audio. `None` means text-only output.
    #[serde(skip)]
    pub audio: Option<Vec<u8>>,
    pub text: String,
    pub engine_used: Option<String>,
    pub quality: Quality,
    pub duration_ms: u64,
    pub cache_hit: bool,
    /// Engine-native voice on success, generic identity otherwise.
    pub voice_id_used: String,
    pub error: Option<String>,
    pub fallback_used: bool,
    pub processing_time_ms: u64,
    pub attempts: u32,
    /// Recovery strategies applied on the way to this response, in order.
    pub strategies: Vec<Strategy>,
}

impl SynthesisResponse {
    /// Degraded response carrying the caller's text and no audio.
    pub fn text_only(text: String, voice_id: String, error: String) -> Self {
        Self {
            audio: None,
            text,
            engine_used: None,
            quality: Quality::Fallback,
            duration_ms: 0,
            cache_hit: false,
            voice_id_used: voice_id,
            error: Some(error),
            fallback_used: true,
            processing_time_ms: 0,
            attempts: 0,
            strategies: Vec::new(),
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub fallback_chain: Vec<String>,
    pub max_retries: u32,
    pub backend_timeout: Duration,
    pub cache_capacity: usize,
}

impl From<&Settings> for OrchestratorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            fallback_chain: settings.fallback_chain.clone(),
            max_retries: settings.max_retries,
            backend_timeout: settings.backend_timeout(),
            cache_capacity: settings.cache_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub registered: bool,
    pub available: bool,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub retry_in_secs: Option<u64>,
    pub health_score: f64,
    pub consecutive_failures: u32,
    pub total_errors: u64,
    pub quality: Option<Quality>,
    pub local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestStats {
    pub total_requests: u64,
    pub successes: u64,
    pub fallbacks: u64,
    pub text_only: u64,
    pub cache_hits: u64,
    pub avg_processing_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub engines: BTreeMap<String, EngineStatus>,
    pub fallback_chain: Vec<String>,
    pub stats: RequestStats,
    pub recent_errors: Vec<ClassifiedError>,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    successes: AtomicU64,
    fallbacks: AtomicU64,
    text_only: AtomicU64,
    cache_hits: AtomicU64,
    processing_ms: AtomicU64,
}

impl Counters {
    fn record(&self, response: &SynthesisResponse) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.processing_ms
            .fetch_add(response.processing_time_ms, Ordering::Relaxed);
        if response.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if response.has_audio() {
            self.successes.fetch_add(1, Ordering::Relaxed);
            if response.fallback_used {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.text_only.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> RequestStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let processing = self.processing_ms.load(Ordering::Relaxed);
        RequestStats {
            total_requests: total,
            successes: self.successes.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            text_only: self.text_only.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            avg_processing_ms: if total == 0 {
                0.0
            } else {
                processing as f64 / total as f64
            },
        }
    }
}

/// Wires the orchestrator's collaborators. Anything not supplied is built from the
/// settings with the system clock.
pub struct OrchestratorBuilder {
    settings: Settings,
    resolver: Arc<VoiceResolver>,
    backends: BackendRegistry,
    clock: Option<Arc<dyn Clock>>,
    health: Option<Arc<HealthTracker>>,
    breaker: Option<Arc<CircuitBreaker>>,
    overrides: Vec<(ErrorKind, Vec<Strategy>)>,
}

impl OrchestratorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn health(mut self, health: Arc<HealthTracker>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Replace the recovery strategies for one error kind.
    pub fn recovery_override(mut self, kind: ErrorKind, strategies: Vec<Strategy>) -> Self {
        self.overrides.push((kind, strategies));
        self
    }

    pub fn build(self) -> SynthesisOrchestrator {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let health = self
            .health
            .unwrap_or_else(|| Arc::new(HealthTracker::new(self.settings.error_history_size)));
        let breaker = self.breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::with_clock(
                self.settings.breaker_config(),
                clock.clone(),
            ))
        });
        let mut recovery =
            RecoveryExecutor::new(RecoveryConfig::from(&self.settings), self.resolver.clone());
        for (kind, strategies) in self.overrides {
            recovery = recovery.with_override(kind, strategies);
        }
        let config = OrchestratorConfig::from(&self.settings);

        SynthesisOrchestrator {
            cache: AudioCache::new(config.cache_capacity),
            config,
            resolver: self.resolver,
            backends: self.backends,
            classifier: ErrorClassifier::new(),
            health,
            breaker,
            recovery,
            clock,
            availability: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }
}

/// Runs each request through the ranked engine chain until one produces audio, or
/// degrades to a text-only response. Never returns an error to the caller.
pub struct SynthesisOrchestrator {
    config: OrchestratorConfig,
    resolver: Arc<VoiceResolver>,
    backends: BackendRegistry,
    classifier: ErrorClassifier,
    health: Arc<HealthTracker>,
    breaker: Arc<CircuitBreaker>,
    recovery: RecoveryExecutor,
    clock: Arc<dyn Clock>,
    cache: AudioCache,
    /// Result of `initialize`; engines never probed count as available.
    availability: RwLock<HashMap<String, bool>>,
    counters: Counters,
}

enum AttemptError {
    Failed(String),
    Cancelled,
}

impl SynthesisOrchestrator {
    pub fn builder(
        settings: &Settings,
        resolver: Arc<VoiceResolver>,
        backends: BackendRegistry,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings: settings.clone(),
            resolver,
            backends,
            clock: None,
            health: None,
            breaker: None,
            overrides: Vec::new(),
        }
    }

    pub fn new(settings: &Settings, resolver: Arc<VoiceResolver>, backends: BackendRegistry) -> Self {
        Self::builder(settings, resolver, backends).build()
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn resolver(&self) -> &Arc<VoiceResolver> {
        &self.resolver
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Probe every registered engine once. Engines that report not-ready or fail the
    /// probe are skipped by `synthesize` until the next `initialize`.
    pub async fn initialize(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for name in self.backends.names() {
            let Some(backend) = self.backends.get(&name) else {
                continue;
            };
            let ready = match backend.initialize().await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(engine = %name, error = %e, "Engine probe failed");
                    false
                }
            };
            if ready {
                info!(engine = %name, "Engine ready");
            } else {
                warn!(engine = %name, "Engine not ready, excluding from fallback chain");
            }
            results.insert(name, ready);
        }

        for engine in &self.config.fallback_chain {
            if !self.backends.contains(engine) {
                warn!(engine = %engine, "Fallback chain names an engine with no adapter");
            }
        }

        let mut availability = self.availability.write().unwrap_or_else(|e| e.into_inner());
        availability.clear();
        availability.extend(results.iter().map(|(k, v)| (k.clone(), *v)));
        results
    }

    fn is_available(&self, engine: &str) -> bool {
        self.backends.contains(engine)
            && self
                .availability
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(engine)
                .copied()
                .unwrap_or(true)
    }

    /// Preferred engine first (when usable), then the configured chain.
    fn engine_order(&self, preferred: Option<&str>) -> Vec<String> {
        let mut order = Vec::new();
        if let Some(engine) = preferred {
            if self.is_available(engine) {
                order.push(engine.to_string());
            } else {
                debug!(engine = %engine, "Preferred engine unavailable, using fallback chain");
            }
        }
        for engine in &self.config.fallback_chain {
            if !order.contains(engine) && self.is_available(engine) {
                order.push(engine.clone());
            }
        }
        order
    }

    /// Sticky engine if it is still allowed, else the first candidate whose breaker admits calls.
    fn next_engine(&self, work: &mut AttemptRequest) -> Option<String> {
        if let Some(current) = work.current_engine.clone() {
            if work.candidates.contains(&current) && self.breaker.should_use(&current) {
                return Some(current);
            }
        }
        let next = work
            .candidates
            .iter()
            .find(|engine| {
                let allowed = self.breaker.should_use(engine);
                if !allowed {
                    debug!(engine = %engine, "Circuit open, skipping engine");
                }
                allowed
            })
            .cloned();
        work.current_engine = next.clone();
        next
    }

    pub async fn synthesize(&self, request: SynthesisRequest) -> SynthesisResponse {
        self.synthesize_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like `synthesize`, but gives up as soon as `cancel` fires. A cancelled request
    /// returns text-only output and is not counted against any engine.
    pub async fn synthesize_with_cancel(
        &self,
        request: SynthesisRequest,
        cancel: &CancellationToken,
    ) -> SynthesisResponse {
        let started = Instant::now();
        let mut response = self.run(request, cancel).await;
        response.processing_time_ms = millis(started.elapsed());
        self.counters.record(&response);

        if response.has_audio() {
            info!(
                engine = response.engine_used.as_deref().unwrap_or("-"),
                voice = %response.voice_id_used,
                fallback = response.fallback_used,
                cache_hit = response.cache_hit,
                ms = response.processing_time_ms,
                "Synthesis complete"
            );
        } else {
            warn!(
                error = response.error.as_deref().unwrap_or("-"),
                attempts = response.attempts,
                "Synthesis degraded to text-only"
            );
        }
        response
    }

    async fn run(&self, request: SynthesisRequest, cancel: &CancellationToken) -> SynthesisResponse {
        let identity = self
            .resolver
            .resolve(request.voice_id.as_deref(), &request.context);
        let voice = identity.generic_id.clone();

        if request.text.trim().is_empty() {
            return SynthesisResponse::text_only(request.text, voice, "empty text".to_string());
        }

        if let Some(hit) = self.cache.get(&request.text, &voice) {
            debug!(voice = %voice, "Audio cache hit");
            return SynthesisResponse {
                audio: Some(hit.audio.as_ref().clone()),
                text: request.text,
                engine_used: Some(hit.engine),
                quality: hit.quality,
                duration_ms: hit.duration_ms,
                cache_hit: true,
                voice_id_used: hit.voice_id_used,
                error: None,
                fallback_used: false,
                processing_time_ms: 0,
                attempts: 0,
                strategies: Vec::new(),
            };
        }

        let order = self.engine_order(request.preferred_engine.as_deref());
        let primary = order.first().cloned();
        let budget = request
            .max_retries
            .unwrap_or(self.config.max_retries)
            .max(1);
        let mut work = AttemptRequest::new(request.text, voice, order);
        let mut attempts = 0u32;
        let mut strategies = Vec::new();
        let mut last_error: Option<ClassifiedError> = None;

        while attempts < budget {
            if cancel.is_cancelled() {
                return cancelled(&work, attempts, strategies);
            }
            let Some(engine) = self.next_engine(&mut work) else {
                break;
            };
            let Some(backend) = self.backends.get(&engine) else {
                self.breaker.release_trial(&engine);
                work.candidates.retain(|c| c != &engine);
                continue;
            };
            let native_voice = work.engine_voice(&engine, &self.resolver);
            attempts += 1;
            debug!(engine = %engine, voice = %native_voice, attempt = attempts, "Calling engine");

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(AttemptError::Cancelled),
                outcome = tokio::time::timeout(
                    self.config.backend_timeout,
                    backend.synthesize(&work.text, &native_voice),
                ) => match outcome {
                    Ok(Ok(audio)) => Ok(audio),
                    Ok(Err(e)) => Err(AttemptError::Failed(e.to_string())),
                    Err(_) => Err(AttemptError::Failed(
                        BackendError::Timeout(self.config.backend_timeout).to_string(),
                    )),
                },
            };

            let message = match result {
                Ok(audio) => {
                    self.health.record_success(&engine);
                    self.breaker.record_success(&engine);
                    let quality = backend.quality();
                    let fallback_used = attempts > 1
                        || primary.as_deref() != Some(engine.as_str())
                        || work.is_modified();
                    if !work.is_modified() {
                        self.cache.insert(
                            &work.original_text,
                            &work.voice_id,
                            CachedAudio {
                                audio: Arc::new(audio.audio.clone()),
                                duration_ms: audio.duration_ms,
                                engine: engine.clone(),
                                quality,
                                voice_id_used: native_voice.clone(),
                            },
                        );
                    }
                    return SynthesisResponse {
                        audio: Some(audio.audio),
                        text: work.original_text,
                        engine_used: Some(engine),
                        quality,
                        duration_ms: audio.duration_ms,
                        cache_hit: false,
                        voice_id_used: native_voice,
                        error: None,
                        fallback_used,
                        processing_time_ms: 0,
                        attempts,
                        strategies,
                    };
                }
                Err(AttemptError::Cancelled) => {
                    self.breaker.release_trial(&engine);
                    return cancelled(&work, attempts, strategies);
                }
                Err(AttemptError::Failed(message)) => message,
            };

            let err = self.classifier.classify(&message, &engine);
            warn!(
                engine = %engine,
                kind = %err.kind,
                severity = ?err.severity,
                error = %err.message,
                "Engine attempt failed"
            );
            self.health.record_error(&err);
            self.breaker.record_failure(&engine);

            if attempts >= budget {
                last_error = Some(err);
                break;
            }
            work.attempts_left = budget - attempts;
            match self.recovery.execute(&err, &work) {
                RecoveryOutcome::Retry {
                    request: next,
                    strategy,
                    delay,
                } => {
                    work = next;
                    strategies.push(strategy);
                    if let Some(delay) = delay {
                        tokio::select! {
                            _ = cancel.cancelled() => return cancelled(&work, attempts, strategies),
                            _ = self.clock.sleep(delay) => {}
                        }
                    }
                }
                RecoveryOutcome::Terminal(mut response) => {
                    strategies.push(Strategy::TextOnly);
                    response.attempts = attempts;
                    response.strategies = strategies;
                    return response;
                }
            }
            last_error = Some(err);
        }

        let error = match last_error {
            Some(err) => err.message,
            None => "no synthesis engine available".to_string(),
        };
        let mut response = SynthesisResponse::text_only(work.original_text, work.voice_id, error);
        response.attempts = attempts;
        strategies.push(Strategy::TextOnly);
        response.strategies = strategies;
        response
    }

    pub fn get_status(&self) -> GatewayStatus {
        let mut names = self.backends.names();
        for engine in &self.config.fallback_chain {
            if !names.contains(engine) {
                names.push(engine.clone());
            }
        }

        let report = self.health.health_report();
        let engines = names
            .into_iter()
            .map(|name| {
                let breaker = self.breaker.snapshot(&name);
                let health = report.get(&name).cloned().unwrap_or_default();
                let backend = self.backends.get(&name);
                let status = EngineStatus {
                    registered: backend.is_some(),
                    available: self.is_available(&name),
                    circuit_state: breaker.state,
                    failure_count: breaker.failure_count,
                    retry_in_secs: breaker.retry_in_secs,
                    health_score: health.health_score,
                    consecutive_failures: health.consecutive_failures,
                    total_errors: health.total_errors,
                    quality: backend.as_ref().map(|b| b.quality()),
                    local: backend.as_ref().map_or(false, |b| b.is_local()),
                };
                (name, status)
            })
            .collect();

        GatewayStatus {
            engines,
            fallback_chain: self.config.fallback_chain.clone(),
            stats: self.counters.snapshot(),
            recent_errors: self.health.recent_errors(RECENT_ERRORS_IN_STATUS),
        }
    }

    /// Force an engine's breaker closed, e.g. after an operator fixed its credentials.
    pub fn reset_engine(&self, engine: &str) {
        self.breaker.reset(engine);
    }
}

fn cancelled(work: &AttemptRequest, attempts: u32, strategies: Vec<Strategy>) -> SynthesisResponse {
    let mut response = SynthesisResponse::text_only(
        work.original_text.clone(),
        work.voice_id.clone(),
        "synthesis cancelled".to_string(),
    );
    response.attempts = attempts;
    response.strategies = strategies;
    response
}
