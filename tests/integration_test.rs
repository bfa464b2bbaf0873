use mockall::predicate::{always, eq};
use speechd_gateway::backends::{BackendError, BackendRegistry, Quality, SynthesisBackend, SynthesizedAudio};
use speechd_gateway::breaker::CircuitState;
use speechd_gateway::clock::ManualClock;
use speechd_gateway::config_loader::Settings;
use speechd_gateway::recovery::Strategy;
use speechd_gateway::resolver::ResolutionSource;
use speechd_gateway::{
    ErrorKind, RequestContext, SynthesisOrchestrator, SynthesisRequest, VoiceRegistry,
    VoiceResolver,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mockall::mock! {
    pub Backend {}
    #[async_trait::async_trait]
    impl SynthesisBackend for Backend {
        async fn initialize(&self) -> Result<bool, BackendError>;
        async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SynthesizedAudio, BackendError>;
        fn quality(&self) -> Quality;
        fn is_local(&self) -> bool;
    }
}

fn wav() -> SynthesizedAudio {
    SynthesizedAudio {
        audio: b"RIFF....WAVE".to_vec(),
        duration_ms: 250,
    }
}

fn backend(quality: Quality, local: bool) -> MockBackend {
    let mut mock = MockBackend::new();
    mock.expect_quality().return_const(quality);
    mock.expect_is_local().return_const(local);
    mock.expect_initialize().returning(|| Ok(true));
    mock
}

fn healthy(quality: Quality, local: bool) -> MockBackend {
    let mut mock = backend(quality, local);
    mock.expect_synthesize().returning(|_, _| Ok(wav()));
    mock
}

fn failing(quality: Quality, local: bool, message: &'static str, times: usize) -> MockBackend {
    let mut mock = backend(quality, local);
    mock.expect_synthesize()
        .times(times)
        .returning(move |_, _| Err(BackendError::NotReady(message.to_string())));
    mock
}

fn unused(quality: Quality, local: bool) -> MockBackend {
    let mut mock = backend(quality, local);
    mock.expect_synthesize().never();
    mock
}

fn settings() -> Settings {
    Settings {
        fallback_chain: vec!["edge".into(), "local".into(), "remote".into()],
        local_engines: vec!["local".into()],
        ..Settings::default()
    }
}

fn resolver(settings: &Settings) -> Arc<VoiceResolver> {
    Arc::new(VoiceResolver::new(
        Arc::new(VoiceRegistry::builtin()),
        settings.default_voice.clone(),
        settings.context_voices.clone(),
        settings.region_voices.clone(),
    ))
}

fn gateway(
    settings: &Settings,
    edge: MockBackend,
    local: MockBackend,
    remote: MockBackend,
) -> (SynthesisOrchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let backends = BackendRegistry::new()
        .with("edge", Arc::new(edge))
        .with("local", Arc::new(local))
        .with("remote", Arc::new(remote));
    let orchestrator = SynthesisOrchestrator::builder(settings, resolver(settings), backends)
        .clock(clock.clone())
        .build();
    (orchestrator, clock)
}

#[tokio::test]
async fn test_open_breaker_falls_through_to_local_engine() {
    let (gw, _) = gateway(
        &settings(),
        unused(Quality::High, false),
        healthy(Quality::Medium, true),
        unused(Quality::High, false),
    );
    for _ in 0..5 {
        gw.breaker().record_failure("edge");
    }
    assert_eq!(gw.breaker().state("edge"), CircuitState::Open);

    let resp = gw.synthesize(SynthesisRequest::new("Hello")).await;
    assert!(resp.has_audio());
    assert_eq!(resp.engine_used.as_deref(), Some("local"));
    assert_eq!(resp.quality, Quality::Medium);
    assert!(resp.fallback_used);
    assert_eq!(resp.attempts, 1);
}

#[tokio::test]
async fn test_all_engines_unavailable_degrades_to_text_only() {
    let (gw, _) = gateway(
        &settings(),
        failing(Quality::High, false, "service unavailable", 1),
        failing(Quality::Medium, true, "service unavailable", 1),
        failing(Quality::High, false, "service unavailable", 1),
    );

    let resp = gw.synthesize(SynthesisRequest::new("Hello there")).await;
    assert!(resp.audio.is_none());
    assert!(resp.fallback_used);
    assert_eq!(resp.text, "Hello there");
    assert_eq!(resp.quality, Quality::Fallback);
    assert!(resp.error.as_deref().unwrap().contains("service unavailable"));
    assert_eq!(resp.attempts, 3);
    assert_eq!(resp.strategies.last(), Some(&Strategy::TextOnly));

    let status = gw.get_status();
    assert_eq!(status.stats.text_only, 1);
    assert_eq!(status.recent_errors.len(), 3);
    assert!(status
        .recent_errors
        .iter()
        .all(|e| e.kind == ErrorKind::EngineUnavailable));
}

#[tokio::test]
async fn test_invalid_text_is_sanitized_and_retried() {
    let mut edge = backend(Quality::High, false);
    edge.expect_synthesize()
        .with(eq("Hello\u{0000}world"), always())
        .times(1)
        .returning(|_, _| {
            Err(BackendError::Remote {
                status: 400,
                message: "invalid character in input".into(),
            })
        });
    edge.expect_synthesize()
        .with(eq("Hello world"), always())
        .times(1)
        .returning(|_, _| Ok(wav()));

    let (gw, _) = gateway(
        &settings(),
        edge,
        unused(Quality::Medium, true),
        unused(Quality::High, false),
    );

    let resp = gw.synthesize(SynthesisRequest::new("Hello\u{0000}world")).await;
    assert!(resp.has_audio());
    assert_eq!(resp.engine_used.as_deref(), Some("edge"));
    assert!(resp.fallback_used);
    assert_eq!(resp.text, "Hello\u{0000}world");
    assert_eq!(resp.strategies, vec![Strategy::SanitizeText]);
}

#[tokio::test]
async fn test_repeated_network_failures_open_breaker() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut edge = backend(Quality::High, false);
    let counter = calls.clone();
    edge.expect_synthesize().returning(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Network("connection reset by peer".into()))
    });

    let (gw, clock) = gateway(
        &settings(),
        edge,
        healthy(Quality::Medium, true),
        unused(Quality::High, false),
    );

    for _ in 0..5 {
        let resp = gw
            .synthesize(SynthesisRequest::new("Hi").with_max_retries(1))
            .await;
        assert!(!resp.has_audio());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(gw.breaker().state("edge"), CircuitState::Open);

    let resp = gw
        .synthesize(SynthesisRequest::new("Hi").with_max_retries(1))
        .await;
    assert_eq!(resp.engine_used.as_deref(), Some("local"));
    assert!(resp.fallback_used);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let status = gw.get_status();
    let edge_status = &status.engines["edge"];
    assert_eq!(edge_status.circuit_state, CircuitState::Open);
    assert!(edge_status.retry_in_secs.unwrap() <= 60);
    assert!(edge_status.health_score < 1.0);

    // After the open timeout one caller gets the trial call; the rest keep skipping edge.
    clock.advance(Duration::from_secs(61));
    assert_eq!(gw.breaker().state("edge"), CircuitState::HalfOpen);
    assert!(gw.breaker().should_use("edge"));
    assert!(!gw.breaker().should_use("edge"));

    let resp = gw
        .synthesize(SynthesisRequest::new("Hi again").with_max_retries(1))
        .await;
    assert_eq!(resp.engine_used.as_deref(), Some("local"));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_network_backoff_schedule() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut edge = backend(Quality::High, false);
    edge.expect_synthesize().returning(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(BackendError::Network("dns lookup failed".into()))
        } else {
            Ok(wav())
        }
    });

    let (gw, clock) = gateway(
        &settings(),
        edge,
        unused(Quality::Medium, true),
        unused(Quality::High, false),
    );

    let resp = gw
        .synthesize(SynthesisRequest::new("Backoff").with_max_retries(4))
        .await;
    assert_eq!(resp.engine_used.as_deref(), Some("edge"));
    assert_eq!(resp.attempts, 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(500), Duration::from_secs(1)]
    );
    assert_eq!(gw.breaker().state("edge"), CircuitState::Closed);
    assert_eq!(gw.health().engine_health("edge").consecutive_failures, 0);
}

#[tokio::test]
async fn test_last_attempt_switches_instead_of_backing_off() {
    let mut edge = backend(Quality::High, false);
    edge.expect_synthesize()
        .times(2)
        .returning(|_, _| Err(BackendError::Network("connection reset by peer".into())));

    let (gw, clock) = gateway(
        &settings(),
        edge,
        healthy(Quality::Medium, true),
        unused(Quality::High, false),
    );

    let resp = gw.synthesize(SynthesisRequest::new("Hello")).await;
    assert!(resp.has_audio());
    assert_eq!(resp.engine_used.as_deref(), Some("local"));
    assert_eq!(resp.attempts, 3);
    assert_eq!(
        resp.strategies,
        vec![Strategy::RetryWithBackoff, Strategy::SwitchEngine]
    );
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(500)]);
}

#[tokio::test]
async fn test_spent_budget_returns_without_sleeping() {
    let (gw, clock) = gateway(
        &settings(),
        failing(Quality::High, false, "connection refused", 1),
        unused(Quality::Medium, true),
        unused(Quality::High, false),
    );

    let resp = gw
        .synthesize(SynthesisRequest::new("Hello").with_max_retries(1))
        .await;
    assert!(!resp.has_audio());
    assert_eq!(resp.attempts, 1);
    assert_eq!(resp.strategies, vec![Strategy::TextOnly]);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_lowest_tier_local_engine_gets_a_last_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut local = backend(Quality::Low, true);
    local.expect_synthesize().times(2).returning(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(BackendError::NotReady("audio device busy".into()))
        } else {
            Ok(wav())
        }
    });

    let (gw, _) = gateway(
        &settings(),
        failing(Quality::High, false, "401 Unauthorized", 1),
        local,
        failing(Quality::High, false, "quota exceeded", 1),
    );

    let resp = gw
        .synthesize(SynthesisRequest::new("Last resort").with_max_retries(4))
        .await;
    assert!(resp.has_audio());
    assert_eq!(resp.engine_used.as_deref(), Some("local"));
    assert_eq!(resp.attempts, 4);
    assert_eq!(
        resp.strategies,
        vec![
            Strategy::SwitchEngine,
            Strategy::SwitchEngine,
            Strategy::UseLocalEngine
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auth_failure_never_retries_same_engine() {
    let (gw, clock) = gateway(
        &settings(),
        failing(Quality::High, false, "401 Unauthorized", 1),
        healthy(Quality::Medium, true),
        unused(Quality::High, false),
    );

    let resp = gw.synthesize(SynthesisRequest::new("Hi")).await;
    assert_eq!(resp.engine_used.as_deref(), Some("local"));
    assert_eq!(resp.strategies, vec![Strategy::SwitchEngine]);
    assert!(clock.sleeps().is_empty());
    assert!(gw.health().health_score("edge") < 1.0);
}

#[tokio::test]
async fn test_voice_substitution_uses_engine_fallback_voice() {
    let mut edge = backend(Quality::High, false);
    edge.expect_synthesize()
        .with(always(), eq("en-GB-RyanNeural"))
        .times(1)
        .returning(|_, _| Err(BackendError::VoiceNotFound("en-GB-RyanNeural".into())));
    edge.expect_synthesize()
        .with(always(), eq("en-US-JennyNeural"))
        .times(1)
        .returning(|_, _| Ok(wav()));

    let (gw, _) = gateway(
        &settings(),
        edge,
        unused(Quality::Medium, true),
        unused(Quality::High, false),
    );

    let resp = gw
        .synthesize(SynthesisRequest::new("Cheers").with_voice("british male"))
        .await;
    assert_eq!(resp.voice_id_used, "en-US-JennyNeural");
    assert_eq!(resp.strategies, vec![Strategy::SubstituteVoice]);
    assert!(resp.fallback_used);
}

#[tokio::test]
async fn test_empty_override_goes_straight_to_text_only() {
    let settings = settings();
    let backends = BackendRegistry::new()
        .with("edge", Arc::new(failing(Quality::High, false, "service unavailable", 1)))
        .with("local", Arc::new(unused(Quality::Medium, true)))
        .with("remote", Arc::new(unused(Quality::High, false)));
    let gw = SynthesisOrchestrator::builder(&settings, resolver(&settings), backends)
        .clock(Arc::new(ManualClock::new()))
        .recovery_override(ErrorKind::EngineUnavailable, Vec::new())
        .build();

    let resp = gw.synthesize(SynthesisRequest::new("Hi")).await;
    assert!(!resp.has_audio());
    assert_eq!(resp.strategies, vec![Strategy::TextOnly]);
    assert_eq!(resp.attempts, 1);
}

#[tokio::test]
async fn test_unknown_preferred_engine_uses_chain() {
    let (gw, _) = gateway(
        &settings(),
        healthy(Quality::High, false),
        unused(Quality::Medium, true),
        unused(Quality::High, false),
    );

    let resp = gw
        .synthesize(SynthesisRequest::new("Hi").with_engine("nonexistent"))
        .await;
    assert_eq!(resp.engine_used.as_deref(), Some("edge"));
    assert!(!resp.fallback_used);
}

#[tokio::test]
async fn test_backend_timeout_is_classified() {
    struct Stuck;

    #[async_trait::async_trait]
    impl SynthesisBackend for Stuck {
        async fn initialize(&self) -> Result<bool, BackendError> {
            Ok(true)
        }
        async fn synthesize(&self, _: &str, _: &str) -> Result<SynthesizedAudio, BackendError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(wav())
        }
        fn quality(&self) -> Quality {
            Quality::High
        }
        fn is_local(&self) -> bool {
            false
        }
    }

    let settings = Settings {
        backend_timeout_ms: 50,
        ..settings()
    };
    let backends = BackendRegistry::new()
        .with("edge", Arc::new(Stuck))
        .with("local", Arc::new(healthy(Quality::Medium, true)))
        .with("remote", Arc::new(unused(Quality::High, false)));
    let gw = SynthesisOrchestrator::builder(&settings, resolver(&settings), backends)
        .clock(Arc::new(ManualClock::new()))
        .build();

    let resp = gw
        .synthesize(SynthesisRequest::new("Hi").with_max_retries(1))
        .await;
    assert!(!resp.has_audio());
    assert!(resp.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(gw.health().recent_errors(1)[0].kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_cancellation_stops_in_flight_call() {
    struct Slow;

    #[async_trait::async_trait]
    impl SynthesisBackend for Slow {
        async fn initialize(&self) -> Result<bool, BackendError> {
            Ok(true)
        }
        async fn synthesize(&self, _: &str, _: &str) -> Result<SynthesizedAudio, BackendError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(wav())
        }
        fn quality(&self) -> Quality {
            Quality::High
        }
        fn is_local(&self) -> bool {
            false
        }
    }

    let settings = settings();
    let backends = BackendRegistry::new()
        .with("edge", Arc::new(Slow))
        .with("local", Arc::new(unused(Quality::Medium, true)))
        .with("remote", Arc::new(unused(Quality::High, false)));
    let gw = SynthesisOrchestrator::new(&settings, resolver(&settings), backends);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let resp = gw
        .synthesize_with_cancel(SynthesisRequest::new("Never mind"), &token)
        .await;
    assert!(!resp.has_audio());
    assert_eq!(resp.error.as_deref(), Some("synthesis cancelled"));
    assert_eq!(resp.text, "Never mind");
    assert!(gw.health().recent_errors(10).is_empty());
    assert_eq!(gw.breaker().state("edge"), CircuitState::Closed);
}

#[tokio::test]
async fn test_cancelled_trial_call_is_released() {
    struct Slow;

    #[async_trait::async_trait]
    impl SynthesisBackend for Slow {
        async fn initialize(&self) -> Result<bool, BackendError> {
            Ok(true)
        }
        async fn synthesize(&self, _: &str, _: &str) -> Result<SynthesizedAudio, BackendError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(wav())
        }
        fn quality(&self) -> Quality {
            Quality::High
        }
        fn is_local(&self) -> bool {
            false
        }
    }

    let settings = settings();
    let clock = Arc::new(ManualClock::new());
    let backends = BackendRegistry::new()
        .with("edge", Arc::new(Slow))
        .with("local", Arc::new(unused(Quality::Medium, true)))
        .with("remote", Arc::new(unused(Quality::High, false)));
    let gw = SynthesisOrchestrator::builder(&settings, resolver(&settings), backends)
        .clock(clock.clone())
        .build();

    for _ in 0..5 {
        gw.breaker().record_failure("edge");
    }
    clock.advance(Duration::from_secs(60));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let resp = gw
        .synthesize_with_cancel(SynthesisRequest::new("Trial"), &token)
        .await;
    assert_eq!(resp.error.as_deref(), Some("synthesis cancelled"));
    assert_eq!(resp.attempts, 1);

    // The abandoned trial goes to the next caller.
    assert_eq!(gw.breaker().state("edge"), CircuitState::HalfOpen);
    assert!(gw.breaker().should_use("edge"));
}

#[test]
fn test_voice_resolution_rules() {
    let settings = settings();
    let resolver = resolver(&settings);
    let none = RequestContext::new();

    let by_native = resolver.resolve_with_source(Some("en-GB-RyanNeural"), &none);
    assert_eq!(by_native.identity.generic_id, "british_male_authoritative");
    assert_eq!(by_native.source, ResolutionSource::NativeId);

    let legacy = resolver.resolve(Some("pam_female_professional"), &none);
    assert_eq!(legacy.generic_id, "american_female_professional");
    assert_eq!(
        resolver.resolve(Some("en-US-JennyNeural"), &none).generic_id,
        legacy.generic_id
    );

    assert_eq!(
        resolver
            .resolve(Some("british female professional"), &none)
            .generic_id,
        "british_female_professional"
    );

    let described = resolver.resolve_with_source(Some("british male"), &none);
    assert_eq!(described.identity.generic_id, "british_male_authoritative");
    assert_eq!(described.source, ResolutionSource::Characteristics);

    let travel = RequestContext::new().with_usage("travel_planning");
    assert_eq!(
        resolver.resolve(None, &travel).generic_id,
        "australian_female_friendly"
    );

    let nz = RequestContext::new().with_region("nz");
    assert_eq!(resolver.resolve(None, &nz).generic_id, "australian_female_friendly");

    let unknown = resolver.resolve_with_source(Some("zzz-not-a-voice"), &none);
    assert_eq!(unknown.identity.generic_id, "american_female_professional");
    assert_eq!(unknown.source, ResolutionSource::Default);

    // Same input, same answer.
    for _ in 0..10 {
        assert_eq!(
            resolver.resolve(Some("female friendly"), &none).generic_id,
            resolver.resolve(Some("female friendly"), &none).generic_id
        );
    }
}
