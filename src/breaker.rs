use crate::clock::{Clock, SystemClock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_retry_at: Option<Instant>,
    timeout: Duration,
    /// Opens since the breaker last closed; drives the backoff doubling.
    opens: u32,
    /// When the single half-open trial call was handed out.
    trial_started_at: Option<Instant>,
}

impl BreakerEntry {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_retry_at: None,
            timeout: config.base_timeout,
            opens: 0,
            trial_started_at: None,
        }
    }
}

/// Point-in-time view of one engine's breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub timeout_secs: u64,
    /// Seconds until a trial call is allowed; only set while open.
    pub retry_in_secs: Option<u64>,
}

/// Per-engine closed/open/half-open state machine.
///
/// Open breakers move to half-open lazily: the first query after `next_retry_at`
/// observes the transition, there is no background timer.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether the orchestrator may call `engine` right now.
    ///
    /// While half-open only one caller gets `true`; it holds the trial until it reports
    /// back through `record_success`, `record_failure` or `release_trial`. A trial that is
    /// never reported expires after the current open timeout.
    pub fn should_use(&self, engine: &str) -> bool {
        self.with_entry(engine, |entry, now| match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let free = entry
                    .trial_started_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= entry.timeout);
                if free {
                    entry.trial_started_at = Some(now);
                }
                free
            }
        })
    }

    /// Give back a half-open trial that ended without an outcome, e.g. a cancelled call.
    pub fn release_trial(&self, engine: &str) {
        self.with_entry(engine, |entry, _| entry.trial_started_at = None)
    }

    pub fn state(&self, engine: &str) -> CircuitState {
        self.with_entry(engine, |entry, _| entry.state)
    }

    pub fn snapshot(&self, engine: &str) -> BreakerSnapshot {
        self.with_entry(engine, |entry, now| BreakerSnapshot {
            state: entry.state,
            failure_count: entry.failure_count,
            timeout_secs: entry.timeout.as_secs(),
            retry_in_secs: match entry.state {
                CircuitState::Open => entry
                    .next_retry_at
                    .map(|at| at.saturating_duration_since(now).as_secs()),
                _ => None,
            },
        })
    }

    /// Next instant at which an open breaker admits a trial call.
    pub fn next_retry_at(&self, engine: &str) -> Option<Instant> {
        self.with_entry(engine, |entry, _| match entry.state {
            CircuitState::Open => entry.next_retry_at,
            _ => None,
        })
    }

    pub fn record_success(&self, engine: &str) {
        let config = self.config;
        self.with_entry(engine, |entry, _| match entry.state {
            CircuitState::HalfOpen => {
                info!(engine, "Circuit closed after successful trial call");
                *entry = BreakerEntry::new(&config);
            }
            CircuitState::Closed => entry.failure_count = 0,
            // A call that started before the breaker opened; the open window stands.
            CircuitState::Open => {}
        })
    }

    pub fn record_failure(&self, engine: &str) {
        let config = self.config;
        self.with_entry(engine, |entry, now| {
            entry.failure_count += 1;
            entry.last_failure_at = Some(now);
            match entry.state {
                CircuitState::Closed if entry.failure_count >= config.failure_threshold => {
                    trip(entry, &config, now, engine);
                }
                CircuitState::HalfOpen => trip(entry, &config, now, engine),
                _ => {}
            }
        })
    }

    /// Force an engine back to closed with a fresh timeout.
    pub fn reset(&self, engine: &str) {
        let config = self.config;
        self.with_entry(engine, |entry, _| *entry = BreakerEntry::new(&config));
        info!(engine, "Circuit manually reset");
    }

    fn with_entry<R>(&self, engine: &str, f: impl FnOnce(&mut BreakerEntry, Instant) -> R) -> R {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(engine.to_string())
            .or_insert_with(|| BreakerEntry::new(&self.config));

        if entry.state == CircuitState::Open
            && entry.next_retry_at.map_or(true, |at| now >= at)
        {
            info!(engine, "Circuit half-open, allowing trial call");
            entry.state = CircuitState::HalfOpen;
            entry.failure_count = 0;
            entry.trial_started_at = None;
        }

        f(entry, now)
    }
}

fn trip(entry: &mut BreakerEntry, config: &BreakerConfig, now: Instant, engine: &str) {
    if entry.opens > 0 {
        entry.timeout = entry.timeout.saturating_mul(2).min(config.max_timeout);
    }
    entry.opens += 1;
    entry.state = CircuitState::Open;
    entry.trial_started_at = None;
    entry.next_retry_at = Some(now + entry.timeout);
    warn!(
        engine,
        timeout_secs = entry.timeout.as_secs(),
        failures = entry.failure_count,
        "Circuit opened"
    );
}
