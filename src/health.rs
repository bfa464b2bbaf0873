use crate::classifier::{ClassifiedError, ErrorKind, Severity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// Number of most recent errors per engine that weigh on the health score.
const SCORE_WINDOW: usize = 10;
const CRITICAL_PENALTY: f64 = 0.3;
const HIGH_PENALTY: f64 = 0.2;
const STREAK_PENALTY: f64 = 0.1;
const MAX_STREAK_PENALTY: f64 = 0.5;
const SUCCESS_BONUS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineHealth {
    pub total_errors: u64,
    pub recent_errors: u64,
    pub consecutive_failures: u32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_kind_histogram: HashMap<ErrorKind, u64>,
    /// 0.0 (failing) – 1.0 (healthy)
    pub health_score: f64,
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self {
            total_errors: 0,
            recent_errors: 0,
            consecutive_failures: 0,
            last_error_at: None,
            error_kind_histogram: HashMap::new(),
            health_score: 1.0,
        }
    }
}

#[derive(Default)]
struct EngineRecord {
    health: EngineHealth,
    window: VecDeque<Severity>,
}

#[derive(Default)]
struct HealthInner {
    engines: HashMap<String, EngineRecord>,
    history: VecDeque<ClassifiedError>,
}

/// Rolling per-engine reliability, shared by all in-flight requests.
///
/// One lock guards all engines so a report never mixes pre- and post-update values.
pub struct HealthTracker {
    inner: Mutex<HealthInner>,
    history_capacity: usize,
}

impl HealthTracker {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HealthInner::default()),
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn record_error(&self, err: &ClassifiedError) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.history.len() >= self.history_capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(err.clone());

        let record = inner.engines.entry(err.engine.clone()).or_default();
        if record.window.len() >= SCORE_WINDOW {
            record.window.pop_front();
        }
        record.window.push_back(err.severity);

        let health = &mut record.health;
        health.total_errors += 1;
        health.recent_errors += 1;
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_error_at = Some(err.timestamp);
        *health.error_kind_histogram.entry(err.kind).or_insert(0) += 1;

        let critical = record
            .window
            .iter()
            .filter(|s| **s == Severity::Critical)
            .count() as f64;
        let high = record
            .window
            .iter()
            .filter(|s| **s == Severity::High)
            .count() as f64;
        let streak =
            (STREAK_PENALTY * health.consecutive_failures as f64).min(MAX_STREAK_PENALTY);

        health.health_score =
            (1.0 - CRITICAL_PENALTY * critical - HIGH_PENALTY * high - streak).clamp(0.0, 1.0);

        debug!(
            engine = %err.engine,
            kind = %err.kind,
            score = health.health_score,
            streak = health.consecutive_failures,
            "Recorded engine error"
        );
    }

    pub fn record_success(&self, engine: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let health = &mut inner.engines.entry(engine.to_string()).or_default().health;
        health.consecutive_failures = 0;
        health.recent_errors = health.recent_errors.saturating_sub(1);
        health.health_score = (health.health_score + SUCCESS_BONUS).min(1.0);
    }

    pub fn health_report(&self) -> HashMap<String, EngineHealth> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .engines
            .iter()
            .map(|(name, record)| (name.clone(), record.health.clone()))
            .collect()
    }

    /// Health of one engine; engines never seen report full health.
    pub fn engine_health(&self, engine: &str) -> EngineHealth {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .engines
            .get(engine)
            .map(|r| r.health.clone())
            .unwrap_or_default()
    }

    pub fn health_score(&self, engine: &str) -> f64 {
        self.engine_health(engine).health_score
    }

    /// Up to `limit` most recent classified errors across all engines, oldest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ClassifiedError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(skip).cloned().collect()
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(100)
    }
}
