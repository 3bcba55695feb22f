//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Three-state circuit breaker and breaker registry."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
//! Per-dependency fault isolation.
//!
//! A breaker starts `closed`. `failure_threshold` consecutive failures open it
//! for `timeout`; while open every call is rejected with
//! [`ResilienceError::CircuitOpen`] without touching the operation. The first
//! call after the timeout moves it to `half-open`, where at most
//! `half_open_requests` probes are admitted. One failed probe reopens the
//! circuit, `success_threshold` consecutive successes close it.
//!
//! All bookkeeping happens under a short synchronous lock on either side of
//! the wrapped operation; the lock is never held across an await.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{error_matches_any, ResilienceError};
use crate::events::{EventBus, EventKind, ResilienceEvent};
use crate::metrics::ResilienceMetrics;

/// Number of transitions retained per breaker.
pub const TRANSITION_HISTORY: usize = 100;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    fn score_multiplier(&self) -> f64 {
        match self {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.25,
        }
    }

    fn event_kind(&self) -> EventKind {
        match self {
            CircuitState::Closed => EventKind::CircuitClosed,
            CircuitState::Open => EventKind::CircuitOpened,
            CircuitState::HalfOpen => EventKind::CircuitHalfOpen,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_half_open_requests() -> u32 {
    3
}

/// Breaker configuration.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `closed` that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successes that close a half-open circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time spent `open` before a probe is allowed.
    #[serde(default = "default_timeout", rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    /// Probes admitted while `half-open`.
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
    /// Error kinds or message fragments that never count as failures.
    #[serde(default)]
    pub allowed_exceptions: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout: default_timeout(),
            half_open_requests: default_half_open_requests(),
            allowed_exceptions: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "circuit breaker thresholds must be at least 1".into(),
            ));
        }
        if self.half_open_requests < self.success_threshold {
            return Err(ResilienceError::InvalidConfig(format!(
                "half_open_requests ({}) must be >= success_threshold ({})",
                self.half_open_requests, self.success_threshold
            )));
        }
        Ok(())
    }
}

/// Windowed and lifetime counters of a breaker.
///
/// Windowed counters (`failures`, `successes`, the consecutive pair and
/// `half_open_attempts`) reset on every transition into `closed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitCounters {
    pub failures: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_attempts: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
    pub times_opened: u64,
}

impl CircuitCounters {
    fn reset_window(&mut self) {
        self.failures = 0;
        self.successes = 0;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_attempts = 0;
    }
}

/// Immutable record of one state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    /// Counters as they stood when the transition was decided.
    pub counters: CircuitCounters,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub counters: CircuitCounters,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_in_ms: Option<u64>,
    pub health_score: f64,
}

/// Serializable form of a breaker for an external persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub config: CircuitBreakerConfig,
    pub state: CircuitState,
    pub counters: CircuitCounters,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

#[derive(Debug)]
struct BreakerInner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    counters: CircuitCounters,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    /// Bumped on every entry into half-open so stale probe slots are ignored.
    half_open_epoch: u64,
    transitions: VecDeque<StateTransition>,
}

impl BreakerInner {
    fn transition(&mut self, to: CircuitState, reason: impl Into<String>) -> StateTransition {
        let record = StateTransition {
            from: self.state,
            to,
            timestamp: Utc::now(),
            reason: reason.into(),
            counters: self.counters,
        };
        self.state = to;
        match to {
            CircuitState::Open => {
                self.next_attempt = Some(Instant::now() + self.config.timeout);
                self.counters.times_opened += 1;
                self.counters.half_open_attempts = 0;
                self.counters.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_epoch += 1;
                self.counters.half_open_attempts = 0;
                self.counters.consecutive_successes = 0;
                self.counters.consecutive_failures = 0;
            }
            CircuitState::Closed => {
                self.next_attempt = None;
                self.counters.reset_window();
            }
        }
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(record.clone());
        record
    }

    fn retry_after(&self) -> Option<Duration> {
        self.next_attempt
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Outcome of the admission check performed before an operation runs.
enum Admission {
    Admitted {
        transition: Option<StateTransition>,
        /// Half-open epoch of the probe slot taken by this call.
        probe: Option<u64>,
    },
    Rejected(ResilienceError),
}

/// Half-open probe slot held for the duration of one call.
///
/// Dropping it unsettled (the caller abandoned the future) hands the slot back.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    epoch: Option<u64>,
}

impl ProbeSlot<'_> {
    fn settle(mut self) {
        self.epoch = None;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.epoch.take() {
            self.breaker.release_probe(epoch);
        }
    }
}

/// Circuit breaker guarding a single dependency.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
}

impl CircuitBreaker {
    /// Create a closed breaker. Fails if the configuration is inconsistent.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: EventBus,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                config,
                state: CircuitState::Closed,
                counters: CircuitCounters::default(),
                last_failure_time: None,
                next_attempt: None,
                half_open_epoch: 0,
                transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
            }),
            events,
            metrics,
        })
    }

    /// Rebuild a breaker from a persisted snapshot.
    ///
    /// A persisted open-state deadline is translated back onto the monotonic clock.
    pub fn from_snapshot(
        snapshot: CircuitBreakerSnapshot,
        events: EventBus,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self, ResilienceError> {
        snapshot.config.validate()?;
        let next_attempt = snapshot.next_attempt_at.map(|at| {
            let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            Instant::now() + remaining
        });
        let next_attempt = match (snapshot.state, next_attempt) {
            (CircuitState::Open, None) => Some(Instant::now() + snapshot.config.timeout),
            (_, value) => value,
        };
        let mut transitions: VecDeque<StateTransition> = snapshot.transitions.into();
        while transitions.len() > TRANSITION_HISTORY {
            transitions.pop_front();
        }
        // Probes in flight when the snapshot was taken can never settle here.
        let mut counters = snapshot.counters;
        counters.half_open_attempts = 0;
        Ok(Self {
            name: snapshot.name,
            inner: Mutex::new(BreakerInner {
                config: snapshot.config,
                state: snapshot.state,
                counters,
                last_failure_time: snapshot.last_failure_time,
                next_attempt,
                half_open_epoch: 0,
                transitions,
            }),
            events,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.inner.lock().config.clone()
    }

    /// Run `operation` through the breaker.
    ///
    /// Operation errors are recorded and returned unchanged. Rejections are
    /// returned as [`ResilienceError::CircuitOpen`] inside the `anyhow::Error`.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let slot = match self.admit() {
            Admission::Rejected(err) => return Err(err.into()),
            Admission::Admitted { transition, probe } => {
                if let Some(transition) = transition {
                    self.publish(transition);
                }
                ProbeSlot {
                    breaker: self,
                    epoch: probe,
                }
            }
        };

        let outcome = operation().await;
        slot.settle();
        let transition = match &outcome {
            Ok(_) => self.on_success(),
            Err(err) => self.on_failure(err),
        };
        if let Some(transition) = transition {
            self.publish(transition);
        }
        outcome
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        let mut opened_probe = None;
        let mut probe = None;
        if inner.state == CircuitState::Open {
            let due = inner
                .next_attempt
                .map(|at| Instant::now() >= at)
                .unwrap_or(true);
            if !due {
                inner.counters.total_rejections += 1;
                let retry_after = inner.retry_after();
                drop(inner);
                self.record_rejection(CircuitState::Open);
                return Admission::Rejected(ResilienceError::circuit_open(
                    &self.name,
                    CircuitState::Open.as_str(),
                    retry_after,
                ));
            }
            opened_probe = Some(inner.transition(CircuitState::HalfOpen, "open timeout elapsed"));
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.counters.half_open_attempts >= inner.config.half_open_requests {
                inner.counters.total_rejections += 1;
                drop(inner);
                if let Some(transition) = opened_probe {
                    self.publish(transition);
                }
                self.record_rejection(CircuitState::HalfOpen);
                return Admission::Rejected(ResilienceError::circuit_open(
                    &self.name,
                    CircuitState::HalfOpen.as_str(),
                    None,
                ));
            }
            inner.counters.half_open_attempts += 1;
            probe = Some(inner.half_open_epoch);
        }
        Admission::Admitted {
            transition: opened_probe,
            probe,
        }
    }

    fn release_probe(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::HalfOpen || inner.half_open_epoch != epoch {
            return;
        }
        inner.counters.half_open_attempts = inner.counters.half_open_attempts.saturating_sub(1);
        debug!(
            target: "rampart::resilience::circuit_breaker",
            breaker = %self.name,
            "abandoned half-open probe released"
        );
    }

    fn on_success(&self) -> Option<StateTransition> {
        let mut inner = self.inner.lock();
        inner.counters.successes += 1;
        inner.counters.total_successes += 1;
        inner.counters.consecutive_successes += 1;
        inner.counters.consecutive_failures = 0;
        let threshold = inner.config.success_threshold;
        match inner.state {
            CircuitState::Closed => {
                if inner.counters.consecutive_successes >= threshold {
                    inner.counters.failures = 0;
                }
                None
            }
            CircuitState::HalfOpen => {
                if inner.counters.consecutive_successes >= threshold {
                    Some(inner.transition(
                        CircuitState::Closed,
                        format!("{threshold} consecutive successes while half-open"),
                    ))
                } else {
                    None
                }
            }
            CircuitState::Open => {
                debug!(
                    target: "rampart::resilience::circuit_breaker",
                    breaker = %self.name,
                    "success recorded while circuit open"
                );
                None
            }
        }
    }

    fn on_failure(&self, err: &anyhow::Error) -> Option<StateTransition> {
        let mut inner = self.inner.lock();
        if error_matches_any(err, &inner.config.allowed_exceptions) {
            drop(inner);
            debug!(
                target: "rampart::resilience::circuit_breaker",
                breaker = %self.name,
                error = %err,
                "allowed exception; not counted as failure"
            );
            return self.on_success();
        }

        inner.counters.failures += 1;
        inner.counters.total_failures += 1;
        inner.counters.consecutive_failures += 1;
        inner.counters.consecutive_successes = 0;
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                let threshold = inner.config.failure_threshold;
                if inner.counters.consecutive_failures >= threshold {
                    Some(inner.transition(
                        CircuitState::Open,
                        format!("{threshold} consecutive failures: {err}"),
                    ))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => Some(inner.transition(
                CircuitState::Open,
                format!("probe failed while half-open: {err}"),
            )),
            CircuitState::Open => None,
        }
    }

    fn record_rejection(&self, state: CircuitState) {
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_rejection(&self.name, state);
        }
        debug!(
            target: "rampart::resilience::circuit_breaker",
            breaker = %self.name,
            state = %state,
            "call rejected without execution"
        );
    }

    fn publish(&self, transition: StateTransition) {
        match transition.to {
            CircuitState::Open => warn!(
                target: "rampart::resilience::circuit_breaker",
                breaker = %self.name,
                from = %transition.from,
                reason = %transition.reason,
                "circuit opened"
            ),
            _ => info!(
                target: "rampart::resilience::circuit_breaker",
                breaker = %self.name,
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "circuit transition"
            ),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_transition(&self.name, transition.to);
        }
        let kind = transition.to.event_kind();
        let data = serde_json::to_value(&transition).unwrap_or(serde_json::Value::Null);
        self.events
            .emit(ResilienceEvent::new(kind, self.name.clone(), data));
    }

    /// Lifetime success rate scaled by the current state, in `0..=100`.
    pub fn health_score(&self) -> f64 {
        let inner = self.inner.lock();
        let total = inner.counters.total_successes + inner.counters.total_failures;
        let rate = if total == 0 {
            1.0
        } else {
            inner.counters.total_successes as f64 / total as f64
        };
        (rate * inner.state.score_multiplier() * 100.0).clamp(0.0, 100.0)
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let health_score = self.health_score();
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            counters: inner.counters,
            last_failure_time: inner.last_failure_time,
            next_attempt_in_ms: inner
                .retry_after()
                .map(rampart_common::time::duration_to_millis),
            health_score,
        }
    }

    /// Copy of the retained transition log, oldest first.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.inner.lock().transitions.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        let next_attempt_at = inner
            .retry_after()
            .map(|remaining| Utc::now() + rampart_common::time::to_chrono(remaining));
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            config: inner.config.clone(),
            state: inner.state,
            counters: inner.counters,
            last_failure_time: inner.last_failure_time,
            next_attempt_at,
            transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    /// Open the circuit immediately, e.g. during maintenance.
    pub fn force_open(&self, reason: &str) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open {
                None
            } else {
                Some(inner.transition(CircuitState::Open, format!("forced: {reason}")))
            }
        };
        if let Some(transition) = transition {
            self.publish(transition);
        }
    }

    /// Return to `closed` and clear windowed counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Closed {
                inner.counters.reset_window();
                None
            } else {
                Some(inner.transition(CircuitState::Closed, "manual reset"))
            }
        };
        if let Some(transition) = transition {
            self.publish(transition);
        }
    }

    /// Apply a live configuration change. Invalid updates leave the old config in place.
    pub fn update_config<F>(&self, update: F) -> Result<(), ResilienceError>
    where
        F: FnOnce(&mut CircuitBreakerConfig),
    {
        let mut inner = self.inner.lock();
        let mut candidate = inner.config.clone();
        update(&mut candidate);
        candidate.validate()?;
        inner.config = candidate;
        Ok(())
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Aggregate view across every registered breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerFleetHealth {
    pub breakers: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    /// Mean of per-breaker health scores; 100 when empty.
    pub score: f64,
    /// Sum of lifetime open transitions.
    pub total_trips: u64,
}

/// Registry of named breakers with lazy creation.
pub struct CircuitBreakerManager {
    default_config: RwLock<CircuitBreakerConfig>,
    breakers: RwLock<IndexMap<String, Arc<CircuitBreaker>>>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
}

impl CircuitBreakerManager {
    pub fn new(
        default_config: CircuitBreakerConfig,
        events: EventBus,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self, ResilienceError> {
        default_config.validate()?;
        Ok(Self {
            default_config: RwLock::new(default_config),
            breakers: RwLock::new(IndexMap::new()),
            events,
            metrics,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Fetch a breaker, creating it with the default configuration on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return existing.clone();
        }
        let config = self.default_config.read().clone();
        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(self.build(name, config)))
            .clone()
    }

    /// Fetch or create a breaker with a dedicated configuration.
    ///
    /// An existing breaker keeps its own configuration.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, ResilienceError> {
        config.validate()?;
        let mut breakers = self.breakers.write();
        Ok(breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(self.build(name, config)))
            .clone())
    }

    fn build(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker {
            name: name.to_owned(),
            inner: Mutex::new(BreakerInner {
                config,
                state: CircuitState::Closed,
                counters: CircuitCounters::default(),
                last_failure_time: None,
                next_attempt: None,
                half_open_epoch: 0,
                transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
            }),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }

    /// Run `operation` through the named breaker, creating it if needed.
    pub async fn execute<F, Fut, T>(&self, name: &str, operation: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let breaker = self.get_or_create(name);
        breaker.execute(operation).await
    }

    pub fn health(&self) -> BreakerFleetHealth {
        let breakers = self.all();
        let mut health = BreakerFleetHealth {
            breakers: breakers.len(),
            ..BreakerFleetHealth::default()
        };
        let mut score_sum = 0.0;
        for breaker in &breakers {
            let stats = breaker.stats();
            match stats.state {
                CircuitState::Closed => health.closed += 1,
                CircuitState::Open => health.open += 1,
                CircuitState::HalfOpen => health.half_open += 1,
            }
            score_sum += stats.health_score;
            health.total_trips += stats.counters.times_opened;
        }
        health.score = if breakers.is_empty() {
            100.0
        } else {
            score_sum / breakers.len() as f64
        };
        health
    }

    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
        info!(target: "rampart::resilience::circuit_breaker", "all breakers reset");
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.all().iter().map(|breaker| breaker.snapshot()).collect()
    }

    /// Install a breaker restored from a snapshot, replacing any existing one.
    pub fn restore(
        &self,
        snapshot: CircuitBreakerSnapshot,
    ) -> Result<Arc<CircuitBreaker>, ResilienceError> {
        let breaker = Arc::new(CircuitBreaker::from_snapshot(
            snapshot,
            self.events.clone(),
            self.metrics.clone(),
        )?);
        self.breakers
            .write()
            .insert(breaker.name().to_owned(), breaker.clone());
        Ok(breaker)
    }

    /// Change the configuration used for breakers created from now on.
    pub fn update_default_config<F>(&self, update: F) -> Result<(), ResilienceError>
    where
        F: FnOnce(&mut CircuitBreakerConfig),
    {
        let mut config = self.default_config.write();
        let mut candidate = config.clone();
        update(&mut candidate);
        candidate.validate()?;
        *config = candidate;
        Ok(())
    }
}

impl fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("breakers", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaggedError;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("dep", config, EventBus::new(), None).unwrap()
    }

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(1000),
            half_open_requests: 2,
            allowed_exceptions: Vec::new(),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> anyhow::Error {
        breaker
            .execute(|| async { Err::<(), _>(anyhow!("boom")) })
            .await
            .unwrap_err()
    }

    fn is_rejection(err: &anyhow::Error) -> bool {
        err.downcast_ref::<ResilienceError>()
            .map(ResilienceError::is_circuit_open)
            .unwrap_or(false)
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_half_opens_after_timeout() {
        let breaker = breaker(quick_config());
        for _ in 0..3 {
            let err = fail(&breaker).await;
            assert_eq!(err.to_string(), "boom", "original error is surfaced");
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        let calls = AtomicUsize::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(is_rejection(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(501)).await;
        breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_success_threshold() {
        let breaker = breaker(quick_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(1001)).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        let counters = breaker.stats().counters;
        assert_eq!(counters.failures, 0);
        assert_eq!(counters.consecutive_successes, 0);
        assert_eq!(counters.half_open_attempts, 0);
        assert_eq!(counters.total_failures, 3);

        let states: Vec<_> = breaker.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_half_open_failure_reopens() {
        let mut config = quick_config();
        config.success_threshold = 3;
        config.half_open_requests = 3;
        let breaker = breaker(config);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(1001)).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.stats().next_attempt_in_ms.unwrap() > 900);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_caps_concurrent_probes() {
        let breaker = Arc::new(breaker(quick_config()));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(1001)).await;

        let invoked = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let breaker = breaker.clone();
            let invoked = invoked.clone();
            handles.push(tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        let mut rejected = 0;
        for handle in handles {
            if let Err(err) = handle.await.unwrap() {
                assert!(is_rejection(&err));
                rejected += 1;
            }
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 2);
        assert_eq!(rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_half_open_probe_frees_its_slot() {
        let breaker = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            half_open_requests: 1,
            timeout: Duration::from_millis(1000),
            ..CircuitBreakerConfig::default()
        });
        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1001)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.stats().counters.half_open_attempts, 0);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn allowed_exceptions_do_not_trip() {
        let mut config = quick_config();
        config.allowed_exceptions = vec!["NotFound".into()];
        let breaker = breaker(config);
        for _ in 0..5 {
            let err = breaker
                .execute(|| async {
                    Err::<(), _>(TaggedError::new("NotFound", "no such user").into())
                })
                .await
                .unwrap_err();
            assert!(err.downcast_ref::<TaggedError>().is_some());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().counters.total_failures, 0);
    }

    #[tokio::test]
    async fn closed_success_streak_clears_windowed_failures() {
        let breaker = breaker(quick_config());
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.stats().counters.failures, 2);
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.stats().counters.failures, 0);
        assert_eq!(breaker.stats().counters.total_failures, 2);
    }

    #[tokio::test]
    async fn health_score_scales_by_state() {
        let breaker = breaker(quick_config());
        assert_eq!(breaker.health_score(), 100.0);
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        for _ in 0..3 {
            fail(&breaker).await;
        }
        // 1 success out of 4 calls, open multiplier 0.25.
        assert!((breaker.health_score() - 6.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn transitions_emit_events() {
        let events = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.on_event(move |event| {
            sink.lock().push((event.kind, event.component.clone()));
            Ok(())
        });
        let breaker = CircuitBreaker::new("orders", quick_config(), events, None).unwrap();
        for _ in 0..3 {
            fail(&breaker).await;
        }
        breaker.reset();
        assert_eq!(
            *seen.lock(),
            vec![
                (EventKind::CircuitOpened, "orders".to_owned()),
                (EventKind::CircuitClosed, "orders".to_owned()),
            ]
        );
    }

    #[test]
    fn rejects_configs_that_can_never_close() {
        let config = CircuitBreakerConfig {
            success_threshold: 3,
            half_open_requests: 1,
            ..CircuitBreakerConfig::default()
        };
        assert!(matches!(
            CircuitBreaker::new("x", config, EventBus::new(), None),
            Err(ResilienceError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_round_trips_open_state() {
        let breaker = breaker(quick_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let json = serde_json::to_string(&breaker.snapshot()).unwrap();
        let snapshot: CircuitBreakerSnapshot = serde_json::from_str(&json).unwrap();
        let restored = CircuitBreaker::from_snapshot(snapshot, EventBus::new(), None).unwrap();
        assert_eq!(restored.state(), CircuitState::Open);
        assert_eq!(restored.transitions().len(), 1);
        let err = restored.execute(|| async { Ok(()) }).await.unwrap_err();
        assert!(is_rejection(&err));
    }

    #[tokio::test]
    async fn manager_creates_lazily_and_aggregates() {
        let manager =
            CircuitBreakerManager::new(quick_config(), EventBus::new(), None).unwrap();
        manager
            .execute("a", || async { Ok::<_, anyhow::Error>(1) })
            .await
            .unwrap();
        let b = manager.get_or_create("b");
        for _ in 0..3 {
            fail(&b).await;
        }
        assert!(Arc::ptr_eq(&b, &manager.get_or_create("b")));
        let health = manager.health();
        assert_eq!(health.breakers, 2);
        assert_eq!(health.open, 1);
        assert_eq!(health.closed, 1);
        assert_eq!(health.total_trips, 1);

        manager.reset_all();
        assert_eq!(manager.health().open, 0);
        assert_eq!(manager.names(), vec!["a".to_owned(), "b".to_owned()]);
    }
}
