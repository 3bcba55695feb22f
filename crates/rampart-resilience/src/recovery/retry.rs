//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Retry recovery with configurable backoff."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use super::{
    describe, elapsed_ms, AttemptTimer, ExhaustPolicy, Operation, RecoveryContext,
    RecoveryExecutor, RecoveryResult, StrategyKind,
};
use crate::error::{error_matches_any, ResilienceError};

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    #[default]
    Exponential,
    Jittered,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

/// Retry parameters.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_initial_delay", rename = "initial_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay", rename = "max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the random addition for `jittered`, as a fraction of the exponential delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// When non-empty, only errors matching one of these kinds or message
    /// fragments are retried; anything else fails fast.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
    #[serde(default)]
    pub on_exhausted: ExhaustPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
            retryable_errors: Vec::new(),
            on_exhausted: ExhaustPolicy::default(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidConfig(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ResilienceError::InvalidConfig(
                "retry initial_delay must not exceed max_delay".into(),
            ));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ResilienceError::InvalidConfig(
                "retry multiplier must be >= 1".into(),
            ));
        }
        if !(self.jitter_factor.is_finite() && self.jitter_factor >= 0.0) {
            return Err(ResilienceError::InvalidConfig(
                "retry jitter_factor must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Stateful delay generator for one retry sequence.
///
/// Delays are clamped to `max_delay` and never shorter than the previous one.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    strategy: BackoffStrategy,
    initial_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter_factor: f64,
    retry: u32,
    previous: Duration,
}

impl BackoffSchedule {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            strategy: config.backoff,
            initial_ms: config.initial_delay.as_secs_f64() * 1000.0,
            max_ms: config.max_delay.as_secs_f64() * 1000.0,
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor,
            retry: 0,
            previous: Duration::ZERO,
        }
    }

    /// Delay before the next retry.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        self.retry += 1;
        let exponential = || self.initial_ms * self.multiplier.powi(self.retry as i32 - 1);
        let raw_ms = match self.strategy {
            BackoffStrategy::Constant => self.initial_ms,
            BackoffStrategy::Linear => self.initial_ms * self.retry as f64,
            BackoffStrategy::Exponential => exponential(),
            BackoffStrategy::Jittered => {
                let base = exponential();
                let spread = self.jitter_factor * base;
                if spread.is_finite() && spread > 0.0 {
                    base + rng.gen_range(0.0..=spread)
                } else {
                    base
                }
            }
        };
        let clamped_ms = if raw_ms.is_finite() {
            raw_ms.clamp(0.0, self.max_ms)
        } else {
            self.max_ms
        };
        let delay = Duration::from_micros((clamped_ms * 1000.0).round() as u64).max(self.previous);
        self.previous = delay;
        delay
    }
}

/// Re-invokes the operation with backoff until it succeeds or attempts run out.
pub struct RetryRecovery {
    config: RetryConfig,
    rng: Mutex<StdRng>,
}

impl RetryRecovery {
    pub fn new(config: RetryConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Seed the jitter RNG for deterministic testing.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl RecoveryExecutor for RetryRecovery {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Retry
    }

    fn on_exhausted(&self) -> ExhaustPolicy {
        self.config.on_exhausted
    }

    /// Retry `operation` with backoff until it succeeds or attempts run out.
    ///
    /// Exhaustion always yields [`FinalState::Failed`](super::FinalState::Failed).
    /// The configured `on_exhausted` policy is not applied here; the self-healer
    /// reads it through [`RecoveryExecutor::on_exhausted`] and runs the
    /// escalation or fallback follow-up itself.
    async fn execute(&self, operation: Operation, context: &RecoveryContext) -> RecoveryResult {
        let started = Instant::now();
        let mut schedule = BackoffSchedule::new(&self.config);
        let mut attempts = Vec::new();
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts as usize {
            let mut delay_ms = 0;
            if attempt > 1 {
                let delay = {
                    let mut rng = self.rng.lock();
                    schedule.next_delay(&mut *rng)
                };
                delay_ms = rampart_common::time::duration_to_millis(delay);
                sleep(delay).await;
            }

            let timer = AttemptTimer::start();
            match operation().await {
                Ok(value) => {
                    attempts.push(timer.finish(attempt, "attempt", delay_ms, None));
                    info!(
                        target: "rampart::resilience::recovery",
                        component = %context.component,
                        attempt,
                        "retry succeeded"
                    );
                    return RecoveryResult::recovered(StrategyKind::Retry, value, attempts, started);
                }
                Err(err) => {
                    let message = describe(&err);
                    attempts.push(timer.finish(
                        attempt,
                        "attempt",
                        delay_ms,
                        Some(message.clone()),
                    ));
                    let retryable = self.config.retryable_errors.is_empty()
                        || error_matches_any(&err, &self.config.retryable_errors);
                    warn!(
                        target: "rampart::resilience::recovery",
                        component = %context.component,
                        attempt,
                        retryable,
                        error = %message,
                        "retry attempt failed"
                    );
                    if !retryable {
                        return RecoveryResult::failed(
                            StrategyKind::Retry,
                            format!("non-retryable error: {message}"),
                            attempts,
                            elapsed_ms(started),
                        );
                    }
                    last_error = message;
                }
            }
        }

        let exhausted = ResilienceError::RecoveryExhausted {
            attempts: attempts.len(),
            message: last_error,
        };
        RecoveryResult::failed(
            StrategyKind::Retry,
            exhausted.to_string(),
            attempts,
            elapsed_ms(started),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaggedError;
    use crate::recovery::{operation, FinalState};
    use serde_json::json;
    use std::sync::Arc;

    fn config(backoff: BackoffStrategy) -> RetryConfig {
        RetryConfig {
            max_attempts: 6,
            backoff,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter_factor: 0.5,
            ..RetryConfig::default()
        }
    }

    fn delays(config: &RetryConfig, n: usize) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut schedule = BackoffSchedule::new(config);
        (0..n)
            .map(|_| schedule.next_delay(&mut rng).as_millis() as u64)
            .collect()
    }

    #[test]
    fn backoff_curves_match_their_formulas() {
        assert_eq!(delays(&config(BackoffStrategy::Constant), 3), vec![100, 100, 100]);
        assert_eq!(delays(&config(BackoffStrategy::Linear), 3), vec![100, 200, 300]);
        assert_eq!(
            delays(&config(BackoffStrategy::Exponential), 6),
            vec![100, 200, 400, 800, 1000, 1000]
        );
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        for backoff in [
            BackoffStrategy::Linear,
            BackoffStrategy::Exponential,
            BackoffStrategy::Jittered,
        ] {
            let values = delays(&config(backoff), 12);
            assert!(values.windows(2).all(|pair| pair[0] <= pair[1]), "{backoff:?}: {values:?}");
            assert!(values.iter().all(|value| *value <= 1000), "{backoff:?}: {values:?}");
        }
        let jittered = delays(&config(BackoffStrategy::Jittered), 1);
        assert!((100..=150).contains(&jittered[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_retry_waits_between_attempts() {
        let retry = RetryRecovery::new(RetryConfig {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            ..RetryConfig::default()
        })
        .unwrap();
        let origin = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let op = operation(move || {
            let sink = sink.clone();
            async move {
                sink.lock().push(origin.elapsed().as_millis() as u64);
                Err(anyhow::anyhow!("still down"))
            }
        });

        let result = retry.execute(op, &RecoveryContext::for_component("db")).await;
        assert!(!result.success);
        assert_eq!(result.final_state, FinalState::Failed);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(*seen.lock(), vec![0, 100, 300]);
        let waits: Vec<u64> = result.attempts.iter().map(|a| a.delay_before_ms).collect();
        assert_eq!(waits, vec![0, 100, 200]);
        assert_eq!(result.total_duration_ms, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_fast() {
        let retry = RetryRecovery::new(RetryConfig {
            max_attempts: 5,
            retryable_errors: vec!["Timeout".into()],
            ..RetryConfig::default()
        })
        .unwrap();
        let op = operation(|| async { Err(TaggedError::new("Validation", "bad input").into()) });
        let result = retry.execute(op, &RecoveryContext::default()).await;
        assert!(!result.success);
        assert_eq!(result.attempts.len(), 1);
        assert!(result.error.unwrap().contains("non-retryable"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_failed_and_leaves_policy_to_caller() {
        let retry = RetryRecovery::new(RetryConfig {
            max_attempts: 2,
            backoff: BackoffStrategy::Constant,
            initial_delay: Duration::from_millis(10),
            on_exhausted: ExhaustPolicy::Fallback,
            ..RetryConfig::default()
        })
        .unwrap();
        let op = operation(|| async { Err(anyhow::anyhow!("down")) });
        let result = retry.execute(op, &RecoveryContext::for_component("db")).await;
        assert_eq!(result.final_state, FinalState::Failed);
        assert_eq!(result.strategy, StrategyKind::Retry);
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(retry.on_exhausted(), ExhaustPolicy::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_a_later_attempt() {
        let retry = RetryRecovery::new(RetryConfig::default()).unwrap().with_seed(1);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let op = operation(move || {
            let counter = counter.clone();
            async move {
                let mut calls = counter.lock();
                *calls += 1;
                if *calls < 2 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        });
        let result = retry.execute(op, &RecoveryContext::default()).await;
        assert!(result.success);
        assert_eq!(result.final_state, FinalState::Recovered);
        assert_eq!(result.result, Some(json!({"ok": true})));
        assert_eq!(result.attempts.len(), 2);
        assert!(!result.attempts[0].success);
        assert!(result.attempts[1].success);
    }

    #[test]
    fn rejects_inverted_delays() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            ..RetryConfig::default()
        };
        assert!(RetryRecovery::new(config).is_err());
    }
}
