//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Recovery executors sharing a common result contract."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
//! Recovery strategies.
//!
//! Four executors ([`RetryRecovery`], [`FallbackRecovery`],
//! [`RestoreRecovery`], [`EscalationRecovery`]) implement
//! [`RecoveryExecutor`]. None of them return an error: every outcome,
//! including exhaustion, is a [`RecoveryResult`] whose `attempts` log
//! reconstructs the timing of the recovery.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

mod escalation;
mod fallback;
mod restore;
mod retry;

pub use escalation::{EscalationConfig, EscalationRecovery, Notification, NotificationHandler};
pub use fallback::{FallbackConfig, FallbackProvider, FallbackRecovery};
pub use restore::{RestoreConfig, RestoreFn, RestoreRecovery, RestoreRequest, RestoreValidator};
pub use retry::{BackoffSchedule, BackoffStrategy, RetryConfig, RetryRecovery};

/// Future returned by an [`Operation`].
pub type OperationFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Re-invocable, type-erased operation used by recovery executors.
pub type Operation = Arc<dyn Fn() -> OperationFuture + Send + Sync>;

/// Wrap an async closure as an [`Operation`].
pub fn operation<F, Fut>(f: F) -> Operation
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Executor family a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Retry,
    Fallback,
    Restore,
    Escalate,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Retry => "retry",
            StrategyKind::Fallback => "fallback",
            StrategyKind::Restore => "restore",
            StrategyKind::Escalate => "escalate",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal classification of a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalState {
    Recovered,
    Failed,
    Escalated,
}

impl FinalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalState::Recovered => "recovered",
            FinalState::Failed => "failed",
            FinalState::Escalated => "escalated",
        }
    }
}

/// What the self-healer does once a strategy gives up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustPolicy {
    /// Run the escalation strategy as a follow-up.
    Escalate,
    /// Report the failure as is.
    #[default]
    Fail,
    /// Run the follow-up fallback chain, if one is configured.
    Fallback,
}

/// One try within a recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    /// 1-based position in the attempt log.
    pub attempt: usize,
    /// What was tried: `primary`, `attempt`, a provider name or a channel.
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Backoff waited before this attempt started.
    pub delay_before_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of executing a recovery strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub strategy: StrategyKind,
    pub attempts: Vec<RecoveryAttempt>,
    pub total_duration_ms: u64,
    pub final_state: FinalState,
}

impl RecoveryResult {
    pub(crate) fn recovered(
        strategy: StrategyKind,
        value: Value,
        attempts: Vec<RecoveryAttempt>,
        started: Instant,
    ) -> Self {
        Self {
            success: true,
            result: Some(value),
            error: None,
            strategy,
            attempts,
            total_duration_ms: elapsed_ms(started),
            final_state: FinalState::Recovered,
        }
    }

    /// A failed result, also used for synthetic outcomes such as timeouts.
    pub fn failed(
        strategy: StrategyKind,
        error: impl Into<String>,
        attempts: Vec<RecoveryAttempt>,
        total_duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            strategy,
            attempts,
            total_duration_ms,
            final_state: FinalState::Failed,
        }
    }
}

/// Failure information handed to executors.
///
/// Retry and fallback only use it for logging; escalation formats it into
/// the incident message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub component: String,
    pub failure_id: Option<String>,
    pub category: Option<String>,
    pub severity: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl RecoveryContext {
    pub fn for_component(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..Self::default()
        }
    }
}

/// Common interface of the four recovery strategies.
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Policy applied by the self-healer when this executor fails.
    fn on_exhausted(&self) -> ExhaustPolicy {
        ExhaustPolicy::Fail
    }

    async fn execute(&self, operation: Operation, context: &RecoveryContext) -> RecoveryResult;
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    rampart_common::time::duration_to_millis(started.elapsed())
}

/// Measures one attempt against both the wall clock and the runtime clock.
pub(crate) struct AttemptTimer {
    started_at: DateTime<Utc>,
    start: Instant,
}

impl AttemptTimer {
    pub(crate) fn start() -> Self {
        Self {
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    pub(crate) fn finish(
        self,
        attempt: usize,
        label: impl Into<String>,
        delay_before_ms: u64,
        error: Option<String>,
    ) -> RecoveryAttempt {
        let duration_ms = elapsed_ms(self.start);
        RecoveryAttempt {
            attempt,
            label: label.into(),
            started_at: self.started_at,
            ended_at: self.started_at + chrono::Duration::milliseconds(duration_ms as i64),
            duration_ms,
            delay_before_ms,
            success: error.is_none(),
            error,
        }
    }
}

/// Render an error with its full context chain.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn operation_is_reinvocable() {
        let op = operation(|| async { Ok(json!(7)) });
        assert_eq!(op().await.unwrap(), json!(7));
        assert_eq!(op().await.unwrap(), json!(7));
    }

    #[test]
    fn result_serialises_with_lowercase_labels() {
        let result = RecoveryResult::failed(StrategyKind::Escalate, "nope", Vec::new(), 12);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["strategy"], "escalate");
        assert_eq!(json["final_state"], "failed");
        assert_eq!(json["total_duration_ms"], 12);
    }
}
