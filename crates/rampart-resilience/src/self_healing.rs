//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Failure detection and bounded, coalesced recovery execution."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
//! Self healing.
//!
//! [`SelfHealer::detect_failure`] records a [`FailureDetection`];
//! [`SelfHealer::heal`] resolves a recovery strategy for its category and
//! runs it on a spawned task raced against `recovery_timeout`. In-flight
//! recoveries live in a map of shared futures keyed by failure id, so
//! concurrent `heal` calls for the same failure join one execution. The
//! map is also the admission gate: once `max_concurrent_recoveries` entries
//! exist, new recoveries fail immediately.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerManager;
use crate::error::ResilienceError;
use crate::events::{EventBus, EventKind, ResilienceEvent};
use crate::health::{HealthMonitor, HealthStatus};
use crate::metrics::ResilienceMetrics;
use crate::recovery::{
    operation, EscalationConfig, EscalationRecovery, ExhaustPolicy, FallbackRecovery, FinalState,
    Operation, RecoveryContext, RecoveryExecutor, RecoveryResult, RetryConfig, RetryRecovery,
    StrategyKind,
};
use crate::timer::PeriodicTask;

/// Closed set of failure classes used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    Transient,
    Timeout,
    Network,
    RateLimit,
    ResourceExhaustion,
    Dependency,
    DataCorruption,
    Configuration,
    HealthCheck,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Transient => "transient",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Network => "network",
            FailureCategory::RateLimit => "rate-limit",
            FailureCategory::ResourceExhaustion => "resource-exhaustion",
            FailureCategory::Dependency => "dependency",
            FailureCategory::DataCorruption => "data-corruption",
            FailureCategory::Configuration => "configuration",
            FailureCategory::HealthCheck => "health-check",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A reported failure. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetection {
    pub id: String,
    pub category: FailureCategory,
    pub severity: Severity,
    pub component: String,
    pub error: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// One recovery run against a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAction {
    pub id: String,
    pub failure_id: String,
    pub action: StrategyKind,
    pub status: ActionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<RecoveryResult>,
}

/// Audit record appended when a recovery finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub failure_id: String,
    pub component: String,
    pub category: FailureCategory,
    pub strategy: StrategyKind,
    pub success: bool,
    pub final_state: FinalState,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealingStats {
    pub total_failures: usize,
    pub total_recoveries: usize,
    pub successful_recoveries: usize,
    pub failed_recoveries: usize,
    pub escalated_recoveries: usize,
    pub active_recoveries: usize,
    /// `0.0..=1.0`; 1.0 when nothing has been attempted.
    pub success_rate: f64,
    pub average_recovery_ms: f64,
}

/// Strategy assignment for one failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStrategy {
    pub category: FailureCategory,
    pub strategy: StrategyKind,
}

fn default_auto_recover() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_history_size() -> usize {
    1000
}

fn default_retry() -> RetryConfig {
    RetryConfig {
        on_exhausted: ExhaustPolicy::Escalate,
        ..RetryConfig::default()
    }
}

fn default_category_strategies() -> Vec<CategoryStrategy> {
    use FailureCategory::*;
    [
        (Transient, StrategyKind::Retry),
        (Timeout, StrategyKind::Retry),
        (Network, StrategyKind::Retry),
        (RateLimit, StrategyKind::Retry),
        (DataCorruption, StrategyKind::Escalate),
        (Configuration, StrategyKind::Escalate),
    ]
    .into_iter()
    .map(|(category, strategy)| CategoryStrategy { category, strategy })
    .collect()
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfHealingConfig {
    /// Start healing as soon as a failure is detected.
    #[serde(default = "default_auto_recover")]
    pub auto_recover: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_recoveries: usize,
    #[serde(default = "default_recovery_timeout", rename = "recovery_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovery_timeout: Duration,
    #[serde(default = "default_health_check_interval", rename = "health_check_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub health_check_interval: Duration,
    /// Retained failures, actions and recovery events.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Default strategy and the one used for `retry` category assignments.
    #[serde(default = "default_retry")]
    pub retry: RetryConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default = "default_category_strategies")]
    pub category_strategies: Vec<CategoryStrategy>,
}

impl Default for SelfHealingConfig {
    fn default() -> Self {
        Self {
            auto_recover: default_auto_recover(),
            max_concurrent_recoveries: default_max_concurrent(),
            recovery_timeout: default_recovery_timeout(),
            health_check_interval: default_health_check_interval(),
            history_size: default_history_size(),
            retry: default_retry(),
            escalation: EscalationConfig::default(),
            category_strategies: default_category_strategies(),
        }
    }
}

impl SelfHealingConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_concurrent_recoveries == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_concurrent_recoveries must be at least 1".into(),
            ));
        }
        if self.recovery_timeout.is_zero() || self.health_check_interval.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "self-healing timeout and interval must be non-zero".into(),
            ));
        }
        if self.history_size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "self-healing history_size must be at least 1".into(),
            ));
        }
        self.retry.validate()
    }
}

type SharedRecovery = Shared<BoxFuture<'static, Arc<RecoveryResult>>>;

struct HealerCore {
    config: RwLock<SelfHealingConfig>,
    strategies: RwLock<HashMap<FailureCategory, Arc<dyn RecoveryExecutor>>>,
    default_strategy: RwLock<Arc<dyn RecoveryExecutor>>,
    escalation: Arc<EscalationRecovery>,
    fallback_follow_up: RwLock<Option<Arc<FallbackRecovery>>>,
    recovery_ops: RwLock<HashMap<String, Operation>>,
    failures: RwLock<IndexMap<String, FailureDetection>>,
    actions: RwLock<IndexMap<String, HealingAction>>,
    active: Mutex<HashMap<String, SharedRecovery>>,
    history: RwLock<VecDeque<RecoveryEvent>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    health: Option<Arc<HealthMonitor>>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
}

/// Ties failure detection to recovery execution.
pub struct SelfHealer {
    core: Arc<HealerCore>,
    timer: PeriodicTask,
}

impl SelfHealer {
    pub fn new(
        config: SelfHealingConfig,
        breakers: Option<Arc<CircuitBreakerManager>>,
        health: Option<Arc<HealthMonitor>>,
        events: EventBus,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let retry: Arc<dyn RecoveryExecutor> = Arc::new(RetryRecovery::new(config.retry.clone())?);
        let escalation = Arc::new(EscalationRecovery::new(config.escalation.clone()));
        let mut strategies: HashMap<FailureCategory, Arc<dyn RecoveryExecutor>> = HashMap::new();
        for assignment in &config.category_strategies {
            let executor: Arc<dyn RecoveryExecutor> = match assignment.strategy {
                StrategyKind::Retry => retry.clone(),
                StrategyKind::Escalate => escalation.clone(),
                other => {
                    warn!(
                        target: "rampart::resilience::self_healing",
                        category = %assignment.category,
                        strategy = %other,
                        "strategy needs runtime providers; register it with set_strategy"
                    );
                    continue;
                }
            };
            strategies.insert(assignment.category, executor);
        }
        Ok(Self {
            core: Arc::new(HealerCore {
                config: RwLock::new(config),
                strategies: RwLock::new(strategies),
                default_strategy: RwLock::new(retry),
                escalation,
                fallback_follow_up: RwLock::new(None),
                recovery_ops: RwLock::new(HashMap::new()),
                failures: RwLock::new(IndexMap::new()),
                actions: RwLock::new(IndexMap::new()),
                active: Mutex::new(HashMap::new()),
                history: RwLock::new(VecDeque::new()),
                breakers,
                health,
                events,
                metrics,
            }),
            timer: PeriodicTask::new("self-healer"),
        })
    }

    /// Assign an executor to a failure category.
    pub fn set_strategy(&self, category: FailureCategory, executor: Arc<dyn RecoveryExecutor>) {
        self.core.strategies.write().insert(category, executor);
    }

    pub fn set_default_strategy(&self, executor: Arc<dyn RecoveryExecutor>) {
        *self.core.default_strategy.write() = executor;
    }

    /// Fallback chain run when a strategy with `on_exhausted = fallback` fails.
    pub fn set_fallback_follow_up(&self, fallback: Arc<FallbackRecovery>) {
        *self.core.fallback_follow_up.write() = Some(fallback);
    }

    /// Escalation executor; register channel handlers on it.
    pub fn escalation(&self) -> Arc<EscalationRecovery> {
        self.core.escalation.clone()
    }

    /// Operation re-run when recovering failures of `component`.
    pub fn register_recovery<F, Fut>(&self, component: impl Into<String>, recover: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.core
            .recovery_ops
            .write()
            .insert(component.into(), operation(recover));
    }

    /// Record a failure and, with `auto_recover`, start healing it in the background.
    pub fn detect_failure(
        &self,
        category: FailureCategory,
        component: &str,
        error: impl fmt::Display,
        severity: Severity,
        context: Option<Value>,
    ) -> FailureDetection {
        let failure = self
            .core
            .record_failure(category, component, error.to_string(), severity, context);
        if self.core.config.read().auto_recover {
            if tokio::runtime::Handle::try_current().is_ok() {
                if let Err(err) = self.core.begin(&failure.id, None) {
                    error!(
                        target: "rampart::resilience::self_healing",
                        error = %err,
                        "auto recovery not started"
                    );
                }
            } else {
                warn!(
                    target: "rampart::resilience::self_healing",
                    failure = %failure.id,
                    "no async runtime; auto recovery skipped"
                );
            }
        }
        failure
    }

    /// Heal a detected failure, joining the in-flight recovery if there is one.
    pub async fn heal(&self, failure_id: &str) -> Result<Arc<RecoveryResult>, ResilienceError> {
        let recovery = self.core.begin(failure_id, None)?;
        Ok(recovery.await)
    }

    /// Run `op`; on error, heal and return the recovered value if there is one.
    ///
    /// The original error is returned unchanged when healing fails or yields
    /// no usable value.
    pub async fn execute_with_healing<T, F, Fut>(
        &self,
        component: &str,
        op: F,
        category: FailureCategory,
        severity: Severity,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let op = Arc::new(op);
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let failure = self
            .core
            .record_failure(category, component, format!("{err:#}"), severity, None);
        let erased: Operation = {
            let op = op.clone();
            Arc::new(move || {
                let op = op.clone();
                async move {
                    let value = op().await?;
                    Ok(serde_json::to_value(value)?)
                }
                .boxed()
            })
        };
        let result = match self.core.begin(&failure.id, Some(erased)) {
            Ok(recovery) => recovery.await,
            Err(heal_err) => {
                warn!(
                    target: "rampart::resilience::self_healing",
                    error = %heal_err,
                    "healing not started"
                );
                return Err(err);
            }
        };
        if !result.success {
            return Err(err);
        }
        match result.result.clone().map(serde_json::from_value::<T>) {
            Some(Ok(value)) => Ok(value),
            Some(Err(decode)) => {
                warn!(
                    target: "rampart::resilience::self_healing",
                    component,
                    error = %decode,
                    "recovered value has the wrong shape; surfacing original error"
                );
                Err(err)
            }
            None => Err(err),
        }
    }

    /// Turn unhealthy or degraded components into failures.
    ///
    /// Components with an in-flight recovery are skipped.
    pub fn perform_health_check(&self) -> Vec<FailureDetection> {
        self.core.perform_health_check()
    }

    pub fn start(&self) -> bool {
        if self.core.health.is_none() {
            debug!(
                target: "rampart::resilience::self_healing",
                "no health monitor; periodic checks disabled"
            );
            return false;
        }
        let period = self.core.config.read().health_check_interval;
        let core = self.core.clone();
        self.timer.start(period, move || {
            let core = core.clone();
            async move {
                core.perform_health_check();
            }
        })
    }

    pub async fn stop(&self) {
        self.timer.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn config(&self) -> SelfHealingConfig {
        self.core.config.read().clone()
    }

    /// Update scalar settings, restarting the periodic check if it was running.
    ///
    /// Executors built at construction are kept; replace them with
    /// [`SelfHealer::set_strategy`] or [`SelfHealer::set_default_strategy`].
    pub async fn update_config<F>(&self, update: F) -> Result<(), ResilienceError>
    where
        F: FnOnce(&mut SelfHealingConfig),
    {
        let mut candidate = self.config();
        update(&mut candidate);
        candidate.validate()?;
        let was_running = self.timer.is_running();
        self.timer.stop().await;
        *self.core.config.write() = candidate;
        if was_running {
            self.start();
        }
        Ok(())
    }

    pub fn get_failure(&self, failure_id: &str) -> Option<FailureDetection> {
        self.core.failures.read().get(failure_id).cloned()
    }

    pub fn failures(&self) -> Vec<FailureDetection> {
        self.core.failures.read().values().cloned().collect()
    }

    pub fn actions(&self) -> Vec<HealingAction> {
        self.core.actions.read().values().cloned().collect()
    }

    pub fn recovery_history(&self) -> Vec<RecoveryEvent> {
        self.core.history.read().iter().cloned().collect()
    }

    pub fn active_recoveries(&self) -> usize {
        self.core.active.lock().len()
    }

    pub fn stats(&self) -> HealingStats {
        let history = self.core.history.read();
        let total = history.len();
        let successful = history.iter().filter(|e| e.success).count();
        let escalated = history
            .iter()
            .filter(|e| e.final_state == FinalState::Escalated)
            .count();
        let duration_sum: u64 = history.iter().map(|e| e.duration_ms).sum();
        HealingStats {
            total_failures: self.core.failures.read().len(),
            total_recoveries: total,
            successful_recoveries: successful,
            failed_recoveries: total - successful,
            escalated_recoveries: escalated,
            active_recoveries: self.active_recoveries(),
            success_rate: if total == 0 {
                1.0
            } else {
                successful as f64 / total as f64
            },
            average_recovery_ms: if total == 0 {
                0.0
            } else {
                duration_sum as f64 / total as f64
            },
        }
    }
}

impl fmt::Debug for SelfHealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfHealer")
            .field("active_recoveries", &self.active_recoveries())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn trim_front<K, V>(map: &mut IndexMap<K, V>, limit: usize) {
    while map.len() > limit {
        map.shift_remove_index(0);
    }
}

impl HealerCore {
    fn record_failure(
        &self,
        category: FailureCategory,
        component: &str,
        error: String,
        severity: Severity,
        context: Option<Value>,
    ) -> FailureDetection {
        let failure = FailureDetection {
            id: Uuid::new_v4().to_string(),
            category,
            severity,
            component: component.to_owned(),
            error,
            detected_at: Utc::now(),
            context: context.unwrap_or(Value::Null),
        };
        warn!(
            target: "rampart::resilience::self_healing",
            failure = %failure.id,
            component,
            category = %category,
            severity = severity.as_str(),
            error = %failure.error,
            "failure detected"
        );
        let limit = self.config.read().history_size;
        let mut failures = self.failures.write();
        failures.insert(failure.id.clone(), failure.clone());
        trim_front(&mut failures, limit);
        failure
    }

    /// Join or start the recovery for `failure_id`.
    fn begin(
        self: &Arc<Self>,
        failure_id: &str,
        operation_override: Option<Operation>,
    ) -> Result<SharedRecovery, ResilienceError> {
        let failure = self
            .failures
            .read()
            .get(failure_id)
            .cloned()
            .ok_or_else(|| ResilienceError::UnknownFailure(failure_id.to_owned()))?;

        let mut active = self.active.lock();
        if let Some(in_flight) = active.get(failure_id) {
            debug!(
                target: "rampart::resilience::self_healing",
                failure = failure_id,
                "joining in-flight recovery"
            );
            return Ok(in_flight.clone());
        }
        let limit = self.config.read().max_concurrent_recoveries;
        if active.len() >= limit {
            warn!(
                target: "rampart::resilience::self_healing",
                failure = failure_id,
                limit,
                "max concurrent recoveries reached"
            );
            let rejected = RecoveryResult::failed(
                self.strategy_for(failure.category).kind(),
                format!("max concurrent recoveries reached ({limit})"),
                Vec::new(),
                0,
            );
            return Ok(future::ready(Arc::new(rejected)).boxed().shared());
        }

        let core = self.clone();
        let task = tokio::spawn(async move {
            let result = core.clone().run_recovery(failure.clone(), operation_override).await;
            core.active.lock().remove(&failure.id);
            result
        });
        let strategy = self.strategy_for_id(failure_id);
        let recovery = async move {
            match task.await {
                Ok(result) => result,
                Err(join) => Arc::new(RecoveryResult::failed(
                    strategy,
                    format!("recovery task aborted: {join}"),
                    Vec::new(),
                    0,
                )),
            }
        }
        .boxed()
        .shared();
        active.insert(failure_id.to_owned(), recovery.clone());
        Ok(recovery)
    }

    fn strategy_for(&self, category: FailureCategory) -> Arc<dyn RecoveryExecutor> {
        self.strategies
            .read()
            .get(&category)
            .cloned()
            .unwrap_or_else(|| self.default_strategy.read().clone())
    }

    fn strategy_for_id(&self, failure_id: &str) -> StrategyKind {
        self.failures
            .read()
            .get(failure_id)
            .map(|f| self.strategy_for(f.category).kind())
            .unwrap_or(StrategyKind::Retry)
    }

    fn operation_for(&self, component: &str) -> Operation {
        if let Some(op) = self.recovery_ops.read().get(component).cloned() {
            return op;
        }
        let component = component.to_owned();
        match self.health.clone() {
            // Re-probe the component; recovered once it reports healthy again.
            Some(health) => operation(move || {
                let health = health.clone();
                let component = component.clone();
                async move {
                    match health.check_component(&component).await {
                        Some(check) if check.status == HealthStatus::Healthy => {
                            Ok(json!({ "component": component, "status": check.status }))
                        }
                        Some(check) => Err(anyhow::anyhow!(
                            "component '{component}' still {}",
                            check.status
                        )),
                        None => Err(anyhow::anyhow!(
                            "no recovery operation registered for '{component}'"
                        )),
                    }
                }
            }),
            None => operation(move || {
                let component = component.clone();
                async move {
                    Err(anyhow::anyhow!(
                        "no recovery operation registered for '{component}'"
                    ))
                }
            }),
        }
    }

    fn context_for(&self, failure: &FailureDetection) -> RecoveryContext {
        let circuit = self
            .breakers
            .as_ref()
            .and_then(|breakers| breakers.get(&failure.component))
            .map(|breaker| breaker.state().as_str());
        RecoveryContext {
            component: failure.component.clone(),
            failure_id: Some(failure.id.clone()),
            category: Some(failure.category.as_str().to_owned()),
            severity: Some(failure.severity.as_str().to_owned()),
            error: Some(failure.error.clone()),
            metadata: json!({ "context": failure.context, "circuit_state": circuit }),
        }
    }

    async fn run_recovery(
        self: Arc<Self>,
        failure: FailureDetection,
        operation_override: Option<Operation>,
    ) -> Arc<RecoveryResult> {
        let executor = self.strategy_for(failure.category);
        let op = operation_override.unwrap_or_else(|| self.operation_for(&failure.component));
        let context = self.context_for(&failure);
        let action_id = Uuid::new_v4().to_string();
        {
            let limit = self.config.read().history_size;
            let mut actions = self.actions.write();
            actions.insert(
                action_id.clone(),
                HealingAction {
                    id: action_id.clone(),
                    failure_id: failure.id.clone(),
                    action: executor.kind(),
                    status: ActionStatus::Pending,
                    started_at: Utc::now(),
                    completed_at: None,
                    result: None,
                },
            );
            trim_front(&mut actions, limit);
        }
        self.set_action_status(&action_id, ActionStatus::Executing, None);
        info!(
            target: "rampart::resilience::self_healing",
            failure = %failure.id,
            component = %failure.component,
            strategy = %executor.kind(),
            "recovery started"
        );
        self.events.emit(ResilienceEvent::new(
            EventKind::RecoveryStarted,
            failure.component.clone(),
            json!({
                "failure_id": failure.id,
                "strategy": executor.kind(),
                "category": failure.category,
            }),
        ));
        if executor.kind() == StrategyKind::Escalate {
            self.emit_escalation(&failure);
        }

        let mut result = self.race(executor.clone(), op.clone(), context.clone()).await;

        if !result.success {
            match executor.on_exhausted() {
                ExhaustPolicy::Escalate if executor.kind() != StrategyKind::Escalate => {
                    self.emit_escalation(&failure);
                    let escalation: Arc<dyn RecoveryExecutor> = self.escalation.clone();
                    let follow_up = self.race(escalation, op.clone(), context.clone()).await;
                    merge_attempts(&mut result, &follow_up);
                    result.final_state = if follow_up.success {
                        FinalState::Escalated
                    } else {
                        FinalState::Failed
                    };
                }
                ExhaustPolicy::Fallback => {
                    let fallback = self.fallback_follow_up.read().clone();
                    if let Some(fallback) = fallback {
                        let fallback: Arc<dyn RecoveryExecutor> = fallback;
                        let follow_up = self.race(fallback, op.clone(), context.clone()).await;
                        merge_attempts(&mut result, &follow_up);
                        if follow_up.success {
                            result.success = true;
                            result.result = follow_up.result;
                            result.error = None;
                            result.final_state = FinalState::Recovered;
                        }
                    }
                }
                _ => {}
            }
        }

        let result = Arc::new(result);
        self.finish(&failure, &action_id, &result);
        result
    }

    /// Run an executor on its own task, racing it against `recovery_timeout`.
    ///
    /// On timeout the task is left to finish on its own.
    async fn race(
        &self,
        executor: Arc<dyn RecoveryExecutor>,
        op: Operation,
        context: RecoveryContext,
    ) -> RecoveryResult {
        let limit = self.config.read().recovery_timeout;
        let kind = executor.kind();
        let task = tokio::spawn(async move { executor.execute(op, &context).await });
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => RecoveryResult::failed(
                kind,
                format!("recovery task aborted: {join}"),
                Vec::new(),
                0,
            ),
            Err(_) => {
                let limit_ms = rampart_common::time::duration_to_millis(limit);
                warn!(
                    target: "rampart::resilience::self_healing",
                    strategy = %kind,
                    limit_ms,
                    "recovery timed out"
                );
                RecoveryResult::failed(
                    kind,
                    format!("recovery timed out after {limit_ms} ms"),
                    Vec::new(),
                    limit_ms,
                )
            }
        }
    }

    fn emit_escalation(&self, failure: &FailureDetection) {
        self.events.emit(ResilienceEvent::new(
            EventKind::EscalationTriggered,
            failure.component.clone(),
            json!({
                "failure_id": failure.id,
                "severity": failure.severity,
                "channels": self.escalation.config().channels,
            }),
        ));
    }

    fn set_action_status(
        &self,
        action_id: &str,
        status: ActionStatus,
        result: Option<RecoveryResult>,
    ) {
        if let Some(action) = self.actions.write().get_mut(action_id) {
            action.status = status;
            if matches!(status, ActionStatus::Completed | ActionStatus::Failed) {
                action.completed_at = Some(Utc::now());
                action.result = result;
            }
        }
    }

    fn finish(&self, failure: &FailureDetection, action_id: &str, result: &RecoveryResult) {
        let status = if result.success {
            ActionStatus::Completed
        } else {
            ActionStatus::Failed
        };
        self.set_action_status(action_id, status, Some(result.clone()));
        {
            let limit = self.config.read().history_size;
            let mut history = self.history.write();
            history.push_back(RecoveryEvent {
                failure_id: failure.id.clone(),
                component: failure.component.clone(),
                category: failure.category,
                strategy: result.strategy,
                success: result.success,
                final_state: result.final_state,
                duration_ms: result.total_duration_ms,
                timestamp: Utc::now(),
            });
            while history.len() > limit {
                history.pop_front();
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_recovery(result);
        }
        let kind = if result.success {
            info!(
                target: "rampart::resilience::self_healing",
                failure = %failure.id,
                component = %failure.component,
                attempts = result.attempts.len(),
                "recovery succeeded"
            );
            EventKind::RecoverySucceeded
        } else {
            error!(
                target: "rampart::resilience::self_healing",
                failure = %failure.id,
                component = %failure.component,
                final_state = result.final_state.as_str(),
                error = result.error.as_deref().unwrap_or(""),
                "recovery failed"
            );
            EventKind::RecoveryFailed
        };
        let data = json!({
            "failure_id": failure.id,
            "strategy": result.strategy,
            "final_state": result.final_state,
            "attempts": result.attempts.len(),
            "duration_ms": result.total_duration_ms,
            "error": result.error,
        });
        self.events
            .emit(ResilienceEvent::new(kind, failure.component.clone(), data));
    }

    fn perform_health_check(self: &Arc<Self>) -> Vec<FailureDetection> {
        let Some(health) = &self.health else {
            return Vec::new();
        };
        let system = health.get_system_health();
        let healing: Vec<String> = {
            let active = self.active.lock();
            let failures = self.failures.read();
            active
                .keys()
                .filter_map(|id| failures.get(id).map(|f| f.component.clone()))
                .collect()
        };
        let auto_recover = self.config.read().auto_recover;
        let mut detected = Vec::new();
        for component in system.components {
            let severity = match component.status {
                HealthStatus::Unhealthy => Severity::High,
                HealthStatus::Degraded => Severity::Medium,
                _ => continue,
            };
            if healing.contains(&component.component) {
                debug!(
                    target: "rampart::resilience::self_healing",
                    component = %component.component,
                    "recovery already in flight; not re-reported"
                );
                continue;
            }
            let error = component
                .last_check
                .as_ref()
                .and_then(|check| check.error.clone())
                .unwrap_or_else(|| format!("component reported {}", component.status));
            let failure = self.record_failure(
                FailureCategory::HealthCheck,
                &component.component,
                error,
                severity,
                Some(json!({
                    "status": component.status,
                    "availability": component.availability,
                    "incident_count": component.incident_count,
                })),
            );
            if auto_recover {
                if let Err(err) = self.begin(&failure.id, None) {
                    error!(
                        target: "rampart::resilience::self_healing",
                        error = %err,
                        "health-driven recovery not started"
                    );
                }
            }
            detected.push(failure);
        }
        detected
    }
}

fn merge_attempts(result: &mut RecoveryResult, follow_up: &RecoveryResult) {
    let offset = result.attempts.len();
    result
        .attempts
        .extend(follow_up.attempts.iter().cloned().map(|mut attempt| {
            attempt.attempt += offset;
            attempt
        }));
    result.total_duration_ms += follow_up.total_duration_ms;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthCheck, HealthMonitorConfig};
    use crate::recovery::{
        BackoffStrategy, FallbackConfig, FallbackProvider, RestoreConfig, RestoreRecovery,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_config() -> SelfHealingConfig {
        SelfHealingConfig {
            auto_recover: false,
            retry: RetryConfig {
                max_attempts: 2,
                backoff: BackoffStrategy::Constant,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                on_exhausted: ExhaustPolicy::Fail,
                ..RetryConfig::default()
            },
            ..SelfHealingConfig::default()
        }
    }

    fn healer(config: SelfHealingConfig) -> SelfHealer {
        SelfHealer::new(config, None, None, EventBus::new(), None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_heals_share_one_execution() {
        let healer = healer(quick_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        healer.register_recovery("db", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("reconnected"))
            }
        });
        let failure = healer.detect_failure(
            FailureCategory::Network,
            "db",
            "reset by peer",
            Severity::High,
            None,
        );
        let (a, b) = tokio::join!(healer.heal(&failure.id), healer.heal(&failure.id));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(healer.active_recoveries(), 0);
        assert_eq!(healer.recovery_history().len(), 1);
    }

    #[tokio::test]
    async fn unknown_failure_is_an_error() {
        let healer = healer(quick_config());
        assert!(matches!(
            healer.heal("nope").await,
            Err(ResilienceError::UnknownFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn admission_gate_rejects_overflow_immediately() {
        let mut config = quick_config();
        config.max_concurrent_recoveries = 1;
        let healer = healer(config);
        healer.register_recovery("slow", || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(json!(1))
        });
        let first = healer.detect_failure(
            FailureCategory::Transient,
            "slow",
            "x",
            Severity::Low,
            None,
        );
        let second = healer.detect_failure(
            FailureCategory::Transient,
            "slow",
            "y",
            Severity::Low,
            None,
        );
        let pending = healer.heal(&first.id);
        let overflow = async {
            tokio::task::yield_now().await;
            healer.heal(&second.id).await.unwrap()
        };
        let (first_result, rejected) = tokio::join!(pending, overflow);
        assert!(first_result.unwrap().success);
        assert!(!rejected.success);
        assert!(rejected.error.as_deref().unwrap().contains("max concurrent recoveries"));
        assert!(rejected.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_timeout_produces_failed_result() {
        let mut config = quick_config();
        config.recovery_timeout = Duration::from_millis(500);
        let healer = healer(config);
        healer.register_recovery("hung", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        });
        let failure = healer.detect_failure(
            FailureCategory::Timeout,
            "hung",
            "stuck",
            Severity::High,
            None,
        );
        let result = healer.heal(&failure.id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.final_state, FinalState::Failed);
        assert_eq!(result.error.as_deref(), Some("recovery timed out after 500 ms"));
        assert_eq!(healer.actions()[0].status, ActionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retry_escalates() {
        let mut config = quick_config();
        config.retry.on_exhausted = ExhaustPolicy::Escalate;
        config.escalation.channels = vec!["oncall".into()];
        let healer = healer(config);
        let pages = Arc::new(AtomicUsize::new(0));
        let counter = pages.clone();
        healer.escalation().register_handler("oncall", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        healer.register_recovery("payments", || async { Err(anyhow::anyhow!("still failing")) });
        let failure = healer.detect_failure(
            FailureCategory::Dependency,
            "payments",
            "503",
            Severity::Critical,
            None,
        );
        let result = healer.heal(&failure.id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.final_state, FinalState::Escalated);
        assert_eq!(result.attempts.len(), 3, "two retries plus one channel");
        assert_eq!(pages.load(Ordering::SeqCst), 1);
        assert_eq!(healer.stats().escalated_recoveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_policy_runs_follow_up_chain() {
        let mut config = quick_config();
        config.retry.on_exhausted = ExhaustPolicy::Fallback;
        let healer = healer(config);
        healer.set_fallback_follow_up(Arc::new(FallbackRecovery::new(
            FallbackConfig::default(),
            vec![FallbackProvider::new("static", 1, operation(|| async { Ok(json!("stale")) }))],
        )));
        healer.register_recovery("catalog", || async { Err(anyhow::anyhow!("down")) });
        let failure = healer.detect_failure(
            FailureCategory::Transient,
            "catalog",
            "down",
            Severity::Medium,
            None,
        );
        let result = healer.heal(&failure.id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!("stale")));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_with_healing_returns_substitute_or_original_error() {
        let healer = healer(quick_config());
        healer.set_strategy(
            FailureCategory::DataCorruption,
            Arc::new(RestoreRecovery::new(RestoreConfig::default(), |_| async { Ok(json!(42)) })),
        );
        let value: u32 = healer
            .execute_with_healing(
                "ledger",
                || async { Err(anyhow::anyhow!("checksum mismatch")) },
                FailureCategory::DataCorruption,
                Severity::High,
            )
            .await
            .unwrap();
        assert_eq!(value, 42);

        let err = healer
            .execute_with_healing::<u32, _, _>(
                "ledger",
                || async { Err(anyhow::anyhow!("permanent")) },
                FailureCategory::Transient,
                Severity::Low,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "permanent");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_with_healing_retries_the_original_call() {
        let healer = healer(quick_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value: String = healer
            .execute_with_healing(
                "search",
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(anyhow::anyhow!("blip"))
                        } else {
                            Ok("hits".to_owned())
                        }
                    }
                },
                FailureCategory::Transient,
                Severity::Low,
            )
            .await
            .unwrap();
        assert_eq!(value, "hits");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_dedupes_components_in_recovery() {
        let health = Arc::new(
            HealthMonitor::new(HealthMonitorConfig::default(), EventBus::new(), None).unwrap(),
        );
        let mut config = quick_config();
        config.auto_recover = true;
        let healer =
            SelfHealer::new(config, None, Some(health.clone()), EventBus::new(), None).unwrap();
        healer.register_recovery("queue", || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(json!("drained"))
        });
        for _ in 0..3 {
            health.record_check(HealthCheck::new("queue", HealthStatus::Unhealthy));
        }
        health.record_check(HealthCheck::new("api", HealthStatus::Healthy));

        let first = healer.perform_health_check();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].category, FailureCategory::HealthCheck);
        assert_eq!(first[0].severity, Severity::High);
        assert!(healer.perform_health_check().is_empty());

        let result = healer.heal(&first[0].id).await.unwrap();
        assert!(result.success);
    }
}
