//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Component health polling, aggregation and trend detection."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
//! Health monitoring.
//!
//! Each registered component has a probe (a custom check function or a
//! no-op that always reports healthy). Probe results are appended to a
//! bounded per-component history from which [`ComponentHealth`] is
//! recomputed on every new check. Probes that error or exceed
//! `check_timeout` are recorded as `unhealthy`; they never surface as errors.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::degradation::DegradationLevel;
use crate::error::ResilienceError;
use crate::events::{EventBus, EventKind, ResilienceEvent};
use crate::metrics::ResilienceMetrics;
use crate::timer::PeriodicTask;

/// Status reported by a probe or derived for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy | HealthStatus::Unknown => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a probe returns on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub status: HealthStatus,
    #[serde(default)]
    pub details: Option<Value>,
}

impl ProbeReport {
    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Caller-supplied probe.
pub type HealthCheckFn =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<ProbeReport>> + Send + Sync>;

/// A single probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub component: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub details: Option<Value>,
    pub last_checked: DateTime<Utc>,
}

impl HealthCheck {
    pub fn new(component: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            component: component.into(),
            status,
            response_time_ms: 0,
            error: None,
            details: None,
            last_checked: Utc::now(),
        }
    }

    pub fn at(mut self, checked: DateTime<Utc>) -> Self {
        self.last_checked = checked;
        self
    }

    pub fn with_response_time(mut self, millis: u64) -> Self {
        self.response_time_ms = millis;
        self
    }
}

/// Rolling metrics over the availability window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Fraction of non-healthy checks, `0.0..=1.0`.
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: u64,
    pub p99_response_time_ms: u64,
    /// Checks per minute.
    pub throughput: f64,
}

/// Aggregate over a component's recent checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    /// Percentage of healthy checks in the availability window.
    pub availability: f64,
    /// Number of times the component turned unhealthy within the incident window.
    pub incident_count: usize,
    pub last_check: Option<HealthCheck>,
    pub metrics: HealthMetrics,
}

impl ComponentHealth {
    fn pending(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            status: HealthStatus::Unknown,
            availability: 100.0,
            incident_count: 0,
            last_check: None,
            metrics: HealthMetrics::default(),
        }
    }

    fn metric(&self, name: &str) -> Option<f64> {
        Some(match name {
            "availability" => self.availability,
            "incident_count" | "incidents" => self.incident_count as f64,
            "error_rate" => self.metrics.error_rate,
            "response_time" | "avg_response_time" => self.metrics.avg_response_time_ms,
            "p95_response_time" => self.metrics.p95_response_time_ms as f64,
            "p99_response_time" => self.metrics.p99_response_time_ms as f64,
            "throughput" => self.metrics.throughput,
            "status" => self.status.severity() as f64,
            _ => return None,
        })
    }
}

/// Point-in-time view across all components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    /// Level suggested by the score; the degradation controller owns the real one.
    pub degradation_level: DegradationLevel,
    /// Mean availability, `0..=100`.
    pub score: f64,
    /// Components currently degraded or unhealthy.
    pub active_incidents: usize,
    pub components: Vec<ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

impl SystemHealth {
    pub fn unhealthy_components(&self) -> impl Iterator<Item = &ComponentHealth> {
        self.components
            .iter()
            .filter(|c| c.status == HealthStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

/// Comparison applied by [`HealthCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ComparisonOperator {
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::Gt => value > threshold,
            ComparisonOperator::Lt => value < threshold,
            ComparisonOperator::Ge => value >= threshold,
            ComparisonOperator::Le => value <= threshold,
            ComparisonOperator::Eq => (value - threshold).abs() < f64::EPSILON,
            ComparisonOperator::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Predicate over a named health metric.
///
/// `metric` is `health_score`, `active_incidents` or `<component>.<metric>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCondition {
    pub metric: String,
    pub operator: ComparisonOperator,
    pub threshold: f64,
}

impl HealthCondition {
    pub fn new(metric: impl Into<String>, operator: ComparisonOperator, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            operator,
            threshold,
        }
    }
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_history_size() -> usize {
    1000
}

fn default_status_window() -> usize {
    5
}

fn default_availability_window() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_incident_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    #[serde(default = "default_check_interval", rename = "check_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub check_interval: Duration,
    #[serde(default = "default_check_timeout", rename = "check_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub check_timeout: Duration,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Number of recent checks the status vote looks at.
    #[serde(default = "default_status_window")]
    pub status_window: usize,
    #[serde(default = "default_availability_window", rename = "availability_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub availability_window: Duration,
    #[serde(default = "default_incident_window", rename = "incident_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub incident_window: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            check_timeout: default_check_timeout(),
            history_size: default_history_size(),
            status_window: default_status_window(),
            availability_window: default_availability_window(),
            incident_window: default_incident_window(),
        }
    }
}

impl HealthMonitorConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.check_interval.is_zero() || self.check_timeout.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "health check interval and timeout must be non-zero".into(),
            ));
        }
        if self.history_size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "health history_size must be at least 1".into(),
            ));
        }
        if self.status_window < UNHEALTHY_VOTES {
            return Err(ResilienceError::InvalidConfig(format!(
                "health status_window must be at least {UNHEALTHY_VOTES}"
            )));
        }
        Ok(())
    }
}

/// Unhealthy checks within the status window needed to mark a component unhealthy.
pub const UNHEALTHY_VOTES: usize = 3;

/// Derive the component status from its most recent checks.
///
/// At least [`UNHEALTHY_VOTES`] unhealthy checks make the component unhealthy;
/// any other degraded or unhealthy check makes it degraded; otherwise the
/// newest status wins.
pub fn vote_status(recent: &[HealthStatus]) -> HealthStatus {
    let Some(latest) = recent.last() else {
        return HealthStatus::Unknown;
    };
    let unhealthy = recent
        .iter()
        .filter(|s| **s == HealthStatus::Unhealthy)
        .count();
    if unhealthy >= UNHEALTHY_VOTES {
        HealthStatus::Unhealthy
    } else if unhealthy > 0 || recent.contains(&HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        *latest
    }
}

fn percentile(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn aggregate(
    component: &str,
    history: &VecDeque<HealthCheck>,
    config: &HealthMonitorConfig,
    now: DateTime<Utc>,
) -> ComponentHealth {
    let recent: Vec<HealthStatus> = history
        .iter()
        .rev()
        .take(config.status_window)
        .rev()
        .map(|check| check.status)
        .collect();

    let availability_start = rampart_common::time::window_start(now, config.availability_window);
    let window: Vec<&HealthCheck> = history
        .iter()
        .filter(|check| check.last_checked >= availability_start)
        .collect();

    let availability = if window.is_empty() {
        100.0
    } else {
        let healthy = window
            .iter()
            .filter(|check| check.status == HealthStatus::Healthy)
            .count();
        healthy as f64 / window.len() as f64 * 100.0
    };

    let incident_start = rampart_common::time::window_start(now, config.incident_window);
    let mut incident_count = 0;
    let mut previous = HealthStatus::Healthy;
    for check in history {
        if check.status == HealthStatus::Unhealthy
            && previous != HealthStatus::Unhealthy
            && check.last_checked >= incident_start
        {
            incident_count += 1;
        }
        previous = check.status;
    }

    let mut metrics = HealthMetrics::default();
    if !window.is_empty() {
        let mut times: Vec<u64> = window.iter().map(|check| check.response_time_ms).collect();
        times.sort_unstable();
        let failing = window
            .iter()
            .filter(|check| check.status != HealthStatus::Healthy)
            .count();
        let span_minutes = window
            .first()
            .map(|oldest| {
                rampart_common::time::millis_between(oldest.last_checked, now) as f64 / 60_000.0
            })
            .unwrap_or(0.0)
            .max(1.0);
        metrics = HealthMetrics {
            error_rate: failing as f64 / window.len() as f64,
            avg_response_time_ms: times.iter().sum::<u64>() as f64 / times.len() as f64,
            p95_response_time_ms: percentile(&times, 0.95),
            p99_response_time_ms: percentile(&times, 0.99),
            throughput: window.len() as f64 / span_minutes,
        };
    }

    ComponentHealth {
        component: component.to_owned(),
        status: vote_status(&recent),
        availability,
        incident_count,
        last_check: history.back().cloned(),
        metrics,
    }
}

fn suggested_level(score: f64, unhealthy: usize) -> DegradationLevel {
    if score >= 80.0 && unhealthy == 0 {
        DegradationLevel::Full
    } else if score >= 60.0 {
        DegradationLevel::Reduced
    } else if score >= 40.0 {
        DegradationLevel::Minimal
    } else {
        DegradationLevel::Emergency
    }
}

struct MonitorState {
    config: RwLock<HealthMonitorConfig>,
    /// `None` marks the default always-healthy probe.
    probes: RwLock<IndexMap<String, Option<HealthCheckFn>>>,
    history: RwLock<HashMap<String, VecDeque<HealthCheck>>>,
    health: RwLock<HashMap<String, ComponentHealth>>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
}

/// Polls registered components and aggregates their health.
pub struct HealthMonitor {
    state: Arc<MonitorState>,
    timer: PeriodicTask,
}

impl HealthMonitor {
    pub fn new(
        config: HealthMonitorConfig,
        events: EventBus,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(MonitorState {
                config: RwLock::new(config),
                probes: RwLock::new(IndexMap::new()),
                history: RwLock::new(HashMap::new()),
                health: RwLock::new(HashMap::new()),
                events,
                metrics,
            }),
            timer: PeriodicTask::new("health-monitor"),
        })
    }

    pub fn config(&self) -> HealthMonitorConfig {
        self.state.config.read().clone()
    }

    /// Register a component with a custom probe, replacing any previous one.
    pub fn register_check<F, Fut>(&self, component: impl Into<String>, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ProbeReport>> + Send + 'static,
    {
        let check: HealthCheckFn = Arc::new(move || check().boxed());
        self.state.probes.write().insert(component.into(), Some(check));
    }

    /// Register a component probed by the default always-healthy check.
    pub fn register_component(&self, component: impl Into<String>) {
        self.state
            .probes
            .write()
            .entry(component.into())
            .or_insert(None);
    }

    /// Forget a component together with its history.
    pub fn unregister(&self, component: &str) -> bool {
        let removed = self.state.probes.write().shift_remove(component).is_some();
        self.state.history.write().remove(component);
        self.state.health.write().remove(component);
        removed
    }

    pub fn components(&self) -> Vec<String> {
        self.state.probes.read().keys().cloned().collect()
    }

    /// Run one component's probe now and record the result.
    pub async fn check_component(&self, component: &str) -> Option<HealthCheck> {
        self.state.check_component(component).await
    }

    /// Probe every registered component concurrently.
    pub async fn check_all(&self) -> Vec<HealthCheck> {
        self.state.check_all().await
    }

    /// Record an externally produced check (push-style probes).
    pub fn record_check(&self, check: HealthCheck) -> ComponentHealth {
        self.state.record_check(check)
    }

    pub fn get_component_health(&self, component: &str) -> Option<ComponentHealth> {
        self.state.health.read().get(component).cloned()
    }

    /// Copy of a component's retained checks, oldest first.
    pub fn get_history(&self, component: &str) -> Vec<HealthCheck> {
        self.state
            .history
            .read()
            .get(component)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_system_health(&self) -> SystemHealth {
        self.state.system_health()
    }

    /// Resolve the condition's metric and apply its comparison.
    ///
    /// Unknown metrics evaluate to false.
    pub fn evaluate_condition(&self, condition: &HealthCondition) -> bool {
        match self.resolve_metric(&condition.metric) {
            Some(value) => condition.operator.apply(value, condition.threshold),
            None => {
                warn!(
                    target: "rampart::resilience::health",
                    metric = %condition.metric,
                    "unknown health metric in condition"
                );
                false
            }
        }
    }

    pub fn resolve_metric(&self, metric: &str) -> Option<f64> {
        match metric {
            "health_score" => Some(self.get_system_health().score),
            "active_incidents" => Some(self.get_system_health().active_incidents as f64),
            other => {
                let (component, name) = other.rsplit_once('.')?;
                let health = self.state.health.read();
                health.get(component).and_then(|c| c.metric(name))
            }
        }
    }

    /// Compare the healthy ratio of the older and newer half of `window`.
    pub fn get_trend(&self, component: &str, window: Duration) -> Trend {
        let now = Utc::now();
        let start = rampart_common::time::window_start(now, window);
        let midpoint = rampart_common::time::window_start(now, window / 2);
        let history = self.state.history.read();
        let Some(checks) = history.get(component) else {
            return Trend::Stable;
        };
        let ratio = |from: DateTime<Utc>, to: DateTime<Utc>| {
            let (healthy, total) = checks
                .iter()
                .filter(|c| c.last_checked >= from && c.last_checked < to)
                .fold((0usize, 0usize), |(healthy, total), c| {
                    (healthy + usize::from(c.status == HealthStatus::Healthy), total + 1)
                });
            (total > 0).then(|| healthy as f64 / total as f64)
        };
        let older = ratio(start, midpoint);
        let newer = ratio(midpoint, now + chrono::Duration::milliseconds(1));
        match (older, newer) {
            (Some(older), Some(newer)) if newer - older > 0.1 => Trend::Improving,
            (Some(older), Some(newer)) if older - newer > 0.1 => Trend::Declining,
            _ => Trend::Stable,
        }
    }

    /// Start periodic polling. Returns false if already running.
    pub fn start(&self) -> bool {
        let period = self.state.config.read().check_interval;
        let state = self.state.clone();
        let started = self.timer.start(period, move || {
            let state = state.clone();
            async move {
                state.check_all().await;
            }
        });
        if started {
            info!(
                target: "rampart::resilience::health",
                interval_ms = period.as_millis() as u64,
                "health monitor started"
            );
        }
        started
    }

    pub async fn stop(&self) {
        self.timer.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Apply a configuration change, restarting the polling loop if it was running.
    pub async fn update_config<F>(&self, update: F) -> Result<(), ResilienceError>
    where
        F: FnOnce(&mut HealthMonitorConfig),
    {
        let mut candidate = self.config();
        update(&mut candidate);
        candidate.validate()?;
        let was_running = self.timer.is_running();
        self.timer.stop().await;
        *self.state.config.write() = candidate;
        if was_running {
            self.start();
        }
        Ok(())
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("components", &self.components())
            .field("running", &self.is_running())
            .finish()
    }
}

impl MonitorState {
    async fn check_component(&self, component: &str) -> Option<HealthCheck> {
        let probe = self.probes.read().get(component).cloned()?;
        let limit = self.config.read().check_timeout;
        let started = Instant::now();
        let outcome = match probe {
            None => Ok(ProbeReport::healthy()),
            Some(probe) => match timeout(limit, probe()).await {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(_) => Err(format!(
                    "timed out after {} ms",
                    rampart_common::time::duration_to_millis(limit)
                )),
            },
        };
        let response_time_ms = rampart_common::time::duration_to_millis(started.elapsed());
        let check = match outcome {
            Ok(report) => HealthCheck {
                component: component.to_owned(),
                status: report.status,
                response_time_ms,
                error: None,
                details: report.details,
                last_checked: Utc::now(),
            },
            Err(message) => {
                let failure = ResilienceError::HealthCheckFailed {
                    component: component.to_owned(),
                    message,
                };
                warn!(
                    target: "rampart::resilience::health",
                    component,
                    error = %failure,
                    "health probe failed"
                );
                HealthCheck {
                    component: component.to_owned(),
                    status: HealthStatus::Unhealthy,
                    response_time_ms,
                    error: Some(failure.to_string()),
                    details: None,
                    last_checked: Utc::now(),
                }
            }
        };
        self.record_check(check.clone());
        Some(check)
    }

    async fn check_all(&self) -> Vec<HealthCheck> {
        let components: Vec<String> = self.probes.read().keys().cloned().collect();
        let checks = join_all(components.iter().map(|c| self.check_component(c))).await;
        checks.into_iter().flatten().collect()
    }

    fn record_check(&self, check: HealthCheck) -> ComponentHealth {
        let config = self.config.read().clone();
        let component = check.component.clone();
        let status = check.status;
        let aggregate = {
            let mut history = self.history.write();
            let entries = history.entry(component.clone()).or_default();
            entries.push_back(check);
            while entries.len() > config.history_size {
                entries.pop_front();
            }
            aggregate(&component, entries, &config, Utc::now())
        };
        let previous = self
            .health
            .write()
            .insert(component.clone(), aggregate.clone())
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Unknown);

        if let Some(metrics) = &self.metrics {
            metrics.record_health_check(&component, status);
        }
        debug!(
            target: "rampart::resilience::health",
            component = %component,
            check = %status,
            aggregate = %aggregate.status,
            "health check recorded"
        );

        let kind = match aggregate.status.severity().cmp(&previous.severity()) {
            std::cmp::Ordering::Greater => Some(EventKind::HealthDegraded),
            std::cmp::Ordering::Less => Some(EventKind::HealthRecovered),
            std::cmp::Ordering::Equal => None,
        };
        if let Some(kind) = kind {
            info!(
                target: "rampart::resilience::health",
                component = %component,
                from = %previous,
                to = %aggregate.status,
                "component health changed"
            );
            self.events.emit(ResilienceEvent::new(
                kind,
                component,
                json!({
                    "previous": previous,
                    "status": aggregate.status,
                    "availability": aggregate.availability,
                }),
            ));
        }
        aggregate
    }

    fn system_health(&self) -> SystemHealth {
        let order: Vec<String> = self.probes.read().keys().cloned().collect();
        let health = self.health.read();
        let mut components: Vec<ComponentHealth> = order
            .iter()
            .map(|name| {
                health
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| ComponentHealth::pending(name))
            })
            .collect();
        // Push-only components have health but no probe.
        for (name, entry) in health.iter() {
            if !order.contains(name) {
                components.push(entry.clone());
            }
        }
        drop(health);

        let count = components.len();
        let unhealthy = components
            .iter()
            .filter(|c| c.status == HealthStatus::Unhealthy)
            .count();
        let degraded = components
            .iter()
            .filter(|c| c.status == HealthStatus::Degraded)
            .count();
        let unknown = components
            .iter()
            .filter(|c| c.status == HealthStatus::Unknown)
            .count();
        let score = if count == 0 {
            100.0
        } else {
            components.iter().map(|c| c.availability).sum::<f64>() / count as f64
        };
        let overall = if count == 0 {
            HealthStatus::Healthy
        } else if unhealthy * 2 > count {
            HealthStatus::Unhealthy
        } else if unhealthy > 0 || degraded > 0 {
            HealthStatus::Degraded
        } else if unknown == count {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        };
        SystemHealth {
            overall,
            degradation_level: suggested_level(score, unhealthy),
            score,
            active_incidents: unhealthy + degraded,
            components,
            timestamp: Utc::now(),
        }
    }
}
