//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Rule-driven graceful degradation and feature flag control."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::{debug, info, warn};

use crate::error::ResilienceError;
use crate::events::{EventBus, EventKind, ResilienceEvent};
use crate::health::{HealthCondition, HealthMonitor};
use crate::metrics::ResilienceMetrics;
use crate::timer::PeriodicTask;

/// Enumerates the capability postures of the system, least degraded first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    /// Everything enabled.
    Full,
    Reduced,
    Minimal,
    /// Only core function survives.
    Emergency,
}

impl DegradationLevel {
    /// Represent the level as a static label for metrics and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "full",
            DegradationLevel::Reduced => "reduced",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Emergency => "emergency",
        }
    }

    /// Fixed capability reductions installed at this level.
    pub fn capability_reductions(&self) -> IndexMap<String, CapabilityReduction> {
        let table: &[(&str, u8, &str)] = match self {
            DegradationLevel::Full => &[],
            DegradationLevel::Reduced => &[
                ("parallelism", 50, "half of the usual worker parallelism"),
                ("cache", 75, "cache capacity trimmed"),
            ],
            DegradationLevel::Minimal => &[
                ("parallelism", 25, "quarter parallelism"),
                ("cache", 50, "cache capacity halved"),
                ("timeout", 50, "shorter timeouts"),
            ],
            DegradationLevel::Emergency => &[
                ("parallelism", 0, "parallel work suspended"),
                ("cache", 25, "minimal cache"),
                ("timeout", 25, "shortest timeouts"),
                ("batch_size", 10, "small batches only"),
            ],
        };
        table
            .iter()
            .map(|(capability, percentage, description)| {
                (
                    (*capability).to_owned(),
                    CapabilityReduction {
                        capability: (*capability).to_owned(),
                        percentage: *percentage,
                        description: (*description).to_owned(),
                    },
                )
            })
            .collect()
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remaining share of a capability, in percent of normal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReduction {
    pub capability: String,
    pub percentage: u8,
    pub description: String,
}

/// A toggleable feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Levels at which this feature is switched off.
    #[serde(default)]
    pub degradation_levels: Vec<DegradationLevel>,
    /// Lower priority features are disabled first.
    #[serde(default)]
    pub priority: u32,
    /// Features this one needs.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl FeatureFlag {
    pub fn new(name: impl Into<String>, priority: u32, levels: &[DegradationLevel]) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            degradation_levels: levels.to_vec(),
            priority,
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on(mut self, feature: impl Into<String>) -> Self {
        self.dependencies.push(feature.into());
        self
    }
}

/// Condition that moves the system to `target_level` when it holds.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationRule {
    pub name: String,
    pub condition: HealthCondition,
    pub target_level: DegradationLevel,
    /// Explicit features to disable; defaults to every feature flagged for the level.
    #[serde(default)]
    pub affected_features: Option<Vec<String>>,
    /// Re-check the condition after this delay before committing.
    #[serde(default, rename = "grace_period_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub grace_period: Option<Duration>,
}

/// The authoritative degraded posture. Absent means `full`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationState {
    pub level: DegradationLevel,
    /// Disabled features in ascending priority.
    pub disabled_features: IndexSet<String>,
    pub reduced_capabilities: IndexMap<String, CapabilityReduction>,
    pub reason: String,
    pub since: DateTime<Utc>,
    pub triggered_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationTransition {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub reason: String,
    pub triggered_by: String,
    pub timestamp: DateTime<Utc>,
    pub disabled_features: Vec<String>,
}

/// Result of one rule evaluation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    Applied {
        rule: String,
        level: DegradationLevel,
    },
    Recovered,
    Unchanged,
}

fn default_recovery_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_recovery_score_threshold() -> f64 {
    80.0
}

fn default_history_size() -> usize {
    100
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "default_recovery_check_interval", rename = "recovery_check_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovery_check_interval: Duration,
    /// Minimum health score before returning to `full`.
    #[serde(default = "default_recovery_score_threshold")]
    pub recovery_score_threshold: f64,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Evaluated in order; the first matching rule wins.
    #[serde(default)]
    pub rules: Vec<DegradationRule>,
    /// Feature flags registered at construction or on reconfiguration.
    #[serde(default)]
    pub features: Vec<FeatureFlag>,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            recovery_check_interval: default_recovery_check_interval(),
            recovery_score_threshold: default_recovery_score_threshold(),
            history_size: default_history_size(),
            rules: Vec::new(),
            features: Vec::new(),
        }
    }
}

impl DegradationConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.recovery_check_interval.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "degradation recovery_check_interval must be non-zero".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.recovery_score_threshold) {
            return Err(ResilienceError::InvalidConfig(
                "degradation recovery_score_threshold must be within 0..=100".into(),
            ));
        }
        if self.history_size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "degradation history_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

struct DegradationCore {
    config: RwLock<DegradationConfig>,
    features: RwLock<IndexMap<String, FeatureFlag>>,
    state: RwLock<Option<DegradationState>>,
    history: RwLock<VecDeque<DegradationTransition>>,
    health: Arc<HealthMonitor>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
}

/// Shifts the system between degradation levels based on health.
pub struct GracefulDegradation {
    core: Arc<DegradationCore>,
    timer: PeriodicTask,
}

impl GracefulDegradation {
    pub fn new(
        config: DegradationConfig,
        health: Arc<HealthMonitor>,
        events: EventBus,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let features = config
            .features
            .iter()
            .map(|flag| (flag.name.clone(), flag.clone()))
            .collect();
        Ok(Self {
            core: Arc::new(DegradationCore {
                config: RwLock::new(config),
                features: RwLock::new(features),
                state: RwLock::new(None),
                history: RwLock::new(VecDeque::new()),
                health,
                events,
                metrics,
            }),
            timer: PeriodicTask::new("degradation"),
        })
    }

    pub fn register_feature(&self, flag: FeatureFlag) {
        self.core.features.write().insert(flag.name.clone(), flag);
    }

    pub fn add_rule(&self, rule: DegradationRule) {
        self.core.config.write().rules.push(rule);
    }

    pub fn is_degraded(&self) -> bool {
        self.core.state.read().is_some()
    }

    pub fn current_level(&self) -> DegradationLevel {
        self.core.current_level()
    }

    pub fn state(&self) -> Option<DegradationState> {
        self.core.state.read().clone()
    }

    /// Unknown features count as enabled.
    pub fn is_feature_enabled(&self, name: &str) -> bool {
        let configured = self
            .core
            .features
            .read()
            .get(name)
            .map(|flag| flag.enabled)
            .unwrap_or(true);
        configured
            && !self
                .core
                .state
                .read()
                .as_ref()
                .map(|state| state.disabled_features.contains(name))
                .unwrap_or(false)
    }

    /// Remaining percentage of `capability`; 100 when not reduced.
    pub fn get_capability_level(&self, capability: &str) -> u8 {
        self.core
            .state
            .read()
            .as_ref()
            .and_then(|state| state.reduced_capabilities.get(capability))
            .map(|reduction| reduction.percentage)
            .unwrap_or(100)
    }

    pub fn features(&self) -> Vec<FeatureFlag> {
        self.core.features.read().values().cloned().collect()
    }

    pub fn history(&self) -> Vec<DegradationTransition> {
        self.core.history.read().iter().cloned().collect()
    }

    /// Switch a feature off together with everything that depends on it.
    pub fn disable_feature(&self, name: &str) -> Vec<String> {
        let mut features = self.core.features.write();
        let affected = dependents_closure(&features, [name.to_owned()]);
        for feature in &affected {
            if let Some(flag) = features.get_mut(feature) {
                flag.enabled = false;
            }
        }
        info!(
            target: "rampart::resilience::degradation",
            feature = name,
            cascade = ?affected,
            "feature disabled"
        );
        affected
    }

    /// Switch a feature on together with the features it depends on.
    pub fn enable_feature(&self, name: &str) -> Vec<String> {
        let mut features = self.core.features.write();
        let mut affected = Vec::new();
        let mut pending = vec![name.to_owned()];
        let mut seen = HashSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(flag) = features.get_mut(&current) {
                flag.enabled = true;
                pending.extend(flag.dependencies.iter().cloned());
                affected.push(current);
            }
        }
        info!(
            target: "rampart::resilience::degradation",
            feature = name,
            cascade = ?affected,
            "feature enabled"
        );
        affected
    }

    /// Apply `level` immediately. `Full` clears any active degradation.
    pub fn degrade(&self, level: DegradationLevel, reason: &str) {
        self.core.apply(level, reason, "manual", None);
    }

    /// Return to `full` if health allows it. No-op when not degraded.
    pub fn recover(&self) -> bool {
        self.core.try_recover()
    }

    /// Run one rule cycle now.
    pub async fn evaluate(&self) -> EvaluationOutcome {
        self.core.evaluate().await
    }

    pub fn start(&self) -> bool {
        let period = self.core.config.read().recovery_check_interval;
        let core = self.core.clone();
        self.timer.start(period, move || {
            let core = core.clone();
            async move {
                core.evaluate().await;
            }
        })
    }

    pub async fn stop(&self) {
        self.timer.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn config(&self) -> DegradationConfig {
        self.core.config.read().clone()
    }

    /// Apply a configuration change, restarting the evaluation loop if it was running.
    ///
    /// Newly declared features are registered; existing flags keep their runtime state.
    pub async fn update_config<F>(&self, update: F) -> Result<(), ResilienceError>
    where
        F: FnOnce(&mut DegradationConfig),
    {
        let mut candidate = self.config();
        update(&mut candidate);
        candidate.validate()?;
        let was_running = self.timer.is_running();
        self.timer.stop().await;
        {
            let mut features = self.core.features.write();
            for flag in &candidate.features {
                features
                    .entry(flag.name.clone())
                    .or_insert_with(|| flag.clone());
            }
        }
        *self.core.config.write() = candidate;
        if was_running {
            self.start();
        }
        Ok(())
    }
}

impl fmt::Debug for GracefulDegradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulDegradation")
            .field("level", &self.current_level())
            .field("running", &self.is_running())
            .finish()
    }
}

/// `roots` plus every feature that transitively depends on one of them.
fn dependents_closure(
    features: &IndexMap<String, FeatureFlag>,
    roots: impl IntoIterator<Item = String>,
) -> Vec<String> {
    let mut closed: IndexSet<String> = roots.into_iter().collect();
    let mut index = 0;
    while index < closed.len() {
        let current = closed[index].clone();
        for flag in features.values() {
            if flag.dependencies.contains(&current) {
                closed.insert(flag.name.clone());
            }
        }
        index += 1;
    }
    closed.into_iter().collect()
}

impl DegradationCore {
    fn current_level(&self) -> DegradationLevel {
        self.state
            .read()
            .as_ref()
            .map(|state| state.level)
            .unwrap_or(DegradationLevel::Full)
    }

    async fn evaluate(&self) -> EvaluationOutcome {
        let rules = self.config.read().rules.clone();
        for rule in rules {
            if !self.health.evaluate_condition(&rule.condition) {
                continue;
            }
            if rule.target_level == self.current_level() {
                return EvaluationOutcome::Unchanged;
            }
            if let Some(grace) = rule.grace_period {
                debug!(
                    target: "rampart::resilience::degradation",
                    rule = %rule.name,
                    grace_ms = grace.as_millis() as u64,
                    "rule matched; waiting out grace period"
                );
                tokio::time::sleep(grace).await;
                if !self.health.evaluate_condition(&rule.condition) {
                    info!(
                        target: "rampart::resilience::degradation",
                        rule = %rule.name,
                        "condition cleared during grace period"
                    );
                    return EvaluationOutcome::Unchanged;
                }
            }
            let reason = format!(
                "rule '{}' matched ({} {:?} {})",
                rule.name, rule.condition.metric, rule.condition.operator, rule.condition.threshold
            );
            self.apply(
                rule.target_level,
                &reason,
                &rule.name,
                rule.affected_features.as_deref(),
            );
            return EvaluationOutcome::Applied {
                rule: rule.name,
                level: rule.target_level,
            };
        }
        if self.state.read().is_some() && self.try_recover() {
            return EvaluationOutcome::Recovered;
        }
        EvaluationOutcome::Unchanged
    }

    fn apply(
        &self,
        level: DegradationLevel,
        reason: &str,
        triggered_by: &str,
        affected: Option<&[String]>,
    ) {
        if level == DegradationLevel::Full {
            self.clear(reason, triggered_by);
            return;
        }

        let disabled_features = {
            let features = self.features.read();
            let roots: Vec<String> = match affected {
                Some(names) => names.to_vec(),
                None => features
                    .values()
                    .filter(|flag| flag.degradation_levels.contains(&level))
                    .map(|flag| flag.name.clone())
                    .collect(),
            };
            let mut closed = dependents_closure(&features, roots);
            closed.sort_by_key(|name| features.get(name).map(|flag| flag.priority).unwrap_or(0));
            closed.into_iter().collect::<IndexSet<String>>()
        };

        let next = DegradationState {
            level,
            disabled_features,
            reduced_capabilities: level.capability_reductions(),
            reason: reason.to_owned(),
            since: Utc::now(),
            triggered_by: triggered_by.to_owned(),
        };
        let previous = self.state.write().replace(next.clone());
        let from = previous
            .as_ref()
            .map(|state| state.level)
            .unwrap_or(DegradationLevel::Full);

        warn!(
            target: "rampart::resilience::degradation",
            from = %from,
            to = %level,
            reason,
            disabled = ?next.disabled_features,
            "degradation level applied"
        );
        self.record(DegradationTransition {
            from,
            to: level,
            reason: reason.to_owned(),
            triggered_by: triggered_by.to_owned(),
            timestamp: next.since,
            disabled_features: next.disabled_features.iter().cloned().collect(),
        });
        let data = serde_json::to_value(&next).unwrap_or(serde_json::Value::Null);
        self.events.emit(ResilienceEvent::new(
            EventKind::DegradationActivated,
            triggered_by,
            data,
        ));
    }

    fn try_recover(&self) -> bool {
        if self.state.read().is_none() {
            return false;
        }
        let threshold = self.config.read().recovery_score_threshold;
        let system = self.health.get_system_health();
        let unhealthy = system.unhealthy_components().count();
        if system.score < threshold || unhealthy > 0 {
            debug!(
                target: "rampart::resilience::degradation",
                score = system.score,
                unhealthy,
                "recovery conditions not met"
            );
            return false;
        }
        self.clear(
            &format!("health score {:.1} with no unhealthy components", system.score),
            "recovery-check",
        )
    }

    fn clear(&self, reason: &str, triggered_by: &str) -> bool {
        let Some(previous) = self.state.write().take() else {
            return false;
        };
        // Re-enabled most important first.
        let reenabled: Vec<String> = previous.disabled_features.iter().rev().cloned().collect();
        info!(
            target: "rampart::resilience::degradation",
            from = %previous.level,
            reason,
            reenabled = ?reenabled,
            "recovered to full capability"
        );
        self.record(DegradationTransition {
            from: previous.level,
            to: DegradationLevel::Full,
            reason: reason.to_owned(),
            triggered_by: triggered_by.to_owned(),
            timestamp: Utc::now(),
            disabled_features: Vec::new(),
        });
        self.events.emit(ResilienceEvent::new(
            EventKind::DegradationRecovered,
            triggered_by,
            serde_json::json!({
                "from": previous.level,
                "reason": reason,
                "reenabled_features": reenabled,
            }),
        ));
        true
    }

    fn record(&self, transition: DegradationTransition) {
        if let Some(metrics) = &self.metrics {
            metrics.record_degradation(transition.to);
        }
        let limit = self.config.read().history_size;
        let mut history = self.history.write();
        history.push_back(transition);
        while history.len() > limit {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ComparisonOperator, HealthCheck, HealthMonitorConfig, HealthStatus};
    use DegradationLevel::*;

    fn monitor() -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(HealthMonitorConfig::default(), EventBus::new(), None).unwrap())
    }

    fn emergency_rule() -> DegradationRule {
        DegradationRule {
            name: "score-collapse".into(),
            condition: HealthCondition::new("health_score", ComparisonOperator::Lt, 50.0),
            target_level: Emergency,
            affected_features: None,
            grace_period: None,
        }
    }

    fn controller(health: Arc<HealthMonitor>) -> GracefulDegradation {
        let config = DegradationConfig {
            rules: vec![emergency_rule()],
            features: vec![
                FeatureFlag::new("recommendations", 30, &[Minimal, Emergency]),
                FeatureFlag::new("analytics", 10, &[Reduced, Minimal, Emergency]),
                FeatureFlag::new("checkout", 100, &[]),
                FeatureFlag::new("exports", 20, &[Emergency]),
            ],
            ..DegradationConfig::default()
        };
        GracefulDegradation::new(config, health, EventBus::new(), None).unwrap()
    }

    /// Drive the health score to 40 with five components.
    fn collapse(health: &HealthMonitor) {
        for (index, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let status = if index < 2 { HealthStatus::Healthy } else { HealthStatus::Unhealthy };
            health.record_check(HealthCheck::new(*name, status));
        }
    }

    fn restore(health: &HealthMonitor) {
        for name in ["a", "b", "c", "d", "e"] {
            health.unregister(name);
            health.record_check(HealthCheck::new(name, HealthStatus::Healthy));
        }
    }

    #[tokio::test]
    async fn emergency_rule_disables_flagged_features_by_priority() {
        let health = monitor();
        let degradation = controller(health.clone());
        collapse(&health);
        assert_eq!(health.get_system_health().score, 40.0);

        let outcome = degradation.evaluate().await;
        assert_eq!(
            outcome,
            EvaluationOutcome::Applied {
                rule: "score-collapse".into(),
                level: Emergency
            }
        );
        let state = degradation.state().unwrap();
        let disabled: Vec<_> = state.disabled_features.iter().cloned().collect();
        assert_eq!(disabled, vec!["analytics", "exports", "recommendations"]);
        assert!(degradation.is_feature_enabled("checkout"));
        assert!(!degradation.is_feature_enabled("exports"));
        assert!(degradation.is_feature_enabled("never-registered"));
        assert_eq!(degradation.get_capability_level("parallelism"), 0);
        assert_eq!(degradation.get_capability_level("batch_size"), 10);
        assert_eq!(degradation.get_capability_level("unknown"), 100);
    }

    #[tokio::test]
    async fn recovers_once_health_returns() {
        let health = monitor();
        let degradation = controller(health.clone());
        collapse(&health);
        degradation.evaluate().await;
        assert!(!degradation.recover(), "unhealthy components block recovery");

        restore(&health);
        assert_eq!(degradation.evaluate().await, EvaluationOutcome::Recovered);
        assert!(!degradation.is_degraded());
        assert!(degradation.is_feature_enabled("exports"));
        assert_eq!(degradation.get_capability_level("parallelism"), 100);
        let levels: Vec<_> = degradation.history().iter().map(|t| t.to).collect();
        assert_eq!(levels, vec![Emergency, Full]);
    }

    #[test]
    fn recover_is_noop_when_not_degraded() {
        let degradation = controller(monitor());
        assert!(!degradation.recover());
        assert!(degradation.history().is_empty());
        assert_eq!(degradation.current_level(), Full);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_suppresses_blips() {
        let health = monitor();
        let mut rule = emergency_rule();
        rule.grace_period = Some(Duration::from_secs(5));
        let degradation = GracefulDegradation::new(
            DegradationConfig {
                rules: vec![rule],
                ..DegradationConfig::default()
            },
            health.clone(),
            EventBus::new(),
            None,
        )
        .unwrap();
        collapse(&health);
        let pending = degradation.evaluate();
        let heal = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            restore(&health);
        };
        let (outcome, ()) = tokio::join!(pending, heal);
        assert_eq!(outcome, EvaluationOutcome::Unchanged);
        assert!(!degradation.is_degraded());
    }

    #[test]
    fn feature_dependencies_cascade() {
        let degradation = controller(monitor());
        degradation.register_feature(FeatureFlag::new("search", 50, &[]));
        degradation.register_feature(FeatureFlag::new("autocomplete", 5, &[]).depends_on("search"));
        degradation
            .register_feature(FeatureFlag::new("suggestions", 5, &[]).depends_on("autocomplete"));

        let disabled = degradation.disable_feature("search");
        assert_eq!(disabled, vec!["search", "autocomplete", "suggestions"]);
        assert!(!degradation.is_feature_enabled("suggestions"));

        let enabled = degradation.enable_feature("suggestions");
        assert_eq!(enabled.len(), 3);
        assert!(degradation.is_feature_enabled("search"));
    }

    #[test]
    fn manual_degrade_replaces_state_wholesale() {
        let degradation = controller(monitor());
        degradation.degrade(Reduced, "load shedding drill");
        assert_eq!(
            degradation.state().unwrap().disabled_features.iter().collect::<Vec<_>>(),
            vec!["analytics"]
        );
        degradation.degrade(Minimal, "escalating drill");
        let state = degradation.state().unwrap();
        assert_eq!(state.level, Minimal);
        assert_eq!(state.disabled_features.len(), 2);
        assert_eq!(state.reduced_capabilities["timeout"].percentage, 50);
        degradation.degrade(Full, "drill over");
        assert!(!degradation.is_degraded());
    }
}
