//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Prometheus instrumentation for the resilience engine."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts};
use rampart_metrics::SharedRegistry;

use crate::chaos::{ExperimentStatus, FaultType};
use crate::circuit_breaker::CircuitState;
use crate::degradation::DegradationLevel;
use crate::health::HealthStatus;
use crate::recovery::RecoveryResult;

/// Metrics published by the resilience engine.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    circuit_transitions_total: IntCounterVec,
    circuit_rejections_total: IntCounterVec,
    recoveries_total: IntCounterVec,
    recovery_duration_seconds: HistogramVec,
    health_checks_total: IntCounterVec,
    degradations_total: IntCounterVec,
    chaos_experiments_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let circuit_transitions_total = IntCounterVec::new(
            Opts::new(
                "rampart_circuit_transitions_total",
                "Circuit breaker state transitions by breaker and target state",
            ),
            &["breaker", "to"],
        )?;
        registry.register(Box::new(circuit_transitions_total.clone()))?;

        let circuit_rejections_total = IntCounterVec::new(
            Opts::new(
                "rampart_circuit_rejections_total",
                "Calls rejected by a breaker without invoking the operation",
            ),
            &["breaker", "state"],
        )?;
        registry.register(Box::new(circuit_rejections_total.clone()))?;

        let recoveries_total = IntCounterVec::new(
            Opts::new(
                "rampart_recoveries_total",
                "Recovery executions by strategy and final state",
            ),
            &["strategy", "final_state"],
        )?;
        registry.register(Box::new(recoveries_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "rampart_recovery_duration_seconds",
            "Wall-clock duration of recovery executions",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?);
        let recovery_duration_seconds = HistogramVec::new(histogram_opts, &["strategy"])?;
        registry.register(Box::new(recovery_duration_seconds.clone()))?;

        let health_checks_total = IntCounterVec::new(
            Opts::new(
                "rampart_health_checks_total",
                "Health probe results by component and status",
            ),
            &["component", "status"],
        )?;
        registry.register(Box::new(health_checks_total.clone()))?;

        let degradations_total = IntCounterVec::new(
            Opts::new(
                "rampart_degradations_total",
                "Count of degradation level transitions",
            ),
            &["level"],
        )?;
        registry.register(Box::new(degradations_total.clone()))?;

        let chaos_experiments_total = IntCounterVec::new(
            Opts::new(
                "rampart_chaos_experiments_total",
                "Chaos experiments by fault type and terminal status",
            ),
            &["fault_type", "status"],
        )?;
        registry.register(Box::new(chaos_experiments_total.clone()))?;

        Ok(Self {
            registry,
            circuit_transitions_total,
            circuit_rejections_total,
            recoveries_total,
            recovery_duration_seconds,
            health_checks_total,
            degradations_total,
            chaos_experiments_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_circuit_transition(&self, breaker: &str, to: CircuitState) {
        self.circuit_transitions_total
            .with_label_values(&[breaker, to.as_str()])
            .inc();
    }

    pub fn record_circuit_rejection(&self, breaker: &str, state: CircuitState) {
        self.circuit_rejections_total
            .with_label_values(&[breaker, state.as_str()])
            .inc();
    }

    /// Count a finished recovery and observe its duration.
    pub fn record_recovery(&self, result: &RecoveryResult) {
        let strategy = result.strategy.as_str();
        self.recoveries_total
            .with_label_values(&[strategy, result.final_state.as_str()])
            .inc();
        self.recovery_duration_seconds
            .with_label_values(&[strategy])
            .observe(Duration::from_millis(result.total_duration_ms).as_secs_f64());
    }

    pub fn record_health_check(&self, component: &str, status: HealthStatus) {
        self.health_checks_total
            .with_label_values(&[component, status.as_str()])
            .inc();
    }

    /// Track a transition into a new degradation level.
    pub fn record_degradation(&self, level: DegradationLevel) {
        self.degradations_total
            .with_label_values(&[level.as_str()])
            .inc();
    }

    pub fn record_chaos_experiment(&self, fault_type: FaultType, status: ExperimentStatus) {
        self.chaos_experiments_total
            .with_label_values(&[fault_type.as_str(), status.as_str()])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_metrics::{counter_value, new_registry};

    #[test]
    fn registers_all_families_once() {
        let registry = new_registry();
        let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
        metrics.record_circuit_transition("db", CircuitState::Open);
        metrics.record_degradation(DegradationLevel::Minimal);
        assert_eq!(
            counter_value(&registry, "rampart_circuit_transitions_total", &[("to", "open")]),
            Some(1.0)
        );
        assert_eq!(
            counter_value(&registry, "rampart_degradations_total", &[("level", "minimal")]),
            Some(1.0)
        );
        assert!(ResilienceMetrics::new(registry).is_err(), "duplicate registration must fail");
    }
}
