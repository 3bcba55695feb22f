//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Resilience engine: breakers, recovery, health, healing, degradation and chaos."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
//! Resilience engine.
//!
//! Callers wrap risky operations in [`CircuitBreaker::execute`]. Failures are
//! reported to [`SelfHealer::detect_failure`], which runs a recovery strategy
//! chosen by failure category. [`HealthMonitor`] samples components on a
//! timer and [`GracefulDegradation`] shifts the system between degradation
//! levels from what it reports. [`ChaosEngine`] perturbs all of the above to
//! validate them. Every component publishes on a shared [`EventBus`].

pub mod chaos;
pub mod circuit_breaker;
pub mod config;
pub mod degradation;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod recovery;
pub mod self_healing;
mod timer;

pub use chaos::{
    ChaosConfig, ChaosEngine, ChaosExperiment, ChaosSuite, ExperimentResults, ExperimentStatus,
    FaultConfig, FaultInjector, FaultOverrides, FaultType,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerSnapshot,
    CircuitBreakerStats, CircuitState, StateTransition,
};
pub use config::ResilienceConfig;
pub use degradation::{
    DegradationConfig, DegradationLevel, DegradationRule, DegradationState, FeatureFlag,
    GracefulDegradation,
};
pub use engine::ResilienceEngine;
pub use error::{ResilienceError, TaggedError};
pub use events::{EventBus, EventKind, ResilienceEvent, Subscription};
pub use health::{
    ComponentHealth, HealthCheck, HealthCondition, HealthMonitor, HealthMonitorConfig,
    HealthStatus, ProbeReport, SystemHealth,
};
pub use metrics::ResilienceMetrics;
pub use recovery::{
    operation, EscalationRecovery, FallbackProvider, FallbackRecovery, Operation,
    RecoveryContext, RecoveryExecutor, RecoveryResult, RestoreRecovery, RetryRecovery,
};
pub use self_healing::{
    FailureCategory, FailureDetection, HealingAction, SelfHealer, SelfHealingConfig, Severity,
};

/// Crate prelude collecting the most commonly used types.
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager};
    pub use super::degradation::{DegradationLevel, FeatureFlag, GracefulDegradation};
    pub use super::engine::ResilienceEngine;
    pub use super::error::ResilienceError;
    pub use super::events::{EventBus, EventKind};
    pub use super::health::{HealthMonitor, HealthStatus, ProbeReport};
    pub use super::recovery::{operation, RecoveryExecutor, RecoveryResult};
    pub use super::self_healing::{FailureCategory, SelfHealer, Severity};
}
