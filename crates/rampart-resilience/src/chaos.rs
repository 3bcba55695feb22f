//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Fault injection experiments validating the resilience stack."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{BreakerFleetHealth, CircuitBreaker, CircuitBreakerManager};
use crate::degradation::{DegradationLevel, GracefulDegradation};
use crate::error::{ResilienceError, TaggedError};
use crate::events::{EventBus, EventKind, ResilienceEvent};
use crate::metrics::ResilienceMetrics;
use crate::recovery::{operation, Operation};
use crate::self_healing::{HealingStats, SelfHealer};

/// Error kind carried by every injected failure.
pub const INJECTED_ERROR_KIND: &str = "ChaosInjectedError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultType {
    /// Delay calls.
    Latency,
    /// Fail calls.
    Error,
    /// Delay, then fail.
    Timeout,
    /// Fail every call.
    ServiceUnavailable,
    /// Fail every call.
    NetworkPartition,
    /// Delay, then fail. Destructive.
    ResourceExhaustion,
    /// Fail calls as if data were corrupt. Destructive.
    DataCorruption,
}

impl FaultType {
    pub const ALL: [FaultType; 7] = [
        FaultType::Latency,
        FaultType::Error,
        FaultType::Timeout,
        FaultType::ServiceUnavailable,
        FaultType::NetworkPartition,
        FaultType::ResourceExhaustion,
        FaultType::DataCorruption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultType::Latency => "latency",
            FaultType::Error => "error",
            FaultType::Timeout => "timeout",
            FaultType::ServiceUnavailable => "service-unavailable",
            FaultType::NetworkPartition => "network-partition",
            FaultType::ResourceExhaustion => "resource-exhaustion",
            FaultType::DataCorruption => "data-corruption",
        }
    }

    /// Refused while `safe_mode` is on.
    pub fn is_destructive(&self) -> bool {
        matches!(self, FaultType::DataCorruption | FaultType::ResourceExhaustion)
    }

    fn injects_errors(&self) -> bool {
        !matches!(self, FaultType::Latency)
    }

    fn unconditional(&self) -> bool {
        matches!(self, FaultType::ServiceUnavailable | FaultType::NetworkPartition)
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
            ExperimentStatus::Cancelled => "cancelled",
        }
    }
}

/// Fully resolved fault parameters.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Chance that a call is affected, `0.0..=1.0`.
    pub probability: f64,
    #[serde(rename = "latency_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub latency: Duration,
    /// Standard deviation of the normally distributed latency jitter.
    #[serde(rename = "latency_jitter_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub latency_jitter: Duration,
    pub error_kind: String,
    pub error_message: String,
    /// Share of capacity the fault is meant to remove; reported, not enforced.
    pub impact: f64,
}

impl FaultConfig {
    pub fn defaults_for(fault: FaultType) -> Self {
        let (probability, latency_ms, jitter_ms, message, impact) = match fault {
            FaultType::Latency => (1.0, 1000, 100, "injected latency", 0.3),
            FaultType::Error => (0.5, 0, 0, "injected error", 0.5),
            FaultType::Timeout => (0.3, 5000, 0, "injected timeout", 0.5),
            FaultType::ServiceUnavailable => (1.0, 0, 0, "service unavailable", 1.0),
            FaultType::NetworkPartition => (1.0, 0, 0, "network partition", 1.0),
            FaultType::ResourceExhaustion => (0.3, 500, 50, "resource exhausted", 0.7),
            FaultType::DataCorruption => (0.1, 0, 0, "data corruption detected", 0.8),
        };
        Self {
            probability,
            latency: Duration::from_millis(latency_ms),
            latency_jitter: Duration::from_millis(jitter_ms),
            error_kind: INJECTED_ERROR_KIND.to_owned(),
            error_message: message.to_owned(),
            impact,
        }
    }

    /// Defaults for `fault` with the caller's overrides applied on top.
    pub fn merged(fault: FaultType, overrides: &FaultOverrides) -> Self {
        let defaults = Self::defaults_for(fault);
        Self {
            probability: overrides.probability.unwrap_or(defaults.probability),
            latency: overrides.latency.unwrap_or(defaults.latency),
            latency_jitter: overrides.latency_jitter.unwrap_or(defaults.latency_jitter),
            error_kind: overrides.error_kind.clone().unwrap_or(defaults.error_kind),
            error_message: overrides
                .error_message
                .clone()
                .unwrap_or(defaults.error_message),
            impact: overrides.impact.unwrap_or(defaults.impact),
        }
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(ResilienceError::ChaosValidation(format!(
                "probability {} outside [0, 1]",
                self.probability
            )));
        }
        if !(0.0..=1.0).contains(&self.impact) {
            return Err(ResilienceError::ChaosValidation(format!(
                "impact {} outside [0, 1]",
                self.impact
            )));
        }
        Ok(())
    }
}

/// Caller supplied overrides; unset fields keep the per-fault defaults.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultOverrides {
    pub probability: Option<f64>,
    #[serde(rename = "latency_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub latency: Option<Duration>,
    #[serde(rename = "latency_jitter_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub latency_jitter: Option<Duration>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub impact: Option<f64>,
}

/// Wraps calls and perturbs them while active.
pub struct FaultInjector {
    fault: FaultType,
    config: FaultConfig,
    active: AtomicBool,
    injected: AtomicU64,
    rng: Mutex<StdRng>,
    jitter: Option<Normal<f64>>,
}

impl FaultInjector {
    pub fn new(fault: FaultType, config: FaultConfig, seed: u64) -> Self {
        let sd = config.latency_jitter.as_secs_f64() * 1000.0;
        let jitter = (sd > 0.0).then(|| Normal::new(0.0, sd).ok()).flatten();
        Self {
            fault,
            config,
            active: AtomicBool::new(false),
            injected: AtomicU64::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            jitter,
        }
    }

    pub fn fault_type(&self) -> FaultType {
        self.fault
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of calls perturbed so far.
    pub fn injected_count(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    /// Apply the fault to one call, then run it unless the fault failed it.
    pub async fn wrap(&self, op: Operation) -> anyhow::Result<Value> {
        self.inject().await?;
        op().await
    }

    async fn inject(&self) -> anyhow::Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let (hit, delay) = {
            let mut rng = self.rng.lock();
            let hit = self.fault.unconditional() || rng.gen_bool(self.config.probability);
            let base = self.config.latency.as_secs_f64() * 1000.0;
            let offset = self
                .jitter
                .as_ref()
                .map(|dist| dist.sample(&mut *rng))
                .unwrap_or(0.0);
            (hit, Duration::from_micros(((base + offset).max(0.0) * 1000.0) as u64))
        };
        if !hit {
            return Ok(());
        }
        self.injected.fetch_add(1, Ordering::Relaxed);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.fault.injects_errors() {
            let injected = TaggedError::new(&self.config.error_kind, &self.config.error_message);
            return Err(injected.into());
        }
        Ok(())
    }
}

impl fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultInjector")
            .field("fault", &self.fault)
            .field("active", &self.is_active())
            .field("injected", &self.injected_count())
            .finish_non_exhaustive()
    }
}

/// State of the stack at one instant, used as experiment baseline and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub breakers: BreakerFleetHealth,
    pub degradation_level: DegradationLevel,
    pub healing: HealingStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub circuit_trips: u64,
    pub degradation_activated: bool,
    pub recoveries_succeeded: usize,
    pub recoveries_failed: usize,
    /// Calls issued by the workload; zero without one.
    pub requests: u64,
    pub errors: u64,
    pub rejected_by_breaker: u64,
    pub injected_faults: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub observations: Vec<String>,
    pub recommendations: Vec<String>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosExperiment {
    pub id: String,
    pub name: String,
    pub fault_type: FaultType,
    pub target: String,
    pub config: FaultConfig,
    #[serde(rename = "duration_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    pub status: ExperimentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub baseline: Option<MetricsSnapshot>,
    pub results: Option<ExperimentResults>,
    pub error: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_safe_mode() -> bool {
    true
}

fn default_allowed_faults() -> Vec<FaultType> {
    FaultType::ALL.to_vec()
}

fn default_max_concurrent() -> usize {
    1
}

fn default_workload_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_history_size() -> usize {
    100
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Refuse destructive fault types.
    #[serde(default = "default_safe_mode")]
    pub safe_mode: bool,
    #[serde(default = "default_allowed_faults")]
    pub allowed_faults: Vec<FaultType>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_experiments: usize,
    /// Seed for reproducible injection; entropy when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Pause between workload calls.
    #[serde(default = "default_workload_interval", rename = "workload_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub workload_interval: Duration,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            safe_mode: default_safe_mode(),
            allowed_faults: default_allowed_faults(),
            max_concurrent_experiments: default_max_concurrent(),
            seed: None,
            workload_interval: default_workload_interval(),
            history_size: default_history_size(),
        }
    }
}

impl ChaosConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_concurrent_experiments == 0 || self.history_size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "chaos max_concurrent_experiments and history_size must be at least 1".into(),
            ));
        }
        if self.workload_interval.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "chaos workload_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Declarative list of experiments loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChaosSuite {
    /// Reseeds the engine so a suite replays identically.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub experiments: Vec<SuiteExperiment>,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct SuiteExperiment {
    pub name: String,
    pub fault: FaultType,
    pub target: String,
    #[serde(rename = "duration_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    #[serde(default)]
    pub config: FaultOverrides,
}

impl ChaosSuite {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("unable to read chaos suite {}", path.as_ref().display()))?;
        contents.parse::<Self>()
    }
}

impl std::str::FromStr for ChaosSuite {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        toml::from_str::<Self>(input).map_err(anyhow::Error::new)
    }
}

struct RunningExperiment {
    cancel: watch::Sender<bool>,
    injector: Arc<FaultInjector>,
    target: String,
}

#[derive(Default)]
struct WorkloadStats {
    requests: u64,
    errors: u64,
    rejected: u64,
    latencies_ms: Vec<u64>,
}

/// Runs fault injection experiments and reports what the stack did about them.
pub struct ChaosEngine {
    config: RwLock<ChaosConfig>,
    breakers: Arc<CircuitBreakerManager>,
    degradation: Option<Arc<GracefulDegradation>>,
    healer: Option<Arc<SelfHealer>>,
    workloads: RwLock<HashMap<String, Operation>>,
    experiments: RwLock<IndexMap<String, ChaosExperiment>>,
    running: Mutex<HashMap<String, RunningExperiment>>,
    rng: Mutex<StdRng>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
}

impl ChaosEngine {
    pub fn new(
        config: ChaosConfig,
        breakers: Arc<CircuitBreakerManager>,
        degradation: Option<Arc<GracefulDegradation>>,
        healer: Option<Arc<SelfHealer>>,
        events: EventBus,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config: RwLock::new(config),
            breakers,
            degradation,
            healer,
            workloads: RwLock::new(HashMap::new()),
            experiments: RwLock::new(IndexMap::new()),
            running: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            events,
            metrics,
        })
    }

    pub fn config(&self) -> ChaosConfig {
        self.config.read().clone()
    }

    pub fn update_config<F>(&self, update: F) -> Result<(), ResilienceError>
    where
        F: FnOnce(&mut ChaosConfig),
    {
        let mut candidate = self.config();
        update(&mut candidate);
        candidate.validate()?;
        if candidate.seed != self.config.read().seed {
            if let Some(seed) = candidate.seed {
                *self.rng.lock() = StdRng::seed_from_u64(seed);
            }
        }
        *self.config.write() = candidate;
        Ok(())
    }

    /// Calls driven through `target`'s breaker for the length of each experiment.
    pub fn register_workload<F, Fut>(&self, target: impl Into<String>, workload: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.workloads
            .write()
            .insert(target.into(), operation(workload));
    }

    /// Active injector for `target`, for callers routing their own traffic through it.
    pub fn injector(&self, target: &str) -> Option<Arc<FaultInjector>> {
        self.running
            .lock()
            .values()
            .find(|running| running.target == target)
            .map(|running| running.injector.clone())
    }

    pub fn experiments(&self) -> Vec<ChaosExperiment> {
        self.experiments.read().values().cloned().collect()
    }

    pub fn get_experiment(&self, id: &str) -> Option<ChaosExperiment> {
        self.experiments.read().get(id).cloned()
    }

    /// Stop a running experiment; its injector is switched off and the
    /// experiment ends as `cancelled`. Finished experiments are left untouched.
    pub fn cancel_experiment(&self, id: &str) -> Result<(), ResilienceError> {
        if let Some(running) = self.running.lock().get(id) {
            running.injector.stop();
            let _ = running.cancel.send(true);
            info!(
                target: "rampart::resilience::chaos",
                experiment = id,
                "experiment cancellation requested"
            );
            return Ok(());
        }
        if self.experiments.read().contains_key(id) {
            Ok(())
        } else {
            Err(ResilienceError::UnknownExperiment(id.to_owned()))
        }
    }

    pub async fn latency_spike(
        &self,
        target: &str,
        latency: Duration,
        duration: Duration,
    ) -> Result<ChaosExperiment, ResilienceError> {
        let overrides = FaultOverrides {
            probability: Some(1.0),
            latency: Some(latency),
            ..FaultOverrides::default()
        };
        self.run_experiment(
            &format!("latency-spike-{target}"),
            FaultType::Latency,
            target,
            overrides,
            duration,
        )
        .await
    }

    pub async fn error_storm(
        &self,
        target: &str,
        error_rate: f64,
        duration: Duration,
    ) -> Result<ChaosExperiment, ResilienceError> {
        let overrides = FaultOverrides {
            probability: Some(error_rate),
            ..FaultOverrides::default()
        };
        self.run_experiment(
            &format!("error-storm-{target}"),
            FaultType::Error,
            target,
            overrides,
            duration,
        )
        .await
    }

    pub async fn service_outage(
        &self,
        target: &str,
        duration: Duration,
    ) -> Result<ChaosExperiment, ResilienceError> {
        self.run_experiment(
            &format!("service-outage-{target}"),
            FaultType::ServiceUnavailable,
            target,
            FaultOverrides::default(),
            duration,
        )
        .await
    }

    /// Run every experiment of `suite` in order, stopping at the first rejection.
    pub async fn run_suite(
        &self,
        suite: &ChaosSuite,
    ) -> Result<Vec<ChaosExperiment>, ResilienceError> {
        if let Some(seed) = suite.seed {
            *self.rng.lock() = StdRng::seed_from_u64(seed);
        }
        let mut finished = Vec::with_capacity(suite.experiments.len());
        for experiment in &suite.experiments {
            finished.push(
                self.run_experiment(
                    &experiment.name,
                    experiment.fault,
                    &experiment.target,
                    experiment.config.clone(),
                    experiment.duration,
                )
                .await?,
            );
        }
        info!(
            target: "rampart::resilience::chaos",
            total = finished.len(),
            "chaos suite completed"
        );
        Ok(finished)
    }

    fn check_admissible(
        &self,
        fault: FaultType,
        config: &FaultConfig,
    ) -> Result<(), ResilienceError> {
        let settings = self.config.read();
        if !settings.enabled {
            return Err(ResilienceError::ChaosValidation("chaos engineering is disabled".into()));
        }
        if !settings.allowed_faults.contains(&fault) {
            return Err(ResilienceError::ChaosValidation(format!(
                "fault type '{fault}' is not in the allowlist"
            )));
        }
        if settings.safe_mode && fault.is_destructive() {
            return Err(ResilienceError::ChaosValidation(format!(
                "fault type '{fault}' is destructive and safe mode is on"
            )));
        }
        config.validate()
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            breakers: self.breakers.health(),
            degradation_level: self
                .degradation
                .as_ref()
                .map(|d| d.current_level())
                .unwrap_or(DegradationLevel::Full),
            healing: self
                .healer
                .as_ref()
                .map(|h| h.stats())
                .unwrap_or_default(),
        }
    }

    fn store(&self, experiment: &ChaosExperiment) {
        let limit = self.config.read().history_size;
        let mut experiments = self.experiments.write();
        experiments.insert(experiment.id.clone(), experiment.clone());
        while experiments.len() > limit {
            experiments.shift_remove_index(0);
        }
    }

    /// Inject `fault_type` into `target` for `duration` and report the deltas.
    pub async fn run_experiment(
        &self,
        name: &str,
        fault_type: FaultType,
        target: &str,
        overrides: FaultOverrides,
        duration: Duration,
    ) -> Result<ChaosExperiment, ResilienceError> {
        let config = FaultConfig::merged(fault_type, &overrides);
        if let Err(rejection) = self.check_admissible(fault_type, &config) {
            warn!(
                target: "rampart::resilience::chaos",
                name,
                fault = %fault_type,
                error = %rejection,
                "experiment rejected"
            );
            return Err(rejection);
        }

        let seed = self.rng.lock().gen::<u64>();
        let injector = Arc::new(FaultInjector::new(fault_type, config.clone(), seed));
        let (cancel, cancel_rx) = watch::channel(false);
        let mut experiment = ChaosExperiment {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            fault_type,
            target: target.to_owned(),
            config,
            duration,
            status: ExperimentStatus::Pending,
            started_at: None,
            ended_at: None,
            baseline: None,
            results: None,
            error: None,
        };
        {
            let limit = self.config.read().max_concurrent_experiments;
            let mut running = self.running.lock();
            if running.len() >= limit {
                return Err(ResilienceError::ChaosValidation(format!(
                    "max concurrent experiments reached ({limit})"
                )));
            }
            running.insert(
                experiment.id.clone(),
                RunningExperiment {
                    cancel,
                    injector: injector.clone(),
                    target: target.to_owned(),
                },
            );
        }
        self.store(&experiment);

        let baseline = self.snapshot();
        experiment.status = ExperimentStatus::Running;
        experiment.started_at = Some(baseline.timestamp);
        experiment.baseline = Some(baseline.clone());
        self.store(&experiment);
        warn!(
            target: "rampart::resilience::chaos",
            experiment = %experiment.id,
            name,
            fault = %fault_type,
            target_component = target,
            duration_ms = rampart_common::time::duration_to_millis(duration),
            "chaos experiment started"
        );
        self.events.emit(ResilienceEvent::new(
            EventKind::ChaosExperimentStarted,
            target,
            json!({ "experiment_id": experiment.id, "name": name, "fault_type": fault_type }),
        ));

        injector.start();
        let workload = self.workloads.read().get(target).cloned();
        let driven = match workload {
            Some(workload) => {
                let breaker = self.breakers.get_or_create(target);
                let interval = self.config.read().workload_interval;
                let task = tokio::spawn(drive_workload(
                    breaker,
                    injector.clone(),
                    workload,
                    interval,
                    Instant::now() + duration,
                    cancel_rx.clone(),
                ));
                task.await.map(Some).map_err(|err| format!("workload task failed: {err}"))
            }
            None => {
                let mut cancelled = cancel_rx.clone();
                tokio::select! {
                    _ = sleep(duration) => {}
                    _ = cancelled.changed() => {}
                }
                Ok(None)
            }
        };
        injector.stop();

        let outcome = self.snapshot();
        let cancelled = *cancel_rx.borrow();
        experiment.ended_at = Some(outcome.timestamp);
        match driven {
            Ok(stats) => {
                experiment.status = if cancelled {
                    ExperimentStatus::Cancelled
                } else {
                    ExperimentStatus::Completed
                };
                experiment.results = Some(self.analyse(
                    &experiment,
                    &baseline,
                    &outcome,
                    stats,
                    injector.injected_count(),
                ));
            }
            Err(message) => {
                error!(
                    target: "rampart::resilience::chaos",
                    experiment = %experiment.id,
                    error = %message,
                    "chaos experiment failed"
                );
                experiment.status = ExperimentStatus::Failed;
                experiment.error = Some(message);
            }
        }
        self.running.lock().remove(&experiment.id);
        self.store(&experiment);

        if let Some(metrics) = &self.metrics {
            metrics.record_chaos_experiment(fault_type, experiment.status);
        }
        info!(
            target: "rampart::resilience::chaos",
            experiment = %experiment.id,
            status = experiment.status.as_str(),
            trips = experiment.results.as_ref().map(|r| r.circuit_trips).unwrap_or(0),
            "chaos experiment finished"
        );
        self.events.emit(ResilienceEvent::new(
            EventKind::ChaosExperimentCompleted,
            target,
            json!({
                "experiment_id": experiment.id,
                "status": experiment.status,
                "results": experiment.results,
            }),
        ));
        Ok(experiment)
    }

    fn analyse(
        &self,
        experiment: &ChaosExperiment,
        baseline: &MetricsSnapshot,
        outcome: &MetricsSnapshot,
        stats: Option<WorkloadStats>,
        injected_faults: u64,
    ) -> ExperimentResults {
        let stats = stats.unwrap_or_default();
        let circuit_trips = outcome
            .breakers
            .total_trips
            .saturating_sub(baseline.breakers.total_trips);
        let started_at = experiment.started_at.unwrap_or(baseline.timestamp);
        let degradation_activated = outcome.degradation_level > baseline.degradation_level
            || self.degradation.as_ref().is_some_and(|d| {
                d.history()
                    .iter()
                    .any(|t| t.timestamp >= started_at && t.to > t.from)
            });
        let recoveries_succeeded = outcome
            .healing
            .successful_recoveries
            .saturating_sub(baseline.healing.successful_recoveries);
        let recoveries_failed = outcome
            .healing
            .failed_recoveries
            .saturating_sub(baseline.healing.failed_recoveries);

        let mut latencies = stats.latencies_ms;
        latencies.sort_unstable();
        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };
        let p95_latency_ms = if latencies.is_empty() {
            0
        } else {
            let rank = (0.95 * latencies.len() as f64).ceil() as usize;
            latencies[rank.clamp(1, latencies.len()) - 1]
        };
        let error_rate = if stats.requests == 0 {
            0.0
        } else {
            stats.errors as f64 / stats.requests as f64
        };

        let mut observations = Vec::new();
        let mut recommendations = Vec::new();
        if stats.requests > 0 {
            observations.push(format!(
                "{} requests, {} errors, {} rejected by the breaker, average latency {:.0} ms",
                stats.requests, stats.errors, stats.rejected, avg_latency_ms
            ));
        }
        if circuit_trips > 0 {
            observations.push(format!("circuit breakers tripped {circuit_trips} time(s)"));
        } else {
            observations.push("no circuit trips observed".to_owned());
            if experiment.fault_type.injects_errors() && stats.errors > 0 {
                recommendations.push(format!(
                    "no trips observed despite {} errors; \
                     consider lowering failure_threshold for '{}'",
                    stats.errors, experiment.target
                ));
            }
        }
        if degradation_activated {
            observations.push(format!(
                "degradation activated (level {})",
                outcome.degradation_level.as_str()
            ));
        }
        let attempted = recoveries_succeeded + recoveries_failed;
        if attempted > 0 {
            let rate = recoveries_succeeded as f64 / attempted as f64;
            observations.push(format!(
                "{recoveries_succeeded} of {attempted} recoveries succeeded"
            ));
            if rate < 0.8 {
                recommendations.push(format!(
                    "recovery success rate {:.0}% is below 80%; improve recovery strategies",
                    rate * 100.0
                ));
            }
        }

        ExperimentResults {
            circuit_trips,
            degradation_activated,
            recoveries_succeeded,
            recoveries_failed,
            requests: stats.requests,
            errors: stats.errors,
            rejected_by_breaker: stats.rejected,
            injected_faults,
            error_rate,
            avg_latency_ms,
            p95_latency_ms,
            observations,
            recommendations,
        }
    }
}

impl fmt::Debug for ChaosEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaosEngine")
            .field("experiments", &self.experiments.read().len())
            .field("running", &self.running.lock().len())
            .finish_non_exhaustive()
    }
}

/// Issue workload calls through the breaker until the deadline or cancellation.
///
/// Injected failures are counted here and never leave the experiment.
async fn drive_workload(
    breaker: Arc<CircuitBreaker>,
    injector: Arc<FaultInjector>,
    workload: Operation,
    interval: Duration,
    deadline: Instant,
    mut cancel: watch::Receiver<bool>,
) -> WorkloadStats {
    let mut stats = WorkloadStats::default();
    loop {
        let cancelled = *cancel.borrow();
        if cancelled || Instant::now() >= deadline {
            break;
        }
        let started = Instant::now();
        let outcome = breaker.execute(|| injector.wrap(workload.clone())).await;
        let elapsed = rampart_common::time::duration_to_millis(started.elapsed());
        stats.requests += 1;
        match outcome {
            Ok(_) => stats.latencies_ms.push(elapsed),
            Err(err)
                if err
                    .downcast_ref::<ResilienceError>()
                    .is_some_and(ResilienceError::is_circuit_open) =>
            {
                stats.rejected += 1;
            }
            Err(_) => {
                stats.errors += 1;
                stats.latencies_ms.push(elapsed);
            }
        }
        tokio::select! {
            _ = sleep(interval) => {}
            _ = cancel.changed() => break,
        }
    }
    stats
}
