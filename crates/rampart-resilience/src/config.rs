//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Aggregate configuration document for the resilience engine."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::path::Path;

use anyhow::{Context, Result};
use rampart_common::{load_toml_with_source, LoadedConfig, LoggingConfig};
use serde::{Deserialize, Serialize};

use crate::chaos::ChaosConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::degradation::DegradationConfig;
use crate::health::HealthMonitorConfig;
use crate::self_healing::SelfHealingConfig;

fn default_metrics_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Prefix applied to every metric family name.
    #[serde(default)]
    pub prefix: Option<String>,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            prefix: None,
        }
    }
}

/// Top level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsSection,
    /// Defaults for breakers created on demand.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health: HealthMonitorConfig,
    #[serde(default)]
    pub self_healing: SelfHealingConfig,
    #[serde(default)]
    pub degradation: DegradationConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

impl ResilienceConfig {
    pub const ENV_CONFIG_PATH: &'static str = "RAMPART_CONFIG";

    /// Load from disk, respecting the `RAMPART_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedConfig<Self>> {
        let loaded: LoadedConfig<Self> = load_toml_with_source(Self::ENV_CONFIG_PATH, candidates)?;
        loaded
            .config
            .validate()
            .with_context(|| format!("invalid configuration in {}", loaded.source.display()))?;
        Ok(loaded)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker.validate()?;
        self.health.validate()?;
        self.self_healing.validate()?;
        self.degradation.validate()?;
        self.chaos.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for ResilienceConfig {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let config = toml::from_str::<Self>(input).context("failed to parse resilience config")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::FaultType;
    use crate::degradation::DegradationLevel;
    use crate::recovery::StrategyKind;
    use crate::self_healing::FailureCategory;
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [logging]
        format = "pretty"

        [circuit_breaker]
        failure_threshold = 3
        timeout_ms = 1000

        [health]
        check_interval_ms = 5000

        [self_healing]
        max_concurrent_recoveries = 2
        recovery_timeout_ms = 10000

        [self_healing.retry]
        max_attempts = 4
        backoff = "linear"

        [[self_healing.category_strategies]]
        category = "rate-limit"
        strategy = "escalate"

        [[degradation.rules]]
        name = "collapse"
        target_level = "emergency"
        condition = { metric = "health_score", operator = "<", threshold = 50.0 }

        [[degradation.features]]
        name = "recommendations"
        priority = 10
        degradation_levels = ["minimal", "emergency"]

        [chaos]
        safe_mode = true
        allowed_faults = ["latency", "error"]
    "#;

    #[test]
    fn parses_every_section() {
        let config: ResilienceConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout, Duration::from_secs(1));
        assert_eq!(config.health.check_interval, Duration::from_secs(5));
        assert_eq!(config.self_healing.retry.max_attempts, 4);
        assert_eq!(
            config.self_healing.category_strategies[0].category,
            FailureCategory::RateLimit
        );
        assert_eq!(
            config.self_healing.category_strategies[0].strategy,
            StrategyKind::Escalate
        );
        assert_eq!(config.degradation.rules[0].target_level, DegradationLevel::Emergency);
        assert_eq!(config.degradation.features[0].degradation_levels.len(), 2);
        assert_eq!(config.chaos.allowed_faults, vec![FaultType::Latency, FaultType::Error]);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn invalid_sections_are_rejected() {
        let err = "[circuit_breaker]\nfailure_threshold = 0\n"
            .parse::<ResilienceConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("thresholds must be at least 1"));
    }

    #[test]
    fn loads_from_candidate_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rampart.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = ResilienceConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.self_healing.max_concurrent_recoveries, 2);
    }
}
