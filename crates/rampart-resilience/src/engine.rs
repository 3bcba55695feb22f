//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Facade wiring every resilience component onto one bus and registry."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use rampart_metrics::{new_prefixed_registry, new_registry, render_text, SharedRegistry};
use tracing::info;

use crate::chaos::ChaosEngine;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::ResilienceConfig;
use crate::degradation::GracefulDegradation;
use crate::events::{EventBus, ResilienceEvent, Subscription};
use crate::health::HealthMonitor;
use crate::metrics::ResilienceMetrics;
use crate::self_healing::SelfHealer;

/// Owns one instance of every component, sharing an event bus and metrics.
pub struct ResilienceEngine {
    config: ResilienceConfig,
    events: EventBus,
    registry: Option<SharedRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    health: Arc<HealthMonitor>,
    healer: Arc<SelfHealer>,
    degradation: Arc<GracefulDegradation>,
    chaos: Arc<ChaosEngine>,
}

impl ResilienceEngine {
    pub fn from_config(config: ResilienceConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let registry = if config.metrics.enabled {
            Some(match &config.metrics.prefix {
                Some(prefix) => new_prefixed_registry(prefix)?,
                None => new_registry(),
            })
        } else {
            None
        };
        let metrics = registry
            .clone()
            .map(ResilienceMetrics::new)
            .transpose()
            .context("failed to register resilience metrics")?;

        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.clone(),
            events.clone(),
            metrics.clone(),
        )?);
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            events.clone(),
            metrics.clone(),
        )?);
        let healer = Arc::new(SelfHealer::new(
            config.self_healing.clone(),
            Some(breakers.clone()),
            Some(health.clone()),
            events.clone(),
            metrics.clone(),
        )?);
        let degradation = Arc::new(GracefulDegradation::new(
            config.degradation.clone(),
            health.clone(),
            events.clone(),
            metrics.clone(),
        )?);
        let chaos = Arc::new(ChaosEngine::new(
            config.chaos.clone(),
            breakers.clone(),
            Some(degradation.clone()),
            Some(healer.clone()),
            events.clone(),
            metrics,
        )?);

        Ok(Self {
            config,
            events,
            registry,
            breakers,
            health,
            healer,
            degradation,
            chaos,
        })
    }

    /// Start the health, self-healing and degradation loops.
    pub fn start(&self) {
        let health = self.health.start();
        let healer = self.healer.start();
        let degradation = self.degradation.start();
        info!(
            target: "rampart::resilience::engine",
            health,
            healer,
            degradation,
            "resilience engine started"
        );
    }

    /// Stop every loop and wait for in-progress ticks to finish.
    pub async fn shutdown(&self) {
        self.degradation.stop().await;
        self.healer.stop().await;
        self.health.stop().await;
        info!(target: "rampart::resilience::engine", "resilience engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.health.is_running() || self.healer.is_running() || self.degradation.is_running()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ResilienceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on_event(handler)
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn healer(&self) -> &Arc<SelfHealer> {
        &self.healer
    }

    pub fn degradation(&self) -> &Arc<GracefulDegradation> {
        &self.degradation
    }

    pub fn chaos(&self) -> &Arc<ChaosEngine> {
        &self.chaos
    }

    /// Prometheus text exposition, or `None` when metrics are disabled.
    pub fn render_metrics(&self) -> Result<Option<String>> {
        self.registry.as_ref().map(render_text).transpose()
    }
}

impl std::fmt::Debug for ResilienceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEngine")
            .field("breakers", &self.breakers.names())
            .field("health", &self.health)
            .field("healer", &self.healer)
            .field("metrics", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn wires_components_onto_one_bus() {
        let engine = ResilienceEngine::from_config(ResilienceConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = engine.on_event(move |event| {
            sink.lock().push(event.kind);
            Ok(())
        });

        engine.breakers().get_or_create("api").force_open("maintenance");
        engine
            .degradation()
            .degrade(crate::degradation::DegradationLevel::Reduced, "load shedding");

        assert_eq!(
            *seen.lock(),
            vec![EventKind::CircuitOpened, EventKind::DegradationActivated]
        );
        let text = engine.render_metrics().unwrap().unwrap();
        assert!(text.contains("rampart_circuit_transitions_total"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_shutdown_toggle_loops() {
        let engine = ResilienceEngine::from_config(ResilienceConfig::default()).unwrap();
        engine.start();
        assert!(engine.is_running());
        engine.shutdown().await;
        assert!(!engine.is_running());
    }

    #[test]
    fn metrics_can_be_disabled() {
        let mut config = ResilienceConfig::default();
        config.metrics.enabled = false;
        let engine = ResilienceEngine::from_config(config).unwrap();
        assert!(engine.render_metrics().unwrap().is_none());
    }
}
