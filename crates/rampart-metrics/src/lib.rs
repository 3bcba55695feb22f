//! ---
//! rampart_section: "03-observability"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Metrics collection and export utilities."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Registry, TextEncoder};
use tracing::debug;

/// Shared registry type used across components.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Produce a registry whose metric names carry `prefix`.
pub fn new_prefixed_registry(prefix: &str) -> Result<SharedRegistry> {
    let registry = Registry::new_custom(Some(prefix.to_owned()), None)
        .with_context(|| format!("invalid metrics prefix {prefix}"))?;
    Ok(Arc::new(registry))
}

/// Render every family in the registry using the Prometheus text exposition format.
///
/// Embedding processes serve this from whatever endpoint they already expose.
pub fn render_text(registry: &SharedRegistry) -> Result<String> {
    let families = registry.gather();
    debug!(families = families.len(), "encoding metrics");
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

/// Look up the value of a counter sample matching every `(label, value)` pair.
///
/// Returns `None` when the family or a matching sample does not exist.
pub fn counter_value(
    registry: &SharedRegistry,
    name: &str,
    labels: &[(&str, &str)],
) -> Option<f64> {
    let families = registry.gather();
    let family = families.iter().find(|fam| fam.get_name() == name)?;
    family
        .get_metric()
        .iter()
        .find(|metric| {
            labels.iter().all(|(key, value)| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == *key && label.get_value() == *value)
            })
        })
        .map(|metric| metric.get_counter().get_value())
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounterVec, Opts};

    #[test]
    fn render_includes_registered_families() {
        let registry = new_registry();
        let counter =
            IntCounterVec::new(Opts::new("demo_total", "demo counter"), &["kind"]).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.with_label_values(&["a"]).inc_by(3);

        let text = render_text(&registry).unwrap();
        assert!(text.contains("demo_total{kind=\"a\"} 3"));
        assert_eq!(counter_value(&registry, "demo_total", &[("kind", "a")]), Some(3.0));
        assert_eq!(counter_value(&registry, "demo_total", &[("kind", "b")]), None);
    }

    #[test]
    fn prefixed_registry_prepends_namespace() {
        let registry = new_prefixed_registry("svc").unwrap();
        let counter = IntCounterVec::new(Opts::new("calls_total", "calls"), &["op"]).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.with_label_values(&["x"]).inc();
        assert!(render_text(&registry).unwrap().contains("svc_calls_total"));
    }
}
