//! ---
//! rampart_section: "15-testing-qa-runbook"
//! rampart_subsection: "integration"
//! rampart_type: "test"
//! rampart_scope: "code"
//! rampart_description: "Engine lifecycle from a config file through the background loops."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use rampart_common::LogFormat;
use rampart_resilience::{
    CircuitBreakerSnapshot, CircuitState, EventKind, HealthStatus, ProbeReport, ResilienceConfig,
    ResilienceEngine, ResilienceError,
};
use serde_json::json;

const CONFIG: &str = r#"
    [logging]
    format = "pretty"

    [metrics]
    prefix = "edge"

    [circuit_breaker]
    failure_threshold = 3

    [health]
    check_interval_ms = 100

    [self_healing]
    health_check_interval_ms = 250

    [degradation]
    recovery_check_interval_ms = 500
"#;

fn load_engine() -> ResilienceEngine {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rampart.toml");
    std::fs::write(&path, CONFIG).unwrap();
    let loaded = ResilienceConfig::load_with_source(&[path.clone()]).unwrap();
    assert_eq!(loaded.source, path);
    assert_eq!(loaded.config.logging.format, LogFormat::Pretty);
    ResilienceEngine::from_config(loaded.config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn background_loops_detect_and_heal_a_failing_probe() {
    let engine = load_engine();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = engine.on_event(move |event| {
        sink.lock().push(event.kind);
        Ok(())
    });

    let up = Arc::new(AtomicBool::new(false));
    let probe = up.clone();
    engine.health().register_check("db", move || {
        let healthy = probe.load(Ordering::SeqCst);
        async move {
            Ok(if healthy {
                ProbeReport::healthy()
            } else {
                ProbeReport::new(HealthStatus::Unhealthy)
            })
        }
    });
    let restart = up.clone();
    engine.healer().register_recovery("db", move || {
        restart.store(true, Ordering::SeqCst);
        async { Ok(json!({ "restarted": "db" })) }
    });

    engine.start();
    tokio::time::sleep(Duration::from_secs(3)).await;
    engine.shutdown().await;
    assert!(!engine.is_running());

    let kinds = seen.lock().clone();
    for expected in [
        EventKind::HealthDegraded,
        EventKind::RecoveryStarted,
        EventKind::RecoverySucceeded,
        EventKind::HealthRecovered,
    ] {
        assert!(kinds.contains(&expected), "missing {expected:?} in {kinds:?}");
    }
    let stats = engine.healer().stats();
    assert!(stats.successful_recoveries >= 1);
    assert_eq!(stats.failed_recoveries, 0);
    assert_eq!(
        engine.health().get_component_health("db").unwrap().status,
        HealthStatus::Healthy
    );

    let text = engine.render_metrics().unwrap().unwrap();
    assert!(text.contains("edge_rampart_recoveries_total"));
}

#[tokio::test]
async fn breaker_snapshot_survives_an_engine_restart() {
    let first = load_engine();
    let ledger = first.breakers().get_or_create("ledger");
    for _ in 0..3 {
        let _ = ledger
            .execute(|| async { Err::<(), _>(anyhow!("ledger unavailable")) })
            .await;
    }
    assert_eq!(ledger.state(), CircuitState::Open);
    let persisted = serde_json::to_string(&ledger.snapshot()).unwrap();

    let second = load_engine();
    let snapshot: CircuitBreakerSnapshot = serde_json::from_str(&persisted).unwrap();
    let restored = second.breakers().restore(snapshot).unwrap();
    assert_eq!(restored.state(), CircuitState::Open);
    assert_eq!(restored.stats().counters.total_failures, 3);

    let err = second
        .breakers()
        .execute("ledger", || async { Ok::<_, anyhow::Error>(1) })
        .await
        .unwrap_err();
    assert!(err
        .downcast_ref::<ResilienceError>()
        .is_some_and(ResilienceError::is_circuit_open));
}
