//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Priority-ordered fallback chain recovery."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{
    describe, elapsed_ms, AttemptTimer, ExhaustPolicy, Operation, RecoveryContext,
    RecoveryExecutor, RecoveryResult, StrategyKind,
};
use crate::error::ResilienceError;

type CanHandle = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// A named alternative source of the result.
#[derive(Clone)]
pub struct FallbackProvider {
    pub name: String,
    /// Lower values are tried first.
    pub priority: i32,
    pub timeout: Option<Duration>,
    can_handle: Option<CanHandle>,
    execute: Operation,
}

impl FallbackProvider {
    pub fn new(name: impl Into<String>, priority: i32, execute: Operation) -> Self {
        Self {
            name: name.into(),
            priority,
            timeout: None,
            can_handle: None,
            execute,
        }
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Only attempt this provider for errors the predicate approves.
    pub fn with_can_handle<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.can_handle = Some(Arc::new(predicate));
        self
    }

    fn accepts(&self, err: &anyhow::Error) -> bool {
        self.can_handle
            .as_ref()
            .map(|predicate| predicate(err))
            .unwrap_or(true)
    }

    async fn run(&self) -> anyhow::Result<serde_json::Value> {
        match self.timeout {
            Some(limit) => match timeout(limit, (self.execute)()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::Error::new(ResilienceError::RecoveryExhausted {
                    attempts: 1,
                    message: format!(
                        "fallback '{}' timed out after {} ms",
                        self.name,
                        rampart_common::time::duration_to_millis(limit)
                    ),
                })),
            },
            None => (self.execute)().await,
        }
    }
}

impl fmt::Debug for FallbackProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackProvider")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("can_handle", &self.can_handle.is_some())
            .finish()
    }
}

fn default_cascade() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Keep walking the chain after a failed fallback.
    #[serde(default = "default_cascade")]
    pub cascade_on_failure: bool,
    #[serde(default)]
    pub on_exhausted: ExhaustPolicy,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cascade_on_failure: default_cascade(),
            on_exhausted: ExhaustPolicy::default(),
        }
    }
}

/// Tries the primary operation once, then each provider in ascending priority.
#[derive(Debug, Clone)]
pub struct FallbackRecovery {
    config: FallbackConfig,
    chain: Vec<FallbackProvider>,
}

impl FallbackRecovery {
    pub fn new(config: FallbackConfig, mut chain: Vec<FallbackProvider>) -> Self {
        chain.sort_by_key(|provider| provider.priority);
        Self { config, chain }
    }

    /// Insert a provider, keeping the chain ordered. Equal priorities keep insertion order.
    pub fn add_provider(&mut self, provider: FallbackProvider) {
        let index = self
            .chain
            .partition_point(|existing| existing.priority <= provider.priority);
        self.chain.insert(index, provider);
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.chain.iter().map(|p| p.name.clone()).collect()
    }
}

#[async_trait]
impl RecoveryExecutor for FallbackRecovery {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fallback
    }

    fn on_exhausted(&self) -> ExhaustPolicy {
        self.config.on_exhausted
    }

    async fn execute(&self, operation: Operation, context: &RecoveryContext) -> RecoveryResult {
        let started = Instant::now();
        let mut attempts = Vec::new();

        let timer = AttemptTimer::start();
        let mut last_error = match operation().await {
            Ok(value) => {
                attempts.push(timer.finish(1, "primary", 0, None));
                return RecoveryResult::recovered(StrategyKind::Fallback, value, attempts, started);
            }
            Err(err) => {
                attempts.push(timer.finish(1, "primary", 0, Some(describe(&err))));
                err
            }
        };

        for provider in &self.chain {
            if !provider.accepts(&last_error) {
                debug!(
                    target: "rampart::resilience::recovery",
                    component = %context.component,
                    provider = %provider.name,
                    "fallback declined error"
                );
                continue;
            }
            let timer = AttemptTimer::start();
            match provider.run().await {
                Ok(value) => {
                    attempts.push(timer.finish(attempts.len() + 1, provider.name.clone(), 0, None));
                    info!(
                        target: "rampart::resilience::recovery",
                        component = %context.component,
                        provider = %provider.name,
                        "fallback succeeded"
                    );
                    return RecoveryResult::recovered(
                        StrategyKind::Fallback,
                        value,
                        attempts,
                        started,
                    );
                }
                Err(err) => {
                    let message = describe(&err);
                    attempts.push(timer.finish(
                        attempts.len() + 1,
                        provider.name.clone(),
                        0,
                        Some(message.clone()),
                    ));
                    warn!(
                        target: "rampart::resilience::recovery",
                        component = %context.component,
                        provider = %provider.name,
                        error = %message,
                        "fallback failed"
                    );
                    last_error = err;
                }
            }
            if !self.config.cascade_on_failure {
                break;
            }
        }

        let exhausted = ResilienceError::RecoveryExhausted {
            attempts: attempts.len(),
            message: describe(&last_error),
        };
        RecoveryResult::failed(
            StrategyKind::Fallback,
            exhausted.to_string(),
            attempts,
            elapsed_ms(started),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_matches, TaggedError};
    use crate::recovery::{operation, FinalState};
    use parking_lot::Mutex;
    use serde_json::json;

    fn failing(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Operation {
        operation(move || {
            let log = log.clone();
            async move {
                log.lock().push(label);
                Err(TaggedError::new("Unavailable", label).into())
            }
        })
    }

    fn returning(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Operation {
        operation(move || {
            let log = log.clone();
            async move {
                log.lock().push(label);
                Ok(json!("value"))
            }
        })
    }

    #[tokio::test]
    async fn walks_chain_by_priority_until_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fallback = FallbackRecovery::new(
            FallbackConfig::default(),
            vec![
                FallbackProvider::new("db", 2, returning("db", log.clone())),
                FallbackProvider::new("cache", 1, failing("cache", log.clone())),
            ],
        );
        let result = fallback
            .execute(failing("primary", log.clone()), &RecoveryContext::default())
            .await;
        assert!(result.success);
        assert_eq!(result.result, Some(json!("value")));
        assert_eq!(result.final_state, FinalState::Recovered);
        let labels: Vec<_> = result.attempts.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, vec!["primary", "cache", "db"]);
        assert_eq!(*log.lock(), vec!["primary", "cache", "db"]);
    }

    #[tokio::test]
    async fn declined_providers_are_never_invoked() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fallback = FallbackRecovery::new(
            FallbackConfig::default(),
            vec![
                FallbackProvider::new("timeouts-only", 1, returning("timeouts-only", log.clone()))
                    .with_can_handle(|err| error_matches(err, "Timeout")),
                FallbackProvider::new("static", 5, returning("static", log.clone())),
            ],
        );
        let result = fallback
            .execute(failing("primary", log.clone()), &RecoveryContext::default())
            .await;
        assert!(result.success);
        assert_eq!(*log.lock(), vec!["primary", "static"]);
        assert_eq!(result.attempts.len(), 2);
    }

    #[tokio::test]
    async fn no_cascade_stops_after_first_fallback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fallback = FallbackRecovery::new(
            FallbackConfig {
                cascade_on_failure: false,
                ..FallbackConfig::default()
            },
            vec![
                FallbackProvider::new("a", 1, failing("a", log.clone())),
                FallbackProvider::new("b", 2, returning("b", log.clone())),
            ],
        );
        let result = fallback
            .execute(failing("primary", log.clone()), &RecoveryContext::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.final_state, FinalState::Failed);
        assert_eq!(*log.lock(), vec!["primary", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_timeout_counts_as_failure() {
        let slow = operation(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!("late"))
        });
        let fallback = FallbackRecovery::new(
            FallbackConfig::default(),
            vec![FallbackProvider::new("slow", 1, slow).with_timeout(Duration::from_millis(50))],
        );
        let primary = operation(|| async { Err(anyhow::anyhow!("primary down")) });
        let result = fallback.execute(primary, &RecoveryContext::default()).await;
        assert!(!result.success);
        assert!(result.attempts[1].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(result.attempts[1].duration_ms, 50);
    }

    #[test]
    fn add_provider_keeps_priority_order() {
        let noop = operation(|| async { Ok(json!(null)) });
        let mut fallback = FallbackRecovery::new(FallbackConfig::default(), Vec::new());
        fallback.add_provider(FallbackProvider::new("c", 3, noop.clone()));
        fallback.add_provider(FallbackProvider::new("a", 1, noop.clone()));
        fallback.add_provider(FallbackProvider::new("b", 3, noop));
        assert_eq!(fallback.provider_names(), vec!["a", "c", "b"]);
    }
}
