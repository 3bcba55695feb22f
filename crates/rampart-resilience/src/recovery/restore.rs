//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Checkpoint restore recovery."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{
    describe, elapsed_ms, AttemptTimer, ExhaustPolicy, Operation, RecoveryContext,
    RecoveryExecutor, RecoveryResult, StrategyKind,
};

/// Restores state from a checkpoint and yields the restored value.
pub type RestoreFn =
    Arc<dyn Fn(RestoreRequest) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Checks a restored value; `Ok(false)` and `Err` both reject it.
pub type RestoreValidator =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Arguments passed to the restore function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub checkpoint_id: Option<String>,
    pub restore_point: Option<DateTime<Utc>>,
    pub component: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreConfig {
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub restore_point: Option<DateTime<Utc>>,
    #[serde(default)]
    pub on_exhausted: ExhaustPolicy,
}

pub struct RestoreRecovery {
    config: RestoreConfig,
    restore: RestoreFn,
    validator: Option<RestoreValidator>,
}

impl RestoreRecovery {
    pub fn new<F, Fut>(config: RestoreConfig, restore: F) -> Self
    where
        F: Fn(RestoreRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            config,
            restore: Arc::new(move |request| restore(request).boxed()),
            validator: None,
        }
    }

    pub fn with_validator<F, Fut>(mut self, validator: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.validator = Some(Arc::new(move |value| validator(value).boxed()));
        self
    }
}

impl fmt::Debug for RestoreRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreRecovery")
            .field("config", &self.config)
            .field("validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RecoveryExecutor for RestoreRecovery {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Restore
    }

    fn on_exhausted(&self) -> ExhaustPolicy {
        self.config.on_exhausted
    }

    /// The failing operation is not re-run; the restored value replaces its result.
    async fn execute(&self, _operation: Operation, context: &RecoveryContext) -> RecoveryResult {
        let started = Instant::now();
        let request = RestoreRequest {
            checkpoint_id: self.config.checkpoint_id.clone(),
            restore_point: self.config.restore_point,
            component: context.component.clone(),
        };

        let timer = AttemptTimer::start();
        let restored = match (self.restore)(request).await {
            Ok(value) => value,
            Err(err) => {
                let message = format!("restore failed: {}", describe(&err));
                warn!(
                    target: "rampart::resilience::recovery",
                    component = %context.component,
                    error = %message,
                    "restore failed"
                );
                let attempts = vec![timer.finish(1, "restore", 0, Some(message.clone()))];
                return RecoveryResult::failed(
                    StrategyKind::Restore,
                    message,
                    attempts,
                    elapsed_ms(started),
                );
            }
        };

        if let Some(validator) = &self.validator {
            let verdict = match validator(restored.clone()).await {
                Ok(true) => None,
                Ok(false) => Some("restored state failed validation".to_owned()),
                Err(err) => Some(format!("restore validation errored: {}", describe(&err))),
            };
            if let Some(message) = verdict {
                warn!(
                    target: "rampart::resilience::recovery",
                    component = %context.component,
                    error = %message,
                    "restore rejected"
                );
                let attempts = vec![timer.finish(1, "restore", 0, Some(message.clone()))];
                return RecoveryResult::failed(
                    StrategyKind::Restore,
                    message,
                    attempts,
                    elapsed_ms(started),
                );
            }
        }

        info!(
            target: "rampart::resilience::recovery",
            component = %context.component,
            checkpoint = ?self.config.checkpoint_id,
            "state restored"
        );
        let attempts = vec![timer.finish(1, "restore", 0, None)];
        RecoveryResult::recovered(StrategyKind::Restore, restored, attempts, started)
    }
}
