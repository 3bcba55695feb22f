//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Incident escalation to notification channels."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{
    describe, elapsed_ms, AttemptTimer, ExhaustPolicy, FinalState, Operation, RecoveryContext,
    RecoveryExecutor, RecoveryResult, StrategyKind,
};

/// Delivers a notification to one channel.
pub type NotificationHandler =
    Arc<dyn Fn(Notification) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Incident message sent to every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub title: String,
    pub message: String,
    pub component: String,
    pub failure_id: Option<String>,
    pub severity: Option<String>,
    pub requires_manual_intervention: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Channel names, e.g. `pagerduty` or `slack-oncall`.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub requires_manual_intervention: bool,
    #[serde(default)]
    pub on_exhausted: ExhaustPolicy,
}

pub struct EscalationRecovery {
    config: EscalationConfig,
    handlers: RwLock<HashMap<String, NotificationHandler>>,
}

impl EscalationRecovery {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace the handler for `channel`.
    pub fn register_handler<F, Fut>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Notification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .write()
            .insert(channel.into(), Arc::new(move |n| handler(n).boxed()));
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    fn notification(&self, channel: &str, context: &RecoveryContext) -> Notification {
        let severity = context.severity.clone();
        let title = format!(
            "[{}] {} failure in {}",
            severity.as_deref().unwrap_or("unknown").to_uppercase(),
            context.category.as_deref().unwrap_or("unclassified"),
            context.component
        );
        let mut message = format!(
            "Automated recovery could not resolve a failure in '{}'.\nError: {}",
            context.component,
            context.error.as_deref().unwrap_or("not recorded")
        );
        if let Some(id) = &context.failure_id {
            message.push_str(&format!("\nFailure id: {id}"));
        }
        if self.config.requires_manual_intervention {
            message.push_str("\nManual intervention required.");
        }
        Notification {
            channel: channel.to_owned(),
            title,
            message,
            component: context.component.clone(),
            failure_id: context.failure_id.clone(),
            severity,
            requires_manual_intervention: self.config.requires_manual_intervention,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Debug for EscalationRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationRecovery")
            .field("config", &self.config)
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl RecoveryExecutor for EscalationRecovery {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Escalate
    }

    fn on_exhausted(&self) -> ExhaustPolicy {
        self.config.on_exhausted
    }

    async fn execute(&self, _operation: Operation, context: &RecoveryContext) -> RecoveryResult {
        let started = Instant::now();
        let deliveries = self.config.channels.iter().map(|channel| {
            let handler = self.handlers.read().get(channel).cloned();
            let notification = self.notification(channel, context);
            let channel = notification.channel.clone();
            async move {
                let timer = AttemptTimer::start();
                let outcome = match handler {
                    Some(handler) => handler(notification).await.map_err(|err| describe(&err)),
                    None => {
                        warn!(
                            target: "rampart::resilience::recovery",
                            channel = %notification.channel,
                            title = %notification.title,
                            "no handler for escalation channel; incident logged only"
                        );
                        Ok(())
                    }
                };
                (timer, channel, outcome)
            }
        });
        let outcomes = join_all(deliveries).await;

        let mut attempts = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (index, (timer, channel, outcome)) in outcomes.into_iter().enumerate() {
            if let Err(message) = &outcome {
                error!(
                    target: "rampart::resilience::recovery",
                    channel = %channel,
                    error = %message,
                    "escalation delivery failed"
                );
                failures.push(format!("{channel}: {message}"));
            }
            attempts.push(timer.finish(index + 1, channel, 0, outcome.err()));
        }

        let delivered = failures.is_empty();
        let final_state = if self.config.requires_manual_intervention {
            FinalState::Escalated
        } else if delivered {
            FinalState::Recovered
        } else {
            FinalState::Failed
        };
        info!(
            target: "rampart::resilience::recovery",
            component = %context.component,
            channels = attempts.len(),
            delivered,
            final_state = final_state.as_str(),
            "escalation dispatched"
        );
        RecoveryResult {
            success: delivered,
            result: delivered
                .then(|| json!({ "escalated": true, "channels": self.config.channels })),
            error: (!delivered).then(|| failures.join("; ")),
            strategy: StrategyKind::Escalate,
            attempts,
            total_duration_ms: elapsed_ms(started),
            final_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::operation;
    use parking_lot::Mutex;

    fn context() -> RecoveryContext {
        RecoveryContext {
            component: "billing".into(),
            failure_id: Some("f-1".into()),
            category: Some("dependency".into()),
            severity: Some("critical".into()),
            error: Some("upstream 503".into()),
            ..RecoveryContext::default()
        }
    }

    fn noop() -> Operation {
        operation(|| async { Ok(serde_json::Value::Null) })
    }

    #[tokio::test]
    async fn every_channel_is_attempted_even_when_one_fails() {
        let escalation = EscalationRecovery::new(EscalationConfig {
            channels: vec!["pager".into(), "chat".into(), "email".into()],
            ..EscalationConfig::default()
        });
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        escalation.register_handler("pager", |_| async { Err(anyhow::anyhow!("pager offline")) });
        escalation.register_handler("chat", move |n: Notification| {
            let sink = sink.clone();
            async move {
                sink.lock().push(n.title);
                Ok(())
            }
        });

        let result = escalation.execute(noop(), &context()).await;
        assert!(!result.success);
        assert_eq!(result.final_state, FinalState::Failed);
        assert_eq!(result.attempts.len(), 3);
        assert!(!result.attempts[0].success);
        assert!(result.attempts[1].success);
        assert!(result.attempts[2].success, "missing handler only warns");
        assert_eq!(*sent.lock(), vec!["[CRITICAL] dependency failure in billing".to_owned()]);
    }

    #[tokio::test]
    async fn manual_intervention_forces_escalated() {
        let escalation = EscalationRecovery::new(EscalationConfig {
            channels: vec!["chat".into()],
            requires_manual_intervention: true,
            ..EscalationConfig::default()
        });
        escalation.register_handler("chat", |n: Notification| async move {
            assert!(n.message.contains("Manual intervention required."));
            Ok(())
        });
        let result = escalation.execute(noop(), &context()).await;
        assert!(result.success);
        assert_eq!(result.final_state, FinalState::Escalated);
    }
}
