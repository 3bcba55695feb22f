//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Error taxonomy shared by the resilience engine."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::time::Duration;

/// Result alias used by engine APIs that can only fail with engine errors.
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Error type for the resilience engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResilienceError {
    /// The breaker rejected the call without attempting it.
    #[error("circuit '{name}' is {state}; call rejected (retry after {retry_after_ms:?} ms)")]
    CircuitOpen {
        /// Breaker that rejected the call.
        name: String,
        /// State label at rejection time (`open` or `half-open`).
        state: &'static str,
        /// Remaining open-state time, when known.
        retry_after_ms: Option<u64>,
    },
    /// Every attempt or fallback of a recovery failed.
    #[error("recovery exhausted after {attempts} attempt(s): {message}")]
    RecoveryExhausted {
        /// Number of attempts made.
        attempts: usize,
        /// Last error observed.
        message: String,
    },
    /// A health probe threw or timed out.
    #[error("health check for '{component}' failed: {message}")]
    HealthCheckFailed {
        /// Component whose probe failed.
        component: String,
        /// Failure description.
        message: String,
    },
    /// The system is operating below full capability.
    #[error("system degraded to {level}: {reason}")]
    DegradationActive {
        /// Active degradation level label.
        level: String,
        /// Reason recorded when the level was applied.
        reason: String,
    },
    /// A chaos experiment was rejected by safety rules.
    #[error("chaos experiment rejected: {0}")]
    ChaosValidation(String),
    /// No failure with the given identifier was ever detected.
    #[error("unknown failure id {0}")]
    UnknownFailure(String),
    /// No experiment with the given identifier exists.
    #[error("unknown chaos experiment {0}")]
    UnknownExperiment(String),
    /// A configuration value violates an invariant.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Convenience constructor for circuit rejections.
    pub fn circuit_open(name: &str, state: &'static str, retry_after: Option<Duration>) -> Self {
        Self::CircuitOpen {
            name: name.to_owned(),
            state,
            retry_after_ms: retry_after.map(rampart_common::time::duration_to_millis),
        }
    }

    /// Whether this error is a breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Error carrying a stable, matchable kind next to its message.
///
/// Breaker `allowed_exceptions` and retry `retryable_errors` match against
/// `kind` as well as against message text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaggedError {
    /// Stable name of the error, e.g. `NotFound` or `ChaosInjectedError`.
    pub kind: String,
    /// Human readable detail.
    pub message: String,
}

impl TaggedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Returns true if `pattern` names the error's kind or appears in any message of its chain.
pub fn error_matches(err: &anyhow::Error, pattern: &str) -> bool {
    if let Some(tagged) = err.downcast_ref::<TaggedError>() {
        if tagged.kind == pattern {
            return true;
        }
    }
    if let Some(engine) = err.downcast_ref::<ResilienceError>() {
        if variant_name(engine) == pattern {
            return true;
        }
    }
    err.chain().any(|cause| {
        cause
            .downcast_ref::<TaggedError>()
            .map(|tagged| tagged.kind == pattern)
            .unwrap_or(false)
            || cause.to_string().contains(pattern)
    })
}

/// Returns true if any pattern matches.
pub fn error_matches_any(err: &anyhow::Error, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| error_matches(err, pattern))
}

fn variant_name(err: &ResilienceError) -> &'static str {
    match err {
        ResilienceError::CircuitOpen { .. } => "CircuitOpenError",
        ResilienceError::RecoveryExhausted { .. } => "RecoveryExhaustedError",
        ResilienceError::HealthCheckFailed { .. } => "HealthCheckFailedError",
        ResilienceError::DegradationActive { .. } => "DegradationActiveError",
        ResilienceError::ChaosValidation(_) => "ChaosValidationError",
        ResilienceError::UnknownFailure(_) => "UnknownFailureError",
        ResilienceError::UnknownExperiment(_) => "UnknownExperimentError",
        ResilienceError::InvalidConfig(_) => "InvalidConfigError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn matches_by_kind_and_message() {
        let err = anyhow::Error::new(TaggedError::new("NotFound", "no row 7"));
        assert!(error_matches(&err, "NotFound"));
        assert!(error_matches(&err, "row 7"));
        assert!(!error_matches(&err, "Timeout"));
    }

    #[test]
    fn matches_through_context_chain() {
        let err = Err::<(), _>(TaggedError::new("Timeout", "upstream slow"))
            .context("fetching profile")
            .unwrap_err();
        assert!(error_matches(&err, "Timeout"));
        assert!(error_matches(&err, "fetching profile"));
    }

    #[test]
    fn engine_errors_match_by_taxonomy_name() {
        let err = anyhow::Error::new(ResilienceError::circuit_open("db", "open", None));
        assert!(error_matches(&err, "CircuitOpenError"));
        assert!(!error_matches_any(&anyhow!("plain"), &["CircuitOpenError".into()]));
    }

    #[test]
    fn display_is_informative() {
        let err = ResilienceError::circuit_open(
            "payments",
            "open",
            Some(Duration::from_millis(1500)),
        );
        assert_eq!(
            err.to_string(),
            "circuit 'payments' is open; call rejected (retry after Some(1500) ms)"
        );
    }
}
