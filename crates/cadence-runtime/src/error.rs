//! Structured error types for step execution

use cadence_core::{Classify, ErrorClass};
use cadence_resilience::BreakerError;
use thiserror::Error;

use crate::template::TemplateError;

/// Why a step failed. The variant decides whether retry and the circuit
/// breaker absorb it or whether it surfaces at once.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Network blip, rate limit, resource exhaustion
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The external dependency itself is unavailable
    #[error("Dependency '{dependency}' unavailable: {message}")]
    DependencyDown { dependency: String, message: String },

    /// Bad input, auth failure, invalid config: never retried
    #[error("{0}")]
    Fatal(String),

    #[error("Invalid config for '{handler}': {reason}")]
    InvalidConfig { handler: String, reason: String },

    #[error("Step handler '{0}' not registered")]
    UnknownHandler(String),

    #[error("Step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Circuit '{dependency}' is open, retry in {retry_after_ms}ms")]
    CircuitOpen {
        dependency: String,
        retry_after_ms: u64,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl StepError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn dependency_down(dependency: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DependencyDown {
            dependency: dependency.into(),
            message: msg.into(),
        }
    }

    pub fn invalid_config(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

impl Classify for StepError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::Timeout { .. } => ErrorClass::Transient,
            Self::DependencyDown { .. } | Self::CircuitOpen { .. } => ErrorClass::DependencyDown,
            Self::Fatal(_)
            | Self::InvalidConfig { .. }
            | Self::UnknownHandler(_)
            | Self::Template(_) => ErrorClass::Fatal,
        }
    }
}

impl From<BreakerError<StepError>> for StepError {
    fn from(err: BreakerError<StepError>) -> Self {
        match err {
            BreakerError::Open {
                dependency,
                retry_after_ms,
            } => Self::CircuitOpen {
                dependency,
                retry_after_ms,
            },
            BreakerError::Inner(e) => e,
        }
    }
}

impl From<reqwest::Error> for StepError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            classify_status(status.as_u16(), err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

/// Map an HTTP status to the error taxonomy: 408/429/5xx are transient,
/// other 4xx are fatal.
pub fn classify_status(status: u16, message: String) -> StepError {
    match status {
        408 | 429 => StepError::Transient(message),
        500..=599 => StepError::Transient(message),
        _ => StepError::Fatal(message),
    }
}

/// Failure of the executor itself, as opposed to a step
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("Run not found: {0}")]
    RunNotFound(uuid::Uuid),
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for RuntimeError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Storage(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}
