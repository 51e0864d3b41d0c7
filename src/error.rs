use serde::{Deserialize, Serialize};

use crate::providers::{ProviderError, ProviderErrorKind};

/// Error taxonomy surfaced by the runtime and recorded on failed executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationError {
    /// One attempt of an activity failed; retried per policy, never recorded in history.
    TransientActivityFailure { name: String, attempt: u32, message: String },
    /// Replay diverged from recorded history. Fatal for the instance.
    NonDeterminism { message: String },
    /// Activity failed after exhausting its attempts.
    ActivityFailure { name: String, attempts: u32, message: String },
    /// A saga unwind completed only partially.
    CompensationFailure { message: String },
    /// Duplicate append (sequence number or completion already recorded).
    Conflict { message: String },
    /// Storage layer failure. Not retried by the engine.
    Storage { operation: String, message: String },
    /// Error returned by orchestrator code.
    Application { message: String },
    InstanceNotFound { instance: String },
    UnregisteredOrchestration { name: String },
}

impl OrchestrationError {
    pub fn application(message: impl Into<String>) -> Self {
        OrchestrationError::Application { message: message.into() }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        OrchestrationError::NonDeterminism { message: message.into() }
    }

    /// Only transient activity failures are retried, and only by the dispatcher.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestrationError::TransientActivityFailure { .. })
    }

    /// A conflict means another writer already recorded the same step.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestrationError::Conflict { .. })
    }

    /// Message without the category prefix, as seen by orchestrator code.
    pub fn message(&self) -> String {
        match self {
            OrchestrationError::TransientActivityFailure { message, .. }
            | OrchestrationError::NonDeterminism { message }
            | OrchestrationError::ActivityFailure { message, .. }
            | OrchestrationError::CompensationFailure { message }
            | OrchestrationError::Conflict { message }
            | OrchestrationError::Storage { message, .. }
            | OrchestrationError::Application { message } => message.clone(),
            OrchestrationError::InstanceNotFound { instance } => format!("instance not found: {instance}"),
            OrchestrationError::UnregisteredOrchestration { name } => {
                format!("unregistered orchestration: {name}")
            }
        }
    }
}

impl std::fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationError::TransientActivityFailure { name, attempt, message } => {
                write!(f, "activity '{name}' attempt {attempt} failed: {message}")
            }
            OrchestrationError::NonDeterminism { message } => write!(f, "nondeterministic: {message}"),
            OrchestrationError::ActivityFailure { name, attempts, message } => {
                write!(f, "activity '{name}' failed after {attempts} attempt(s): {message}")
            }
            OrchestrationError::CompensationFailure { message } => write!(f, "compensation failed: {message}"),
            OrchestrationError::Conflict { message } => write!(f, "conflict: {message}"),
            OrchestrationError::Storage { operation, message } => write!(f, "storage error in {operation}: {message}"),
            OrchestrationError::Application { message } => write!(f, "{message}"),
            OrchestrationError::InstanceNotFound { .. } | OrchestrationError::UnregisteredOrchestration { .. } => {
                write!(f, "{}", self.message())
            }
        }
    }
}

impl std::error::Error for OrchestrationError {}

impl From<ProviderError> for OrchestrationError {
    fn from(e: ProviderError) -> Self {
        match e.kind {
            ProviderErrorKind::Conflict => OrchestrationError::Conflict { message: e.message },
            ProviderErrorKind::Retryable | ProviderErrorKind::Permanent => OrchestrationError::Storage {
                operation: e.operation,
                message: e.message,
            },
        }
    }
}

/// Error returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for orchestration"),
            WaitError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WaitError {}
