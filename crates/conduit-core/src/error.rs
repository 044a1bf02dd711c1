// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conduit-core.
//!
//! Three families of failure flow through the engine:
//!
//! - [`CorrelationError`]: a trigger or event contract mismatch. Fatal to the
//!   command that hit it, never retried.
//! - [`CoreError`]: engine-level failures (invalid transitions, missing
//!   resources, store failures) plus the two control-flow signals a running
//!   task can raise ([`CoreError::TaskFaulted`], [`CoreError::Cancelled`]).
//! - [`ProblemDetails`]: the structured error attached to a faulted task or
//!   workflow instance.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Well-known problem types (Serverless Workflow error taxonomy).
pub mod problem_types {
    /// The workflow or task definition is invalid.
    pub const CONFIGURATION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/configuration";
    /// Input or output failed validation.
    pub const VALIDATION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/validation";
    /// A runtime expression could not be evaluated.
    pub const EXPRESSION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/expression";
    /// A call to an external service failed.
    pub const COMMUNICATION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/communication";
    /// The task timed out.
    pub const TIMEOUT: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/timeout";
    /// The task faulted while running.
    pub const RUNTIME: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/runtime";
}

/// Structured error attached to faulted tasks and workflow instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// URI identifying the problem type.
    #[serde(rename = "type")]
    pub problem_type: String,
    /// Short, human-readable summary.
    pub title: String,
    /// Status code (HTTP semantics).
    pub status: u16,
    /// Human-readable explanation specific to this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Reference (task path) of the component that raised the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    /// Create a problem of the given type.
    pub fn new(problem_type: impl Into<String>, title: impl Into<String>, status: u16) -> Self {
        Self {
            problem_type: problem_type.into(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
        }
    }

    /// A runtime fault.
    pub fn runtime(detail: impl Into<String>) -> Self {
        Self::new(problem_types::RUNTIME, "Runtime Error", 500).with_detail(detail)
    }

    /// A configuration error (bad definition, missing reference).
    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::new(problem_types::CONFIGURATION, "Configuration Error", 400).with_detail(detail)
    }

    /// An expression evaluation error.
    pub fn expression(detail: impl Into<String>) -> Self {
        Self::new(problem_types::EXPRESSION, "Expression Error", 400).with_detail(detail)
    }

    /// A communication error with an external collaborator.
    pub fn communication(detail: impl Into<String>) -> Self {
        Self::new(problem_types::COMMUNICATION, "Communication Error", 503).with_detail(detail)
    }

    /// A timeout.
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(problem_types::TIMEOUT, "Timeout", 408).with_detail(detail)
    }

    /// Set the detail message.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the instance reference, keeping an existing one.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        if self.instance.is_none() {
            self.instance = Some(instance.into());
        }
        self
    }
}

impl std::fmt::Display for ProblemDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.title, self.status)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        if let Some(instance) = &self.instance {
            write!(f, " at '{}'", instance)?;
        }
        Ok(())
    }
}

/// Correlation and trigger errors.
///
/// These indicate a data/definition mismatch and are surfaced as-is.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CorrelationError {
    /// A correlation key is absent from the event.
    #[error("Event '{event_id}' does not define correlation attribute '{attribute}'")]
    MissingAttribute {
        /// The event that was being correlated.
        event_id: String,
        /// The attribute the trigger expected.
        attribute: String,
    },

    /// The event does not belong to any open correlation context.
    #[error("Event '{event_id}' does not correlate to any open context of trigger '{trigger}'")]
    NoMatchingContext {
        /// The trigger that was evaluated.
        trigger: String,
        /// The event that failed to correlate.
        event_id: String,
    },

    /// A correlation context id is unknown to the trigger.
    #[error("Correlation context '{context_id}' not found in trigger '{trigger}'")]
    ContextNotFound {
        /// The trigger.
        trigger: String,
        /// The missing context.
        context_id: String,
    },

    /// The correlation context has already fired.
    #[error("Correlation context '{context_id}' has already fired")]
    AlreadyFired {
        /// The fired context.
        context_id: String,
    },

    /// The trigger does not exist.
    #[error("Trigger '{0}' not found")]
    TriggerNotFound(String),

    /// The workflow referenced by a start outcome does not exist.
    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    /// The instance referenced by a correlate outcome does not exist or is terminal.
    #[error("Workflow instance '{0}' not found or no longer accepts correlations")]
    InstanceUnavailable(String),

    /// Another context was already delivered under the correlation key.
    #[error("Workflow instance '{instance_id}' already received a correlation context for '{key}'")]
    AlreadyCorrelated {
        /// The instance.
        instance_id: String,
        /// The correlation key.
        key: String,
    },
}

/// Core errors that can occur while executing workflows.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Workflow instance was not found in the store.
    #[error("Instance '{instance_id}' not found")]
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// Task instance was not found in the instance's task tree.
    #[error("Task '{task_id}' not found in instance '{instance_id}'")]
    TaskNotFound {
        /// The owning instance.
        instance_id: String,
        /// The task ID that was not found.
        task_id: String,
    },

    /// Workflow definition was not found.
    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    /// A task transition is not allowed from the task's current status.
    #[error("Cannot {operation} task '{task_id}' in status '{status}'")]
    InvalidTaskState {
        /// The task ID.
        task_id: String,
        /// The attempted operation.
        operation: &'static str,
        /// The current status.
        status: String,
    },

    /// A workflow transition is not allowed from the instance's current phase.
    #[error("Cannot {operation} instance '{instance_id}' in phase '{phase}'")]
    InvalidInstanceState {
        /// The instance ID.
        instance_id: String,
        /// The attempted operation.
        operation: &'static str,
        /// The current phase.
        phase: String,
    },

    /// The task's retry policy does not allow another attempt.
    #[error("Task '{task_id}' exhausted its retry policy after {attempts} attempt(s): {cause}")]
    RetryLimitExceeded {
        /// The task ID.
        task_id: String,
        /// Attempts made so far, including the first run.
        attempts: u32,
        /// The fault that would have been retried.
        cause: ProblemDetails,
    },

    /// A task faulted; the structured error is recorded on the task.
    #[error("Task faulted: {0}")]
    TaskFaulted(ProblemDetails),

    /// Execution was cancelled.
    #[error("Execution cancelled")]
    Cancelled,

    /// The definition is invalid (unknown flow target, malformed task).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Correlation failed.
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// Resource store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::InvalidTaskState { .. } => "INVALID_TASK_STATE",
            Self::InvalidInstanceState { .. } => "INVALID_INSTANCE_STATE",
            Self::RetryLimitExceeded { .. } => "RETRY_LIMIT_EXCEEDED",
            Self::TaskFaulted(_) => "TASK_FAULTED",
            Self::Cancelled => "CANCELLED",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Correlation(_) => "CORRELATION_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Convert this error into the structured error recorded on an instance.
    pub fn to_problem(&self) -> ProblemDetails {
        match self {
            Self::TaskFaulted(problem) => problem.clone(),
            Self::RetryLimitExceeded { cause, .. } => cause.clone(),
            Self::Configuration(message) => ProblemDetails::configuration(message.clone()),
            Self::Correlation(e) => ProblemDetails::configuration(e.to_string()),
            Self::Store(e) => ProblemDetails::communication(e.to_string()),
            other => ProblemDetails::runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_details_display() {
        let problem = ProblemDetails::runtime("boom").with_instance("/do/0/step");
        assert_eq!(problem.to_string(), "Runtime Error (500): boom at '/do/0/step'");
    }

    #[test]
    fn test_with_instance_keeps_original() {
        let problem = ProblemDetails::runtime("boom")
            .with_instance("/do/0/inner")
            .with_instance("/do/0");
        assert_eq!(problem.instance.as_deref(), Some("/do/0/inner"));
    }

    #[test]
    fn test_problem_details_serializes_type_field() {
        let problem = ProblemDetails::timeout("too slow");
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], problem_types::TIMEOUT);
        assert_eq!(json["status"], 408);
        assert!(json.get("instance").is_none());
    }

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::InstanceNotFound {
                    instance_id: "x".to_string(),
                },
                "INSTANCE_NOT_FOUND",
            ),
            (
                CoreError::InvalidTaskState {
                    task_id: "t".to_string(),
                    operation: "complete",
                    status: "pending".to_string(),
                },
                "INVALID_TASK_STATE",
            ),
            (CoreError::Cancelled, "CANCELLED"),
            (
                CoreError::Correlation(CorrelationError::TriggerNotFound("t".to_string())),
                "CORRELATION_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "{:?}", error);
        }
    }

    #[test]
    fn test_invalid_task_state_display() {
        let err = CoreError::InvalidTaskState {
            task_id: "abc".to_string(),
            operation: "complete",
            status: "pending".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot complete task 'abc' in status 'pending'");
    }

    #[test]
    fn test_to_problem_preserves_task_fault() {
        let fault = ProblemDetails::communication("upstream down");
        let err = CoreError::TaskFaulted(fault.clone());
        assert_eq!(err.to_problem(), fault);

        let err = CoreError::Configuration("unknown task 'x'".to_string());
        assert_eq!(err.to_problem().problem_type, problem_types::CONFIGURATION);
    }
}
