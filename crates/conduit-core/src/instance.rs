// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow and task instances.
//!
//! The task tree is an arena: tasks live in `WorkflowStatus::tasks` keyed by
//! id, children are id lists on the parent and each child records its
//! parent's id.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::CorrelationContext;
use crate::definition::{FlowDirective, TaskDefinition, WorkflowReference};
use crate::error::ProblemDetails;
use crate::resource::{Resource, ResourceMetadata};

/// Status of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not started.
    Pending,
    /// Executing.
    Running,
    /// Blocked, typically waiting on correlation.
    Suspended,
    /// Failed. May still be retried.
    Faulted,
    /// Cancelled.
    Cancelled,
    /// Skipped without running.
    Skipped,
    /// Completed successfully.
    Completed,
}

impl TaskStatus {
    /// Whether the task reached an end state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::Cancelled | Self::Faulted
        )
    }

    /// Lowercase status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Faulted => "faulted",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One retry of a faulted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based retry number.
    pub number: u32,
    /// When the retry started.
    pub at: DateTime<Utc>,
    /// Error that caused it.
    pub cause: ProblemDetails,
}

/// Runtime record of one task definition's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    /// Task id, unique within the instance.
    pub id: String,
    /// Parent task id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Child task ids, in creation order.
    #[serde(default)]
    pub children: Vec<String>,
    /// Task name.
    pub name: String,
    /// JSON pointer of the definition, such as `/do/0/greet`.
    pub path: String,
    /// Snapshot of the definition.
    pub definition: TaskDefinition,
    /// Whether the task was added by an extension rather than the definition.
    #[serde(default)]
    pub is_extension: bool,
    /// Status.
    pub status: TaskStatus,
    /// Input handed to the task, before `input.from` is applied.
    #[serde(default)]
    pub input: Value,
    /// Output, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error, once faulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetails>,
    /// Context data visible to the task.
    #[serde(default)]
    pub context: Arc<Value>,
    /// Retries performed so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetryAttempt>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// End time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Last state change.
    pub last_modified: DateTime<Utc>,
    /// Flow directive chosen on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<FlowDirective>,
}

/// Phase of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPhase {
    /// Created, not yet scheduled or started.
    #[default]
    Pending,
    /// Executing.
    Running,
    /// At least one task is waiting on correlation.
    Waiting,
    /// Suspended by an operator.
    Suspended,
    /// Completed.
    Completed,
    /// Cancelled.
    Cancelled,
    /// Faulted.
    Faulted,
}

impl WorkflowPhase {
    /// Whether the phase is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Faulted)
    }

    /// Lowercase phase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Faulted => "faulted",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of an instance on a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Platform-native process id.
    pub process_id: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Exit code, once the process terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

/// Desired state of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceSpec {
    /// Workflow being executed.
    pub definition: WorkflowReference,
    /// Instance input.
    #[serde(default)]
    pub input: Value,
}

/// Observed state of an instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Phase.
    pub phase: WorkflowPhase,
    /// Task arena.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskInstance>,
    /// Root task ids.
    #[serde(default)]
    pub roots: Vec<String>,
    /// Output, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error, once faulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetails>,
    /// Workflow context data.
    #[serde(default)]
    pub context: Value,
    /// Correlation contexts delivered to waiting tasks, by correlation key.
    #[serde(default)]
    pub correlation: BTreeMap<String, CorrelationContext>,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// End time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Execution attempts.
    #[serde(default)]
    pub runs: Vec<RunRecord>,
}

/// Runtime execution record of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Resource metadata.
    pub metadata: ResourceMetadata,
    /// Desired state.
    pub spec: WorkflowInstanceSpec,
    /// Observed state.
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl WorkflowInstance {
    /// A new pending instance.
    pub fn new(metadata: ResourceMetadata, definition: WorkflowReference, input: Value) -> Self {
        Self {
            metadata,
            spec: WorkflowInstanceSpec { definition, input },
            status: WorkflowStatus::default(),
        }
    }

    /// A task by id.
    pub fn task(&self, id: &str) -> Option<&TaskInstance> {
        self.status.tasks.get(id)
    }

    /// Children of a task, in creation order.
    pub fn children(&self, id: &str) -> Vec<&TaskInstance> {
        self.task(id)
            .map(|t| t.children.iter().filter_map(|c| self.task(c)).collect())
            .unwrap_or_default()
    }

    /// Ids of a task's descendants, depth first.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<String> = self
            .task(id)
            .map(|t| t.children.iter().rev().cloned().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(task) = self.task(&next) {
                stack.extend(task.children.iter().rev().cloned());
            }
            out.push(next);
        }
        out
    }

    /// The run currently in progress, if any.
    pub fn current_run(&self) -> Option<&RunRecord> {
        self.status.runs.last().filter(|r| r.ended_at.is_none())
    }
}

impl Resource for WorkflowInstance {
    const KIND: &'static str = "WorkflowInstance";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}
