// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task state machine.
//!
//! | Command   | From             | To        |
//! |-----------|------------------|-----------|
//! | Start     | Pending          | Running   |
//! | Suspend   | Running          | Suspended |
//! | Resume    | Suspended        | Running   |
//! | Retry     | Faulted          | Running   |
//! | Skip      | Pending, Running | Skipped   |
//! | SetResult | Running          | Completed |
//! | SetError  | Running          | Faulted   |
//! | Cancel    | any non-terminal | Cancelled |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::lifecycle::LifecycleKind;
use crate::definition::FlowDirective;
use crate::error::{CoreError, ProblemDetails, Result};
use crate::instance::{RetryAttempt, TaskInstance, TaskStatus};

/// A task state transition request.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCommand {
    /// Begin execution.
    Start,
    /// Block the task.
    Suspend,
    /// Unblock the task.
    Resume,
    /// Re-run a faulted task.
    Retry {
        /// The error that caused the retry.
        cause: ProblemDetails,
    },
    /// Skip without running.
    Skip,
    /// Complete with an output.
    SetResult {
        /// Output.
        output: Value,
        /// Flow directive for the parent.
        then: FlowDirective,
        /// Context data exported by the task.
        export: Option<Value>,
    },
    /// Fault with an error.
    SetError {
        /// The error.
        error: ProblemDetails,
    },
    /// Cancel.
    Cancel,
}

impl TaskCommand {
    /// Operation name used in errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Retry { .. } => "retry",
            Self::Skip => "skip",
            Self::SetResult { .. } => "set result",
            Self::SetError { .. } => "set error",
            Self::Cancel => "cancel",
        }
    }

    /// Whether the command may be applied to a task in `status`.
    pub fn is_valid_from(&self, status: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Self::Start => status == Pending,
            Self::Suspend => status == Running,
            Self::Resume => status == Suspended,
            Self::Retry { .. } => status == Faulted,
            Self::Skip => matches!(status, Pending | Running),
            Self::SetResult { .. } | Self::SetError { .. } => status == Running,
            Self::Cancel => !status.is_terminal(),
        }
    }
}

/// Apply a command to a task, producing the next task value.
///
/// Invalid transitions fail with [`CoreError::InvalidTaskState`] and leave
/// the input untouched.
pub fn apply(task: &TaskInstance, command: &TaskCommand, now: DateTime<Utc>) -> Result<(TaskInstance, LifecycleKind)> {
    if !command.is_valid_from(task.status) {
        return Err(CoreError::InvalidTaskState {
            task_id: task.id.clone(),
            operation: command.name(),
            status: task.status.to_string(),
        });
    }

    let mut next = task.clone();
    next.last_modified = now;
    let kind = match command {
        TaskCommand::Start => {
            next.status = TaskStatus::Running;
            next.started_at = Some(now);
            LifecycleKind::Running
        }
        TaskCommand::Suspend => {
            next.status = TaskStatus::Suspended;
            LifecycleKind::Suspended
        }
        TaskCommand::Resume => {
            next.status = TaskStatus::Running;
            LifecycleKind::Resumed
        }
        TaskCommand::Retry { cause } => {
            next.status = TaskStatus::Running;
            next.retries.push(RetryAttempt {
                number: task.retries.len() as u32 + 1,
                at: now,
                cause: cause.clone(),
            });
            next.error = None;
            next.output = None;
            next.ended_at = None;
            next.next = None;
            next.children.clear();
            LifecycleKind::Retrying
        }
        TaskCommand::Skip => {
            next.status = TaskStatus::Skipped;
            next.ended_at = Some(now);
            next.next = Some(FlowDirective::Continue);
            LifecycleKind::Skipped
        }
        TaskCommand::SetResult { output, then, export } => {
            next.status = TaskStatus::Completed;
            next.output = Some(output.clone());
            next.next = Some(then.clone());
            if let Some(export) = export {
                next.context = Arc::new(export.clone());
            }
            next.ended_at = Some(now);
            LifecycleKind::Completed
        }
        TaskCommand::SetError { error } => {
            next.status = TaskStatus::Faulted;
            next.error = Some(error.clone());
            next.ended_at = Some(now);
            LifecycleKind::Faulted
        }
        TaskCommand::Cancel => {
            next.status = TaskStatus::Cancelled;
            next.ended_at = Some(now);
            LifecycleKind::Cancelled
        }
    };
    Ok((next, kind))
}
