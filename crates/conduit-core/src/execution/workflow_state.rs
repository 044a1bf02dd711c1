// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow instance reducer.
//!
//! [`apply`] turns a command and the current instance into the next instance
//! plus the lifecycle events of the transition. It never mutates its input,
//! so a writer that lost an optimistic-concurrency race can simply re-apply
//! the same command to the reloaded instance.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::lifecycle::{LifecycleEvent, LifecycleKind};
use super::task_state::{self, TaskCommand};
use crate::definition::{FlowDirective, TaskDefinition, TaskList, position_of};
use crate::error::{CoreError, ProblemDetails, Result};
use crate::instance::{RunRecord, TaskInstance, TaskStatus, WorkflowInstance, WorkflowPhase};
use crate::resource::Resource;

/// A task to allocate in the arena.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    /// Pre-allocated id.
    pub id: String,
    /// Parent task; `None` for a root task.
    pub parent: Option<String>,
    /// Task name.
    pub name: String,
    /// Definition path.
    pub path: String,
    /// Definition.
    pub definition: TaskDefinition,
    /// Effective input.
    pub input: Value,
    /// Context data; inherited from the parent (or the workflow) when unset.
    pub context: Option<Arc<Value>>,
    /// Whether the task is not part of the definition.
    pub is_extension: bool,
}

impl NewTask {
    /// A task with a freshly generated id.
    pub fn new(name: impl Into<String>, path: impl Into<String>, definition: TaskDefinition, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent: None,
            name: name.into(),
            path: path.into(),
            definition,
            input,
            context: None,
            is_extension: false,
        }
    }

    /// Attach to a parent.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Use explicit context data.
    pub fn with_context(mut self, context: Arc<Value>) -> Self {
        self.context = Some(context);
        self
    }

    /// Mark as an extension task.
    pub fn extension(mut self) -> Self {
        self.is_extension = true;
        self
    }
}

/// An instance state transition request.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowCommand {
    /// Begin execution.
    Start,
    /// Suspend execution.
    Suspend,
    /// Resume a suspended instance.
    Resume,
    /// Complete with an output.
    SetResult {
        /// Output.
        output: Value,
    },
    /// Fault with an error.
    SetError {
        /// The error.
        error: ProblemDetails,
    },
    /// Cancel the instance and every non-terminal task.
    Cancel,
    /// Allocate a task.
    CreateTask(NewTask),
    /// Transition one task.
    Task {
        /// Task id.
        id: String,
        /// Command.
        command: TaskCommand,
    },
    /// Record that a process started executing the instance.
    RecordRun {
        /// Process id.
        process_id: String,
    },
    /// Record that a process terminated.
    RecordExit {
        /// Process id.
        process_id: String,
        /// Exit code.
        exit_code: i64,
    },
}

impl WorkflowCommand {
    /// Operation name used in errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::SetResult { .. } => "set result",
            Self::SetError { .. } => "set error",
            Self::Cancel => "cancel",
            Self::CreateTask(_) => "create task in",
            Self::Task { command, .. } => command.name(),
            Self::RecordRun { .. } => "record run of",
            Self::RecordExit { .. } => "record exit of",
        }
    }
}

/// Next instance value plus the events of the transition.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Next instance value.
    pub instance: WorkflowInstance,
    /// Lifecycle events, in order.
    pub events: Vec<LifecycleEvent>,
}

/// Where execution continues after a task of a sibling list completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextTask {
    /// Run the sibling at this index.
    At(usize),
    /// Leave the sibling list.
    Exit,
    /// End the workflow.
    End,
}

/// Resolve a flow directive over the sibling list `tasks`.
pub fn next_task(tasks: &TaskList, current: usize, directive: &FlowDirective) -> Result<NextTask> {
    match directive {
        FlowDirective::Continue if current + 1 < tasks.len() => Ok(NextTask::At(current + 1)),
        FlowDirective::Continue | FlowDirective::Exit => Ok(NextTask::Exit),
        FlowDirective::End => Ok(NextTask::End),
        FlowDirective::Goto(name) => position_of(tasks, name)
            .map(NextTask::At)
            .ok_or_else(|| CoreError::Configuration(format!("flow directive targets unknown task '{}'", name))),
    }
}

fn invalid(instance: &WorkflowInstance, command: &WorkflowCommand) -> CoreError {
    CoreError::InvalidInstanceState {
        instance_id: instance.id(),
        operation: command.name(),
        phase: instance.status.phase.to_string(),
    }
}

/// Running or Waiting, depending on whether any task is suspended.
fn derived_phase(instance: &WorkflowInstance) -> WorkflowPhase {
    if instance
        .status
        .tasks
        .values()
        .any(|t| t.status == TaskStatus::Suspended)
    {
        WorkflowPhase::Waiting
    } else {
        WorkflowPhase::Running
    }
}

/// Apply a command to an instance.
pub fn apply(instance: &WorkflowInstance, command: &WorkflowCommand, now: DateTime<Utc>) -> Result<Transition> {
    use WorkflowPhase::*;

    let id = instance.id();
    let phase = instance.status.phase;
    let mut next = instance.clone();
    let mut events = Vec::new();
    let workflow_event = |kind| LifecycleEvent::workflow(id.clone(), kind, now);

    match command {
        WorkflowCommand::Start => {
            if phase != Pending {
                return Err(invalid(instance, command));
            }
            next.status.phase = Running;
            next.status.started_at = Some(now);
            events.push(workflow_event(LifecycleKind::Running));
        }
        WorkflowCommand::Suspend => {
            if !matches!(phase, Running | Waiting) {
                return Err(invalid(instance, command));
            }
            next.status.phase = Suspended;
            events.push(workflow_event(LifecycleKind::Suspended));
        }
        WorkflowCommand::Resume => {
            if phase != Suspended {
                return Err(invalid(instance, command));
            }
            next.status.phase = derived_phase(&next);
            events.push(workflow_event(LifecycleKind::Resumed));
        }
        WorkflowCommand::SetResult { output } => {
            if !matches!(phase, Running | Waiting) {
                return Err(invalid(instance, command));
            }
            next.status.phase = Completed;
            next.status.output = Some(output.clone());
            next.status.ended_at = Some(now);
            events.push(workflow_event(LifecycleKind::Completed));
        }
        WorkflowCommand::SetError { error } => {
            if phase.is_terminal() {
                return Err(invalid(instance, command));
            }
            next.status.phase = Faulted;
            next.status.error = Some(error.clone());
            next.status.ended_at = Some(now);
            events.push(workflow_event(LifecycleKind::Faulted));
        }
        WorkflowCommand::Cancel => {
            if phase.is_terminal() {
                return Err(invalid(instance, command));
            }
            for task in next.status.tasks.values_mut() {
                if !task.status.is_terminal() {
                    let (cancelled, kind) = task_state::apply(task, &TaskCommand::Cancel, now)?;
                    events.push(LifecycleEvent::task(id.clone(), &task.id, &task.path, kind, now));
                    *task = cancelled;
                }
            }
            next.status.phase = Cancelled;
            next.status.ended_at = Some(now);
            events.push(workflow_event(LifecycleKind::Cancelled));
        }
        WorkflowCommand::CreateTask(new_task) => {
            if phase.is_terminal() {
                return Err(invalid(instance, command));
            }
            let context = match (&new_task.context, &new_task.parent) {
                (Some(context), _) => context.clone(),
                (None, Some(parent)) => next
                    .task(parent)
                    .map(|p| p.context.clone())
                    .ok_or_else(|| task_not_found(&id, parent))?,
                (None, None) => Arc::new(next.status.context.clone()),
            };
            let task = TaskInstance {
                id: new_task.id.clone(),
                parent: new_task.parent.clone(),
                children: Vec::new(),
                name: new_task.name.clone(),
                path: new_task.path.clone(),
                definition: new_task.definition.clone(),
                is_extension: new_task.is_extension,
                status: TaskStatus::Pending,
                input: new_task.input.clone(),
                output: None,
                error: None,
                context,
                retries: Vec::new(),
                created_at: now,
                started_at: None,
                ended_at: None,
                last_modified: now,
                next: None,
            };
            match &new_task.parent {
                Some(parent) => next
                    .status
                    .tasks
                    .get_mut(parent)
                    .ok_or_else(|| task_not_found(&id, parent))?
                    .children
                    .push(task.id.clone()),
                None => next.status.roots.push(task.id.clone()),
            }
            events.push(LifecycleEvent::task(
                id.clone(),
                &task.id,
                &task.path,
                LifecycleKind::Initialized,
                now,
            ));
            next.status.tasks.insert(task.id.clone(), task);
        }
        WorkflowCommand::Task { id: task_id, command: task_command } => {
            if phase.is_terminal() {
                return Err(invalid(instance, command));
            }
            let task = next.task(task_id).ok_or_else(|| task_not_found(&id, task_id))?;
            let (updated, kind) = task_state::apply(task, task_command, now)?;
            events.push(LifecycleEvent::task(id.clone(), task_id, &updated.path, kind, now));

            match task_command {
                TaskCommand::Retry { .. } => {
                    for descendant in instance.descendants(task_id) {
                        next.status.tasks.remove(&descendant);
                    }
                }
                TaskCommand::Cancel => {
                    for descendant in instance.descendants(task_id) {
                        if let Some(child) = next.status.tasks.get_mut(&descendant)
                            && !child.status.is_terminal()
                        {
                            let (cancelled, kind) = task_state::apply(child, &TaskCommand::Cancel, now)?;
                            events.push(LifecycleEvent::task(id.clone(), &child.id, &child.path, kind, now));
                            *child = cancelled;
                        }
                    }
                }
                TaskCommand::SetResult {
                    export: Some(export), ..
                } => {
                    next.status.context = export.clone();
                }
                _ => {}
            }
            next.status.tasks.insert(task_id.clone(), updated);

            if matches!(phase, Running | Waiting) {
                next.status.phase = derived_phase(&next);
            }
        }
        WorkflowCommand::RecordRun { process_id } => {
            if phase.is_terminal() {
                return Err(invalid(instance, command));
            }
            next.status.runs.push(RunRecord {
                process_id: process_id.clone(),
                started_at: now,
                ended_at: None,
                exit_code: None,
            });
        }
        WorkflowCommand::RecordExit { process_id, exit_code } => {
            if let Some(run) = next
                .status
                .runs
                .iter_mut()
                .rev()
                .find(|r| r.process_id == *process_id && r.ended_at.is_none())
            {
                run.ended_at = Some(now);
                run.exit_code = Some(*exit_code);
            }
        }
    }

    Ok(Transition { instance: next, events })
}

fn task_not_found(instance_id: &str, task_id: &str) -> CoreError {
    CoreError::TaskNotFound {
        instance_id: instance_id.to_string(),
        task_id: task_id.to_string(),
    }
}
