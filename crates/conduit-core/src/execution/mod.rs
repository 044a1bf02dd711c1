// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task and workflow execution.
//!
//! State lives in the [`WorkflowInstance`](crate::instance::WorkflowInstance)
//! resource. Transitions are pure reducers ([`task_state::apply`],
//! [`workflow_state::apply`]) that return the next value and the lifecycle
//! events it produced. A [`WorkflowExecutionContext`] is the single writer of
//! one instance: it runs reducers under its lock, persists with a version
//! check and publishes events on the [`LifecycleBus`] after the write.
//! [`WorkflowExecutor`] and [`TaskExecutor`] drive a context by dispatching
//! on task kind.
//!
//! # Task transitions
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
//! | Cancel    | non-terminal     | Cancelled |

mod commands;
mod context;
mod executor;
mod lifecycle;
mod services;
pub mod task_state;
pub mod workflow_state;

pub use commands::{InstanceCommands, SCHEDULE_LABEL};
pub use context::{INSTANCE_LABEL, WorkflowExecutionContext};
pub use executor::{TaskExecutor, WorkflowExecutor};
pub use lifecycle::{LifecycleBus, LifecycleEvent, LifecycleFilter, LifecycleKind, LifecycleSubject};
pub use services::{
    CallHandler, CorrelationEventSink, DiscardEventSink, EventSink, ExecutionServices, FunctionRegistry,
};
pub use task_state::TaskCommand;
pub use workflow_state::{NewTask, NextTask, Transition, WorkflowCommand, next_task};
