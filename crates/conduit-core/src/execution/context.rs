// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow execution context.
//!
//! The single writer of one workflow instance. Every task and workflow
//! transition goes through [`WorkflowExecutionContext::commit`], which runs
//! the reducer under the instance lock, persists the result with a version
//! check and publishes lifecycle events once the write succeeded. Writes made
//! by others (correlation delivery, operator commands) are picked up by the
//! store watcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::lifecycle::LifecycleBus;
use super::task_state::TaskCommand;
use super::workflow_state::{self, NewTask, WorkflowCommand};
use crate::correlation::{
    CorrelationContext, CorrelationLifetime, CorrelationMode, CorrelationOutcome, Trigger, TriggerSpec,
};
use crate::definition::{FlowDirective, RetryPolicy, TaskKind};
use crate::error::{CoreError, ProblemDetails, Result};
use crate::instance::{TaskInstance, WorkflowInstance, WorkflowPhase};
use crate::resource::{Resource, ResourceMetadata};
use crate::store::{MAX_CONFLICT_RETRIES, ResourceStore, StoreError, WatchEvent};

/// Label linking a listen trigger to the instance waiting on it.
pub const INSTANCE_LABEL: &str = "conduit.io/instance";

/// Owns the task tree of one instance and mediates all its transitions.
pub struct WorkflowExecutionContext {
    instance_id: String,
    current: Mutex<WorkflowInstance>,
    state: watch::Sender<WorkflowInstance>,
    instances: Arc<dyn ResourceStore<WorkflowInstance>>,
    triggers: Arc<dyn ResourceStore<Trigger>>,
    lifecycle: Arc<LifecycleBus>,
    cancellation: CancellationToken,
    closed: CancellationToken,
}

impl WorkflowExecutionContext {
    /// Load the instance and create its context.
    pub async fn load(
        instance_id: &str,
        instances: Arc<dyn ResourceStore<WorkflowInstance>>,
        triggers: Arc<dyn ResourceStore<Trigger>>,
        lifecycle: Arc<LifecycleBus>,
    ) -> Result<Arc<Self>> {
        let instance = instances
            .find(instance_id)
            .await?
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let cancellation = CancellationToken::new();
        if instance.status.phase == WorkflowPhase::Cancelled {
            cancellation.cancel();
        }
        let (state, _) = watch::channel(instance.clone());
        Ok(Arc::new(Self {
            instance_id: instance_id.to_string(),
            current: Mutex::new(instance),
            state,
            instances,
            triggers,
            lifecycle,
            cancellation,
            closed: CancellationToken::new(),
        }))
    }

    /// Lifecycle bus transitions are published on.
    pub fn lifecycle(&self) -> &Arc<LifecycleBus> {
        &self.lifecycle
    }

    /// Instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Token cancelled when the instance is cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the instance was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Latest known copy of the instance.
    pub fn instance(&self) -> WorkflowInstance {
        self.state.borrow().clone()
    }

    /// Observe instance changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowInstance> {
        self.state.subscribe()
    }

    /// A task by id.
    pub fn task(&self, task_id: &str) -> Result<TaskInstance> {
        self.state
            .borrow()
            .task(task_id)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound {
                instance_id: self.instance_id.clone(),
                task_id: task_id.to_string(),
            })
    }

    /// Children of a task, in creation order.
    pub fn children(&self, task_id: &str) -> Vec<TaskInstance> {
        self.state
            .borrow()
            .children(task_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Most recently created child of `parent` named `name`.
    pub fn find_child(&self, parent: &str, name: &str) -> Option<TaskInstance> {
        self.children(parent).into_iter().rev().find(|t| t.name == name)
    }

    /// Apply a command and persist the result.
    ///
    /// On a version conflict the latest instance is reloaded and the same
    /// command re-applied. Lifecycle events are published after the write.
    #[instrument(skip(self, command), fields(instance_id = %self.instance_id, operation = command.name()))]
    pub async fn commit(&self, command: WorkflowCommand) -> Result<WorkflowInstance> {
        let mut current = self.current.lock().await;
        let mut attempts = 0;
        let (saved, events) = loop {
            let now = Utc::now();
            let transition = match workflow_state::apply(&current, &command, now) {
                Ok(transition) => transition,
                Err(CoreError::InvalidInstanceState { .. })
                    if current.status.phase == WorkflowPhase::Cancelled =>
                {
                    self.cancellation.cancel();
                    return Err(CoreError::Cancelled);
                }
                Err(e) => return Err(e),
            };
            match self.instances.update(transition.instance).await {
                Ok(saved) => break (saved, transition.events),
                Err(StoreError::Conflict { .. }) if attempts < MAX_CONFLICT_RETRIES => {
                    attempts += 1;
                    debug!(attempts, "Version conflict, reloading instance");
                    *current = self
                        .instances
                        .find(&self.instance_id)
                        .await?
                        .ok_or_else(|| CoreError::InstanceNotFound {
                            instance_id: self.instance_id.clone(),
                        })?;
                }
                Err(e) => return Err(e.into()),
            }
        };
        *current = saved.clone();
        self.observe(&saved);
        drop(current);

        self.lifecycle.publish_all(events).await;
        Ok(saved)
    }

    fn observe(&self, instance: &WorkflowInstance) {
        if instance.status.phase == WorkflowPhase::Cancelled {
            self.cancellation.cancel();
        }
        self.state.send_replace(instance.clone());
    }

    /// Adopt a copy written by someone else if it is newer than ours.
    async fn refresh(&self, latest: WorkflowInstance) {
        let mut current = self.current.lock().await;
        if latest.metadata.version > current.metadata.version {
            self.observe(&latest);
            *current = latest;
        }
    }

    /// Follow external writes to the instance until [`close`](Self::close).
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let context = Arc::clone(self);
        let mut changes = self.instances.watch();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = context.closed.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(WatchEvent::Updated(instance)) if instance.id() == context.instance_id => {
                        context.refresh(instance).await;
                    }
                    Ok(WatchEvent::Deleted(instance)) if instance.id() == context.instance_id => {
                        warn!(instance_id = %context.instance_id, "Instance deleted while executing");
                        context.cancellation.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Instance watcher lagged, reloading");
                        if let Ok(Some(instance)) = context.instances.find(&context.instance_id).await {
                            context.refresh(instance).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop the watcher.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Cooperative checkpoint between units of work.
    ///
    /// Fails once the instance is cancelled and waits while it is suspended.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        loop {
            if self.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if state.borrow_and_update().status.phase != WorkflowPhase::Suspended {
                return Ok(());
            }
            tokio::select! {
                changed = state.changed() => if changed.is_err() {
                    return Err(CoreError::Cancelled);
                },
                _ = self.cancellation.cancelled() => return Err(CoreError::Cancelled),
            }
        }
    }

    // Workflow-level operations

    /// Pending → Running.
    pub async fn start(&self) -> Result<WorkflowInstance> {
        let instance = self.commit(WorkflowCommand::Start).await?;
        info!(instance_id = %self.instance_id, "Workflow instance started");
        Ok(instance)
    }

    /// Running/Waiting → Suspended.
    pub async fn suspend(&self) -> Result<WorkflowInstance> {
        self.commit(WorkflowCommand::Suspend).await
    }

    /// Suspended → Running/Waiting.
    pub async fn resume(&self) -> Result<WorkflowInstance> {
        self.commit(WorkflowCommand::Resume).await
    }

    /// Complete the instance.
    pub async fn set_result(&self, output: Value) -> Result<WorkflowInstance> {
        let instance = self.commit(WorkflowCommand::SetResult { output }).await?;
        info!(instance_id = %self.instance_id, "Workflow instance completed");
        Ok(instance)
    }

    /// Fault the instance.
    pub async fn set_error(&self, error: ProblemDetails) -> Result<WorkflowInstance> {
        warn!(instance_id = %self.instance_id, error = %error, "Workflow instance faulted");
        self.commit(WorkflowCommand::SetError { error }).await
    }

    /// Cancel the instance and every non-terminal task.
    pub async fn cancel(&self) -> Result<WorkflowInstance> {
        let instance = self.commit(WorkflowCommand::Cancel).await?;
        info!(instance_id = %self.instance_id, "Workflow instance cancelled");
        Ok(instance)
    }

    // Task-level operations

    async fn task_command(&self, task_id: &str, command: TaskCommand) -> Result<TaskInstance> {
        let instance = self
            .commit(WorkflowCommand::Task {
                id: task_id.to_string(),
                command,
            })
            .await?;
        instance.task(task_id).cloned().ok_or_else(|| CoreError::TaskNotFound {
            instance_id: self.instance_id.clone(),
            task_id: task_id.to_string(),
        })
    }

    /// Allocate a task in `Pending`.
    pub async fn create_task(&self, task: NewTask) -> Result<TaskInstance> {
        let task_id = task.id.clone();
        let instance = self.commit(WorkflowCommand::CreateTask(task)).await?;
        instance.task(&task_id).cloned().ok_or_else(|| CoreError::TaskNotFound {
            instance_id: self.instance_id.clone(),
            task_id,
        })
    }

    /// Pending → Running.
    pub async fn start_task(&self, task_id: &str) -> Result<TaskInstance> {
        self.task_command(task_id, TaskCommand::Start).await
    }

    /// Running → Suspended.
    pub async fn suspend_task(&self, task_id: &str) -> Result<TaskInstance> {
        self.task_command(task_id, TaskCommand::Suspend).await
    }

    /// Suspended → Running.
    pub async fn resume_task(&self, task_id: &str) -> Result<TaskInstance> {
        self.task_command(task_id, TaskCommand::Resume).await
    }

    /// Pending/Running → Skipped.
    pub async fn skip_task(&self, task_id: &str) -> Result<TaskInstance> {
        self.task_command(task_id, TaskCommand::Skip).await
    }

    /// Running → Completed.
    pub async fn set_task_result(
        &self,
        task_id: &str,
        output: Value,
        then: FlowDirective,
        export: Option<Value>,
    ) -> Result<TaskInstance> {
        self.task_command(task_id, TaskCommand::SetResult { output, then, export })
            .await
    }

    /// Running → Faulted.
    pub async fn set_task_error(&self, task_id: &str, error: ProblemDetails) -> Result<TaskInstance> {
        self.task_command(task_id, TaskCommand::SetError { error }).await
    }

    /// Cancel a task and its non-terminal descendants.
    pub async fn cancel_task(&self, task_id: &str) -> Result<TaskInstance> {
        self.task_command(task_id, TaskCommand::Cancel).await
    }

    /// Faulted → Running, bounded by `policy`.
    ///
    /// Fails with [`CoreError::RetryLimitExceeded`] once the policy's retries
    /// are used up, leaving the task faulted.
    pub async fn retry_task(&self, task_id: &str, cause: ProblemDetails, policy: &RetryPolicy) -> Result<TaskInstance> {
        let task = self.task(task_id)?;
        let retries = task.retries.len() as u32;
        if retries >= policy.max_retries() {
            return Err(CoreError::RetryLimitExceeded {
                task_id: task_id.to_string(),
                attempts: retries + 1,
                cause,
            });
        }
        info!(
            instance_id = %self.instance_id,
            task_id = %task_id,
            retry = retries + 1,
            "Retrying task"
        );
        self.task_command(task_id, TaskCommand::Retry { cause }).await
    }

    /// Block until events matching a `listen` task are correlated.
    ///
    /// Registers an ephemeral trigger whose outcome delivers the fired context
    /// into `status.correlation[task_id]`, then waits for that delivery. A
    /// context delivered before the call is returned immediately.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn correlate_task(&self, task_id: &str) -> Result<CorrelationContext> {
        let task = self.task(task_id)?;
        if let Some(delivered) = self.delivered(task_id) {
            return Ok(delivered);
        }
        let TaskKind::Listen(listen) = &task.definition.kind else {
            return Err(CoreError::Configuration(format!(
                "task '{}' is a '{}' task and cannot correlate events",
                task.path,
                task.definition.kind_name()
            )));
        };
        let (condition_type, conditions) = listen.to.to_conditions().map_err(CoreError::TaskFaulted)?;

        let instance = self.instance();
        let trigger = Trigger::new(
            ResourceMetadata::new(
                format!("{}-{}", instance.metadata.name, task_id),
                instance.metadata.namespace.clone(),
            )
            .with_label(INSTANCE_LABEL, self.instance_id.clone()),
            TriggerSpec::new(
                conditions,
                CorrelationOutcome::Correlate {
                    instance: self.instance_id.clone(),
                    key: task_id.to_string(),
                },
            )
            .with_condition_type(condition_type)
            .with_mode(CorrelationMode::Exclusive)
            .with_lifetime(CorrelationLifetime::Ephemeral),
        );
        let trigger_id = trigger.id();
        match self.triggers.create(trigger).await {
            Ok(_) => debug!(trigger = %trigger_id, "Registered listen trigger"),
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        let mut registration = ListenRegistration::new(self.triggers.clone(), trigger_id.clone());

        let mut state = self.state.subscribe();
        loop {
            let delivered = state.borrow_and_update().status.correlation.get(task_id).cloned();
            if let Some(context) = delivered {
                // The engine deletes an ephemeral trigger once it fired.
                registration.disarm();
                info!(task_id = %task_id, context_id = %context.id, "Task correlated");
                return Ok(context);
            }
            let cancelled = tokio::select! {
                changed = state.changed() => changed.is_err(),
                _ = self.cancellation.cancelled() => true,
            };
            if cancelled {
                registration.disarm();
                if let Err(e) = self.triggers.delete(&trigger_id).await {
                    warn!(trigger = %trigger_id, error = %e, "Failed to delete listen trigger");
                }
                return Err(CoreError::Cancelled);
            }
        }
    }

    /// Delete every listen trigger registered for this instance.
    ///
    /// Returns the number of triggers removed.
    pub async fn release_listen_triggers(&self) -> Result<usize> {
        let mut selector = BTreeMap::new();
        selector.insert(INSTANCE_LABEL.to_string(), self.instance_id.clone());
        let mut released = 0;
        for trigger in self.triggers.list(Some(&selector)).await? {
            if self.triggers.delete(&trigger.id()).await?.is_some() {
                debug!(trigger = %trigger.id(), "Released listen trigger");
                released += 1;
            }
        }
        Ok(released)
    }

    fn delivered(&self, task_id: &str) -> Option<CorrelationContext> {
        self.state.borrow().status.correlation.get(task_id).cloned()
    }
}

/// Deletes a listen trigger when the waiting task goes away without a
/// delivery, e.g. a losing fork branch whose future was dropped.
struct ListenRegistration {
    triggers: Arc<dyn ResourceStore<Trigger>>,
    trigger_id: Option<String>,
}

impl ListenRegistration {
    fn new(triggers: Arc<dyn ResourceStore<Trigger>>, trigger_id: String) -> Self {
        Self {
            triggers,
            trigger_id: Some(trigger_id),
        }
    }

    fn disarm(&mut self) {
        self.trigger_id = None;
    }
}

impl Drop for ListenRegistration {
    fn drop(&mut self) {
        let Some(trigger_id) = self.trigger_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(trigger = %trigger_id, "No runtime to delete abandoned listen trigger");
            return;
        };
        let triggers = self.triggers.clone();
        handle.spawn(async move {
            match triggers.delete(&trigger_id).await {
                Ok(_) => debug!(trigger = %trigger_id, "Deleted abandoned listen trigger"),
                Err(e) => warn!(trigger = %trigger_id, error = %e, "Failed to delete listen trigger"),
            }
        });
    }
}
