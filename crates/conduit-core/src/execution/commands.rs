// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store-level entry points for operators and API layers.
//!
//! These commands run outside any executor: each one loads the instance,
//! applies the reducer and writes the result with a version check, retrying
//! on conflict. A running executor observes the change through its watcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::context::INSTANCE_LABEL;
use super::lifecycle::{LifecycleBus, LifecycleEvent, LifecycleKind};
use super::task_state::TaskCommand;
use super::workflow_state::{self, WorkflowCommand};
use crate::correlation::{CorrelationLifetime, CorrelationMode, CorrelationOutcome, Trigger, TriggerSpec};
use crate::definition::{Workflow, WorkflowReference};
use crate::error::{CoreError, CorrelationError, ProblemDetails, Result};
use crate::instance::WorkflowInstance;
use crate::resource::{Resource, ResourceMetadata};
use crate::store::{ResourceStore, mutate};

/// Label set on triggers created from a workflow schedule.
pub const SCHEDULE_LABEL: &str = "conduit.io/workflow";

/// Instance and workflow commands over the resource stores.
#[derive(Clone)]
pub struct InstanceCommands {
    instances: Arc<dyn ResourceStore<WorkflowInstance>>,
    workflows: Arc<dyn ResourceStore<Workflow>>,
    triggers: Arc<dyn ResourceStore<Trigger>>,
    lifecycle: Arc<LifecycleBus>,
}

impl InstanceCommands {
    /// Create the command surface.
    pub fn new(
        instances: Arc<dyn ResourceStore<WorkflowInstance>>,
        workflows: Arc<dyn ResourceStore<Workflow>>,
        triggers: Arc<dyn ResourceStore<Trigger>>,
        lifecycle: Arc<LifecycleBus>,
    ) -> Self {
        Self {
            instances,
            workflows,
            triggers,
            lifecycle,
        }
    }

    /// Store a workflow definition.
    ///
    /// A definition with a schedule also gets a durable parallel trigger
    /// starting a new instance every time the schedule's events correlate.
    #[instrument(skip(self, workflow), fields(workflow = %workflow.reference()))]
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        let schedule = workflow
            .spec
            .schedule
            .as_ref()
            .map(|s| s.on.to_conditions())
            .transpose()
            .map_err(|p| CoreError::Configuration(p.to_string()))?;
        let workflow = self.workflows.create(workflow).await?;

        if let Some((condition_type, conditions)) = schedule {
            let reference = workflow.reference();
            let trigger = Trigger::new(
                ResourceMetadata::new(
                    format!("{}-schedule", workflow.metadata.name),
                    workflow.metadata.namespace.clone(),
                )
                .with_label(SCHEDULE_LABEL, workflow.id()),
                TriggerSpec::new(
                    conditions,
                    CorrelationOutcome::Start {
                        workflow: reference,
                        input: None,
                    },
                )
                .with_condition_type(condition_type)
                .with_mode(CorrelationMode::Parallel)
                .with_lifetime(CorrelationLifetime::Durable),
            );
            let trigger = self.triggers.create(trigger).await?;
            info!(trigger = %trigger.id(), "Registered workflow schedule");
        }
        Ok(workflow)
    }

    /// Create a pending instance of a stored workflow.
    #[instrument(skip(self, input), fields(workflow = %reference))]
    pub async fn create_instance(
        &self,
        reference: &WorkflowReference,
        input: Value,
        name: Option<String>,
    ) -> Result<WorkflowInstance> {
        let workflow = self
            .workflows
            .find(&reference.id())
            .await?
            .ok_or_else(|| CorrelationError::WorkflowNotFound(reference.to_string()))?;
        let name = name.unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", workflow.spec.document.name, &suffix[..8])
        });
        let metadata = ResourceMetadata::new(name, workflow.metadata.namespace.clone());
        let instance = self
            .instances
            .create(WorkflowInstance::new(metadata, workflow.reference(), input))
            .await?;

        info!(instance_id = %instance.id(), "Created workflow instance");
        self.lifecycle
            .publish(LifecycleEvent::workflow(instance.id(), LifecycleKind::Initialized, Utc::now()))
            .await;
        Ok(instance)
    }

    /// Cancel an instance and every unfinished task. Listen triggers of the
    /// instance are deleted.
    pub async fn cancel_instance(&self, instance_id: &str) -> Result<WorkflowInstance> {
        let instance = self.apply(instance_id, WorkflowCommand::Cancel).await?;
        let mut selector = BTreeMap::new();
        selector.insert(INSTANCE_LABEL.to_string(), instance_id.to_string());
        for trigger in self.triggers.list(Some(&selector)).await? {
            if let Err(e) = self.triggers.delete(&trigger.id()).await {
                warn!(trigger = %trigger.id(), error = %e, "Failed to delete listen trigger");
            }
        }
        Ok(instance)
    }

    /// Suspend a running instance.
    pub async fn suspend_instance(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.apply(instance_id, WorkflowCommand::Suspend).await
    }

    /// Resume a suspended instance.
    pub async fn resume_instance(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.apply(instance_id, WorkflowCommand::Resume).await
    }

    /// Retry a faulted task.
    pub async fn retry_task(&self, instance_id: &str, task_id: &str, cause: ProblemDetails) -> Result<WorkflowInstance> {
        self.apply(
            instance_id,
            WorkflowCommand::Task {
                id: task_id.to_string(),
                command: TaskCommand::Retry { cause },
            },
        )
        .await
    }

    /// Skip a task that has not completed yet.
    pub async fn skip_task(&self, instance_id: &str, task_id: &str) -> Result<WorkflowInstance> {
        self.apply(
            instance_id,
            WorkflowCommand::Task {
                id: task_id.to_string(),
                command: TaskCommand::Skip,
            },
        )
        .await
    }

    /// Apply a command with the load, reduce, versioned-update loop.
    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn apply(&self, instance_id: &str, command: WorkflowCommand) -> Result<WorkflowInstance> {
        let mut events = Vec::new();
        let updated = mutate(&*self.instances, instance_id, |current: &WorkflowInstance| {
            let transition = workflow_state::apply(current, &command, Utc::now())?;
            events = transition.events;
            Ok::<_, CoreError>(Some(transition.instance))
        })
        .await?
        .ok_or_else(|| CoreError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        })?;

        info!(instance_id = %instance_id, phase = %updated.status.phase, "Applied instance command");
        self.lifecycle.publish_all(events).await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DocumentDefinition, TaskDefinition, TaskKind, WorkflowDefinition, NamedTask};
    use crate::execution::lifecycle::LifecycleFilter;
    use crate::instance::WorkflowPhase;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn workflow() -> Workflow {
        Workflow::new(WorkflowDefinition {
            document: DocumentDefinition {
                dsl: "1.0.0".to_string(),
                namespace: "default".to_string(),
                name: "greet".to_string(),
                version: "1.0.0".to_string(),
            },
            secrets: Vec::new(),
            schedule: None,
            tasks: vec![NamedTask::new(
                "hello",
                TaskDefinition::new(TaskKind::Set(json!({"greeting": "hi"}).as_object().cloned().unwrap_or_default())),
            )],
        })
    }

    fn commands() -> InstanceCommands {
        InstanceCommands::new(
            Arc::new(InMemoryStore::<WorkflowInstance>::new()),
            Arc::new(InMemoryStore::<Workflow>::new()),
            Arc::new(InMemoryStore::<Trigger>::new()),
            Arc::new(LifecycleBus::new(16)),
        )
    }

    #[tokio::test]
    async fn test_create_instance_requires_workflow() {
        let commands = commands();
        let err = commands
            .create_instance(&workflow().reference(), json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Correlation(CorrelationError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_create_instance_publishes_initialized() {
        let commands = commands();
        let mut events = commands.lifecycle.subscribe(LifecycleFilter::all());
        let workflow = commands.register_workflow(workflow()).await.unwrap();

        let instance = commands
            .create_instance(&workflow.reference(), json!({"name": "ada"}), Some("greet-1".to_string()))
            .await
            .unwrap();
        assert_eq!(instance.metadata.name, "greet-1");
        assert_eq!(instance.status.phase, WorkflowPhase::Pending);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, LifecycleKind::Initialized);
        assert_eq!(event.instance_id, instance.id());
    }

    #[tokio::test]
    async fn test_suspend_pending_instance_is_rejected() {
        let commands = commands();
        let workflow = commands.register_workflow(workflow()).await.unwrap();
        let instance = commands
            .create_instance(&workflow.reference(), json!({}), None)
            .await
            .unwrap();

        let err = commands.suspend_instance(&instance.id()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInstanceState { operation: "suspend", .. }));
    }

    #[tokio::test]
    async fn test_cancel_instance() {
        let commands = commands();
        let workflow = commands.register_workflow(workflow()).await.unwrap();
        let instance = commands
            .create_instance(&workflow.reference(), json!({}), None)
            .await
            .unwrap();

        let cancelled = commands.cancel_instance(&instance.id()).await.unwrap();
        assert_eq!(cancelled.status.phase, WorkflowPhase::Cancelled);
        assert!(cancelled.metadata.version > instance.metadata.version);
    }

    #[tokio::test]
    async fn test_apply_unknown_instance() {
        let err = commands().cancel_instance("missing.default").await.unwrap_err();
        assert!(matches!(err, CoreError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_schedule_registers_durable_trigger() {
        let commands = commands();
        let mut scheduled = workflow();
        scheduled.spec.schedule = Some(
            serde_json::from_value(json!({"on": {"one": {"with": {"type": "order.created"}}}})).unwrap(),
        );

        let workflow = commands.register_workflow(scheduled).await.unwrap();
        let triggers = commands.triggers.list(None).await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].spec.lifetime, CorrelationLifetime::Durable);
        assert_eq!(
            triggers[0].metadata.labels.get(SCHEDULE_LABEL),
            Some(&workflow.id())
        );
    }
}
