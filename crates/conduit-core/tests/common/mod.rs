// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for conduit-core integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::correlation::{CorrelationEngine, StoreOutcomeRealizer, Trigger};
use conduit_core::definition::{Workflow, WorkflowDefinition};
use conduit_core::execution::{
    EventSink, ExecutionServices, InstanceCommands, LifecycleBus, WorkflowExecutionContext, WorkflowExecutor,
};
use conduit_core::instance::WorkflowInstance;
use conduit_core::{Event, InMemoryStore, ProblemDetails, Resource};
use serde_json::{Value, json};

/// All stores plus the engine and command surface wired together.
pub struct Harness {
    pub workflows: Arc<InMemoryStore<Workflow>>,
    pub instances: Arc<InMemoryStore<WorkflowInstance>>,
    pub triggers: Arc<InMemoryStore<Trigger>>,
    pub lifecycle: Arc<LifecycleBus>,
    pub engine: Arc<CorrelationEngine>,
    pub commands: InstanceCommands,
}

impl Harness {
    pub fn new() -> Self {
        let workflows = Arc::new(InMemoryStore::<Workflow>::new());
        let instances = Arc::new(InMemoryStore::<WorkflowInstance>::new());
        let triggers = Arc::new(InMemoryStore::<Trigger>::new());
        let lifecycle = Arc::new(LifecycleBus::new(64));
        let realizer = Arc::new(StoreOutcomeRealizer::new(workflows.clone(), instances.clone()));
        let engine = Arc::new(CorrelationEngine::new(triggers.clone(), realizer));
        let commands = InstanceCommands::new(
            instances.clone(),
            workflows.clone(),
            triggers.clone(),
            lifecycle.clone(),
        );
        Self {
            workflows,
            instances,
            triggers,
            lifecycle,
            engine,
            commands,
        }
    }

    /// Register a workflow and create a pending instance of it.
    pub async fn instance(&self, workflow: Workflow, input: Value) -> (Workflow, WorkflowInstance) {
        let workflow = self.commands.register_workflow(workflow).await.unwrap();
        let instance = self
            .commands
            .create_instance(&workflow.reference(), input, None)
            .await
            .unwrap();
        (workflow, instance)
    }

    pub async fn executor(
        &self,
        workflow: Workflow,
        instance: &WorkflowInstance,
        services: ExecutionServices,
    ) -> WorkflowExecutor {
        let context = WorkflowExecutionContext::load(
            &instance.id(),
            self.instances.clone(),
            self.triggers.clone(),
            self.lifecycle.clone(),
        )
        .await
        .unwrap();
        WorkflowExecutor::new(workflow, context, services)
    }

    /// Register, create and execute to completion.
    pub async fn run(&self, workflow: Workflow, input: Value, services: ExecutionServices) -> WorkflowInstance {
        let (workflow, instance) = self.instance(workflow, input).await;
        let executor = self.executor(workflow, &instance, services).await;
        tokio::time::timeout(Duration::from_secs(10), executor.execute())
            .await
            .expect("workflow did not finish in time")
            .unwrap()
    }
}

/// A workflow from its `do` list.
pub fn workflow(name: &str, tasks: Value) -> Workflow {
    let definition: WorkflowDefinition = serde_json::from_value(json!({
        "document": {
            "dsl": "1.0.0",
            "namespace": "default",
            "name": name,
            "version": "1.0.0",
        },
        "do": tasks,
    }))
    .unwrap();
    Workflow::new(definition)
}

/// Records published events.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, event: Event) -> Result<(), ProblemDetails> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Task by path.
pub fn task_at<'a>(instance: &'a WorkflowInstance, path: &str) -> &'a conduit_core::instance::TaskInstance {
    instance
        .status
        .tasks
        .values()
        .find(|t| t.path == path)
        .unwrap_or_else(|| panic!("no task at '{}'", path))
}
