// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance scheduler tests.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Stores, eventually, instance, workflow};
use conduit_core::correlation::Trigger;
use conduit_core::execution::{InstanceCommands, LifecycleBus};
use conduit_core::instance::WorkflowPhase;
use conduit_core::{InMemoryStore, Resource, ResourceStore};
use conduit_environment::ProcessRegistry;
use conduit_environment::runtime::WorkflowProcess;
use conduit_environment::runtime::mock::{MockRuntime, STOPPED_EXIT_CODE};
use conduit_environment::scheduler::{InstanceScheduler, SERVICE_ACCOUNT_LABEL, SchedulerStores};

struct Fixture {
    stores: Stores,
    runtime: Arc<MockRuntime>,
    registry: Arc<ProcessRegistry>,
    commands: InstanceCommands,
    scheduler: InstanceScheduler,
}

async fn fixture() -> Fixture {
    let stores = Stores::new().await;
    let runtime = Arc::new(MockRuntime::new());
    let registry = Arc::new(ProcessRegistry::new());
    let commands = InstanceCommands::new(
        stores.instances.clone(),
        stores.workflows.clone(),
        Arc::new(InMemoryStore::<Trigger>::new()),
        Arc::new(LifecycleBus::new(16)),
    );
    let scheduler = InstanceScheduler::new(
        SchedulerStores {
            instances: stores.instances.clone(),
            workflows: stores.workflows.clone(),
            service_accounts: stores.service_accounts.clone(),
        },
        runtime.clone(),
        registry.clone(),
        commands.clone(),
        Duration::from_millis(20),
    );
    Fixture {
        stores,
        runtime,
        registry,
        commands,
        scheduler,
    }
}

#[tokio::test]
async fn test_pending_instance_gets_a_process_and_a_run() {
    let f = fixture().await;
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    let pending = f.stores.instances.create(instance(&workflow, "greet-1")).await.unwrap();

    assert_eq!(f.scheduler.reconcile().await.unwrap(), 1);

    let processes = f.runtime.processes();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].starts(), 1);
    assert_eq!(processes[0].instance_id(), Some(pending.id().as_str()));

    let stored = f.stores.instances.find(&pending.id()).await.unwrap().unwrap();
    let run = stored.current_run().unwrap();
    assert_eq!(run.process_id, processes[0].id());
    assert_eq!(f.registry.len().await, 1);

    // An open run is never scheduled twice.
    assert_eq!(f.scheduler.reconcile().await.unwrap(), 0);
    assert_eq!(f.runtime.processes().len(), 1);
}

#[tokio::test]
async fn test_exit_is_recorded_and_process_released() {
    let f = fixture().await;
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    let pending = f.stores.instances.create(instance(&workflow, "greet-1")).await.unwrap();
    f.scheduler.reconcile().await.unwrap();

    let process = f.runtime.processes()[0].clone();
    process.finish(0);

    let instances = f.stores.instances.clone();
    let id = pending.id();
    assert!(
        eventually(|| {
            let instances = instances.clone();
            let id = id.clone();
            async move {
                let stored = instances.find(&id).await.unwrap().unwrap();
                stored.status.runs.first().and_then(|r| r.exit_code) == Some(0)
            }
        })
        .await
    );
    let registry = f.registry.clone();
    assert!(eventually(|| { let registry = registry.clone(); async move { registry.is_empty().await } }).await);
    assert_eq!(process.releases(), 1);
}

#[tokio::test]
async fn test_non_zero_exit_faults_unfinished_instance() {
    let f = fixture().await;
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    let pending = f.stores.instances.create(instance(&workflow, "greet-1")).await.unwrap();
    f.scheduler.reconcile().await.unwrap();

    f.runtime.processes()[0].finish(2);

    let instances = f.stores.instances.clone();
    let id = pending.id();
    assert!(
        eventually(|| {
            let instances = instances.clone();
            let id = id.clone();
            async move { instances.find(&id).await.unwrap().unwrap().status.phase == WorkflowPhase::Faulted }
        })
        .await
    );
    let stored = f.stores.instances.find(&id).await.unwrap().unwrap();
    let error = stored.status.error.unwrap();
    assert!(error.detail.unwrap().contains("exited with code 2"));
}

#[tokio::test]
async fn test_scheduler_stops_process_of_cancelled_instance() {
    let f = fixture().await;
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    let pending = f.stores.instances.create(instance(&workflow, "greet-1")).await.unwrap();
    f.scheduler.reconcile().await.unwrap();
    let process = f.runtime.processes()[0].clone();

    f.commands.cancel_instance(&pending.id()).await.unwrap();
    f.scheduler.reconcile().await.unwrap();

    assert_eq!(process.releases(), 1);
    assert_eq!(*process.exit_code().borrow(), Some(STOPPED_EXIT_CODE));
    let registry = f.registry.clone();
    assert!(eventually(|| { let registry = registry.clone(); async move { registry.is_empty().await } }).await);
}

#[tokio::test]
async fn test_missing_workflow_faults_instance() {
    let f = fixture().await;
    let workflow = workflow("ghost", &[]);
    let pending = f.stores.instances.create(instance(&workflow, "ghost-1")).await.unwrap();

    assert_eq!(f.scheduler.reconcile().await.unwrap(), 0);

    let stored = f.stores.instances.find(&pending.id()).await.unwrap().unwrap();
    assert_eq!(stored.status.phase, WorkflowPhase::Faulted);
    let error = stored.status.error.unwrap();
    assert!(error.problem_type.contains("configuration"));
    assert!(f.runtime.processes().is_empty());
}

#[tokio::test]
async fn test_missing_service_account_faults_instance() {
    let f = fixture().await;
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    let mut labelled = instance(&workflow, "greet-1");
    labelled.metadata = labelled.metadata.with_label(SERVICE_ACCOUNT_LABEL, "billing");
    let pending = f.stores.instances.create(labelled).await.unwrap();

    f.scheduler.reconcile().await.unwrap();

    let stored = f.stores.instances.find(&pending.id()).await.unwrap().unwrap();
    assert_eq!(stored.status.phase, WorkflowPhase::Faulted);
    assert!(stored.status.error.unwrap().detail.unwrap().contains("billing.default"));
}

#[tokio::test]
async fn test_platform_failure_reports_message() {
    let f = fixture().await;
    f.runtime.fail_with("Cannot connect to the Docker daemon");
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    let pending = f.stores.instances.create(instance(&workflow, "greet-1")).await.unwrap();

    f.scheduler.reconcile().await.unwrap();

    let stored = f.stores.instances.find(&pending.id()).await.unwrap().unwrap();
    assert_eq!(stored.status.phase, WorkflowPhase::Faulted);
    assert!(
        stored
            .status
            .error
            .unwrap()
            .detail
            .unwrap()
            .contains("Cannot connect to the Docker daemon")
    );
}

#[tokio::test]
async fn test_run_loop_schedules_new_instances() {
    let f = fixture().await;
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    let shutdown = f.scheduler.shutdown_handle();
    let handle = tokio::spawn(f.scheduler.run());

    f.stores.instances.create(instance(&workflow, "greet-1")).await.unwrap();

    let runtime = f.runtime.clone();
    assert!(eventually(|| { let runtime = runtime.clone(); async move { runtime.processes().len() == 1 } }).await);

    shutdown.notify_one();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_slow_creation_does_not_serialize_the_queue() {
    let f = fixture().await;
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    for name in ["greet-1", "greet-2", "greet-3"] {
        f.stores.instances.create(instance(&workflow, name)).await.unwrap();
    }
    let delay = Duration::from_millis(300);
    f.runtime.delay_creation(delay);

    let started = Instant::now();
    assert_eq!(f.scheduler.reconcile().await.unwrap(), 3);

    assert!(started.elapsed() < delay * 2, "took {:?}", started.elapsed());
    assert_eq!(f.runtime.processes().len(), 3);
    assert_eq!(f.registry.len().await, 3);
}

#[tokio::test]
async fn test_overlapping_reconciles_schedule_instance_once() {
    let f = fixture().await;
    let workflow = f.stores.workflows.create(workflow("greet", &[])).await.unwrap();
    let pending = f.stores.instances.create(instance(&workflow, "greet-1")).await.unwrap();
    f.runtime.delay_creation(Duration::from_millis(100));

    let (first, second) = tokio::join!(f.scheduler.reconcile(), f.scheduler.reconcile());

    assert_eq!(first.unwrap() + second.unwrap(), 1);
    assert_eq!(f.runtime.processes().len(), 1);
    let stored = f.stores.instances.find(&pending.id()).await.unwrap().unwrap();
    assert_eq!(stored.status.runs.len(), 1);
}
