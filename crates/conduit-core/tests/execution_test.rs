// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow execution against in-memory stores.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{Harness, RecordingEventSink, task_at, workflow};
use conduit_core::execution::{ExecutionServices, FunctionRegistry, LifecycleKind, WorkflowExecutionContext};
use conduit_core::instance::{TaskStatus, WorkflowPhase};
use conduit_core::{CoreError, Event, ProblemDetails, Resource, ResourceStore};
use serde_json::{Value, json};

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_sequence_passes_output_to_next_task() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "sequence",
                json!([
                    { "first": { "set": { "x": "${ .seed }" } } },
                    { "second": { "set": { "y": "${ .x }", "from": "${ $input.seed }" } } }
                ]),
            ),
            json!({"seed": 7}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Completed);
    assert_eq!(instance.status.output, Some(json!({"y": 7, "from": 7})));
    assert_eq!(task_at(&instance, "/do/0/first").status, TaskStatus::Completed);
    assert_eq!(task_at(&instance, "/do/1/second").output, Some(json!({"y": 7, "from": 7})));
    assert!(instance.status.ended_at.is_some());
}

#[tokio::test]
async fn test_then_jumps_and_guard_skips() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "jumps",
                json!([
                    { "start": { "set": { "n": 1 }, "then": "last" } },
                    { "never": { "set": { "reached": true } } },
                    { "last": { "if": "${ .n == 2 }", "set": { "unexpected": true } } }
                ]),
            ),
            json!({}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Completed);
    assert!(instance.status.tasks.values().all(|t| t.name != "never"));
    assert_eq!(task_at(&instance, "/do/2/last").status, TaskStatus::Skipped);
    // A skipped task hands its input through
    assert_eq!(instance.status.output, Some(json!({"n": 1})));
}

#[tokio::test]
async fn test_switch_selects_matching_case() {
    let harness = Harness::new();
    let definition = workflow(
        "review",
        json!([
            { "check": { "switch": [
                { "approved": { "when": ".status == \"approved\"", "then": "ship" } },
                { "otherwise": { "then": "reject" } }
            ] } },
            { "reject": { "set": { "rejected": true }, "then": "end" } },
            { "ship": { "set": { "shipped": true } } }
        ]),
    );

    let approved = harness
        .run(definition.clone(), json!({"status": "approved"}), ExecutionServices::default())
        .await;
    assert_eq!(approved.status.output, Some(json!({"shipped": true})));

    let mut renamed = definition;
    renamed.spec.document.name = "review-declined".to_string();
    renamed.metadata.name = "review-declined".to_string();
    let declined = harness
        .run(renamed, json!({"status": "declined"}), ExecutionServices::default())
        .await;
    assert_eq!(declined.status.output, Some(json!({"rejected": true})));
    assert!(declined.status.tasks.values().all(|t| t.name != "ship"));
}

#[tokio::test]
async fn test_fork_collects_branch_outputs() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "fanout",
                json!([
                    { "split": { "fork": { "branches": [
                        { "left": { "set": { "side": "left" } } },
                        { "right": { "set": { "side": "right" } } }
                    ] } } }
                ]),
            ),
            json!({}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(
        instance.status.output,
        Some(json!([{"side": "left"}, {"side": "right"}]))
    );
    assert_eq!(
        task_at(&instance, "/do/0/split/fork/branches/1/right").status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_competing_fork_cancels_losers() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "race",
                json!([
                    { "race": { "fork": { "compete": true, "branches": [
                        { "slow": { "wait": { "seconds": 30 } } },
                        { "fast": { "set": { "winner": "fast" } } }
                    ] } } }
                ]),
            ),
            json!({}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Completed);
    assert_eq!(instance.status.output, Some(json!({"winner": "fast"})));
    assert_eq!(
        task_at(&instance, "/do/0/race/fork/branches/0/slow").status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn test_losing_listen_branch_leaves_no_trigger() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "race-listen",
                json!([
                    { "race": { "fork": { "compete": true, "branches": [
                        { "waiting": { "listen": { "to": { "one": {
                            "with": { "type": "never.happens" }
                        } } } } },
                        { "timer": { "do": [
                            { "pause": { "wait": { "milliseconds": 200 } } },
                            { "mark": { "set": { "winner": "timer" } } }
                        ] } }
                    ] } } }
                ]),
            ),
            json!({}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Completed);
    assert_eq!(
        task_at(&instance, "/do/0/race/fork/branches/0/waiting").status,
        TaskStatus::Cancelled
    );
    assert_eq!(harness.triggers.len().await, 0);

    // A late matching event has nothing left to correlate with.
    let report = harness
        .engine
        .ingest(&Event::new("never.happens", "/elsewhere"))
        .await
        .unwrap();
    assert!(report.fired.is_empty());
}

#[tokio::test]
async fn test_faulted_fork_releases_listen_trigger() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "fork-fault",
                json!([
                    { "both": { "fork": { "branches": [
                        { "waiting": { "listen": { "to": { "one": {
                            "with": { "type": "never.happens" }
                        } } } } },
                        { "failing": { "do": [
                            { "pause": { "wait": { "milliseconds": 100 } } },
                            { "boom": { "raise": { "error": {
                                "type": "https://serverlessworkflow.io/spec/1.0.0/errors/runtime",
                                "title": "Boom",
                                "status": 500
                            } } } }
                        ] } }
                    ] } } }
                ]),
            ),
            json!({}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Faulted);
    assert!(harness.triggers.is_empty().await);
}

#[tokio::test]
async fn test_raise_faults_workflow() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "failing",
                json!([
                    { "boom": { "raise": { "error": {
                        "type": "https://serverlessworkflow.io/spec/1.0.0/errors/runtime",
                        "title": "Boom",
                        "status": 500
                    } } } },
                    { "after": { "set": { "reached": true } } }
                ]),
            ),
            json!({}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Faulted);
    let error = instance.status.error.clone().unwrap();
    assert_eq!(error.title, "Boom");
    assert_eq!(error.instance.as_deref(), Some("/do/0/boom"));
    assert_eq!(task_at(&instance, "/do/0/boom").status, TaskStatus::Faulted);
    assert!(instance.status.tasks.values().all(|t| t.name != "after"));
}

#[tokio::test]
async fn test_try_retries_until_call_succeeds() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let functions = FunctionRegistry::new().register("flaky", move |arguments: &Value, _input: &Value| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(ProblemDetails::communication("upstream unavailable"))
        } else {
            Ok(json!({"echo": arguments["value"]}))
        }
    });
    let services = ExecutionServices::default().with_functions(Arc::new(functions));

    let instance = harness
        .run(
            workflow(
                "resilient",
                json!([
                    { "attempt": {
                        "try": [ { "invoke": { "call": "flaky", "with": { "value": "${ .value }" } } } ],
                        "catch": {
                            "errors": { "with": { "type": "https://serverlessworkflow.io/spec/1.0.0/errors/communication" } },
                            "retry": { "delay": { "milliseconds": 1 }, "limit": { "attempt": { "count": 3 } } }
                        }
                    } }
                ]),
            ),
            json!({"value": "ping"}),
            services,
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Completed);
    assert_eq!(instance.status.output, Some(json!({"echo": "ping"})));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let body = task_at(&instance, "/do/0/attempt/try");
    assert_eq!(body.retries.len(), 2);
    assert_eq!(body.retries[0].number, 1);
}

#[tokio::test]
async fn test_retry_limit_surfaces_error() {
    let harness = Harness::new();
    let functions = FunctionRegistry::new().register("down", |_: &Value, _: &Value| {
        Err(ProblemDetails::communication("still down"))
    });
    let services = ExecutionServices::default().with_functions(Arc::new(functions));

    let instance = harness
        .run(
            workflow(
                "exhausted",
                json!([
                    { "attempt": {
                        "try": [ { "invoke": { "call": "down" } } ],
                        "catch": { "retry": { "limit": { "attempt": { "count": 1 } } } }
                    } }
                ]),
            ),
            json!({}),
            services,
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Faulted);
    let error = instance.status.error.clone().unwrap();
    assert_eq!(error.title, "Communication Error");
    assert_eq!(task_at(&instance, "/do/0/attempt/try").retries.len(), 1);
    assert_eq!(task_at(&instance, "/do/0/attempt").status, TaskStatus::Faulted);
}

#[tokio::test]
async fn test_catch_handler_recovers_and_workflow_continues() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "recovering",
                json!([
                    { "guarded": {
                        "try": [ { "fail": { "raise": { "error": {
                            "type": "https://serverlessworkflow.io/spec/1.0.0/errors/communication",
                            "title": "Unreachable",
                            "status": 503
                        } } } } ],
                        "catch": {
                            "as": "failure",
                            "do": [ { "fallback": { "set": { "recovered": "${ $failure.title }" } } } ]
                        }
                    } },
                    { "report": { "set": { "status": "${ .recovered }" } } }
                ]),
            ),
            json!({}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Completed);
    assert_eq!(instance.status.output, Some(json!({"status": "Unreachable"})));
    assert_eq!(task_at(&instance, "/do/0/guarded/try/0/fail").status, TaskStatus::Faulted);
    assert_eq!(
        task_at(&instance, "/do/0/guarded/catch/0/fallback").status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_catch_filter_lets_other_errors_through() {
    let harness = Harness::new();
    let instance = harness
        .run(
            workflow(
                "picky",
                json!([
                    { "guarded": {
                        "try": [ { "fail": { "raise": { "error": {
                            "type": "https://serverlessworkflow.io/spec/1.0.0/errors/runtime",
                            "title": "Broken",
                            "status": 500
                        } } } } ],
                        "catch": { "errors": { "with": { "status": 503 } } }
                    } }
                ]),
            ),
            json!({}),
            ExecutionServices::default(),
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Faulted);
    assert_eq!(instance.status.error.unwrap().title, "Broken");
}

#[tokio::test]
async fn test_emit_publishes_event() {
    let harness = Harness::new();
    let sink = Arc::new(RecordingEventSink::default());
    let services = ExecutionServices::default().with_events(sink.clone());

    let instance = harness
        .run(
            workflow(
                "announce",
                json!([
                    { "notify": { "emit": { "event": { "with": {
                        "type": "order.shipped",
                        "source": "/fulfilment",
                        "data": { "order": "${ .order }" }
                    } } } } }
                ]),
            ),
            json!({"order": "A-1"}),
            services,
        )
        .await;

    assert_eq!(instance.status.phase, WorkflowPhase::Completed);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "order.shipped");
    assert_eq!(events[0].data, Some(json!({"order": "A-1"})));
    assert!(!events[0].id.is_empty());
}

#[tokio::test]
async fn test_listen_waits_for_correlated_event() {
    let harness = Harness::new();
    let (workflow, instance) = harness
        .instance(
            workflow(
                "awaiting",
                json!([
                    { "await": { "listen": { "to": { "one": {
                        "with": { "type": "payment.completed" }
                    } } } } }
                ]),
            ),
            json!({}),
        )
        .await;
    let executor = harness.executor(workflow, &instance, ExecutionServices::default()).await;

    let deliver = async {
        let triggers = &harness.triggers;
        wait_until(move || async move { triggers.len().await == 1 }).await;
        let waiting = harness.instances.find(&instance.id()).await.unwrap().unwrap();
        assert_eq!(waiting.status.phase, WorkflowPhase::Waiting);

        let report = harness
            .engine
            .ingest(&Event::new("payment.completed", "/payments").with_data(json!({"paid": 10})))
            .await
            .unwrap();
        assert_eq!(report.fired.len(), 1);
    };
    let (finished, ()) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(10), executor.execute()),
        deliver
    );
    let finished = finished.unwrap().unwrap();

    assert_eq!(finished.status.phase, WorkflowPhase::Completed);
    assert_eq!(task_at(&finished, "/do/0/await").output, Some(json!([{"paid": 10}])));
    assert!(harness.triggers.is_empty().await);
}

#[tokio::test]
async fn test_cancel_cascades_to_running_tasks() {
    let harness = Harness::new();
    let (workflow, instance) = harness
        .instance(workflow("sleepy", json!([{ "pause": { "wait": { "seconds": 30 } } }])), json!({}))
        .await;
    let executor = harness.executor(workflow, &instance, ExecutionServices::default()).await;
    let instance_id = instance.id();

    let cancel = async {
        let instances = &harness.instances;
        let id = instance_id.as_str();
        wait_until(move || async move {
            instances
                .find(id)
                .await
                .unwrap()
                .is_some_and(|i| i.status.tasks.values().any(|t| t.name == "pause" && t.status == TaskStatus::Running))
        })
        .await;
        harness.commands.cancel_instance(&instance_id).await.unwrap();
    };
    let (finished, ()) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(10), executor.execute()),
        cancel
    );
    let finished = finished.unwrap().unwrap();

    assert_eq!(finished.status.phase, WorkflowPhase::Cancelled);
    assert!(finished.status.tasks.values().all(|t| t.status == TaskStatus::Cancelled));
}

#[tokio::test]
async fn test_lifecycle_events_follow_transitions() {
    let harness = Harness::new();
    let (workflow, instance) = harness
        .instance(workflow("observed", json!([{ "only": { "set": { "ok": true } } }])), json!({}))
        .await;
    let executor = harness.executor(workflow, &instance, ExecutionServices::default()).await;
    let mut events = executor.subscribe();

    executor.execute().await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.instance_id, instance.id());
        received.push((event.is_workflow(), event.kind));
    }
    assert_eq!(received.first(), Some(&(true, LifecycleKind::Running)));
    assert_eq!(received.last(), Some(&(true, LifecycleKind::Completed)));
    let task_kinds: Vec<_> = received.iter().filter(|(w, _)| !w).map(|(_, k)| *k).collect();
    // Root `do` and the `only` task
    assert_eq!(
        task_kinds,
        vec![
            LifecycleKind::Initialized,
            LifecycleKind::Running,
            LifecycleKind::Initialized,
            LifecycleKind::Running,
            LifecycleKind::Completed,
            LifecycleKind::Completed,
        ]
    );
}

#[tokio::test]
async fn test_result_on_pending_instance_is_rejected() {
    let harness = Harness::new();
    let (_, instance) = harness
        .instance(workflow("idle", json!([{ "only": { "set": {} } }])), json!({}))
        .await;
    let context = WorkflowExecutionContext::load(
        &instance.id(),
        harness.instances.clone(),
        harness.triggers.clone(),
        harness.lifecycle.clone(),
    )
    .await
    .unwrap();

    let err = context.set_result(json!({})).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidInstanceState { .. }));
    let stored = harness.instances.find(&instance.id()).await.unwrap().unwrap();
    assert_eq!(stored.status.phase, WorkflowPhase::Pending);
    assert_eq!(stored.metadata.version, instance.metadata.version);
}
