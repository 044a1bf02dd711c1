// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborators task executors call out to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::correlation::CorrelationEngine;
use crate::error::ProblemDetails;
use crate::event::Event;
use crate::expression::{ExpressionEvaluator, PathExpressionEvaluator};

/// Invokes the function named by a `call` task.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Call `function` with evaluated arguments and the task input.
    async fn call(&self, function: &str, arguments: &Value, input: &Value) -> Result<Value, ProblemDetails>;
}

/// Publishes events produced by `emit` tasks.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<(), ProblemDetails>;
}

type Function = Arc<dyn Fn(&Value, &Value) -> Result<Value, ProblemDetails> + Send + Sync>;

/// [`CallHandler`] dispatching to registered synchronous functions.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Function>,
}

impl FunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function taking `(arguments, input)`.
    pub fn register<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&Value, &Value) -> Result<Value, ProblemDetails> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }
}

#[async_trait]
impl CallHandler for FunctionRegistry {
    async fn call(&self, function: &str, arguments: &Value, input: &Value) -> Result<Value, ProblemDetails> {
        let f = self
            .functions
            .get(function)
            .ok_or_else(|| ProblemDetails::configuration(format!("function '{}' is not defined", function)))?;
        f(arguments, input)
    }
}

/// [`EventSink`] that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardEventSink;

#[async_trait]
impl EventSink for DiscardEventSink {
    async fn publish(&self, event: Event) -> Result<(), ProblemDetails> {
        debug!(event_id = %event.id, event_type = %event.event_type, "Discarding emitted event");
        Ok(())
    }
}

/// [`EventSink`] feeding emitted events back into a correlation engine.
pub struct CorrelationEventSink {
    engine: Arc<CorrelationEngine>,
}

impl CorrelationEventSink {
    /// Route emitted events to `engine`.
    pub fn new(engine: Arc<CorrelationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EventSink for CorrelationEventSink {
    async fn publish(&self, event: Event) -> Result<(), ProblemDetails> {
        self.engine
            .ingest(&event)
            .await
            .map(|_| ())
            .map_err(|e| e.to_problem())
    }
}

/// Services shared by every executor of a host.
#[derive(Clone)]
pub struct ExecutionServices {
    /// Runtime expression evaluator.
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    /// Function dispatcher for `call` tasks.
    pub functions: Arc<dyn CallHandler>,
    /// Destination of `emit` tasks.
    pub events: Arc<dyn EventSink>,
}

impl Default for ExecutionServices {
    fn default() -> Self {
        Self {
            evaluator: Arc::new(PathExpressionEvaluator::new()),
            functions: Arc::new(FunctionRegistry::new()),
            events: Arc::new(DiscardEventSink),
        }
    }
}

impl ExecutionServices {
    /// Replace the expression evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Replace the function dispatcher.
    pub fn with_functions(mut self, functions: Arc<dyn CallHandler>) -> Self {
        self.functions = functions;
        self
    }

    /// Replace the event sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}
