// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Core - Event-driven workflow orchestration
//!
//! This crate holds the orchestration core of conduit: it correlates inbound
//! CloudEvents into triggers, starts or resumes workflow instances when
//! triggers fire, and executes serverless-workflow task trees while keeping
//! every transition in the resource store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────────────────────┐
//! │   Event producers    │─────►│          CorrelationEngine           │
//! │ (brokers, emit tasks)│      │  triggers → contexts → fired outcome │
//! └──────────────────────┘      └──────────────────────────────────────┘
//!                                     │ Start               │ Correlate
//!                                     ▼                     ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     ResourceStore (versioned)                        │
//! │          Workflow · WorkflowInstance · Trigger · ServiceAccount      │
//! └──────────────────────────────────────────────────────────────────────┘
//!           │ watch                                   ▲ commit
//!           ▼                                         │
//! ┌───────────────────────┐               ┌──────────────────────────────┐
//! │ conduit-environment   │   spawns      │  WorkflowExecutor (runner)   │
//! │ InstanceScheduler     │──────────────►│  WorkflowExecutionContext    │
//! │ Docker / Kubernetes   │               │  LifecycleBus                │
//! └───────────────────────┘               └──────────────────────────────┘
//! ```
//!
//! # Correlation
//!
//! | Type | Role |
//! |------|------|
//! | [`EventFilter`](correlation::EventFilter) | Attribute patterns plus correlation keys |
//! | [`Trigger`](correlation::Trigger) | Conditions, mode, lifetime and outcome |
//! | [`CorrelationContext`](correlation::CorrelationContext) | Events correlated under one key set |
//! | [`CorrelationEngine`](correlation::CorrelationEngine) | Routes events, realizes fired contexts |
//!
//! A trigger in `exclusive` mode keeps at most one open context and ignores
//! events that do not correlate with it. A trigger in `parallel` mode opens a
//! context per distinct key set. Contexts older than the configured
//! maximum active duration are evicted by the expiry sweeper.
//!
//! # Execution
//!
//! Workflow and task transitions are pure reducers in
//! [`execution::task_state`] and [`execution::workflow_state`]. The
//! [`WorkflowExecutionContext`](execution::WorkflowExecutionContext) applies
//! them under a lock, writes the result with an optimistic version check and
//! publishes [`LifecycleEvent`](execution::LifecycleEvent)s once the write
//! succeeded. Executors are stateless: restarting one against a partially
//! executed instance resumes where the previous one stopped.
//!
//! # Configuration
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `CONDUIT_CORRELATION_MAX_ACTIVE_SECS` | `86400` | Context lifetime, `0` disables eviction |
//! | `CONDUIT_CORRELATION_SWEEP_INTERVAL_SECS` | `60` | Expiry sweep interval |
//! | `CONDUIT_LIFECYCLE_BUFFER` | `256` | Per-subscriber lifecycle channel capacity |
//!
//! Runner processes read their own contract through [`runner::RunnerConfig`].

#![deny(missing_docs)]

/// Core configuration loaded from environment variables.
pub mod config;

/// Event correlation, triggers and outcome realization.
pub mod correlation;

/// Workflow definition language.
pub mod definition;

/// Error types and problem details.
pub mod error;

/// CloudEvents envelope.
pub mod event;

/// Task and workflow execution.
pub mod execution;

/// Runtime expression evaluation.
pub mod expression;

/// Workflow and task instance state.
pub mod instance;

/// Resource metadata and service accounts.
pub mod resource;

/// Environment contract between the scheduler and runner processes.
pub mod runner;

/// Versioned resource storage.
pub mod store;

pub use config::{ConfigError, CoreConfig};
pub use error::{CoreError, CorrelationError, ProblemDetails, Result};
pub use event::{AttributeValue, Event};
pub use resource::{Resource, ResourceMetadata, ServiceAccount};
pub use store::{InMemoryStore, ResourceStore, StoreError, WatchEvent};
