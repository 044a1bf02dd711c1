// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Environment - Runtime Scheduling
//!
//! This crate maps workflow instances onto isolated runner processes on a
//! container platform, and hosts the orchestration core around them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     conduit-environment (This Crate)                  │
//! │  ┌─────────────┐  ┌──────────────┐  ┌─────────────┐  ┌────────────┐  │
//! │  │ Correlation │  │   Instance   │  │   Process   │  │  Secrets   │  │
//! │  │   Engine    │  │  Scheduler   │  │  Registry   │  │  Manager   │  │
//! │  └─────────────┘  └──────────────┘  └─────────────┘  └────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │ Start / Correlate       │ create_process / stop
//!          ▼                         ▼
//! ┌───────────────────┐   ┌──────────────────────────────────────────────┐
//! │  Resource stores  │   │               WorkflowRuntime                 │
//! │ (instances, ...)  │   │   DockerRuntime          KubernetesRuntime    │
//! └───────────────────┘   │   (docker CLI)           (kubectl CLI)        │
//!          ▲              └──────────────────────────────────────────────┘
//!          │                          │ container / Job
//!          │                          ▼
//!          │              ┌──────────────────────────────────────────────┐
//!          └──────────────│        Runner (WorkflowExecutor)              │
//!                         └──────────────────────────────────────────────┘
//! ```
//!
//! # Runtime contract
//!
//! Both runtimes:
//!
//! | Step | Docker | Kubernetes |
//! |------|--------|------------|
//! | Image | pull policy enforced by inspect then pull | `imagePullPolicy` |
//! | Spec | [`ContainerTemplate`](runtime::docker::ContainerTemplate) | [`PodTemplate`](runtime::kubernetes::PodTemplate) |
//! | Secrets | per-instance host directory, read-only bind mount | Secret, read-only `secret` volume |
//! | Network | network of the host container when inside Docker | cluster network, pod namespace |
//! | Exit | `docker wait` | Job `Succeeded` / `Failed` |
//! | Stop | stop + remove, once | delete Job (foreground) + Secret, once |
//!
//! Runners receive the environment contract of
//! [`conduit_core::runner::RunnerConfig`]. Secret values are never passed
//! through the environment.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CONDUIT_RUNTIME` | `docker` | `docker` or `kubernetes` |
//! | `CONDUIT_API_URI` | *required* | API base URI handed to runners |
//! | `CONDUIT_RUNNER_IMAGE` | `ghcr.io/conduit-workflows/runner:latest` | Runner image |
//! | `CONDUIT_RUNNER_PULL_POLICY` | `IfNotPresent` | `Always`, `IfNotPresent` or `Never` |
//! | `CONDUIT_SKIP_CERTIFICATE_VALIDATION` | `false` | Passed to runners |
//! | `CONDUIT_SECRETS_DIRECTORY` | `/run/secrets/conduit` | Secrets mount path in runners |
//! | `CONDUIT_DATA_DIR` | `.data` | Host directory for per-instance secret files |
//! | `CONDUIT_SECRETS_SOURCE` | `{data_dir}/secret-store` | One file per secret value |
//! | `CONDUIT_DOCKER_NETWORK` | detected | Network runner containers join |
//! | `CONDUIT_KUBERNETES_NAMESPACE` | detected | Namespace of runner Jobs |
//! | `CONDUIT_SCHEDULER_POLL_SECS` | `5` | Reconcile interval |
//! | `CONDUIT_CONTAINER_TEMPLATE` | - | JSON container template |
//! | `CONDUIT_POD_TEMPLATE` | - | JSON pod template |

#![deny(missing_docs)]

/// Environment configuration.
pub mod config;

/// Error types.
pub mod error;

/// Embeddable host.
pub mod host;

/// Process registry.
pub mod registry;

/// Runtime backends.
pub mod runtime;

/// Instance scheduler.
pub mod scheduler;

/// Secrets sources.
pub mod secrets;

pub use config::Config;
pub use error::{Error, Result};
pub use host::{Host, HostBuilder};
pub use registry::ProcessRegistry;
pub use runtime::{PullPolicy, RuntimeError, WorkflowProcess, WorkflowRuntime};
pub use scheduler::InstanceScheduler;
