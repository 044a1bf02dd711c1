// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes runtime.
//!
//! Runs each instance as a `batch/v1` Job with a single pod. Calls to the
//! cluster go through the [`KubernetesApi`] seam; [`KubectlCli`] drives the
//! `kubectl` binary.

mod api;
mod cli;
mod process;
mod runtime;
mod template;

pub use api::{JobPhase, JobStatus, KubernetesApi};
pub use cli::KubectlCli;
pub use process::KubernetesProcess;
pub use runtime::{KubernetesRuntime, SERVICE_ACCOUNT_NAMESPACE_PATH, in_cluster, resolve_namespace};
pub use template::{JobParams, PodTemplate, secret_manifest};
