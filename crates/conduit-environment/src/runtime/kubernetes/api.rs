// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes API seam.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::runtime::{LogLine, Result};

/// Phase of a runner Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// The pod is pending or running.
    Active,
    /// The pod completed successfully.
    Succeeded,
    /// The pod failed.
    Failed,
}

/// Observed Job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Job phase.
    pub phase: JobPhase,
    /// Exit code of the runner container, once terminated.
    pub exit_code: Option<i64>,
}

impl JobStatus {
    /// Whether the Job reached a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, JobPhase::Succeeded | JobPhase::Failed)
    }

    /// Exit code, falling back to the phase when the pod is gone.
    pub fn resolved_exit_code(&self) -> Option<i64> {
        match self.phase {
            JobPhase::Active => None,
            JobPhase::Succeeded => Some(self.exit_code.unwrap_or(0)),
            JobPhase::Failed => Some(self.exit_code.unwrap_or(1)),
        }
    }
}

/// Operations the Kubernetes runtime needs from the cluster.
///
/// Deleting an object that does not exist succeeds.
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    /// Create or update an object from its manifest.
    async fn apply(&self, manifest: &Value) -> Result<()>;

    /// Status of a Job, `None` if it does not exist.
    async fn job_status(&self, namespace: &str, name: &str) -> Result<Option<JobStatus>>;

    /// Follow the output of a Job's pod. The stream ends when the pod terminates.
    async fn follow_logs(&self, namespace: &str, job: &str) -> Result<mpsc::Receiver<LogLine>>;

    /// Delete a Job and its pods with foreground propagation.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a Secret.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;
}
