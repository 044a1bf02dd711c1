// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! [`KubernetesApi`] over the `kubectl` command line client.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::api::{JobPhase, JobStatus, KubernetesApi};
use crate::runtime::{LogLine, Result, RuntimeError};

const LOG_CHANNEL_CAPACITY: usize = 256;

/// How long `kubectl logs` waits for the pod to start running.
const POD_RUNNING_TIMEOUT: Duration = Duration::from_secs(300);

/// Drives a cluster through the `kubectl` binary and its current context.
#[derive(Debug, Clone)]
pub struct KubectlCli {
    binary: PathBuf,
}

impl Default for KubectlCli {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl KubectlCli {
    /// Use the client at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, operation: &'static str, args: &[&str], stdin: Option<Vec<u8>>) -> Result<String> {
        debug!(operation, args = ?args, "kubectl");
        let platform = |message: String| RuntimeError::Platform {
            operation,
            message,
            image: String::new(),
        };

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| platform(format!("failed to run {}: {}", self.binary.display(), e)))?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&bytes).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(platform(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

/// Job status from `kubectl get job -o json` and the pods of the Job.
pub(crate) fn parse_job_status(job: &Value, pods: &Value) -> JobStatus {
    let count = |field: &str| job["status"][field].as_i64().unwrap_or(0);
    let phase = if count("succeeded") > 0 {
        JobPhase::Succeeded
    } else if count("failed") > 0 {
        JobPhase::Failed
    } else {
        JobPhase::Active
    };

    let exit_code = pods["items"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|pod| pod["status"]["containerStatuses"].as_array().into_iter().flatten())
        .find_map(|status| status["state"]["terminated"]["exitCode"].as_i64());

    JobStatus { phase, exit_code }
}

#[async_trait]
impl KubernetesApi for KubectlCli {
    async fn apply(&self, manifest: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(manifest)?;
        self.run("apply manifest", &["apply", "-f", "-"], Some(bytes)).await.map(|_| ())
    }

    async fn job_status(&self, namespace: &str, name: &str) -> Result<Option<JobStatus>> {
        let job = self
            .run(
                "get job",
                &["get", "job", name, "-n", namespace, "-o", "json", "--ignore-not-found"],
                None,
            )
            .await?;
        if job.is_empty() {
            return Ok(None);
        }
        let job: Value = serde_json::from_str(&job)?;

        let selector = format!("job-name={}", name);
        let pods = self
            .run("get pods", &["get", "pods", "-n", namespace, "-l", selector.as_str(), "-o", "json"], None)
            .await?;
        let pods: Value = serde_json::from_str(&pods)?;

        Ok(Some(parse_job_status(&job, &pods)))
    }

    async fn follow_logs(&self, namespace: &str, job: &str) -> Result<mpsc::Receiver<LogLine>> {
        let target = format!("job/{}", job);
        let timeout = format!("--pod-running-timeout={}s", POD_RUNNING_TIMEOUT.as_secs());
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", timeout.as_str(), "-n", namespace, target.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Platform {
                operation: "follow logs",
                message: e.to_string(),
                image: String::new(),
            })?;

        // kubectl merges the container streams on its stdout; its own stderr
        // carries client diagnostics.
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let job = job.to_string();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(LogLine::stdout(line)).await.is_err() {
                        break;
                    }
                }
            }
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job = %job, message = %line, "kubectl logs");
                }
            }
            if let Err(e) = child.wait().await {
                warn!(job = %job, error = %e, "kubectl logs terminated abnormally");
            }
        });

        Ok(rx)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.run(
            "delete job",
            &[
                "delete",
                "job",
                name,
                "-n",
                namespace,
                "--cascade=foreground",
                "--ignore-not-found",
                "--wait=false",
            ],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.run(
            "delete secret",
            &["delete", "secret", name, "-n", namespace, "--ignore-not-found"],
            None,
        )
        .await
        .map(|_| ())
    }
}
