// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! [`DockerApi`] over the `docker` command line client.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::api::{ContainerState, DockerApi};
use super::template::ContainerSpec;
use crate::runtime::{LogLine, Result, RuntimeError};

const LOG_CHANNEL_CAPACITY: usize = 256;

/// Drives the Docker engine through the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Use the client at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Run a client command and return its stdout.
    async fn run(&self, operation: &'static str, args: &[String]) -> Result<String> {
        debug!(operation, args = ?args, "docker");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Platform {
                operation,
                message: format!("failed to run {}: {}", self.binary.display(), e),
                image: String::new(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(RuntimeError::Platform {
                operation,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                image: String::new(),
            })
        }
    }

    /// Like [`run`](Self::run), mapping "no such object" failures to `None`.
    async fn run_optional(&self, operation: &'static str, args: &[String]) -> Result<Option<String>> {
        match self.run(operation, args).await {
            Ok(stdout) => Ok(Some(stdout)),
            Err(RuntimeError::Platform { message, .. }) if is_not_found(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("no such") || message.contains("not found")
}

/// Arguments of `docker create` for a spec.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    for mount in &spec.mounts {
        let mut arg = format!(
            "type=bind,source={},target={}",
            mount.source.display(),
            mount.target.display()
        );
        if mount.read_only {
            arg.push_str(",readonly");
        }
        args.push("--mount".to_string());
        args.push(arg);
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    state: InspectedState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    status: String,
    exit_code: i64,
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<LogLine>, make: fn(String) -> LogLine) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(make(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read container output");
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl DockerApi for DockerCli {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let args = ["image", "inspect", "--format", "{{.Id}}", image].map(String::from);
        Ok(self.run_optional("inspect image", &args).await?.is_some())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let args = ["pull".to_string(), image.to_string()];
        self.run("pull image", &args).await.map(|_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let stdout = self.run("create container", &create_args(spec)).await?;
        stdout
            .lines()
            .last()
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::Platform {
                operation: "create container",
                message: "docker did not report a container id".to_string(),
                image: spec.image.clone(),
            })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let args = ["start".to_string(), id.to_string()];
        self.run("start container", &args).await.map(|_| ())
    }

    async fn follow_logs(&self, id: &str) -> Result<mpsc::Receiver<LogLine>> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", id])
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

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let stdout = child.stdout.take().map(|r| forward_lines(r, tx.clone(), LogLine::stdout));
        let stderr = child.stderr.take().map(|r| forward_lines(r, tx, LogLine::stderr));
        let container_id = id.to_string();

        tokio::spawn(async move {
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            if let Err(e) = child.wait().await {
                warn!(container_id = %container_id, error = %e, "docker logs terminated abnormally");
            }
        });

        Ok(rx)
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let args = ["wait".to_string(), id.to_string()];
        let stdout = self.run("wait container", &args).await?;
        stdout.trim().parse().map_err(|_| RuntimeError::Platform {
            operation: "wait container",
            message: format!("unexpected exit status '{}'", stdout),
            image: String::new(),
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>> {
        let args = ["container".to_string(), "inspect".to_string(), id.to_string()];
        let Some(stdout) = self.run_optional("inspect container", &args).await? else {
            return Ok(None);
        };
        let inspected: Vec<InspectedContainer> = serde_json::from_str(&stdout)?;
        Ok(inspected.into_iter().next().map(|c| ContainerState {
            status: c.state.status,
            exit_code: c.state.exit_code,
        }))
    }

    async fn container_networks(&self, id: &str) -> Result<Vec<String>> {
        let args = [
            "container",
            "inspect",
            "--format",
            "{{json .NetworkSettings.Networks}}",
            id,
        ]
        .map(String::from);
        let Some(stdout) = self.run_optional("inspect networks", &args).await? else {
            return Ok(Vec::new());
        };
        let networks: Value = serde_json::from_str(&stdout)?;
        Ok(networks
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let args = ["stop".to_string(), id.to_string()];
        self.run_optional("stop container", &args).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let args = ["rm".to_string(), "--force".to_string(), id.to_string()];
        self.run_optional("remove container", &args).await.map(|_| ())
    }
}
