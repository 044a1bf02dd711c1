// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A runner container.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::DockerApi;
use crate::runtime::output::LOG_DRAIN_TIMEOUT;
use crate::runtime::{ProcessOutput, Result, STOPPED_EXIT_CODE, WorkflowProcess};

/// A container created by [`DockerRuntime`](super::DockerRuntime).
pub struct DockerProcess {
    id: String,
    image: String,
    api: Arc<dyn DockerApi>,
    output: Arc<ProcessOutput>,
    secrets_dir: Option<PathBuf>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    released: Mutex<bool>,
}

impl DockerProcess {
    /// Wrap a created container.
    pub fn new(id: String, image: String, api: Arc<dyn DockerApi>, secrets_dir: Option<PathBuf>) -> Self {
        Self {
            id,
            image,
            api,
            output: Arc::new(ProcessOutput::new()),
            secrets_dir,
            monitor: Mutex::new(None),
            released: Mutex::new(false),
        }
    }

    /// Host directory holding the mounted secrets.
    pub fn secrets_dir(&self) -> Option<&PathBuf> {
        self.secrets_dir.as_ref()
    }
}

#[async_trait]
impl WorkflowProcess for DockerProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        self.api
            .start_container(&self.id)
            .await
            .map_err(|e| e.with_image(&self.image))?;
        let logs = self.api.follow_logs(&self.id).await.map_err(|e| e.with_image(&self.image))?;
        info!(container_id = %self.id, image = %self.image, "Container started");

        let api = self.api.clone();
        let output = self.output.clone();
        let id = self.id.clone();
        let handle = tokio::spawn(async move {
            let pump = {
                let output = output.clone();
                tokio::spawn(async move { output.pump(logs).await })
            };
            match api.wait_container(&id).await {
                Ok(code) => {
                    if tokio::time::timeout(LOG_DRAIN_TIMEOUT, pump).await.is_err() {
                        debug!(container_id = %id, "Output still open after exit");
                    }
                    output.resolve(code);
                    debug!(container_id = %id, exit_code = code, "Container exited");
                }
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Failed to wait for container");
                    output.resolve(STOPPED_EXIT_CODE);
                }
            }
        });
        *self.monitor.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut released = self.released.lock().await;
        if *released {
            return Ok(());
        }

        self.api
            .stop_container(&self.id)
            .await
            .map_err(|e| e.with_image(&self.image))?;

        if !self.output.is_resolved() {
            match self.api.inspect_container(&self.id).await {
                Ok(Some(state)) if state.is_terminal() => {
                    self.output.resolve(state.exit_code);
                }
                Ok(_) => {}
                Err(e) => warn!(container_id = %self.id, error = %e, "Failed to inspect stopped container"),
            }
        }

        self.api
            .remove_container(&self.id)
            .await
            .map_err(|e| e.with_image(&self.image))?;

        if let Some(dir) = &self.secrets_dir {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }
        if self.output.resolve(STOPPED_EXIT_CODE) {
            debug!(container_id = %self.id, exit_code = STOPPED_EXIT_CODE, "Container removed before it exited");
        }
        *released = true;
        info!(container_id = %self.id, "Container removed");
        Ok(())
    }

    fn stdout(&self) -> broadcast::Receiver<String> {
        self.output.stdout()
    }

    fn stderr(&self) -> broadcast::Receiver<String> {
        self.output.stderr()
    }

    fn exit_code(&self) -> watch::Receiver<Option<i64>> {
        self.output.exit_code()
    }
}
