// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A runner Job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::KubernetesApi;
use crate::runtime::output::LOG_DRAIN_TIMEOUT;
use crate::runtime::{ProcessOutput, Result, STOPPED_EXIT_CODE, WorkflowProcess};

/// Default interval between Job status polls.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A Job created by [`KubernetesRuntime`](super::KubernetesRuntime).
///
/// The Job itself is applied on [`start`](WorkflowProcess::start); the Secret
/// holding the mounted workflow secrets already exists at that point.
pub struct KubernetesProcess {
    name: String,
    namespace: String,
    image: String,
    manifest: Value,
    secret: Option<String>,
    api: Arc<dyn KubernetesApi>,
    output: Arc<ProcessOutput>,
    poll_interval: Duration,
    monitor: Mutex<Option<JoinHandle<()>>>,
    released: Mutex<bool>,
}

impl KubernetesProcess {
    /// Wrap a rendered Job.
    pub fn new(
        name: String,
        namespace: String,
        image: String,
        manifest: Value,
        secret: Option<String>,
        api: Arc<dyn KubernetesApi>,
    ) -> Self {
        Self {
            name,
            namespace,
            image,
            manifest,
            secret,
            api,
            output: Arc::new(ProcessOutput::new()),
            poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            monitor: Mutex::new(None),
            released: Mutex::new(false),
        }
    }

    /// Poll the Job status at `interval`.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Namespace of the Job.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The Job manifest.
    pub fn manifest(&self) -> &Value {
        &self.manifest
    }

    /// Delete the Secret of a Job that never started.
    async fn release_secret(&self) {
        let Some(secret) = &self.secret else {
            return;
        };
        match self.api.delete_secret(&self.namespace, secret).await {
            Ok(()) => debug!(job = %self.name, secret = %secret, "Secret deleted after start failure"),
            Err(e) => warn!(job = %self.name, secret = %secret, error = %e, "Failed to delete secret after start failure"),
        }
    }
}

#[async_trait]
impl WorkflowProcess for KubernetesProcess {
    fn id(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        if let Err(e) = self.api.apply(&self.manifest).await {
            self.release_secret().await;
            return Err(e.with_image(&self.image));
        }
        let logs = match self.api.follow_logs(&self.namespace, &self.name).await {
            Ok(logs) => logs,
            Err(e) => {
                if let Err(delete) = self.api.delete_job(&self.namespace, &self.name).await {
                    warn!(job = %self.name, error = %delete, "Failed to delete job after start failure");
                }
                self.release_secret().await;
                return Err(e.with_image(&self.image));
            }
        };
        info!(job = %self.name, namespace = %self.namespace, image = %self.image, "Job created");

        let api = self.api.clone();
        let output = self.output.clone();
        let name = self.name.clone();
        let namespace = self.namespace.clone();
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let pump = {
                let output = output.clone();
                tokio::spawn(async move { output.pump(logs).await })
            };
            loop {
                match api.job_status(&namespace, &name).await {
                    Ok(Some(status)) => {
                        if let Some(code) = status.resolved_exit_code() {
                            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, pump).await.is_err() {
                                debug!(job = %name, "Output still open after completion");
                            }
                            output.resolve(code);
                            debug!(job = %name, exit_code = code, phase = ?status.phase, "Job finished");
                            return;
                        }
                    }
                    Ok(None) => {
                        warn!(job = %name, "Job disappeared before reaching a terminal state");
                        output.resolve(STOPPED_EXIT_CODE);
                        return;
                    }
                    Err(e) => warn!(job = %name, error = %e, "Failed to read job status"),
                }
                tokio::time::sleep(poll_interval).await;
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

        if !self.output.is_resolved() {
            match self.api.job_status(&self.namespace, &self.name).await {
                Ok(Some(status)) => {
                    if let Some(code) = status.resolved_exit_code() {
                        self.output.resolve(code);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(job = %self.name, error = %e, "Failed to read job status before delete"),
            }
        }

        self.api
            .delete_job(&self.namespace, &self.name)
            .await
            .map_err(|e| e.with_image(&self.image))?;
        if let Some(secret) = &self.secret {
            self.api
                .delete_secret(&self.namespace, secret)
                .await
                .map_err(|e| e.with_image(&self.image))?;
        }

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }
        if self.output.resolve(STOPPED_EXIT_CODE) {
            debug!(job = %self.name, exit_code = STOPPED_EXIT_CODE, "Job deleted before it finished");
        }
        *released = true;
        info!(job = %self.name, namespace = %self.namespace, "Job deleted");
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
