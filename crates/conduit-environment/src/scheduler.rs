// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance scheduler.
//!
//! Periodically reconciles workflow instances with runner processes:
//!
//! - a Pending instance that never ran gets a process on the configured
//!   runtime, and the run is recorded on the instance
//! - a Cancelled instance with a live process has that process stopped
//!
//! Pending instances found in one pass are scheduled concurrently, so a slow
//! image pull does not hold back the rest of the queue.
//!
//! Each started process is watched by a monitor task that mirrors its output
//! into tracing, records the exit code on the instance and removes the
//! process from the platform.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_core::definition::Workflow;
use conduit_core::execution::{InstanceCommands, WorkflowCommand};
use conduit_core::instance::{WorkflowInstance, WorkflowPhase};
use conduit_core::{ProblemDetails, Resource, ResourceStore, ServiceAccount};
use futures::future::join_all;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::registry::ProcessRegistry;
use crate::runtime::{WorkflowProcess, WorkflowRuntime};

/// Label selecting the service account an instance runs as.
pub const SERVICE_ACCOUNT_LABEL: &str = "conduit.io/service-account";

/// Service account used when an instance does not select one.
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Resource stores the scheduler reads and writes.
#[derive(Clone)]
pub struct SchedulerStores {
    /// Workflow instances.
    pub instances: Arc<dyn ResourceStore<WorkflowInstance>>,
    /// Workflow definitions.
    pub workflows: Arc<dyn ResourceStore<Workflow>>,
    /// Service accounts.
    pub service_accounts: Arc<dyn ResourceStore<ServiceAccount>>,
}

/// Schedules instances onto a runtime.
pub struct InstanceScheduler {
    stores: SchedulerStores,
    runtime: Arc<dyn WorkflowRuntime>,
    registry: Arc<ProcessRegistry>,
    commands: InstanceCommands,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
    monitors: CancellationToken,
    scheduling: Mutex<HashSet<String>>,
}

impl InstanceScheduler {
    /// Create a scheduler.
    pub fn new(
        stores: SchedulerStores,
        runtime: Arc<dyn WorkflowRuntime>,
        registry: Arc<ProcessRegistry>,
        commands: InstanceCommands,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stores,
            runtime,
            registry,
            commands,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
            monitors: CancellationToken::new(),
            scheduling: Mutex::new(HashSet::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// The process registry.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Run the scheduler loop.
    ///
    /// On shutdown, monitors stop observing their processes; the processes
    /// themselves keep running.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            platform = %self.runtime.platform(),
            "Instance scheduler started"
        );

        let mut changes = self.stores.instances.watch();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Instance scheduler shutting down");
                    break;
                }
                change = changes.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = change {
                        changes = self.stores.instances.watch();
                    }
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Failed to reconcile instances");
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Failed to reconcile instances");
                    }
                }
            }
        }
        self.monitors.cancel();
    }

    /// Schedule pending instances and stop the processes of cancelled ones.
    ///
    /// Returns the number of processes started.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut pending = Vec::new();
        for instance in self.stores.instances.list(None).await? {
            let instance_id = instance.id();
            match instance.status.phase {
                WorkflowPhase::Pending => {
                    if !instance.status.runs.is_empty() || !self.registry.find_by_instance(&instance_id).await.is_empty() {
                        continue;
                    }
                    pending.push(instance);
                }
                WorkflowPhase::Cancelled => {
                    for entry in self.registry.find_by_instance(&instance_id).await {
                        info!(instance_id = %instance_id, process_id = %entry.process.id(), "Stopping process of cancelled instance");
                        if let Err(e) = entry.process.stop().await {
                            warn!(instance_id = %instance_id, error = %e, "Failed to stop process");
                            continue;
                        }
                        self.registry.remove(entry.process.id()).await;
                    }
                }
                _ => {}
            }
        }

        let scheduled = join_all(pending.iter().map(|instance| async move {
            let instance_id = instance.id();
            let Some(_claim) = Claim::acquire(&self.scheduling, &instance_id) else {
                debug!(instance_id = %instance_id, "Instance is already being scheduled");
                return false;
            };
            if !self.registry.find_by_instance(&instance_id).await.is_empty() {
                return false;
            }
            match self.schedule(instance).await {
                Ok(()) => true,
                Err(e) => {
                    self.fault(&instance_id, &e).await;
                    false
                }
            }
        }))
        .await;
        Ok(scheduled.into_iter().filter(|started| *started).count())
    }

    async fn schedule(&self, instance: &WorkflowInstance) -> Result<()> {
        let instance_id = instance.id();
        let reference = &instance.spec.definition;
        let workflow = self
            .stores
            .workflows
            .find(&reference.id())
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(reference.to_string()))?;

        let account_name = instance
            .metadata
            .labels
            .get(SERVICE_ACCOUNT_LABEL)
            .map(String::as_str)
            .unwrap_or(DEFAULT_SERVICE_ACCOUNT);
        let account_id = format!("{}.{}", account_name, instance.metadata.namespace);
        let account = self
            .stores
            .service_accounts
            .find(&account_id)
            .await?
            .ok_or(Error::ServiceAccountNotFound(account_id))?;

        let process = self.runtime.create_process(&workflow, instance, &account).await?;
        let process_id = process.id().to_string();
        self.registry.insert(instance_id.clone(), process.clone()).await;

        // Subscribe before starting so no output is missed.
        let stdout = process.stdout();
        let stderr = process.stderr();

        let recorded = async {
            process.start().await?;
            self.commands
                .apply(
                    &instance_id,
                    WorkflowCommand::RecordRun {
                        process_id: process_id.clone(),
                    },
                )
                .await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = recorded {
            self.registry.remove(&process_id).await;
            if let Err(stop_error) = process.stop().await {
                warn!(process_id = %process_id, error = %stop_error, "Failed to release process");
            }
            return Err(e);
        }

        info!(instance_id = %instance_id, process_id = %process_id, "Scheduled workflow instance");
        tokio::spawn(monitor(
            process,
            instance_id,
            stdout,
            stderr,
            self.commands.clone(),
            self.registry.clone(),
            self.monitors.child_token(),
        ));
        Ok(())
    }

    async fn fault(&self, instance_id: &str, error: &Error) {
        error!(instance_id = %instance_id, error = %error, "Failed to schedule workflow instance");
        let problem = if error.is_configuration() {
            ProblemDetails::configuration(error.to_string())
        } else {
            ProblemDetails::runtime(error.to_string())
        }
        .with_instance(instance_id);
        if let Err(e) = self
            .commands
            .apply(instance_id, WorkflowCommand::SetError { error: problem })
            .await
        {
            warn!(instance_id = %instance_id, error = %e, "Failed to record scheduling error");
        }
    }
}

/// Marks an instance as being scheduled until dropped.
struct Claim<'a> {
    scheduling: &'a Mutex<HashSet<String>>,
    instance_id: String,
}

impl<'a> Claim<'a> {
    fn acquire(scheduling: &'a Mutex<HashSet<String>>, instance_id: &str) -> Option<Self> {
        let mut claimed = scheduling.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.insert(instance_id.to_string()).then(|| Self {
            scheduling,
            instance_id: instance_id.to_string(),
        })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.scheduling
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.instance_id);
    }
}

fn log_line(process_id: &str, stream: &'static str, line: &str) {
    info!(process_id = %process_id, stream, "{}", line);
}

fn drain(lines: &mut broadcast::Receiver<String>, process_id: &str, stream: &'static str) {
    while let Ok(line) = lines.try_recv() {
        log_line(process_id, stream, &line);
    }
}

async fn monitor(
    process: Arc<dyn WorkflowProcess>,
    instance_id: String,
    mut stdout: broadcast::Receiver<String>,
    mut stderr: broadcast::Receiver<String>,
    commands: InstanceCommands,
    registry: Arc<ProcessRegistry>,
    cancel: CancellationToken,
) {
    let process_id = process.id().to_string();
    let mut exit = process.exit_code();
    let exit_code = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(process_id = %process_id, "Process monitor cancelled");
                return;
            }
            Ok(line) = stdout.recv() => log_line(&process_id, "stdout", &line),
            Ok(line) = stderr.recv() => log_line(&process_id, "stderr", &line),
            code = async { exit.wait_for(Option::is_some).await.ok().and_then(|code| *code) } => break code,
        }
    };
    drain(&mut stdout, &process_id, "stdout");
    drain(&mut stderr, &process_id, "stderr");

    let Some(exit_code) = exit_code else {
        warn!(process_id = %process_id, "Process ended without an exit code");
        return;
    };
    info!(instance_id = %instance_id, process_id = %process_id, exit_code, "Process exited");

    match commands
        .apply(
            &instance_id,
            WorkflowCommand::RecordExit {
                process_id: process_id.clone(),
                exit_code,
            },
        )
        .await
    {
        Ok(instance) if !instance.status.phase.is_terminal() => {
            let detail = if exit_code == 0 {
                "Runner process exited before the instance finished".to_string()
            } else {
                format!("Runner process exited with code {}", exit_code)
            };
            let problem = ProblemDetails::runtime(detail).with_instance(instance_id.clone());
            if let Err(e) = commands.apply(&instance_id, WorkflowCommand::SetError { error: problem }).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to record runner failure");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(instance_id = %instance_id, error = %e, "Failed to record process exit"),
    }

    if let Err(e) = process.stop().await {
        warn!(process_id = %process_id, error = %e, "Failed to release process");
    }
    registry.remove(&process_id).await;
}
