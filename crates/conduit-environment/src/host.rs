// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable host for conduit-environment.
//!
//! [`Host`] wires the orchestration core to a runtime: it owns the resource
//! stores (in-memory unless provided), the correlation engine with its expiry
//! sweeper, and the [`InstanceScheduler`] scheduling instances on the runtime.
//!
//! ```rust,ignore
//! use conduit_environment::config::Config;
//! use conduit_environment::host::{Host, runtime_from_config};
//! use conduit_environment::secrets::DirectorySecretsManager;
//!
//! let config = Config::from_env()?;
//! let secrets = Arc::new(DirectorySecretsManager::new("/etc/conduit/secrets"));
//! let runtime = runtime_from_config(&config, secrets).await?;
//!
//! let host = Host::builder()
//!     .runtime(runtime)
//!     .scheduler_poll_interval(config.scheduler_poll_interval)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! host.commands().register_workflow(workflow).await?;
//! host.ingest(&event).await?;
//!
//! host.shutdown().await?;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conduit_core::correlation::{CorrelationEngine, IngestReport, StoreOutcomeRealizer, Trigger};
use conduit_core::definition::Workflow;
use conduit_core::execution::{InstanceCommands, LifecycleBus};
use conduit_core::instance::WorkflowInstance;
use conduit_core::runner::RuntimePlatform;
use conduit_core::{CoreConfig, Event, InMemoryStore, ResourceStore, ServiceAccount};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{Config, DEFAULT_SCHEDULER_POLL_SECS};
use crate::registry::ProcessRegistry;
use crate::runtime::WorkflowRuntime;
use crate::runtime::docker::{ContainerTemplate, DockerCli, DockerRuntime};
use crate::runtime::kubernetes::{
    KubectlCli, KubernetesRuntime, PodTemplate, SERVICE_ACCOUNT_NAMESPACE_PATH, in_cluster, resolve_namespace,
};
use crate::scheduler::{InstanceScheduler, SchedulerStores};
use crate::secrets::SecretsManager;

/// Build the runtime selected by `config`, driving the platform CLI.
pub async fn runtime_from_config(
    config: &Config,
    secrets: Arc<dyn SecretsManager>,
) -> crate::error::Result<Arc<dyn WorkflowRuntime>> {
    let settings = config.runtime_settings();
    let runtime: Arc<dyn WorkflowRuntime> = match config.runtime {
        RuntimePlatform::Docker => {
            let template = match &config.container_template {
                Some(path) => ContainerTemplate::load(path).await?,
                None => ContainerTemplate::default(),
            };
            Arc::new(
                DockerRuntime::new(Arc::new(DockerCli::default()), settings, secrets, &config.data_dir)
                    .with_template(template)
                    .with_network(config.docker_network.clone()),
            )
        }
        RuntimePlatform::Kubernetes => {
            let template = match &config.pod_template {
                Some(path) => PodTemplate::load(path).await?,
                None => PodTemplate::default(),
            };
            let namespace = resolve_namespace(
                config.kubernetes_namespace.as_deref(),
                in_cluster(),
                Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH),
            )
            .await;
            Arc::new(
                KubernetesRuntime::new(Arc::new(KubectlCli::default()), settings, secrets, namespace)
                    .with_template(template),
            )
        }
    };
    info!(platform = %runtime.platform(), image = %config.runner_image, "Runtime configured");
    Ok(runtime)
}

/// Builder for [`Host`].
pub struct HostBuilder {
    runtime: Option<Arc<dyn WorkflowRuntime>>,
    workflows: Option<Arc<dyn ResourceStore<Workflow>>>,
    instances: Option<Arc<dyn ResourceStore<WorkflowInstance>>>,
    triggers: Option<Arc<dyn ResourceStore<Trigger>>>,
    service_accounts: Option<Arc<dyn ResourceStore<ServiceAccount>>>,
    core: CoreConfig,
    scheduler_poll_interval: Duration,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self {
            runtime: None,
            workflows: None,
            instances: None,
            triggers: None,
            service_accounts: None,
            core: CoreConfig::default(),
            scheduler_poll_interval: Duration::from_secs(DEFAULT_SCHEDULER_POLL_SECS),
        }
    }
}

impl HostBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the runtime (required).
    pub fn runtime(mut self, runtime: Arc<dyn WorkflowRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the workflow store.
    pub fn workflows(mut self, store: Arc<dyn ResourceStore<Workflow>>) -> Self {
        self.workflows = Some(store);
        self
    }

    /// Set the instance store.
    pub fn instances(mut self, store: Arc<dyn ResourceStore<WorkflowInstance>>) -> Self {
        self.instances = Some(store);
        self
    }

    /// Set the trigger store.
    pub fn triggers(mut self, store: Arc<dyn ResourceStore<Trigger>>) -> Self {
        self.triggers = Some(store);
        self
    }

    /// Set the service account store.
    pub fn service_accounts(mut self, store: Arc<dyn ResourceStore<ServiceAccount>>) -> Self {
        self.service_accounts = Some(store);
        self
    }

    /// Set the core configuration.
    pub fn core_config(mut self, config: CoreConfig) -> Self {
        self.core = config;
        self
    }

    /// Set how often the scheduler reconciles instances.
    pub fn scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval = interval;
        self
    }

    /// Build the host configuration.
    pub fn build(self) -> Result<HostConfig> {
        let runtime = self.runtime.ok_or_else(|| anyhow::anyhow!("runtime is required"))?;

        Ok(HostConfig {
            runtime,
            workflows: self.workflows.unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            instances: self.instances.unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            triggers: self.triggers.unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            service_accounts: self.service_accounts.unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            core: self.core,
            scheduler_poll_interval: self.scheduler_poll_interval,
        })
    }
}

/// Configuration for a [`Host`].
pub struct HostConfig {
    runtime: Arc<dyn WorkflowRuntime>,
    workflows: Arc<dyn ResourceStore<Workflow>>,
    instances: Arc<dyn ResourceStore<WorkflowInstance>>,
    triggers: Arc<dyn ResourceStore<Trigger>>,
    service_accounts: Arc<dyn ResourceStore<ServiceAccount>>,
    core: CoreConfig,
    scheduler_poll_interval: Duration,
}

impl HostConfig {
    /// Start the host, spawning the scheduler and the expiry sweeper.
    pub async fn start(self) -> Result<Host> {
        let lifecycle = Arc::new(LifecycleBus::new(self.core.lifecycle_buffer));
        let commands = InstanceCommands::new(
            self.instances.clone(),
            self.workflows.clone(),
            self.triggers.clone(),
            lifecycle.clone(),
        );

        let realizer = Arc::new(StoreOutcomeRealizer::new(self.workflows.clone(), self.instances.clone()));
        let engine = Arc::new(CorrelationEngine::from_config(&self.core, self.triggers.clone(), realizer));

        let registry = Arc::new(ProcessRegistry::new());
        let scheduler = InstanceScheduler::new(
            SchedulerStores {
                instances: self.instances.clone(),
                workflows: self.workflows.clone(),
                service_accounts: self.service_accounts.clone(),
            },
            self.runtime.clone(),
            registry.clone(),
            commands.clone(),
            self.scheduler_poll_interval,
        );
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(scheduler.run());

        let sweeper_shutdown = Arc::new(Notify::new());
        let sweeper_handle = tokio::spawn(
            engine
                .clone()
                .run_expiry_sweeper(self.core.correlation_sweep_interval, sweeper_shutdown.clone()),
        );

        info!(platform = %self.runtime.platform(), "Host started");

        Ok(Host {
            commands,
            engine,
            lifecycle,
            registry,
            service_accounts: self.service_accounts,
            scheduler_handle,
            scheduler_shutdown,
            sweeper_handle,
            sweeper_shutdown,
        })
    }
}

/// A running host.
pub struct Host {
    commands: InstanceCommands,
    engine: Arc<CorrelationEngine>,
    lifecycle: Arc<LifecycleBus>,
    registry: Arc<ProcessRegistry>,
    service_accounts: Arc<dyn ResourceStore<ServiceAccount>>,
    scheduler_handle: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
    sweeper_handle: JoinHandle<()>,
    sweeper_shutdown: Arc<Notify>,
}

impl Host {
    /// Create a builder.
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Instance and workflow commands.
    pub fn commands(&self) -> &InstanceCommands {
        &self.commands
    }

    /// The correlation engine.
    pub fn engine(&self) -> &Arc<CorrelationEngine> {
        &self.engine
    }

    /// The lifecycle bus.
    pub fn lifecycle(&self) -> &Arc<LifecycleBus> {
        &self.lifecycle
    }

    /// Live runner processes.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// The service account store.
    pub fn service_accounts(&self) -> &Arc<dyn ResourceStore<ServiceAccount>> {
        &self.service_accounts
    }

    /// Route an inbound event through every trigger.
    pub async fn ingest(&self, event: &Event) -> conduit_core::Result<IngestReport> {
        self.engine.ingest(event).await
    }

    /// Gracefully shut down the host.
    pub async fn shutdown(self) -> Result<()> {
        info!("Host shutting down...");
        self.scheduler_shutdown.notify_one();
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.scheduler_handle.await {
            error!("Instance scheduler task panicked: {}", e);
        }
        if let Err(e) = self.sweeper_handle.await {
            error!("Expiry sweeper task panicked: {}", e);
        }
        info!("Host shutdown complete");
        Ok(())
    }

    /// Check if the host is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished() && !self.sweeper_handle.is_finished()
    }
}
