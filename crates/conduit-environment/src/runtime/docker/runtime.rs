// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker [`WorkflowRuntime`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::ServiceAccount;
use conduit_core::definition::Workflow;
use conduit_core::instance::WorkflowInstance;
use conduit_core::resource::Resource;
use conduit_core::runner::RuntimePlatform;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::api::DockerApi;
use super::process::DockerProcess;
use super::template::{ContainerTemplate, MountSpec};
use crate::runtime::env::runner_env;
use crate::runtime::{PullPolicy, Result, RuntimeError, RuntimeSettings, WorkflowProcess, WorkflowRuntime, unit_name};
use crate::secrets::{SecretsManager, workflow_secrets};

/// File Docker creates at the root of every container.
pub const DOCKERENV_PATH: &str = "/.dockerenv";

/// Label carrying the qualified name of the instance a container runs.
pub const INSTANCE_LABEL: &str = "conduit.io/instance";

/// Schedules runners as Docker containers.
pub struct DockerRuntime {
    api: Arc<dyn DockerApi>,
    settings: RuntimeSettings,
    secrets: Arc<dyn SecretsManager>,
    template: ContainerTemplate,
    data_dir: PathBuf,
    network_override: Option<String>,
    dockerenv_path: PathBuf,
    network: OnceCell<Option<String>>,
}

impl DockerRuntime {
    /// Create a runtime writing per-instance secrets under `data_dir`.
    pub fn new(
        api: Arc<dyn DockerApi>,
        settings: RuntimeSettings,
        secrets: Arc<dyn SecretsManager>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            settings,
            secrets,
            template: ContainerTemplate::default(),
            data_dir: data_dir.into(),
            network_override: None,
            dockerenv_path: PathBuf::from(DOCKERENV_PATH),
            network: OnceCell::new(),
        }
    }

    /// Use a container template.
    pub fn with_template(mut self, template: ContainerTemplate) -> Self {
        self.template = template;
        self
    }

    /// Attach runners to `network` instead of detecting one.
    pub fn with_network(mut self, network: Option<String>) -> Self {
        self.network_override = network;
        self
    }

    /// Path checked to detect that this process runs in a container.
    pub fn with_dockerenv_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dockerenv_path = path.into();
        self
    }

    async fn resolve_image(&self) -> Result<()> {
        let image = &self.settings.image;
        let pull = match self.settings.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => !self.api.image_exists(image).await.map_err(|e| e.with_image(image))?,
            PullPolicy::Never => {
                if !self.api.image_exists(image).await.map_err(|e| e.with_image(image))? {
                    return Err(RuntimeError::ImagePull {
                        image: image.clone(),
                        message: "image is not present and the pull policy is Never".to_string(),
                    });
                }
                false
            }
        };

        if pull {
            info!(image = %image, "Pulling runner image");
            self.api.pull_image(image).await.map_err(|e| RuntimeError::ImagePull {
                image: image.clone(),
                message: match e {
                    RuntimeError::Platform { message, .. } => message,
                    other => other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    /// Network runners join: the configured one, else the network of the
    /// container this process runs in, if any.
    async fn network(&self) -> Option<String> {
        if let Some(network) = &self.network_override {
            return Some(network.clone());
        }
        self.network
            .get_or_init(|| async { self.detect_network().await })
            .await
            .clone()
    }

    async fn detect_network(&self) -> Option<String> {
        if !tokio::fs::try_exists(&self.dockerenv_path).await.unwrap_or(false) {
            debug!("Not running inside a container, runners use the default network");
            return None;
        }
        let hostname = match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(error = %e, "Failed to read hostname for network detection");
                return None;
            }
        };
        match self.api.container_networks(&hostname).await {
            Ok(networks) => {
                let network = networks.into_iter().next();
                info!(container = %hostname, network = ?network, "Detected host container network");
                network
            }
            Err(e) => {
                warn!(container = %hostname, error = %e, "Failed to inspect host container networks");
                None
            }
        }
    }

    async fn write_secrets(&self, name: &str, secrets: &BTreeMap<String, String>) -> Result<Option<PathBuf>> {
        if secrets.is_empty() {
            return Ok(None);
        }
        let dir = self.data_dir.join("secrets").join(name);
        tokio::fs::create_dir_all(&dir).await?;
        for (key, value) in secrets {
            tokio::fs::write(dir.join(key), value).await?;
        }
        restrict(&dir).await?;
        Ok(Some(tokio::fs::canonicalize(&dir).await?))
    }
}

#[cfg(unix)]
async fn restrict(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict(_dir: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl WorkflowRuntime for DockerRuntime {
    fn platform(&self) -> RuntimePlatform {
        RuntimePlatform::Docker
    }

    #[instrument(skip_all, fields(instance_id = %instance.id(), image = %self.settings.image))]
    async fn create_process(
        &self,
        workflow: &Workflow,
        instance: &WorkflowInstance,
        service_account: &ServiceAccount,
    ) -> Result<Arc<dyn WorkflowProcess>> {
        self.resolve_image().await?;

        let secrets = workflow_secrets(self.secrets.as_ref(), workflow).await?;
        let name = unit_name(instance, instance.status.runs.len());
        let secrets_dir = self.write_secrets(&name, &secrets).await?;
        let mount = secrets_dir.as_ref().map(|dir| MountSpec {
            source: dir.clone(),
            target: self.settings.secrets_directory.clone(),
            read_only: true,
        });

        let env = runner_env(&self.settings, RuntimePlatform::Docker, instance, service_account);
        let network = self.network().await;

        let created = async {
            let mut spec = self.template.render(&name, &self.settings.image, env, mount, network)?;
            spec.labels.insert(INSTANCE_LABEL.to_string(), instance.id());
            self.api
                .create_container(&spec)
                .await
                .map_err(|e| e.with_image(&self.settings.image))
        }
        .await;

        let id = match created {
            Ok(id) => id,
            Err(e) => {
                if let Some(dir) = &secrets_dir {
                    let _ = tokio::fs::remove_dir_all(dir).await;
                }
                return Err(e);
            }
        };

        info!(container_id = %id, name = %name, "Container created");
        Ok(Arc::new(DockerProcess::new(
            id,
            self.settings.image.clone(),
            self.api.clone(),
            secrets_dir,
        )))
    }
}
