// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes [`WorkflowRuntime`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::ServiceAccount;
use conduit_core::definition::Workflow;
use conduit_core::instance::WorkflowInstance;
use conduit_core::resource::Resource;
use conduit_core::runner::RuntimePlatform;
use tracing::{debug, info, instrument};

use super::api::KubernetesApi;
use super::process::{DEFAULT_STATUS_POLL_INTERVAL, KubernetesProcess};
use super::template::{JobParams, PodTemplate, secret_manifest};
use crate::runtime::docker::INSTANCE_LABEL;
use crate::runtime::env::runner_env;
use crate::runtime::{Result, RuntimeSettings, WorkflowProcess, WorkflowRuntime, unit_name};
use crate::secrets::{SecretsManager, workflow_secrets};

/// Namespace file mounted into every pod with a service account token.
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Label values must be at most 63 characters.
const MAX_LABEL_VALUE: usize = 63;

/// Whether this process runs inside a Kubernetes pod.
pub fn in_cluster() -> bool {
    std::env::var("KUBERNETES_SERVICE_HOST").is_ok_and(|host| !host.is_empty())
}

/// Namespace runner Jobs are created in.
///
/// The configured namespace wins; inside a cluster the pod's own namespace is
/// used; otherwise `default`.
pub async fn resolve_namespace(configured: Option<&str>, in_cluster: bool, namespace_file: &Path) -> String {
    if let Some(namespace) = configured {
        return namespace.to_string();
    }
    if in_cluster {
        match tokio::fs::read_to_string(namespace_file).await {
            Ok(namespace) if !namespace.trim().is_empty() => return namespace.trim().to_string(),
            Ok(_) => {}
            Err(e) => debug!(path = %namespace_file.display(), error = %e, "No pod namespace file"),
        }
    }
    "default".to_string()
}

/// Schedules runners as Kubernetes Jobs.
pub struct KubernetesRuntime {
    api: Arc<dyn KubernetesApi>,
    settings: RuntimeSettings,
    secrets: Arc<dyn SecretsManager>,
    template: PodTemplate,
    namespace: String,
    poll_interval: Duration,
}

impl KubernetesRuntime {
    /// Create a runtime scheduling into `namespace`.
    ///
    /// The image pull policy is handed to the kubelet as `imagePullPolicy`.
    pub fn new(
        api: Arc<dyn KubernetesApi>,
        settings: RuntimeSettings,
        secrets: Arc<dyn SecretsManager>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api,
            settings,
            secrets,
            template: PodTemplate::default(),
            namespace: namespace.into(),
            poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
        }
    }

    /// Use a pod template.
    pub fn with_template(mut self, template: PodTemplate) -> Self {
        self.template = template;
        self
    }

    /// Poll Job status at `interval`.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Namespace runner Jobs are created in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn label_value(value: &str) -> String {
    let mut value: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .collect();
    value.truncate(MAX_LABEL_VALUE);
    value.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

#[async_trait]
impl WorkflowRuntime for KubernetesRuntime {
    fn platform(&self) -> RuntimePlatform {
        RuntimePlatform::Kubernetes
    }

    #[instrument(skip_all, fields(instance_id = %instance.id(), namespace = %self.namespace))]
    async fn create_process(
        &self,
        workflow: &Workflow,
        instance: &WorkflowInstance,
        service_account: &ServiceAccount,
    ) -> Result<Arc<dyn WorkflowProcess>> {
        let name = unit_name(instance, instance.status.runs.len());
        let labels = BTreeMap::from([(INSTANCE_LABEL.to_string(), label_value(&instance.id()))]);

        let secrets = workflow_secrets(self.secrets.as_ref(), workflow).await?;
        let secret = (!secrets.is_empty()).then(|| name.clone());

        let env = runner_env(&self.settings, RuntimePlatform::Kubernetes, instance, service_account);
        let manifest = self.template.render(JobParams {
            name: &name,
            namespace: &self.namespace,
            image: &self.settings.image,
            pull_policy: self.settings.pull_policy,
            env,
            secret: secret.as_deref(),
            secrets_directory: &self.settings.secrets_directory,
            labels: labels.clone(),
        })?;

        if let Some(secret) = &secret {
            self.api
                .apply(&secret_manifest(secret, &self.namespace, &secrets, &labels))
                .await
                .map_err(|e| e.with_image(&self.settings.image))?;
            debug!(secret = %secret, count = secrets.len(), "Secret created");
        }

        info!(job = %name, "Job prepared");
        Ok(Arc::new(
            KubernetesProcess::new(
                name,
                self.namespace.clone(),
                self.settings.image.clone(),
                manifest,
                secret,
                self.api.clone(),
            )
            .with_poll_interval(self.poll_interval),
        ))
    }
}
