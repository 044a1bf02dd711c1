// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime module - platform backends for runner processes.
//!
//! A [`WorkflowRuntime`] turns a `(workflow, instance, service account)`
//! triple into a [`WorkflowProcess`]: an isolated unit on the platform
//! (a Docker container or a Kubernetes Job) running the runner image with the
//! runner environment contract injected and the workflow's secrets mounted
//! read-only.
//!
//! Creation failures (image pull, invalid spec, platform API errors) are
//! returned to the caller as [`RuntimeError`]s. Nothing here retries.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::ServiceAccount;
use conduit_core::definition::Workflow;
use conduit_core::instance::WorkflowInstance;
use conduit_core::runner::RuntimePlatform;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

pub mod docker;
pub mod env;
pub mod kubernetes;
pub mod mock;
mod output;

pub use output::{LogLine, LogStream, ProcessOutput, STOPPED_EXIT_CODE};

/// Errors from runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The runner image could not be resolved.
    #[error("Failed to pull image {image}: {message}")]
    ImagePull {
        /// Image reference.
        image: String,
        /// Platform message.
        message: String,
    },

    /// The rendered container or pod spec is invalid.
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// A platform API call failed.
    #[error("{operation} failed for image {image}: {message}")]
    Platform {
        /// The failed operation.
        operation: &'static str,
        /// Platform message.
        message: String,
        /// Runner image of the unit.
        image: String,
    },

    /// A secret declared by the workflow does not exist.
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Attach the unit's image to a platform error that lacks one.
    pub fn with_image(self, image: &str) -> Self {
        match self {
            RuntimeError::Platform {
                operation,
                message,
                image: current,
            } if current.is_empty() => RuntimeError::Platform {
                operation,
                message,
                image: image.to_string(),
            },
            other => other,
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Image resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PullPolicy {
    /// Pull before every run.
    Always,
    /// Pull only when the image is not present locally.
    #[default]
    IfNotPresent,
    /// Never pull; the image must be present.
    Never,
}

impl PullPolicy {
    /// Name as used by Kubernetes `imagePullPolicy`.
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

impl FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(PullPolicy::Always),
            "ifnotpresent" | "if-not-present" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            other => Err(format!("unknown pull policy '{}'", other)),
        }
    }
}

/// Settings shared by the Docker and Kubernetes runtimes.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Runner image.
    pub image: String,
    /// Image pull policy.
    pub pull_policy: PullPolicy,
    /// API base URI handed to runners.
    pub api_uri: String,
    /// Secrets mount path inside the runner.
    pub secrets_directory: PathBuf,
    /// Skip TLS certificate validation in runners.
    pub skip_certificate_validation: bool,
}

/// Builds processes on a platform.
#[async_trait]
pub trait WorkflowRuntime: Send + Sync {
    /// Platform this runtime schedules on.
    fn platform(&self) -> RuntimePlatform;

    /// Create (but not start) a process running `instance`.
    async fn create_process(
        &self,
        workflow: &Workflow,
        instance: &WorkflowInstance,
        service_account: &ServiceAccount,
    ) -> Result<Arc<dyn WorkflowProcess>>;
}

/// A runner process on a platform.
///
/// `stdout` and `stderr` are live: lines are delivered as the platform
/// produces them, and a receiver only sees lines emitted after it subscribed.
#[async_trait]
pub trait WorkflowProcess: Send + Sync {
    /// Process id (container id or Job name).
    fn id(&self) -> &str;

    /// Start the unit.
    async fn start(&self) -> Result<()>;

    /// Stop the unit and release its platform resources. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Standard output lines.
    fn stdout(&self) -> broadcast::Receiver<String>;

    /// Standard error lines.
    fn stderr(&self) -> broadcast::Receiver<String>;

    /// Exit code, `None` until the unit reached a terminal state.
    fn exit_code(&self) -> watch::Receiver<Option<i64>>;

    /// Wait until the unit is terminal and return its exit code.
    ///
    /// Returns `None` if the process was dropped before an exit code was
    /// resolved.
    async fn wait_for_exit(&self) -> Option<i64> {
        let mut exit_code = self.exit_code();
        exit_code.wait_for(Option::is_some).await.ok().and_then(|code| *code)
    }
}

/// Platform-safe unit name for an instance.
///
/// Lowercase, at most 63 characters, unique per instance and attempt.
pub fn unit_name(instance: &WorkflowInstance, attempt: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instance.metadata.qualified_name().as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    let suffix: String = digest.iter().take(5).map(|b| format!("{:02x}", b)).collect();

    let mut prefix: String = instance
        .metadata
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    prefix.truncate(40);
    let prefix = prefix.trim_matches('-');
    if prefix.is_empty() {
        format!("conduit-{}", suffix)
    } else {
        format!("conduit-{}-{}", prefix, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::ResourceMetadata;
    use conduit_core::definition::WorkflowReference;
    use serde_json::json;

    fn instance(name: &str) -> WorkflowInstance {
        WorkflowInstance::new(
            ResourceMetadata::new(name, "default"),
            WorkflowReference {
                name: "greet".to_string(),
                namespace: "default".to_string(),
                version: "1.0.0".to_string(),
            },
            json!({}),
        )
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("Always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("ifnotpresent".parse::<PullPolicy>().unwrap(), PullPolicy::IfNotPresent);
        assert_eq!("Never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert!("sometimes".parse::<PullPolicy>().is_err());
        assert_eq!(PullPolicy::IfNotPresent.as_str(), "IfNotPresent");
    }

    #[test]
    fn test_unit_name_is_platform_safe() {
        let name = unit_name(&instance("Order_Fulfilment.v2"), 0);
        assert!(name.starts_with("conduit-order-fulfilment-v2-"));
        assert!(name.len() <= 63);
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));

        let long = unit_name(&instance(&"x".repeat(200)), 0);
        assert!(long.len() <= 63);
    }

    #[test]
    fn test_unit_name_differs_per_attempt() {
        let instance = instance("greet-1");
        assert_ne!(unit_name(&instance, 0), unit_name(&instance, 1));
        assert_eq!(unit_name(&instance, 0), unit_name(&instance, 0));
    }
}
