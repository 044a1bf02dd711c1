// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment contract between the runtime layer and spawned runners.
//!
//! The runtime injects these variables into every container or pod it
//! schedules; the runner reads them back with [`RunnerConfig::from_env`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Base URI of the API the runner reports to.
pub const ENV_API_URI: &str = "CONDUIT_API_URI";
/// Name of the service account the runner authenticates as.
pub const ENV_SERVICE_ACCOUNT_NAME: &str = "CONDUIT_SERVICEACCOUNT_NAME";
/// Key of the service account.
pub const ENV_SERVICE_ACCOUNT_KEY: &str = "CONDUIT_SERVICEACCOUNT_KEY";
/// Directory the workflow's secrets are mounted into.
pub const ENV_SECRETS_DIRECTORY: &str = "CONDUIT_SECRETS_DIRECTORY";
/// Qualified name of the workflow instance to run.
pub const ENV_WORKFLOW_INSTANCE: &str = "CONDUIT_WORKFLOW_INSTANCE";
/// Platform the runner is hosted on.
pub const ENV_RUNTIME_PLATFORM: &str = "CONDUIT_RUNTIME_PLATFORM";
/// Whether to skip TLS certificate validation.
pub const ENV_SKIP_CERTIFICATE_VALIDATION: &str = "CONDUIT_SKIP_CERTIFICATE_VALIDATION";

/// Default secrets mount path inside a runner.
pub const DEFAULT_SECRETS_DIRECTORY: &str = "/run/secrets/conduit";

/// Container platform hosting runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimePlatform {
    /// Docker engine.
    Docker,
    /// Kubernetes cluster.
    Kubernetes,
}

impl RuntimePlatform {
    /// Identifier injected into runners.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for RuntimePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimePlatform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            _ => Err(ConfigError::Invalid(ENV_RUNTIME_PLATFORM, "must be 'docker' or 'kubernetes'")),
        }
    }
}

/// Parse a boolean flag the way every `CONDUIT_*` flag is parsed.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Configuration a runner reads from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// API base URI.
    pub api_uri: String,
    /// Service account name.
    pub service_account_name: String,
    /// Service account key.
    pub service_account_key: String,
    /// Mounted secrets directory.
    pub secrets_directory: PathBuf,
    /// Qualified name of the instance to run.
    pub workflow_instance: String,
    /// Hosting platform.
    pub platform: RuntimePlatform,
    /// Skip TLS certificate validation.
    pub skip_certificate_validation: bool,
}

impl RunnerConfig {
    /// Load the runner contract from environment variables.
    ///
    /// Required: `CONDUIT_API_URI`, `CONDUIT_SERVICEACCOUNT_NAME`,
    /// `CONDUIT_SERVICEACCOUNT_KEY`, `CONDUIT_WORKFLOW_INSTANCE`,
    /// `CONDUIT_RUNTIME_PLATFORM`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let required = |name: &'static str| std::env::var(name).map_err(|_| ConfigError::Missing(name));

        Ok(Self {
            api_uri: required(ENV_API_URI)?,
            service_account_name: required(ENV_SERVICE_ACCOUNT_NAME)?,
            service_account_key: required(ENV_SERVICE_ACCOUNT_KEY)?,
            secrets_directory: PathBuf::from(
                std::env::var(ENV_SECRETS_DIRECTORY).unwrap_or_else(|_| DEFAULT_SECRETS_DIRECTORY.to_string()),
            ),
            workflow_instance: required(ENV_WORKFLOW_INSTANCE)?,
            platform: required(ENV_RUNTIME_PLATFORM)?.parse()?,
            skip_certificate_validation: std::env::var(ENV_SKIP_CERTIFICATE_VALIDATION)
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        })
    }

    /// Render the contract as environment variable pairs.
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_API_URI.to_string(), self.api_uri.clone()),
            (ENV_SERVICE_ACCOUNT_NAME.to_string(), self.service_account_name.clone()),
            (ENV_SERVICE_ACCOUNT_KEY.to_string(), self.service_account_key.clone()),
            (
                ENV_SECRETS_DIRECTORY.to_string(),
                self.secrets_directory.display().to_string(),
            ),
            (ENV_WORKFLOW_INSTANCE.to_string(), self.workflow_instance.clone()),
            (ENV_RUNTIME_PLATFORM.to_string(), self.platform.to_string()),
            (
                ENV_SKIP_CERTIFICATE_VALIDATION.to_string(),
                self.skip_certificate_validation.to_string(),
            ),
        ]
    }
}
