// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for conduit-environment.

use std::path::PathBuf;
use std::time::Duration;

use conduit_core::runner::{DEFAULT_SECRETS_DIRECTORY, RuntimePlatform, parse_flag};

use crate::runtime::{PullPolicy, RuntimeSettings};

/// Default runner image.
pub const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/conduit-workflows/runner:latest";

/// Default scheduler poll interval in seconds.
pub const DEFAULT_SCHEDULER_POLL_SECS: u64 = 5;

/// Environment configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Platform runner processes are scheduled on
    pub runtime: RuntimePlatform,
    /// API base URI handed to runners
    pub api_uri: String,
    /// Runner image
    pub runner_image: String,
    /// Image pull policy
    pub pull_policy: PullPolicy,
    /// Skip TLS certificate verification (passed to runners)
    pub skip_certificate_validation: bool,
    /// Secrets mount path inside the runner
    pub secrets_directory: PathBuf,
    /// Host directory for per-instance secret files
    pub data_dir: PathBuf,
    /// Directory holding one file per secret value
    pub secrets_source: PathBuf,
    /// Docker network to attach runners to, overriding self-detection
    pub docker_network: Option<String>,
    /// Kubernetes namespace for runner Jobs, overriding self-detection
    pub kubernetes_namespace: Option<String>,
    /// How often the scheduler reconciles instances
    pub scheduler_poll_interval: Duration,
    /// JSON container template (Docker)
    pub container_template: Option<PathBuf>,
    /// JSON pod template (Kubernetes)
    pub pod_template: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let optional = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let runtime = match optional("CONDUIT_RUNTIME") {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid("CONDUIT_RUNTIME", "expected docker or kubernetes"))?,
            None => RuntimePlatform::Docker,
        };

        let api_uri = optional("CONDUIT_API_URI").ok_or(ConfigError::Missing("CONDUIT_API_URI"))?;

        let pull_policy = match optional("CONDUIT_RUNNER_PULL_POLICY") {
            Some(value) => value.parse().map_err(|_| {
                ConfigError::Invalid(
                    "CONDUIT_RUNNER_PULL_POLICY",
                    "expected Always, IfNotPresent or Never",
                )
            })?,
            None => PullPolicy::default(),
        };

        let scheduler_poll_secs: u64 = optional("CONDUIT_SCHEDULER_POLL_SECS")
            .unwrap_or_else(|| DEFAULT_SCHEDULER_POLL_SECS.to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("CONDUIT_SCHEDULER_POLL_SECS", "expected seconds"))?;
        if scheduler_poll_secs == 0 {
            return Err(ConfigError::Invalid(
                "CONDUIT_SCHEDULER_POLL_SECS",
                "must be greater than zero",
            ));
        }

        let data_dir = PathBuf::from(optional("CONDUIT_DATA_DIR").unwrap_or_else(|| ".data".to_string()));

        Ok(Self {
            runtime,
            api_uri,
            runner_image: optional("CONDUIT_RUNNER_IMAGE").unwrap_or_else(|| DEFAULT_RUNNER_IMAGE.to_string()),
            pull_policy,
            skip_certificate_validation: optional("CONDUIT_SKIP_CERTIFICATE_VALIDATION")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            secrets_directory: PathBuf::from(
                optional("CONDUIT_SECRETS_DIRECTORY").unwrap_or_else(|| DEFAULT_SECRETS_DIRECTORY.to_string()),
            ),
            secrets_source: optional("CONDUIT_SECRETS_SOURCE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("secret-store")),
            data_dir,
            docker_network: optional("CONDUIT_DOCKER_NETWORK"),
            kubernetes_namespace: optional("CONDUIT_KUBERNETES_NAMESPACE"),
            scheduler_poll_interval: Duration::from_secs(scheduler_poll_secs),
            container_template: optional("CONDUIT_CONTAINER_TEMPLATE").map(PathBuf::from),
            pod_template: optional("CONDUIT_POD_TEMPLATE").map(PathBuf::from),
        })
    }

    /// Settings shared by both runtimes.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            image: self.runner_image.clone(),
            pull_policy: self.pull_policy,
            api_uri: self.api_uri.clone(),
            secrets_directory: self.secrets_directory.clone(),
            skip_certificate_validation: self.skip_certificate_validation,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable has an invalid value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "CONDUIT_RUNTIME",
        "CONDUIT_API_URI",
        "CONDUIT_RUNNER_IMAGE",
        "CONDUIT_RUNNER_PULL_POLICY",
        "CONDUIT_SKIP_CERTIFICATE_VALIDATION",
        "CONDUIT_SECRETS_DIRECTORY",
        "CONDUIT_DATA_DIR",
        "CONDUIT_SECRETS_SOURCE",
        "CONDUIT_DOCKER_NETWORK",
        "CONDUIT_KUBERNETES_NAMESPACE",
        "CONDUIT_SCHEDULER_POLL_SECS",
        "CONDUIT_CONTAINER_TEMPLATE",
        "CONDUIT_POD_TEMPLATE",
    ];

    /// Clears the config variables and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.vars.push((var.to_string(), env::var(var).ok()));
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe { env::remove_var(var) };
            }
            guard
        }

        fn set(&self, key: &str, value: &str) {
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..) {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_missing_api_uri() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CONDUIT_API_URI")));
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("CONDUIT_API_URI", "http://conduit-api:8080");

        let config = Config::from_env().unwrap();
        assert_eq!(config.runtime, RuntimePlatform::Docker);
        assert_eq!(config.runner_image, DEFAULT_RUNNER_IMAGE);
        assert_eq!(config.pull_policy, PullPolicy::IfNotPresent);
        assert!(!config.skip_certificate_validation);
        assert_eq!(config.secrets_directory, PathBuf::from(DEFAULT_SECRETS_DIRECTORY));
        assert_eq!(config.data_dir, PathBuf::from(".data"));
        assert_eq!(config.secrets_source, PathBuf::from(".data/secret-store"));
        assert_eq!(config.docker_network, None);
        assert_eq!(config.scheduler_poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_kubernetes_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("CONDUIT_API_URI", "https://conduit-api.conduit.svc");
        guard.set("CONDUIT_RUNTIME", "k8s");
        guard.set("CONDUIT_RUNNER_PULL_POLICY", "Always");
        guard.set("CONDUIT_KUBERNETES_NAMESPACE", "workflows");
        guard.set("CONDUIT_SKIP_CERTIFICATE_VALIDATION", "true");
        guard.set("CONDUIT_SCHEDULER_POLL_SECS", "2");

        let config = Config::from_env().unwrap();
        assert_eq!(config.runtime, RuntimePlatform::Kubernetes);
        assert_eq!(config.pull_policy, PullPolicy::Always);
        assert_eq!(config.kubernetes_namespace.as_deref(), Some("workflows"));
        assert!(config.skip_certificate_validation);
        assert_eq!(config.scheduler_poll_interval, Duration::from_secs(2));

        let settings = config.runtime_settings();
        assert_eq!(settings.api_uri, "https://conduit-api.conduit.svc");
        assert!(settings.skip_certificate_validation);
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("CONDUIT_API_URI", "http://api");

        guard.set("CONDUIT_RUNTIME", "nomad");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("CONDUIT_RUNTIME", _)
        ));

        guard.set("CONDUIT_RUNTIME", "docker");
        guard.set("CONDUIT_RUNNER_PULL_POLICY", "sometimes");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("CONDUIT_RUNNER_PULL_POLICY", _)
        ));

        guard.set("CONDUIT_RUNNER_PULL_POLICY", "Never");
        guard.set("CONDUIT_SCHEDULER_POLL_SECS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("CONDUIT_SCHEDULER_POLL_SECS", _)
        ));
    }
}
