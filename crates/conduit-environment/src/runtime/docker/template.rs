// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container templates.
//!
//! A template is an optional JSON file carrying the container settings the
//! operator controls (extra labels, extra environment, a command override,
//! extra mounts). The runtime renders it into a [`ContainerSpec`] together
//! with the settings it owns: name, image, runner environment, secrets mount
//! and network.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::runtime::{Result, RuntimeError};

/// Prefix of the environment variables the runtime owns.
const RESERVED_ENV_PREFIX: &str = "CONDUIT_";

/// A bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path.
    pub source: PathBuf,
    /// Path inside the container.
    pub target: PathBuf,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Bind mounts.
    pub mounts: Vec<MountSpec>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Command override; empty keeps the image entrypoint.
    pub command: Vec<String>,
}

impl ContainerSpec {
    /// Value of an environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Operator-controlled container settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerTemplate {
    /// Extra labels.
    pub labels: BTreeMap<String, String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Command override.
    pub command: Vec<String>,
    /// Extra mounts.
    pub mounts: Vec<MountSpec>,
}

impl ContainerTemplate {
    /// Load a template from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Render the container spec for one runner.
    pub fn render(
        &self,
        name: &str,
        image: &str,
        runner_env: Vec<(String, String)>,
        secrets: Option<MountSpec>,
        network: Option<String>,
    ) -> Result<ContainerSpec> {
        if name.is_empty() {
            return Err(RuntimeError::InvalidSpec("container name is empty".to_string()));
        }
        if image.trim().is_empty() {
            return Err(RuntimeError::InvalidSpec("runner image is empty".to_string()));
        }
        if let Some(key) = self.env.keys().find(|k| k.starts_with(RESERVED_ENV_PREFIX)) {
            return Err(RuntimeError::InvalidSpec(format!(
                "template environment variable '{}' is reserved for the runtime",
                key
            )));
        }

        let mut mounts = self.mounts.clone();
        mounts.extend(secrets);
        if let Some(mount) = mounts.iter().find(|m| !m.target.is_absolute()) {
            return Err(RuntimeError::InvalidSpec(format!(
                "mount target '{}' is not an absolute path",
                mount.target.display()
            )));
        }

        let mut env = runner_env;
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            env,
            mounts,
            network,
            labels: self.labels.clone(),
            command: self.command.clone(),
        })
    }
}
