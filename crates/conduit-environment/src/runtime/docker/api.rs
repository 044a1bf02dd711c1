// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker engine seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::template::ContainerSpec;
use crate::runtime::{LogLine, Result};

/// Observed container state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Engine status (`created`, `running`, `exited`, `dead`, ...).
    pub status: String,
    /// Exit code reported by the engine.
    pub exit_code: i64,
}

impl ContainerState {
    /// Whether the container reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "exited" | "dead")
    }
}

/// Operations the Docker runtime needs from the engine.
///
/// Stop and remove of an unknown container succeed.
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Whether `image` is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull `image`.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Follow a container's output. The stream ends when the container exits.
    async fn follow_logs(&self, id: &str) -> Result<mpsc::Receiver<LogLine>>;

    /// Block until the container exits and return its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Inspect a container, `None` if it does not exist.
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>>;

    /// Networks a container is attached to.
    async fn container_networks(&self, id: &str) -> Result<Vec<String>>;

    /// Stop a container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;
}
