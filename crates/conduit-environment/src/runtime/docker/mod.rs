// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker runtime.
//!
//! Runs each instance as a container created from the runner image. Calls to
//! the engine go through the [`DockerApi`] seam; [`DockerCli`] drives the
//! `docker` binary.

mod api;
mod cli;
mod process;
mod runtime;
mod template;

pub use api::{ContainerState, DockerApi};
pub use cli::DockerCli;
pub use process::DockerProcess;
pub use runtime::{DOCKERENV_PATH, DockerRuntime, INSTANCE_LABEL};
pub use template::{ContainerSpec, ContainerTemplate, MountSpec};
