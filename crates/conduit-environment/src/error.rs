// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conduit-environment.

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Environment errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Scheduling a process on the platform failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Instance state transition failed.
    #[error("Core error: {0}")]
    Core(#[from] conduit_core::CoreError),

    /// Resource store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] conduit_core::StoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Workflow referenced by an instance was not found.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Service account used to run an instance was not found.
    #[error("Service account not found: {0}")]
    ServiceAccountNotFound(String),
}

impl Error {
    /// Whether the error is a definition problem rather than a platform one.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::WorkflowNotFound(_)
                | Error::ServiceAccountNotFound(_)
                | Error::Runtime(RuntimeError::InvalidSpec(_) | RuntimeError::SecretNotFound(_))
        )
    }
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;
