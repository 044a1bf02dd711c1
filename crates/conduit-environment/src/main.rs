// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Environment - runtime scheduling host
//!
//! Runs the correlation engine and the instance scheduler, scheduling every
//! pending workflow instance as a Docker container or Kubernetes Job.

use std::sync::Arc;
use tracing::{info, warn};

use conduit_core::CoreConfig;
use conduit_environment::config::Config;
use conduit_environment::host::{Host, runtime_from_config};
use conduit_environment::secrets::DirectorySecretsManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_environment=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;
    let core_config = CoreConfig::from_env()?;

    info!(
        runtime = %config.runtime,
        api_uri = %config.api_uri,
        image = %config.runner_image,
        data_dir = %config.data_dir.display(),
        "Starting Conduit Environment"
    );

    let secrets = Arc::new(DirectorySecretsManager::new(&config.secrets_source));
    let runtime = runtime_from_config(&config, secrets).await?;

    let host = Host::builder()
        .runtime(runtime)
        .core_config(core_config)
        .scheduler_poll_interval(config.scheduler_poll_interval)
        .build()?
        .start()
        .await?;

    info!("Environment ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    host.shutdown().await?;

    info!("Conduit Environment shut down");

    Ok(())
}
